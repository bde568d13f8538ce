//! Relay packet framing and fragmentation
//!
//! ```text
//! +-----+------+---------+-----------+------------+------------+------+---------+----------+
//! | VER | TYPE | CONN_ID | PACKET_ID | FRAG_TOTAL | FRAG_INDEX | SIZE | ADDRESS |   DATA   |
//! +-----+------+---------+-----------+------------+------------+------+---------+----------+
//! |  1  |  1   |    2    |     2     |     1      |     1      |  2   |  0 / n  |   SIZE   |
//! +-----+------+---------+-----------+------------+------------+------+---------+----------+
//! ```
//!
//! ADDRESS is only present on the fragment with FRAG_INDEX 0.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::Address;
use crate::error::{Error, Result};

use super::address::{self, MAX_ADDRESS_LEN};
use super::command::{CommandHeader, CommandType, COMMAND_HEADER_LEN};

/// conn_id + packet_id + frag_total + frag_index + size
pub const PACKET_HEADER_LEN: usize = 2 + 2 + 1 + 1 + 2;

/// Worst-case encoded size of everything but the payload
pub const PACKET_OVERHEAD: usize = COMMAND_HEADER_LEN + PACKET_HEADER_LEN + MAX_ADDRESS_LEN;

/// Largest datagram the wire format can describe
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// One relay packet, either a whole datagram or one fragment of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub conn_id: u16,
    pub packet_id: u16,
    pub frag_total: u8,
    pub frag_index: u8,
    /// Only carried by the first fragment
    pub address: Option<Address>,
    pub data: Bytes,
}

impl Packet {
    /// Create an unfragmented packet
    pub fn new(conn_id: u16, packet_id: u16, address: Address, data: Bytes) -> Self {
        Self {
            conn_id,
            packet_id,
            frag_total: 1,
            frag_index: 0,
            address: Some(address),
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Exact number of bytes [`Packet::write_to`] produces
    pub fn encoded_len(&self) -> usize {
        let addr_len = match (&self.address, self.frag_index) {
            (Some(addr), 0) => address::encoded_len(addr),
            _ => 0,
        };
        COMMAND_HEADER_LEN + PACKET_HEADER_LEN + addr_len + self.data.len()
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.data.len() > MAX_PACKET_SIZE {
            return Err(Error::MessageTooLarge(self.data.len()));
        }

        CommandHeader::new(CommandType::Packet).write_to(buf);
        buf.put_u16(self.conn_id);
        buf.put_u16(self.packet_id);
        buf.put_u8(self.frag_total);
        buf.put_u8(self.frag_index);
        buf.put_u16(self.data.len() as u16);

        if self.frag_index == 0 {
            let addr = self
                .address
                .as_ref()
                .ok_or_else(|| Error::MalformedAddress("first fragment has no address".into()))?;
            address::write_address(buf, addr)?;
        }

        buf.put_slice(&self.data);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one packet from the front of `buf`, advancing it
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let header = CommandHeader::decode(buf)?;
        if header.kind != CommandType::Packet {
            return Err(Error::UnknownCommand {
                version: super::command::VERSION,
                kind: header.kind.to_byte(),
            });
        }
        if buf.remaining() < PACKET_HEADER_LEN {
            return Err(Error::TruncatedPacket);
        }

        let conn_id = buf.get_u16();
        let packet_id = buf.get_u16();
        let frag_total = buf.get_u8();
        let frag_index = buf.get_u8();
        let size = buf.get_u16() as usize;
        check_fragment(frag_total, frag_index)?;

        let address = if frag_index == 0 {
            Some(address::decode_address(buf)?)
        } else {
            None
        };

        if buf.remaining() < size {
            return Err(Error::TruncatedPacket);
        }
        let data = buf.copy_to_bytes(size);

        Ok(Self {
            conn_id,
            packet_id,
            frag_total,
            frag_index,
            address,
            data,
        })
    }

    /// Length of the complete frame at the front of `buf`, or `None` if
    /// more bytes must arrive before it is known or available.
    ///
    /// Header and address errors are reported as soon as the bytes that
    /// carry them are present.
    pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
        const HEAD_LEN: usize = COMMAND_HEADER_LEN + PACKET_HEADER_LEN;

        if buf.len() < COMMAND_HEADER_LEN {
            return Ok(None);
        }
        let header = CommandHeader::from_bytes(buf[0], buf[1])?;
        if header.kind != CommandType::Packet {
            return Err(Error::UnknownCommand {
                version: buf[0],
                kind: buf[1],
            });
        }
        if buf.len() < HEAD_LEN {
            return Ok(None);
        }

        let mut fields = &buf[COMMAND_HEADER_LEN + 4..HEAD_LEN];
        let frag_total = fields.get_u8();
        let frag_index = fields.get_u8();
        let size = fields.get_u16() as usize;
        check_fragment(frag_total, frag_index)?;

        let addr_len = if frag_index == 0 {
            match address::peek_len(&buf[HEAD_LEN..])? {
                Some(len) => len,
                None => return Ok(None),
            }
        } else {
            0
        };

        Ok(Some(HEAD_LEN + addr_len + size))
    }

    /// Split this packet into fragments of at most `max_total_size` encoded
    /// bytes each, all sharing `packet_id`.
    ///
    /// Only the first fragment carries the address, so it gets that much
    /// less payload than the rest. Fails with `DatagramTooLarge` when the
    /// budget cannot carry the payload in at most 255 fragments.
    pub fn fragments(&self, packet_id: u16, max_total_size: usize) -> Result<Vec<Packet>> {
        let head = COMMAND_HEADER_LEN + PACKET_HEADER_LEN;
        let addr_len = self.address.as_ref().map_or(0, address::encoded_len);
        if max_total_size <= head + addr_len {
            return Err(Error::DatagramTooLarge { max: max_total_size });
        }
        let first_payload = max_total_size - head - addr_len;
        let max_payload = max_total_size - head;

        let len = self.data.len();
        let total = 1 + len.saturating_sub(first_payload).div_ceil(max_payload);
        if total > u8::MAX as usize {
            return Err(Error::DatagramTooLarge { max: max_total_size });
        }

        let fragments = (0..total)
            .map(|index| {
                let (start, budget) = match index {
                    0 => (0, first_payload),
                    _ => (first_payload + (index - 1) * max_payload, max_payload),
                };
                let start = start.min(len);
                let end = (start + budget).min(len);
                Packet {
                    conn_id: self.conn_id,
                    packet_id,
                    frag_total: total as u8,
                    frag_index: index as u8,
                    address: if index == 0 { self.address.clone() } else { None },
                    data: self.data.slice(start..end),
                }
            })
            .collect();

        Ok(fragments)
    }
}

fn check_fragment(frag_total: u8, frag_index: u8) -> Result<()> {
    if frag_total == 0 || frag_index >= frag_total {
        return Err(Error::InvalidFragment);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(data: &'static [u8]) -> Packet {
        Packet::new(7, 0xBEEF, Address::parse("10.0.0.1:53").unwrap(), Bytes::from_static(data))
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = sample(b"hello relay");
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.len(), packet.encoded_len());

        let mut slice = &bytes[..];
        assert_eq!(Packet::decode(&mut slice).unwrap(), packet);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_packet_layout() {
        let bytes = sample(b"ab").to_bytes().unwrap();
        assert_eq!(
            &bytes[..],
            &[
                0x05, 0x02, // header
                0x00, 0x07, // conn_id
                0xBE, 0xEF, // packet_id
                1, 0, // frag_total, frag_index
                0x00, 0x02, // size
                0x01, 10, 0, 0, 1, 0x00, 53, // address
                b'a', b'b',
            ]
        );
    }

    #[test]
    fn test_later_fragment_omits_address() {
        let packet = Packet {
            conn_id: 1,
            packet_id: 2,
            frag_total: 3,
            frag_index: 1,
            address: Some(Address::domain("ignored.example", 1)),
            data: Bytes::from_static(b"xyz"),
        };
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.len(), COMMAND_HEADER_LEN + PACKET_HEADER_LEN + 3);

        let decoded = Packet::decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded.address, None);
        assert_eq!(decoded.data, packet.data);
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = sample(b"payload").to_bytes().unwrap();
        let mut short = &bytes[..bytes.len() - 1];
        assert!(matches!(Packet::decode(&mut short), Err(Error::TruncatedPacket)));

        let mut header_only = &bytes[..5];
        assert!(matches!(Packet::decode(&mut header_only), Err(Error::TruncatedPacket)));
    }

    #[test]
    fn test_bad_address_propagates() {
        let mut bytes = BytesMut::from(&sample(b"x").to_bytes().unwrap()[..]);
        bytes[COMMAND_HEADER_LEN + PACKET_HEADER_LEN] = 0x09;
        assert!(matches!(
            Packet::decode(&mut &bytes[..]),
            Err(Error::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_invalid_fragment_metadata() {
        let mut bytes = BytesMut::from(&sample(b"x").to_bytes().unwrap()[..]);
        bytes[6] = 2;
        bytes[7] = 2;
        assert!(matches!(Packet::decode(&mut &bytes[..]), Err(Error::InvalidFragment)));
    }

    #[test]
    fn test_fragments_split_payload() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let target = Address::domain("example.com", 443);
        let packet = Packet::new(3, 1, target.clone(), Bytes::from(data.clone()));

        // 300 bytes of payload fit next to the address, 315 without it
        let max_total = COMMAND_HEADER_LEN + PACKET_HEADER_LEN + address::encoded_len(&target) + 300;
        let frags = packet.fragments(42, max_total).unwrap();
        assert_eq!(frags.len(), 4);

        for (i, frag) in frags.iter().enumerate() {
            assert_eq!(frag.packet_id, 42);
            assert_eq!(frag.frag_total, 4);
            assert_eq!(frag.frag_index as usize, i);
            assert_eq!(frag.address.is_some(), i == 0);
            assert!(frag.encoded_len() <= max_total);
        }
        assert_eq!(frags[0].size(), 300);
        assert_eq!(frags[1].size(), 315);
        assert_eq!(frags[3].size(), 1000 - 300 - 2 * 315);

        let joined: Vec<u8> = frags.iter().flat_map(|f| f.data.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_fragments_small_budget() {
        // Well under the worst-case overhead, still enough for an IPv4 address
        let data: Vec<u8> = (0..400u32).map(|i| i as u8).collect();
        let packet = Packet::new(3, 1, Address::parse("10.0.0.1:53").unwrap(), Bytes::from(data.clone()));

        let frags = packet.fragments(8, 100).unwrap();
        assert_eq!(frags.len(), 1 + (400 - 83usize).div_ceil(90));
        assert!(frags.iter().all(|f| f.encoded_len() <= 100));

        let joined: Vec<u8> = frags.iter().flat_map(|f| f.data.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_fragments_budget_too_small() {
        let packet = sample(b"data");
        let addr_len = address::encoded_len(&Address::parse("10.0.0.1:53").unwrap());
        assert!(matches!(
            packet.fragments(1, COMMAND_HEADER_LEN + PACKET_HEADER_LEN + addr_len),
            Err(Error::DatagramTooLarge { .. })
        ));

        // More than 255 fragments
        let big = Packet::new(1, 1, Address::unspecified(), Bytes::from(vec![0u8; 6000]));
        assert!(matches!(big.fragments(1, 30), Err(Error::DatagramTooLarge { max: 30 })));
    }

    #[test]
    fn test_fragments_empty_payload() {
        let packet = sample(b"");
        let frags = packet.fragments(9, 1200).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].frag_total, 1);
    }

    #[test]
    fn test_frame_len() {
        let first = sample(b"one");
        let second = Packet {
            conn_id: 7,
            packet_id: 5,
            frag_total: 2,
            frag_index: 1,
            address: None,
            data: Bytes::from_static(b"two"),
        };

        let mut buf = BytesMut::new();
        first.write_to(&mut buf).unwrap();
        let first_len = buf.len();
        second.write_to(&mut buf).unwrap();

        assert_eq!(Packet::frame_len(&buf).unwrap(), Some(first_len));
        assert_eq!(Packet::frame_len(&buf[first_len..]).unwrap(), Some(buf.len() - first_len));

        // Not enough to know the address length yet
        assert_eq!(Packet::frame_len(&buf[..COMMAND_HEADER_LEN + PACKET_HEADER_LEN]).unwrap(), None);
        assert_eq!(Packet::frame_len(&buf[..1]).unwrap(), None);

        let mut frame = buf.split_to(first_len).freeze();
        assert_eq!(Packet::decode(&mut frame).unwrap(), first);
    }

    #[test]
    fn test_frame_len_rejects_dissociate() {
        let bytes = super::super::command::Dissociate::new(1).to_bytes();
        assert!(matches!(
            Packet::frame_len(&bytes),
            Err(Error::UnknownCommand { kind: 0x03, .. })
        ));
    }
}
