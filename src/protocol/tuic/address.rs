//! Address codec
//!
//! ```text
//! +------+----------------------------+------+
//! | TYPE |            BODY            | PORT |
//! +------+----------------------------+------+
//! |  1   | domain: LEN(1) + LEN bytes |  2   |
//! |      | ipv4:   4 bytes            |      |
//! |      | ipv6:   16 bytes           |      |
//! +------+----------------------------+------+
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::common::Address;
use crate::error::{Error, Result};

pub const ADDR_TYPE_DOMAIN: u8 = 0x00;
pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_IPV6: u8 = 0x02;

/// Largest possible encoding: type + length + 255-byte domain + port
pub const MAX_ADDRESS_LEN: usize = 1 + 1 + 255 + 2;

/// Number of bytes `addr` occupies on the wire
pub fn encoded_len(addr: &Address) -> usize {
    match addr {
        Address::Socket(SocketAddr::V4(_)) => 1 + 4 + 2,
        Address::Socket(SocketAddr::V6(_)) => 1 + 16 + 2,
        Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
    }
}

/// Append the encoding of `addr` to `buf`
pub fn write_address<B: BufMut>(buf: &mut B, addr: &Address) -> Result<()> {
    match addr {
        Address::Socket(SocketAddr::V4(v4)) => {
            buf.put_u8(ADDR_TYPE_IPV4);
            buf.put_slice(&v4.ip().octets());
        }
        Address::Socket(SocketAddr::V6(v6)) => {
            buf.put_u8(ADDR_TYPE_IPV6);
            buf.put_slice(&v6.ip().octets());
        }
        Address::Domain(domain, _) => {
            let domain_bytes = domain.as_bytes();
            if domain_bytes.len() > 255 {
                return Err(Error::MalformedAddress("domain too long".into()));
            }
            buf.put_u8(ADDR_TYPE_DOMAIN);
            buf.put_u8(domain_bytes.len() as u8);
            buf.put_slice(domain_bytes);
        }
    }
    buf.put_u16(addr.port());
    Ok(())
}

/// Decode an address from the front of `buf`, advancing it
pub fn decode_address<B: Buf>(buf: &mut B) -> Result<Address> {
    if !buf.has_remaining() {
        return Err(truncated("type"));
    }

    let address = match buf.get_u8() {
        ADDR_TYPE_IPV4 => {
            if buf.remaining() < 4 + 2 {
                return Err(truncated("ipv4"));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Address::ip_port(Ipv4Addr::from(octets).into(), buf.get_u16())
        }
        ADDR_TYPE_IPV6 => {
            if buf.remaining() < 16 + 2 {
                return Err(truncated("ipv6"));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Address::ip_port(Ipv6Addr::from(octets).into(), buf.get_u16())
        }
        ADDR_TYPE_DOMAIN => {
            if !buf.has_remaining() {
                return Err(truncated("domain length"));
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len + 2 {
                return Err(truncated("domain"));
            }
            let mut domain = vec![0u8; len];
            buf.copy_to_slice(&mut domain);
            Address::Domain(domain_from_bytes(domain)?, buf.get_u16())
        }
        other => {
            return Err(Error::MalformedAddress(format!(
                "unknown address type {:#04x}",
                other
            )))
        }
    };

    Ok(address)
}

/// Encoded length of the address at the front of `buf`, or `None` if
/// more bytes are needed to tell
pub fn peek_len(buf: &[u8]) -> Result<Option<usize>> {
    let Some(&atyp) = buf.first() else {
        return Ok(None);
    };

    let len = match atyp {
        ADDR_TYPE_IPV4 => 1 + 4 + 2,
        ADDR_TYPE_IPV6 => 1 + 16 + 2,
        ADDR_TYPE_DOMAIN => match buf.get(1) {
            Some(&len) => 1 + 1 + len as usize + 2,
            None => return Ok(None),
        },
        other => {
            return Err(Error::MalformedAddress(format!(
                "unknown address type {:#04x}",
                other
            )))
        }
    };

    Ok(Some(len))
}

fn domain_from_bytes(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| Error::MalformedAddress("domain is not valid UTF-8".into()))
}

fn truncated(field: &str) -> Error {
    Error::MalformedAddress(format!("truncated {}", field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(addr: &Address) -> BytesMut {
        let mut buf = BytesMut::new();
        write_address(&mut buf, addr).unwrap();
        buf
    }

    #[test]
    fn test_address_roundtrip() {
        let cases = [
            Address::parse("10.0.0.1:53").unwrap(),
            Address::parse("[2001:db8::53]:5353").unwrap(),
            Address::domain("example.com", 443),
            Address::domain("", 0),
        ];

        for addr in cases {
            let buf = encode(&addr);
            assert_eq!(buf.len(), encoded_len(&addr));
            let mut slice = &buf[..];
            assert_eq!(decode_address(&mut slice).unwrap(), addr);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_ipv4_layout() {
        let buf = encode(&Address::parse("10.0.0.1:53").unwrap());
        assert_eq!(&buf[..], &[ADDR_TYPE_IPV4, 10, 0, 0, 1, 0, 53]);
    }

    #[test]
    fn test_domain_layout() {
        let buf = encode(&Address::domain("a.io", 80));
        assert_eq!(&buf[..], &[ADDR_TYPE_DOMAIN, 4, b'a', b'.', b'i', b'o', 0, 80]);
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let mut slice: &[u8] = &[0x07, 1, 2, 3];
        assert!(matches!(decode_address(&mut slice), Err(Error::MalformedAddress(_))));
    }

    #[test]
    fn test_truncated_is_malformed() {
        let buf = encode(&Address::parse("[::1]:53").unwrap());
        for cut in 0..buf.len() {
            let mut slice = &buf[..cut];
            assert!(
                matches!(decode_address(&mut slice), Err(Error::MalformedAddress(_))),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_domain_too_long() {
        let mut buf = BytesMut::new();
        let long = "a".repeat(256);
        let result = write_address(&mut buf, &Address::domain(long, 53));
        assert!(matches!(result, Err(Error::MalformedAddress(_))));
    }

    #[test]
    fn test_peek_len() {
        for addr in [
            Address::parse("10.0.0.1:53").unwrap(),
            Address::parse("[::1]:53").unwrap(),
            Address::domain("relay.example", 8443),
        ] {
            let buf = encode(&addr);
            assert_eq!(peek_len(&buf).unwrap(), Some(buf.len()));
            assert_eq!(peek_len(&buf[..1]).unwrap().is_some(), !addr.is_domain());
        }

        assert_eq!(peek_len(&[]).unwrap(), None);
        assert!(peek_len(&[0x42]).is_err());
    }
}
