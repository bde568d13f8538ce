//! Command header and the Dissociate control signal
//!
//! Every message written to a unidirectional stream or sent as a datagram
//! starts with a two-byte header so the peer can dispatch on it:
//!
//! ```text
//! +-----+------+----------+
//! | VER | TYPE |   BODY   |
//! +-----+------+----------+
//! |  1  |  1   | Variable |
//! +-----+------+----------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const VERSION: u8 = 0x05;

/// Encoded size of [`CommandHeader`]
pub const COMMAND_HEADER_LEN: usize = 2;

/// Command types carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Packet,
    Dissociate,
}

impl CommandType {
    pub fn to_byte(self) -> u8 {
        match self {
            CommandType::Packet => 0x02,
            CommandType::Dissociate => 0x03,
        }
    }
}

/// `[version][type]` prefix of every relay message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub kind: CommandType,
}

impl CommandHeader {
    pub fn new(kind: CommandType) -> Self {
        Self { kind }
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(VERSION);
        buf.put_u8(self.kind.to_byte());
    }

    /// Parse the two header bytes
    pub fn from_bytes(version: u8, kind: u8) -> Result<Self> {
        let kind = match (version, kind) {
            (VERSION, 0x02) => CommandType::Packet,
            (VERSION, 0x03) => CommandType::Dissociate,
            _ => return Err(Error::UnknownCommand { version, kind }),
        };
        Ok(Self { kind })
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < COMMAND_HEADER_LEN {
            return Err(Error::TruncatedPacket);
        }
        let version = buf.get_u8();
        let kind = buf.get_u8();
        Self::from_bytes(version, kind)
    }
}

/// Asks the peer to drop all state it keeps for `conn_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dissociate {
    pub conn_id: u16,
}

impl Dissociate {
    pub const ENCODED_LEN: usize = COMMAND_HEADER_LEN + 2;

    pub fn new(conn_id: u16) -> Self {
        Self { conn_id }
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        CommandHeader::new(CommandType::Dissociate).write_to(buf);
        buf.put_u16(self.conn_id);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        self.write_to(&mut buf);
        buf.freeze()
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let header = CommandHeader::decode(buf)?;
        if header.kind != CommandType::Dissociate {
            return Err(Error::UnknownCommand {
                version: VERSION,
                kind: header.kind.to_byte(),
            });
        }
        if buf.remaining() < 2 {
            return Err(Error::TruncatedPacket);
        }
        Ok(Self::new(buf.get_u16()))
    }
}
