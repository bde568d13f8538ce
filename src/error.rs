//! Error types for the UDP relay

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for the UDP relay.
///
/// `Clone` so that a single close outcome can be handed to every caller of
/// [`crate::RelayPacketConn::close`].
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("Truncated packet")]
    TruncatedPacket,

    #[error("Invalid fragment metadata")]
    InvalidFragment,

    #[error("Unknown command: version {version:#04x}, type {kind:#04x}")]
    UnknownCommand { version: u8, kind: u8 },

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Returned by the transport when a datagram exceeds its negotiated maximum
    #[error("Datagram too large, transport maximum is {max} bytes")]
    DatagramTooLarge { max: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::TruncatedPacket,
            _ => Error::Io(Arc::new(err)),
        }
    }
}

/// Result type alias for the UDP relay
pub type Result<T> = std::result::Result<T, Error>;
