//! Transport Layer
//!
//! Responsibilities:
//! - Describe the shared multiplexed connection the relay runs over
//! - NO connection establishment, NO handshake, NO congestion control
//!
//! Establishing the connection (QUIC handshake, TLS, authentication) is the
//! embedder's job; the relay only needs the operations below.

mod memory;

pub use memory::MemoryConnection;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::{Address, Result};

/// Write half of a unidirectional stream
pub type SendStream = Box<dyn AsyncWrite + Unpin + Send>;

/// Inbound byte stream carrying one socket's framed packets
pub type RecvStream = Box<dyn AsyncRead + Unpin + Send>;

/// A long-lived multiplexed connection shared by many relay sockets
///
/// Implementations must allow concurrent calls from sibling sockets.
#[async_trait]
pub trait MuxConnection: Send + Sync {
    /// Open a fresh unidirectional outbound stream
    async fn open_uni_stream(&self) -> Result<SendStream>;

    /// Send an unreliable, size-limited message.
    ///
    /// Must fail with [`crate::Error::DatagramTooLarge`] carrying the
    /// negotiated maximum when `data` does not fit.
    async fn send_datagram(&self, data: Bytes) -> Result<()>;

    /// Local address of the underlying connection
    fn local_addr(&self) -> Result<Address>;
}
