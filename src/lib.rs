//! tuic-udp - client-side UDP relay over a shared multiplexed connection
//!
//! # Architecture
//!
//! ```text
//! application datagrams
//! → RelayPacketConn (one per association, identified by conn_id)
//! → Packet framing / fragmentation
//! → MuxConnection (unidirectional streams or unreliable datagrams)
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Address
//! ├── transport/       # MuxConnection trait, in-memory connection
//! ├── protocol/tuic/   # Address and packet codec, defragmenter, relay socket
//! ├── config.rs        # RelayConfig, LogConfig
//! └── metrics.rs       # Prometheus counters
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod protocol;

// Supporting modules
pub mod config;
pub mod metrics;

// Re-exports for convenience
pub use common::Address;
pub use error::{Error, Result};
pub use config::{LogConfig, RelayConfig, UdpRelayMode};

pub use protocol::tuic::RelayPacketConn;
pub use transport::{MemoryConnection, MuxConnection};
