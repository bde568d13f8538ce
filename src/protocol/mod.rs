//! Proxy Protocol Layer
//!
//! Responsibilities:
//! - Wire encoding of relay commands and target addresses
//! - Fragmentation and reassembly of datagrams
//! - Per-association relay sockets over a shared transport
//!
//! This layer handles proxy-specific protocol logic; it never establishes
//! connections itself.

pub mod tuic;

pub use tuic::{RelayPacketConn, RelayPacketConnBuilder};
