//! TUIC UDP relay
//!
//! Client side of the UDP relay carried over a TUIC connection: the wire
//! codec for addresses, packets and the dissociate command, fragment
//! reassembly, and the per-association relay socket.
//!
//! ```text
//! Packet:
//! +-----+------+---------+-----------+------------+------------+------+---------+------+
//! | VER | TYPE | CONN_ID | PACKET_ID | FRAG_TOTAL | FRAG_INDEX | SIZE | ADDRESS | DATA |
//! +-----+------+---------+-----------+------------+------------+------+---------+------+
//! |  1  |  1   |    2    |     2     |     1      |     1      |  2   |    *    |  *   |
//! +-----+------+---------+-----------+------------+------------+------+---------+------+
//! ```
//!
//! ADDRESS is present only on the first fragment of a datagram.

pub mod address;
pub mod command;
mod conn;
mod defrag;
mod packet;

pub use command::{CommandHeader, CommandType, Dissociate};
pub use conn::{CloseHook, RelayPacketConn, RelayPacketConnBuilder, TransportHook};
pub use defrag::{Defragmenter, DEFAULT_MAX_PENDING, DEFAULT_REASSEMBLY_TIMEOUT};
pub use packet::{Packet, MAX_PACKET_SIZE, PACKET_HEADER_LEN, PACKET_OVERHEAD};
