//! Fragment reassembly
//!
//! Fragments sharing a `(conn_id, packet_id)` key are collected until every
//! index in `[0, frag_total)` has arrived, then joined in index order.
//! Incomplete sets are evicted once idle for longer than the configured
//! timeout, or when the table is full.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::common::Address;
use crate::metrics;

use super::packet::Packet;

/// Default idle time before an incomplete reassembly is dropped
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on concurrently pending reassemblies
pub const DEFAULT_MAX_PENDING: usize = 1024;

type Key = (u16, u16);

struct Reassembly {
    frag_total: u8,
    received: usize,
    slots: Vec<Option<Bytes>>,
    address: Option<Address>,
    last_touch: Instant,
}

impl Reassembly {
    fn new(frag_total: u8, now: Instant) -> Self {
        Self {
            frag_total,
            received: 0,
            slots: vec![None; frag_total as usize],
            address: None,
            last_touch: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.frag_total as usize
    }

    fn assemble(self) -> (Bytes, Option<Address>) {
        let len = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(len);
        for slot in self.slots.into_iter().flatten() {
            data.extend_from_slice(&slot);
        }
        (data.freeze(), self.address)
    }
}

/// Reassembles fragmented packets for one relay connection.
///
/// Not synchronized; the owning connection feeds it from a single read loop.
pub struct Defragmenter {
    pending: HashMap<Key, Reassembly>,
    idle_timeout: Duration,
    max_pending: usize,
}

impl Default for Defragmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Defragmenter {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_REASSEMBLY_TIMEOUT, DEFAULT_MAX_PENDING)
    }

    pub fn with_limits(idle_timeout: Duration, max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            idle_timeout,
            max_pending: max_pending.max(1),
        }
    }

    /// Number of incomplete reassemblies
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Feed one packet. Returns the whole datagram once it is complete.
    pub fn feed(&mut self, packet: Packet) -> Option<Packet> {
        self.feed_at(packet, Instant::now())
    }

    pub(crate) fn feed_at(&mut self, packet: Packet, now: Instant) -> Option<Packet> {
        if packet.frag_total <= 1 {
            return Some(packet);
        }

        self.evict_idle(now);

        let key = (packet.conn_id, packet.packet_id);
        if !self.pending.contains_key(&key) && self.pending.len() >= self.max_pending {
            self.evict_stalest();
        }

        let entry = self
            .pending
            .entry(key)
            .or_insert_with(|| Reassembly::new(packet.frag_total, now));

        if entry.frag_total != packet.frag_total {
            debug!(
                "Defrag: fragment total mismatch for conn {} packet {} ({} != {}), dropping",
                packet.conn_id, packet.packet_id, packet.frag_total, entry.frag_total
            );
            return None;
        }

        let index = packet.frag_index as usize;
        let Some(slot) = entry.slots.get_mut(index) else {
            return None;
        };
        if slot.is_some() {
            trace!(
                "Defrag: duplicate fragment {} for conn {} packet {}",
                index,
                packet.conn_id,
                packet.packet_id
            );
            metrics::DUPLICATE_FRAGMENTS.inc();
            return None;
        }

        *slot = Some(packet.data);
        entry.received += 1;
        entry.last_touch = now;
        if index == 0 {
            entry.address = packet.address;
        }

        if !entry.is_complete() {
            return None;
        }

        let entry = self.pending.remove(&key)?;
        let (data, address) = entry.assemble();
        trace!(
            "Defrag: reassembled conn {} packet {} ({} bytes)",
            packet.conn_id,
            packet.packet_id,
            data.len()
        );
        metrics::PACKETS_REASSEMBLED.inc();

        Some(Packet {
            conn_id: packet.conn_id,
            packet_id: packet.packet_id,
            frag_total: 1,
            frag_index: 0,
            address,
            data,
        })
    }

    /// Drop reassemblies untouched for longer than the idle timeout
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        let timeout = self.idle_timeout;
        self.pending
            .retain(|_, entry| now.saturating_duration_since(entry.last_touch) <= timeout);

        let removed = before - self.pending.len();
        if removed > 0 {
            debug!("Defrag: evicted {} idle reassemblies", removed);
            metrics::REASSEMBLIES_EVICTED
                .with_label_values(&["idle"])
                .inc_by(removed as u64);
        }
        removed
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .pending
            .iter()
            .min_by_key(|(_, entry)| entry.last_touch)
            .map(|(key, _)| *key);

        if let Some(key) = stalest {
            self.pending.remove(&key);
            debug!("Defrag: table full, evicted conn {} packet {}", key.0, key.1);
            metrics::REASSEMBLIES_EVICTED
                .with_label_values(&["capacity"])
                .inc();
        }
    }
}
