//! Prometheus-based metrics module
//!
//! Counters for the relay data path. Call [`init_metrics`] once to register
//! them with [`REGISTRY`]; counters work (and count) even when unregistered.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Outbound ===

    /// Datagrams accepted by `write_to`, per relay mode
    pub static ref PACKETS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("tuic_packets_sent_total", "Datagrams relayed per relay mode"),
        &["mode"]
    ).unwrap();

    /// Fragments written to unidirectional streams
    pub static ref FRAGMENTS_SENT: IntCounter = IntCounter::new(
        "tuic_fragments_sent_total",
        "Total number of fragments sent"
    ).unwrap();

    /// Datagrams rejected as too large by the transport and re-sent fragmented
    pub static ref DATAGRAM_FALLBACKS: IntCounter = IntCounter::new(
        "tuic_datagram_fallbacks_total",
        "Datagrams re-sent as fragments after a size rejection"
    ).unwrap();

    /// Bytes of payload relayed outbound
    pub static ref BYTES_SENT: IntCounter = IntCounter::new(
        "tuic_bytes_sent_total",
        "Total payload bytes sent"
    ).unwrap();

    // === Inbound ===

    /// Complete datagrams handed to readers
    pub static ref PACKETS_RECEIVED: IntCounter = IntCounter::new(
        "tuic_packets_received_total",
        "Total number of datagrams received"
    ).unwrap();

    /// Datagrams rebuilt from more than one fragment
    pub static ref PACKETS_REASSEMBLED: IntCounter = IntCounter::new(
        "tuic_packets_reassembled_total",
        "Total number of datagrams reassembled from fragments"
    ).unwrap();

    /// Fragments dropped because their index was already recorded
    pub static ref DUPLICATE_FRAGMENTS: IntCounter = IntCounter::new(
        "tuic_duplicate_fragments_total",
        "Total number of duplicate fragments dropped"
    ).unwrap();

    /// Incomplete reassemblies dropped, per reason
    pub static ref REASSEMBLIES_EVICTED: IntCounterVec = IntCounterVec::new(
        Opts::new("tuic_reassemblies_evicted_total", "Incomplete reassemblies evicted"),
        &["reason"]
    ).unwrap();

    // === Lifecycle ===

    /// Dissociate signals sent on close
    pub static ref DISSOCIATES_SENT: IntCounter = IntCounter::new(
        "tuic_dissociates_sent_total",
        "Total number of dissociate commands sent"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(PACKETS_SENT.clone())).ok();
    REGISTRY.register(Box::new(FRAGMENTS_SENT.clone())).ok();
    REGISTRY.register(Box::new(DATAGRAM_FALLBACKS.clone())).ok();
    REGISTRY.register(Box::new(BYTES_SENT.clone())).ok();

    REGISTRY.register(Box::new(PACKETS_RECEIVED.clone())).ok();
    REGISTRY.register(Box::new(PACKETS_REASSEMBLED.clone())).ok();
    REGISTRY.register(Box::new(DUPLICATE_FRAGMENTS.clone())).ok();
    REGISTRY.register(Box::new(REASSEMBLIES_EVICTED.clone())).ok();

    REGISTRY.register(Box::new(DISSOCIATES_SENT.clone())).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_registers_families() {
        init_metrics();
        // Registering twice is a no-op
        init_metrics();

        PACKETS_SENT.with_label_values(&["quic"]).inc();
        REASSEMBLIES_EVICTED.with_label_values(&["idle"]).inc();

        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "tuic_packets_sent_total"));
        assert!(names.iter().any(|n| n == "tuic_dissociates_sent_total"));
    }
}
