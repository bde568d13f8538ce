//! Configuration module
//!
//! JSON configuration for a relay socket, in the shape the embedder stores
//! next to its outbound settings:
//!
//! ```json
//! {
//!   "udp_relay_mode": "native",
//!   "max_udp_relay_packet_size": 1500,
//!   "target": "8.8.8.8:53"
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::error::{Error, Result};

/// How datagrams are carried over the multiplexed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpRelayMode {
    /// One reliable unidirectional stream per datagram
    Quic,
    /// Unreliable datagrams, falling back to fragmented streams
    #[default]
    Native,
}

impl UdpRelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UdpRelayMode::Quic => "quic",
            UdpRelayMode::Native => "native",
        }
    }
}

impl std::fmt::Display for UdpRelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Relay mode: quic or native
    #[serde(default)]
    pub udp_relay_mode: UdpRelayMode,

    /// Largest message sent as a single datagram in native mode
    #[serde(default = "default_max_udp_relay_packet_size")]
    pub max_udp_relay_packet_size: usize,

    /// Default destination for stream-style `read`/`write`
    #[serde(default)]
    pub target: Option<String>,

    /// Seconds an incomplete reassembly may stay idle
    #[serde(default = "default_reassembly_timeout_secs")]
    pub reassembly_timeout_secs: u64,

    /// Maximum number of incomplete reassemblies per socket
    #[serde(default = "default_max_pending_reassemblies")]
    pub max_pending_reassemblies: usize,
}

fn default_max_udp_relay_packet_size() -> usize {
    1500
}

fn default_reassembly_timeout_secs() -> u64 {
    30
}

fn default_max_pending_reassemblies() -> usize {
    1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            udp_relay_mode: UdpRelayMode::default(),
            max_udp_relay_packet_size: default_max_udp_relay_packet_size(),
            target: None,
            reassembly_timeout_secs: default_reassembly_timeout_secs(),
            max_pending_reassemblies: default_max_pending_reassemblies(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_udp_relay_packet_size <= crate::protocol::tuic::PACKET_OVERHEAD {
            return Err(Error::Config(format!(
                "max_udp_relay_packet_size must exceed the {} byte packet overhead",
                crate::protocol::tuic::PACKET_OVERHEAD
            )));
        }
        if self.max_pending_reassemblies == 0 {
            return Err(Error::Config("max_pending_reassemblies must be positive".into()));
        }
        Ok(())
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    /// Install a global fmt subscriber at the configured level.
    ///
    /// `RUST_LOG` overrides the configured level when it names a valid one.
    pub fn init(&self) -> Result<()> {
        let level = std::env::var("RUST_LOG")
            .ok()
            .and_then(|s| s.parse::<Level>().ok())
            .or_else(|| self.level.parse::<Level>().ok())
            .unwrap_or(Level::INFO);

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = RelayConfig::from_json("{}").unwrap();
        assert_eq!(config.udp_relay_mode, UdpRelayMode::Native);
        assert_eq!(config.max_udp_relay_packet_size, 1500);
        assert_eq!(config.reassembly_timeout(), Duration::from_secs(30));
        assert_eq!(config.log.level, "info");
        assert!(config.target.is_none());
    }

    #[test]
    fn test_parse_quic_mode() {
        let config = RelayConfig::from_json(
            r#"{"udp_relay_mode": "quic", "max_udp_relay_packet_size": 1200, "target": "10.0.0.1:53"}"#,
        )
        .unwrap();
        assert_eq!(config.udp_relay_mode, UdpRelayMode::Quic);
        assert_eq!(config.max_udp_relay_packet_size, 1200);
        assert_eq!(config.target.as_deref(), Some("10.0.0.1:53"));
    }

    #[test]
    fn test_config_serialization() {
        let config = RelayConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = RelayConfig::from_json(&json).unwrap();
        assert_eq!(parsed.udp_relay_mode, config.udp_relay_mode);
        assert_eq!(parsed.max_udp_relay_packet_size, config.max_udp_relay_packet_size);
    }

    #[test]
    fn test_rejects_tiny_packet_size() {
        let result = RelayConfig::from_json(r#"{"max_udp_relay_packet_size": 100}"#);
        assert!(matches!(result, Err(Error::Config(_))));

        let result = RelayConfig::from_json(r#"{"udp_relay_mode": "carrier-pigeon"}"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_log_init_once() {
        let log = LogConfig {
            level: "debug".to_string(),
        };
        let _ = log.init();
        // A second global subscriber is always refused
        assert!(log.init().is_err());
    }
}
