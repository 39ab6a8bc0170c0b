//! Bus connection configuration.

use serde::{Deserialize, Serialize};

/// Default port providers accept observer sessions on.
pub const DEFAULT_SERVICE_PORT: u16 = 5001;

/// Default prefix of peer names taking part in observation.
pub const DEFAULT_NAME_PREFIX: &str = "ddbus.A";

/// Configuration for one `BusConnection`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Announcements from peers whose name lacks this prefix are ignored.
    pub name_prefix: String,
    /// Session port providers bind and announce.
    pub service_port: u16,
    /// Seconds between liveness probes.
    pub probe_interval_secs: u64,
    /// Consecutive failed probes before a destination is considered lost.
    pub probe_miss_threshold: u32,
    /// Default deadline for remote method calls, in milliseconds.
    pub method_timeout_ms: u64,
    /// Default `tracing` filter directive.
    pub log_filter: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            service_port: DEFAULT_SERVICE_PORT,
            probe_interval_secs: 15,
            probe_miss_threshold: 2,
            method_timeout_ms: 25_000,
            log_filter: "info".to_string(),
        }
    }
}

impl BusConfig {
    /// Whether `peer_name` belongs to the observation domain.
    pub fn accepts_peer(&self, peer_name: &str) -> bool {
        peer_name.starts_with(&self.name_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.service_port, 5001);
        assert_eq!(config.probe_interval_secs, 15);
        assert_eq!(config.method_timeout_ms, 25_000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BusConfig = serde_json::from_str(r#"{"service_port": 6000}"#).unwrap();
        assert_eq!(config.service_port, 6000);
        assert_eq!(config.name_prefix, DEFAULT_NAME_PREFIX);
    }

    #[test]
    fn test_accepts_peer() {
        let config = BusConfig::default();
        assert!(config.accepts_peer("ddbus.Aabc123"));
        assert!(!config.accepts_peer("org.other.app"));
    }
}
