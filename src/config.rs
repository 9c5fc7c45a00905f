//! Configuration knobs for loops, servers and codecs.
//!
//! The crate consumes no environment variables and owns no CLI surface;
//! embedders either fill [`NetConfig`] in code or hand it a TOML snippet.

use serde::Deserialize;

/// Recognized tuning options. Every field has a working default, so
/// `NetConfig::default()` is always usable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Capacity of each loop's cross-thread task queue. 0 = unbounded.
    pub task_queue_capacity: usize,
    /// Maximum ready events collected per poll wait.
    pub max_poll_events: usize,
    /// Receive buffer for a single UDP datagram.
    pub udp_packet_size: usize,
    /// Payload ceiling for length-prefixed frames.
    pub max_msg_len: usize,
    /// Client connect timeout in milliseconds. 0 = no timeout.
    pub connect_timeout_ms: i64,
    /// Client reconnect interval in milliseconds. Negative = never
    /// reconnect, 0 = immediately.
    pub reconnect_interval_ms: i64,
    /// TCP listen backlog.
    pub listen_backlog: i32,
    /// Enable `SO_REUSEPORT` on listeners.
    pub reuse_port: bool,
    /// Worker threads for half-sync/half-async servers.
    pub worker_threads: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            task_queue_capacity: 0,
            max_poll_events: 2048,
            udp_packet_size: 4096,
            max_msg_len: 1024 * 1024,
            connect_timeout_ms: 0,
            reconnect_interval_ms: -1,
            listen_backlog: 20,
            reuse_port: false,
            worker_threads: 4,
        }
    }
}

impl NetConfig {
    /// Parse a TOML document of knob overrides; unspecified fields keep
    /// their defaults.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(ConfigError::TomlParse)
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    TomlParse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::TomlParse(e) => write!(f, "failed to parse config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetConfig::default();
        assert_eq!(config.task_queue_capacity, 0);
        assert_eq!(config.max_poll_events, 2048);
        assert_eq!(config.udp_packet_size, 4096);
        assert_eq!(config.max_msg_len, 1024 * 1024);
        assert_eq!(config.connect_timeout_ms, 0);
        assert_eq!(config.reconnect_interval_ms, -1);
        assert_eq!(config.listen_backlog, 20);
        assert!(!config.reuse_port);
    }

    #[test]
    fn test_toml_overrides() {
        let toml_str = r#"
            max_poll_events = 512
            udp_packet_size = 8192
            reconnect_interval_ms = 500
            reuse_port = true
        "#;

        let config = NetConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.max_poll_events, 512);
        assert_eq!(config.udp_packet_size, 8192);
        assert_eq!(config.reconnect_interval_ms, 500);
        assert!(config.reuse_port);
        // Untouched fields keep defaults.
        assert_eq!(config.listen_backlog, 20);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(NetConfig::from_toml("max_poll_events = \"lots\"").is_err());
    }
}
