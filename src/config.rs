//! `kvd.toml` configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level server configuration. Every field has a default, so an empty
/// file is a valid configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KvdConfig {
    /// Address the TCP listener binds.
    #[serde(default = "KvdConfig::default_bind")]
    pub bind: String,
    #[serde(default = "KvdConfig::default_port")]
    pub port: u16,
    /// Optional Unix-domain listener path. Omit to disable.
    #[serde(default)]
    pub unixsocket: Option<String>,
    /// Listen backlog.
    #[serde(default = "KvdConfig::default_backlog")]
    pub backlog: i32,
    /// Upper bound on simultaneously connected clients; sizes the event
    /// loop's descriptor table.
    #[serde(default = "KvdConfig::default_max_clients")]
    pub max_clients: usize,
    /// Keep-alive probe cadence for accepted sockets, in seconds. 0
    /// disables keep-alive.
    #[serde(default = "KvdConfig::default_tcp_keepalive")]
    pub tcp_keepalive: i32,
    /// Housekeeping timer interval, in milliseconds.
    #[serde(default = "KvdConfig::default_cron_interval_ms")]
    pub cron_interval_ms: u64,
    /// Commands slower than this many microseconds are recorded in the
    /// slow log. Negative disables the log.
    #[serde(default = "KvdConfig::default_slowlog_log_slower_than_us")]
    pub slowlog_log_slower_than_us: i64,
    /// Bound on retained slow log entries.
    #[serde(default = "KvdConfig::default_slowlog_max_len")]
    pub slowlog_max_len: usize,
}

impl KvdConfig {
    fn default_bind() -> String { "127.0.0.1".into() }
    fn default_port() -> u16 { 7379 }
    fn default_backlog() -> i32 { 511 }
    fn default_max_clients() -> usize { 1024 }
    fn default_tcp_keepalive() -> i32 { 300 }
    fn default_cron_interval_ms() -> u64 { 1_000 }
    fn default_slowlog_log_slower_than_us() -> i64 { 10_000 }
    fn default_slowlog_max_len() -> usize { 128 }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// A complete example configuration with every knob spelled out.
    pub fn default_example() -> Self {
        Self {
            bind: Self::default_bind(),
            port: Self::default_port(),
            unixsocket: None,
            backlog: Self::default_backlog(),
            max_clients: Self::default_max_clients(),
            tcp_keepalive: Self::default_tcp_keepalive(),
            cron_interval_ms: Self::default_cron_interval_ms(),
            slowlog_log_slower_than_us: Self::default_slowlog_log_slower_than_us(),
            slowlog_max_len: Self::default_slowlog_max_len(),
        }
    }
}

impl Default for KvdConfig {
    fn default() -> Self {
        Self::default_example()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: KvdConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.port, 7379);
        assert_eq!(cfg.slowlog_max_len, 128);
        assert!(cfg.unixsocket.is_none());
    }

    #[test]
    fn test_partial_config_overrides() {
        let cfg: KvdConfig = toml::from_str(
            "port = 6400\nslowlog_log_slower_than_us = -1\nunixsocket = \"/tmp/kvd.sock\"\n",
        )
        .unwrap();
        assert_eq!(cfg.port, 6400);
        assert_eq!(cfg.slowlog_log_slower_than_us, -1);
        assert_eq!(cfg.unixsocket.as_deref(), Some("/tmp/kvd.sock"));
        assert_eq!(cfg.bind, "127.0.0.1");
    }

    #[test]
    fn test_example_round_trips_through_toml() {
        let example = KvdConfig::default_example();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed: KvdConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.port, example.port);
        assert_eq!(parsed.max_clients, example.max_clients);
    }
}
