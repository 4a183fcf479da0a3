//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use jchat_shared::constants::{DEFAULT_MAX_BODY_LEN, DEFAULT_PORT, MAX_LINE_LEN};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP address to accept clients on.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:8081`
    pub listen_addr: SocketAddr,

    /// Root of the on-disk state: `message/` holds offline logs,
    /// `files/` holds uploads.
    /// Env: `DATA_DIR`
    /// Default: `./data`
    pub data_dir: PathBuf,

    /// Threads running request handlers.
    /// Env: `WORKER_THREADS`
    /// Default: `8`
    pub worker_threads: usize,

    /// Threads draining the notification queue.
    /// Env: `NOTIFY_THREADS`
    /// Default: `2`
    pub notify_threads: usize,

    /// Upper bound on one readiness wait.
    /// Env: `POLL_TIMEOUT_MS`
    /// Default: `1000`
    pub poll_timeout: Duration,

    /// Readiness events collected per wait.
    /// Env: `MAX_EVENTS`
    /// Default: `128`
    pub max_events: usize,

    /// Maximum number of concurrent clients (0 = unlimited).
    /// Env: `MAX_CONNECTIONS`
    /// Default: `0`
    pub max_connections: usize,

    /// Largest accepted `Content-Length`.
    /// Env: `MAX_BODY_SIZE`
    /// Default: 50 MiB
    pub max_body_size: usize,

    /// Longest initial or header line.
    pub max_line_len: usize,

    /// Queued outbound bytes above which a connection stops being read
    /// until its backlog is flushed.
    /// Env: `OUTBOUND_HIGH_WATER`
    /// Default: 4 MiB
    pub outbound_high_water: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_PORT).into(),
            data_dir: PathBuf::from("./data"),
            worker_threads: 8,
            notify_threads: 2,
            poll_timeout: Duration::from_millis(1000),
            max_events: 128,
            max_connections: 0,
            max_body_size: DEFAULT_MAX_BODY_LEN,
            max_line_len: MAX_LINE_LEN,
            outbound_high_water: 4 * 1024 * 1024, // 4 MiB
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("LISTEN_ADDR") {
            if let Some(parsed) = parse_var::<SocketAddr>("LISTEN_ADDR", &addr) {
                config.listen_addr = parsed;
            }
        }

        if let Some(path) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(path);
        }

        if let Some(val) = lookup("WORKER_THREADS") {
            if let Some(n) = parse_positive("WORKER_THREADS", &val) {
                config.worker_threads = n;
            }
        }

        if let Some(val) = lookup("NOTIFY_THREADS") {
            if let Some(n) = parse_positive("NOTIFY_THREADS", &val) {
                config.notify_threads = n;
            }
        }

        if let Some(val) = lookup("POLL_TIMEOUT_MS") {
            if let Some(ms) = parse_var::<u64>("POLL_TIMEOUT_MS", &val) {
                config.poll_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(val) = lookup("MAX_EVENTS") {
            if let Some(n) = parse_positive("MAX_EVENTS", &val) {
                config.max_events = n;
            }
        }

        if let Some(val) = lookup("MAX_CONNECTIONS") {
            if let Some(n) = parse_var::<usize>("MAX_CONNECTIONS", &val) {
                config.max_connections = n;
            }
        }

        if let Some(val) = lookup("MAX_BODY_SIZE") {
            if let Some(n) = parse_var::<usize>("MAX_BODY_SIZE", &val) {
                config.max_body_size = n;
            }
        }

        if let Some(val) = lookup("OUTBOUND_HIGH_WATER") {
            if let Some(n) = parse_positive("OUTBOUND_HIGH_WATER", &val) {
                config.outbound_high_water = n;
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid value, using default");
            None
        }
    }
}

fn parse_positive(key: &str, value: &str) -> Option<usize> {
    match parse_var::<usize>(key, value)? {
        0 => {
            tracing::warn!(key, "Value must be at least 1, using default");
            None
        }
        n => Some(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, ([0, 0, 0, 0], 8081).into());
        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.notify_threads, 2);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.max_body_size, 50 * 1024 * 1024);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("LISTEN_ADDR", "127.0.0.1:9000"),
            ("DATA_DIR", "/var/lib/jchat"),
            ("WORKER_THREADS", "4"),
            ("POLL_TIMEOUT_MS", "250"),
            ("MAX_CONNECTIONS", "100"),
        ]);
        assert_eq!(config.listen_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/jchat"));
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
        assert_eq!(config.max_connections, 100);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("LISTEN_ADDR", "not an address"),
            ("WORKER_THREADS", "0"),
            ("NOTIFY_THREADS", "many"),
            ("MAX_BODY_SIZE", "-1"),
        ]);
        let defaults = ServerConfig::default();
        assert_eq!(config.listen_addr, defaults.listen_addr);
        assert_eq!(config.worker_threads, defaults.worker_threads);
        assert_eq!(config.notify_threads, defaults.notify_threads);
        assert_eq!(config.max_body_size, defaults.max_body_size);
    }
}
