//! Tuning knobs for the forwarding path.
//!
//! Mode, upstream and whitelist location come from the CLI (see
//! [`crate::cli`]). Everything here is an operational limit read from
//! `HAGATE_*` environment variables; bad values are logged and replaced by
//! the default.

use std::time::Duration;

use hagate_core::config::parse_env_warn;

/// Runtime configuration for the hagate proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // ─────────────────────────────────────────────────────────────────────────
    // Request handling
    // ─────────────────────────────────────────────────────────────────────────
    /// Maximum request body buffered for entity extraction.
    /// Larger requests receive 413 Payload Too Large.
    pub max_body_bytes: usize,

    /// Per-connection ceiling, guards against slow-drip clients.
    pub request_timeout: Duration,

    // ─────────────────────────────────────────────────────────────────────────
    // Upstream
    // ─────────────────────────────────────────────────────────────────────────
    /// Time allowed for the upstream to produce response headers.
    pub upstream_timeout: Duration,

    pub connect_timeout: Duration,

    /// Idle connections kept per upstream host.
    pub pool_max_idle_per_host: usize,

    /// Disable Nagle's algorithm on inbound and upstream sockets.
    pub tcp_nodelay: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 2 * 1024 * 1024, // 2 MiB
            request_timeout: Duration::from_secs(300),
            upstream_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 32,
            tcp_nodelay: true,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// - `HAGATE_MAX_BODY_BYTES` (default: 2097152)
    /// - `HAGATE_REQUEST_TIMEOUT_SECS` (default: 300)
    /// - `HAGATE_UPSTREAM_TIMEOUT_SECS` (default: 30)
    /// - `HAGATE_CONNECT_TIMEOUT_SECS` (default: 10)
    /// - `HAGATE_POOL_MAX_IDLE` (default: 32)
    /// - `HAGATE_TCP_NODELAY` (default: true)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_body_bytes: parse_env_warn("HAGATE_MAX_BODY_BYTES", default.max_body_bytes),

            request_timeout: Duration::from_secs(parse_env_warn(
                "HAGATE_REQUEST_TIMEOUT_SECS",
                default.request_timeout.as_secs(),
            )),

            upstream_timeout: Duration::from_secs(parse_env_warn(
                "HAGATE_UPSTREAM_TIMEOUT_SECS",
                default.upstream_timeout.as_secs(),
            )),

            connect_timeout: Duration::from_secs(parse_env_warn(
                "HAGATE_CONNECT_TIMEOUT_SECS",
                default.connect_timeout.as_secs(),
            )),

            pool_max_idle_per_host: parse_env_warn(
                "HAGATE_POOL_MAX_IDLE",
                default.pool_max_idle_per_host,
            ),

            tcp_nodelay: parse_env_warn("HAGATE_TCP_NODELAY", default.tcp_nodelay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.max_body_bytes, 2 * 1024 * 1024);
        assert_eq!(config.upstream_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert_eq!(config.pool_max_idle_per_host, 32);
        assert!(config.tcp_nodelay);
    }

    #[test]
    #[serial_test::serial]
    fn test_config_env_loading() {
        unsafe {
            std::env::set_var("HAGATE_MAX_BODY_BYTES", "1024");
            std::env::set_var("HAGATE_UPSTREAM_TIMEOUT_SECS", "5");
            std::env::set_var("HAGATE_TCP_NODELAY", "false");
        }

        let config = ProxyConfig::from_env();
        assert_eq!(config.max_body_bytes, 1024);
        assert_eq!(config.upstream_timeout, Duration::from_secs(5));
        assert!(!config.tcp_nodelay);

        unsafe {
            std::env::remove_var("HAGATE_MAX_BODY_BYTES");
            std::env::remove_var("HAGATE_UPSTREAM_TIMEOUT_SECS");
            std::env::remove_var("HAGATE_TCP_NODELAY");
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_env_falls_back_to_default() {
        unsafe {
            std::env::set_var("HAGATE_POOL_MAX_IDLE", "lots");
        }
        assert_eq!(ProxyConfig::from_env().pool_max_idle_per_host, 32);
        unsafe {
            std::env::remove_var("HAGATE_POOL_MAX_IDLE");
        }
    }
}
