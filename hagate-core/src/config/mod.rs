//! Startup settings and environment helpers.
//!
//! [`Settings`] holds the values chosen once at launch: mode, upstream URL,
//! whitelist file and bind address. The proxy binary fills it from CLI flags
//! (with env fallbacks); nothing in it changes while the process runs.
//!
//! Tuning knobs that have sensible defaults are read with
//! [`parse_env_warn`], which logs and falls back instead of failing.

mod error;

pub use error::SettingsError;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tracing::warn;
use url::Url;

use crate::mode::Mode;

pub const DEFAULT_HA_URL: &str = "http://localhost:8123";
pub const DEFAULT_WHITELIST_PATH: &str = "./config.yaml";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

/// Validated startup settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    /// Upstream base URL (http or https).
    pub ha_url: Url,
    /// Durable whitelist file.
    pub whitelist_path: PathBuf,
    pub host: IpAddr,
    pub port: u16,
}

impl Settings {
    /// Validate raw settings values.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if the mode, URL, host or path is invalid.
    pub fn new(
        mode: &str,
        ha_url: &str,
        whitelist_path: impl Into<PathBuf>,
        host: &str,
        port: u16,
    ) -> Result<Self, SettingsError> {
        let whitelist_path = whitelist_path.into();
        if whitelist_path.as_os_str().is_empty() {
            return Err(SettingsError::EmptyWhitelistPath);
        }

        Ok(Self {
            mode: mode.parse()?,
            ha_url: parse_upstream_url(ha_url)?,
            whitelist_path,
            host: parse_host(host)?,
            port,
        })
    }

    /// Address the proxy listener binds to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Upstream base without a trailing slash, ready to prefix request paths.
    #[must_use]
    pub fn upstream_base(&self) -> &str {
        self.ha_url.as_str().trim_end_matches('/')
    }
}

/// Parse and check an upstream base URL.
pub fn parse_upstream_url(raw: &str) -> Result<Url, SettingsError> {
    let url = Url::parse(raw).map_err(|e| SettingsError::InvalidUrl {
        url: raw.to_string(),
        message: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(SettingsError::UnsupportedScheme {
                url: raw.to_string(),
                scheme: other.to_string(),
            });
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(SettingsError::InvalidUrl {
            url: raw.to_string(),
            message: "missing host".to_string(),
        });
    }
    Ok(url)
}

fn parse_host(raw: &str) -> Result<IpAddr, SettingsError> {
    if raw.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    raw.parse().map_err(|_| SettingsError::InvalidHost {
        host: raw.to_string(),
    })
}

/// Parse an environment variable with a warning on invalid values.
///
/// If the env var is set but cannot be parsed, logs a warning and returns the default.
/// If the env var is not set, returns the default silently.
pub fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
