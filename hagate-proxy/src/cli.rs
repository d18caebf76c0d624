//! Command-line interface.
//!
//! Every flag has an environment fallback so the proxy can run as a
//! Home Assistant add-on or container without arguments.

use std::path::PathBuf;

use clap::Parser;
use hagate_core::config::{
    DEFAULT_HA_URL, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_WHITELIST_PATH, Settings, SettingsError,
};

/// Learn-and-limit reverse proxy for the Home Assistant REST API.
#[derive(Parser, Debug, Clone)]
#[command(name = "hagate", author, version, about, long_about = None)]
pub struct Cli {
    /// Home Assistant base URL requests are forwarded to
    #[arg(long, env = "HA_URL", default_value = DEFAULT_HA_URL)]
    pub ha_url: String,

    /// Operating mode: `learn` records traffic, `limit` enforces the whitelist
    #[arg(long, env = "MODE", default_value = "limit")]
    pub mode: String,

    /// Whitelist YAML file
    #[arg(long, env = "CONFIG_PATH", default_value = DEFAULT_WHITELIST_PATH)]
    pub config: PathBuf,

    /// Proxy listen port
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Proxy bind address
    #[arg(long, env = "HOST", default_value = DEFAULT_HOST)]
    pub host: String,
}

impl Cli {
    /// Validate the raw arguments.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` for an unknown mode, a bad upstream URL or an
    /// unparseable host.
    pub fn into_settings(self) -> Result<Settings, SettingsError> {
        Settings::new(&self.mode, &self.ha_url, self.config, &self.host, self.port)
    }
}
