//! Settings error types.

use thiserror::Error;

/// Errors raised while validating startup settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Mode string is neither `learn` nor `limit`.
    #[error("invalid mode '{value}': expected 'learn' or 'limit'")]
    InvalidMode { value: String },

    /// Upstream URL failed to parse.
    #[error("invalid upstream URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// Upstream URL uses a scheme other than http or https.
    #[error("unsupported upstream scheme '{scheme}' in '{url}': expected http or https")]
    UnsupportedScheme { url: String, scheme: String },

    /// Bind host is not a valid IP address.
    #[error("invalid bind host '{host}'")]
    InvalidHost { host: String },

    /// Whitelist path is empty.
    #[error("whitelist path must not be empty")]
    EmptyWhitelistPath,
}
