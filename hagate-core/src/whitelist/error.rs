//! Whitelist load/save error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading or writing the durable whitelist file.
///
/// A missing file is not an error; it loads as an empty whitelist.
#[derive(Debug, Error)]
pub enum WhitelistError {
    /// The file exists but could not be read.
    #[error("failed to read whitelist '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was read but is not a valid whitelist document.
    #[error("failed to parse whitelist '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    /// The in-memory whitelist could not be rendered as YAML.
    #[error("failed to serialize whitelist: {0}")]
    Serialize(String),

    /// The rendered document could not be written into place.
    #[error("failed to persist whitelist to '{path}': {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WhitelistError {
    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            WhitelistError::Io { .. } => "io",
            WhitelistError::Parse { .. } => "parse",
            WhitelistError::Serialize(_) => "serialize",
            WhitelistError::Persist { .. } => "persist",
        }
    }
}
