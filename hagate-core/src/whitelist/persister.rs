//! Background persistence for learn mode.
//!
//! The persister flushes the store when either
//!
//! - at least `save_every` mutations are unsaved (checked on every change), or
//! - the periodic interval fires and anything is unsaved,
//!
//! and always performs one final save when the shutdown token is cancelled.
//! Saves run on the blocking pool so request handling never waits on disk.
//! A failed save is logged and counted; the store stays dirty and the next
//! trigger retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{WhitelistError, WhitelistStore};
use crate::config::parse_env_warn;
use crate::metrics::GateMetrics;

/// Save cadence.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Unsaved mutations that trigger an immediate save (default: 10).
    pub save_every: u64,
    /// Periodic flush interval (default: 30s).
    pub interval: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            save_every: 10,
            interval: Duration::from_secs(30),
        }
    }
}

impl PersistConfig {
    /// Load from environment variables.
    ///
    /// - `HAGATE_SAVE_EVERY` (default: 10, minimum 1)
    /// - `HAGATE_SAVE_INTERVAL_SECS` (default: 30, minimum 1)
    #[must_use]
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            save_every: parse_env_warn("HAGATE_SAVE_EVERY", default.save_every).max(1),
            interval: Duration::from_secs(
                parse_env_warn("HAGATE_SAVE_INTERVAL_SECS", default.interval.as_secs()).max(1),
            ),
        }
    }
}

/// Flushes a [`WhitelistStore`] to disk on a cadence.
pub struct WhitelistPersister {
    store: Arc<WhitelistStore>,
    config: PersistConfig,
    metrics: Option<Arc<GateMetrics>>,
}

impl WhitelistPersister {
    #[must_use]
    pub fn new(store: Arc<WhitelistStore>, config: PersistConfig) -> Self {
        Self {
            store,
            config,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Save now on the blocking pool.
    pub async fn flush(&self) -> Result<(), WhitelistError> {
        let store = Arc::clone(&self.store);
        let result = match tokio::task::spawn_blocking(move || store.save()).await {
            Ok(result) => result,
            Err(join_err) => Err(WhitelistError::Persist {
                path: self.store.path().to_path_buf(),
                source: std::io::Error::other(join_err.to_string()),
            }),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_save(result.is_ok());
        }
        if let Err(e) = &result {
            error!(
                error = %e,
                unsaved = self.store.unsaved_mutations(),
                "Whitelist save failed, in-memory whitelist retained"
            );
        }
        result
    }

    /// Run until `shutdown` is cancelled, then perform the final save.
    ///
    /// Returns the outcome of the final save.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), WhitelistError> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        debug!(
            save_every = self.config.save_every,
            interval_secs = self.config.interval.as_secs(),
            "Whitelist persister started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.store.is_dirty() {
                        // Failures are logged in flush and retried next trigger.
                        let _ = self.flush().await;
                    }
                }
                _ = self.store.changed() => {
                    if self.store.unsaved_mutations() >= self.config.save_every {
                        let _ = self.flush().await;
                    }
                }
            }
        }

        info!(
            unsaved = self.store.unsaved_mutations(),
            "Performing final whitelist save"
        );
        self.flush().await
    }
}
