//! Process lifecycle: readiness, in-flight tracking and shutdown.
//!
//! ```text
//! Starting ──mark_ready──► Ready ──begin_shutdown──► ShuttingDown ──mark_stopped──► Stopped
//! ```
//!
//! `Starting` covers whitelist loading and binding. Once `ShuttingDown` is
//! entered the proxy stops accepting connections, [`LifecycleManager::drain_requests`]
//! waits for open ones, and in learn mode the persister writes its final save
//! before the process reports `Stopped`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::parse_env_warn;
use crate::mode::Mode;

pub mod health;

pub use health::{HealthResponse, ReadinessChecks, ReadinessResponse, health_router};

/// Where the process is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Ready => "ready",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long shutdown waits for open connections.
    pub drain_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl LifecycleConfig {
    /// Reads `HAGATE_DRAIN_TIMEOUT_SECS` (default 10).
    #[must_use]
    pub fn from_env() -> Self {
        let drain_secs = parse_env_warn(
            "HAGATE_DRAIN_TIMEOUT_SECS",
            Self::default().drain_timeout.as_secs(),
        );
        Self {
            drain_timeout: Duration::from_secs(drain_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Shared lifecycle state for the proxy, admin server and persister.
///
/// Wrap in an `Arc`; [`track_request`](Self::track_request) needs one to
/// hand out guards.
pub struct LifecycleManager {
    state: ArcSwap<LifecycleState>,
    mode: Mode,
    config: LifecycleConfig,
    started_at: Instant,
    version: &'static str,

    shutdown: CancellationToken,
    whitelist_loaded: AtomicBool,

    in_flight: AtomicUsize,
    /// Signalled whenever `in_flight` drops to zero.
    idle: Notify,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(mode: Mode, config: LifecycleConfig) -> Self {
        Self {
            state: ArcSwap::from_pointee(LifecycleState::Starting),
            mode,
            config,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
            shutdown: CancellationToken::new(),
            whitelist_loaded: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// True from `begin_shutdown` onwards.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        )
    }

    pub fn mark_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
        info!(
            mode = %self.mode,
            version = self.version,
            startup_ms = self.started_at.elapsed().as_millis() as u64,
            "hagate ready"
        );
    }

    pub fn mark_whitelist_loaded(&self) {
        self.whitelist_loaded.store(true, Ordering::SeqCst);
    }

    /// Token cancelled by [`begin_shutdown`](Self::begin_shutdown).
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Enter `ShuttingDown` and cancel the shutdown token.
    ///
    /// Safe to call more than once (SIGINT and SIGTERM may both arrive); only
    /// the first call logs.
    pub fn begin_shutdown(&self) {
        let previous = self.state.swap(Arc::new(LifecycleState::ShuttingDown));
        self.shutdown.cancel();
        if !matches!(
            *previous,
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        ) {
            info!(
                in_flight = self.active_request_count(),
                "Shutting down, no longer accepting connections"
            );
        }
    }

    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }

    /// Count one unit of in-flight work until the returned guard drops.
    ///
    /// `None` once shutdown has begun.
    #[must_use]
    pub fn track_request(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            manager: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn version(&self) -> &'static str {
        self.version
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    #[must_use]
    pub fn readiness_checks(&self) -> ReadinessChecks {
        ReadinessChecks {
            whitelist_loaded: self.whitelist_loaded.load(Ordering::SeqCst),
        }
    }

    /// Wait until no tracked work remains, or `drain_timeout` passes.
    pub async fn drain_requests(&self) -> DrainResult {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;

        loop {
            // Register before reading the counter so a guard dropped in
            // between still wakes us.
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            let remaining = self.active_request_count();
            if remaining == 0 {
                debug!("Drain complete");
                return DrainResult::Complete;
            }

            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                let remaining = self.active_request_count();
                if remaining == 0 {
                    return DrainResult::Complete;
                }
                warn!(
                    remaining,
                    timeout_secs = self.config.drain_timeout.as_secs(),
                    "Drain timed out with work still in flight"
                );
                return DrainResult::Timeout { remaining };
            }
        }
    }
}

/// Decrements the in-flight count on drop, panics included.
pub struct RequestGuard {
    manager: Arc<LifecycleManager>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.manager.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.manager.idle.notify_waiters();
        }
    }
}

/// Outcome of [`LifecycleManager::drain_requests`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}
