//! `/health` and `/ready` probes.
//!
//! Liveness stays 200 through shutdown so an orchestrator does not kill a
//! process that is still draining; it flips to 503 only once stopped.
//! Readiness is 200 only while `Ready` with the whitelist loaded.
//!
//! The proxy port answers its own `/health` with the same
//! [`HealthResponse`], adding the upstream URL.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use super::{LifecycleManager, LifecycleState};

/// Body of a successful liveness probe.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// `learn` or `limit`.
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ha_url: Option<String>,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

impl HealthResponse {
    #[must_use]
    pub fn healthy(lifecycle: &LifecycleManager, ha_url: Option<String>) -> Self {
        Self {
            status: "healthy",
            mode: lifecycle.mode().as_str(),
            ha_url,
            version: lifecycle.version(),
            uptime_seconds: lifecycle.uptime_seconds(),
        }
    }
}

/// Preconditions for serving traffic.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessChecks {
    pub whitelist_loaded: bool,
}

impl ReadinessChecks {
    #[must_use]
    pub fn all_pass(&self) -> bool {
        self.first_failure().is_none()
    }

    /// Name of the first check that does not pass.
    #[must_use]
    pub fn first_failure(&self) -> Option<&'static str> {
        if !self.whitelist_loaded {
            return Some("whitelist_loaded");
        }
        None
    }
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// `ready` or `not_ready`.
    pub status: &'static str,
    pub checks: ReadinessChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReadinessResponse {
    /// Evaluate readiness against the current lifecycle.
    fn evaluate(lifecycle: &LifecycleManager) -> (StatusCode, Self) {
        let checks = lifecycle.readiness_checks();
        let reason = match lifecycle.state() {
            LifecycleState::ShuttingDown | LifecycleState::Stopped => {
                Some("shutting_down".to_string())
            }
            state => match checks.first_failure() {
                Some(check) => Some(check.to_string()),
                None if state != LifecycleState::Ready => Some(format!("lifecycle_state: {state}")),
                None => None,
            },
        };

        let status = if reason.is_none() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let body = Self {
            status: if reason.is_none() { "ready" } else { "not_ready" },
            checks,
            reason,
        };
        (status, body)
    }
}

/// Router with `GET /health` and `GET /ready`, for merging into the admin server.
pub fn health_router(lifecycle: Arc<LifecycleManager>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .with_state(lifecycle)
}

async fn liveness(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    if lifecycle.state() == LifecycleState::Stopped {
        let body = serde_json::json!({ "status": "unhealthy", "reason": "service_stopped" });
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }
    Json(HealthResponse::healthy(&lifecycle, None)).into_response()
}

async fn readiness(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    let (status, body) = ReadinessResponse::evaluate(&lifecycle);
    (status, Json(body)).into_response()
}
