//! Admin listener: probes and Prometheus scrape endpoint.
//!
//! Bound on the proxy's host at `HAGATE_ADMIN_PORT` (8081). Routes:
//! `/health`, `/ready` (from `hagate_core::lifecycle`) and `/metrics`.
//! Traffic here never reaches the mode controller.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ports::admin_port;
use hagate_core::lifecycle::{LifecycleManager, health_router};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Debug, Clone)]
pub struct AdminServerConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for AdminServerConfig {
    fn default() -> Self {
        Self::for_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl AdminServerConfig {
    /// Admin port from the environment, on `host`.
    #[must_use]
    pub fn for_host(host: IpAddr) -> Self {
        Self {
            host,
            port: admin_port(),
        }
    }

    #[must_use]
    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        (self.host, self.port).into()
    }
}

pub struct AdminServer {
    addr: SocketAddr,
    router: Router,
}

impl AdminServer {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        registry: Arc<Registry>,
        config: AdminServerConfig,
    ) -> Self {
        let scrape = Router::new()
            .route("/metrics", get(scrape_metrics))
            .with_state(registry);
        Self {
            addr: config.bind_addr(),
            router: health_router(lifecycle).merge(scrape),
        }
    }

    /// The admin routes, for serving or for driving directly in tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Bind failures and fatal accept errors.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Admin server listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("Admin server stopped");
        Ok(())
    }
}

async fn scrape_metrics(State(registry): State<Arc<Registry>>) -> Response {
    let mut text = String::new();
    match prometheus_client::encoding::text::encode(&mut text, &registry) {
        Ok(()) => ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], text).into_response(),
        Err(e) => {
            error!(error = %e, "Metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
