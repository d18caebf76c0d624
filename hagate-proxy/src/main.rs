//! hagate - learn-and-limit reverse proxy for the Home Assistant REST API.
//!
//! In `learn` mode every request is forwarded and the endpoints and entities
//! it touches are recorded into the whitelist file. In `limit` mode only
//! requests matching that whitelist are forwarded; everything else gets 403.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use clap::Parser;
use hagate_core::lifecycle::{DrainResult, LifecycleConfig, LifecycleManager};
use hagate_core::metrics::GateMetrics;
use hagate_core::whitelist::{PersistConfig, WhitelistPersister};
use hagate_core::{Mode, ModeController, WhitelistStore};
use hagate_proxy::admin::{AdminServer, AdminServerConfig};
use hagate_proxy::cli::Cli;
use hagate_proxy::logging_layer::logging_layer;
use hagate_proxy::proxy_config::ProxyConfig;
use hagate_proxy::proxy_service::ProxyService;
use hagate_proxy::server;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Non-blocking writer so logging never stalls the runtime; the guard
    // flushes on drop and must live until main returns.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = match Cli::parse().into_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid settings, refusing to start");
            return Err(e.into());
        }
    };
    let proxy_config = ProxyConfig::from_env();

    let lifecycle = Arc::new(LifecycleManager::new(
        settings.mode,
        LifecycleConfig::from_env(),
    ));
    let shutdown = lifecycle.shutdown_token();

    info!(
        version = lifecycle.version(),
        mode = %settings.mode,
        ha_url = settings.upstream_base(),
        whitelist = %settings.whitelist_path.display(),
        bind = %settings.bind_addr(),
        "hagate starting"
    );

    // An unreadable or unparseable whitelist is fatal in both modes.
    let store = match WhitelistStore::load(&settings.whitelist_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(
                error = %e,
                path = %settings.whitelist_path.display(),
                "Failed to load whitelist, refusing to start"
            );
            return Err(e.into());
        }
    };
    lifecycle.mark_whitelist_loaded();

    let (endpoints, entities) = store.counts();
    info!(endpoints, entities, "Whitelist loaded");
    if settings.mode == Mode::Limit && endpoints == 0 {
        warn!(
            path = %settings.whitelist_path.display(),
            "Whitelist has no endpoints, every request will be denied"
        );
    }

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(GateMetrics::new(&mut registry));
    let registry = Arc::new(registry);

    let controller =
        ModeController::new(settings.mode, store.clone()).with_metrics(metrics.clone());

    // The persister gets its own token so its final save runs after draining,
    // once no request can record anything new.
    let persist_shutdown = CancellationToken::new();
    let persister = (settings.mode == Mode::Learn).then(|| {
        let persister = WhitelistPersister::new(store.clone(), PersistConfig::from_env())
            .with_metrics(metrics.clone());
        tokio::spawn(persister.run(persist_shutdown.clone()))
    });

    let admin_config = AdminServerConfig::for_host(settings.host);
    let admin_addr = admin_config.bind_addr();
    let admin = AdminServer::new(lifecycle.clone(), registry, admin_config);
    let admin_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = admin.run(admin_shutdown).await {
            error!(error = %e, "Admin server error");
        }
    });
    info!(addr = %admin_addr, "Admin server started (/health, /ready, /metrics)");

    let proxy_service = ProxyService::new(
        settings.upstream_base(),
        controller,
        lifecycle.clone(),
        proxy_config.clone(),
    )?
    .with_metrics(metrics);
    let service_stack = ServiceBuilder::new()
        .layer(logging_layer())
        .service(proxy_service);

    let listener = TcpListener::bind(settings.bind_addr()).await?;
    info!(
        addr = %settings.bind_addr(),
        max_body_bytes = proxy_config.max_body_bytes,
        upstream_timeout_secs = proxy_config.upstream_timeout.as_secs(),
        "Proxy listening"
    );

    setup_signal_handlers(lifecycle.clone());
    lifecycle.mark_ready();

    server::serve(
        listener,
        service_stack,
        lifecycle.clone(),
        proxy_config,
        shutdown,
    )
    .await;

    info!(
        active_requests = lifecycle.active_request_count(),
        drain_timeout_secs = lifecycle.config().drain_timeout.as_secs(),
        "Waiting for active requests to drain"
    );
    let drain_result = lifecycle.drain_requests().await;

    persist_shutdown.cancel();
    let save_result = match persister {
        Some(handle) => match handle.await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("persister task failed: {e}")),
        },
        None => Ok(()),
    };

    lifecycle.mark_stopped();

    if let Err(e) = save_result {
        error!(error = %e, "Final whitelist save failed, learned entries may be lost");
        return Err(format!("final whitelist save failed: {e}").into());
    }

    match drain_result {
        DrainResult::Complete => {
            info!("All requests drained, shutting down cleanly");
            Ok(())
        }
        DrainResult::Timeout { remaining } => Err(format!(
            "Drain timeout exceeded with {} remaining requests",
            remaining
        )
        .into()),
    }
}

/// SIGINT and SIGTERM both begin graceful shutdown.
fn setup_signal_handlers(lifecycle: Arc<LifecycleManager>) {
    let lifecycle_sigint = lifecycle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                lifecycle_sigint.begin_shutdown();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
                lifecycle.begin_shutdown();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
            }
        }
    });

    #[cfg(not(unix))]
    let _ = lifecycle;
}
