//! Runs the full proxy stack on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hagate_core::extract::EntityExtractor;
use hagate_core::lifecycle::{LifecycleConfig, LifecycleManager};
use hagate_core::metrics::GateMetrics;
use hagate_core::{Mode, ModeController, Whitelist, WhitelistStore};
use hagate_proxy::logging_layer::logging_layer;
use hagate_proxy::proxy_config::ProxyConfig;
use hagate_proxy::proxy_service::ProxyService;
use hagate_proxy::server;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use prometheus_client::registry::Registry;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;

pub struct GateBuilder {
    mode: Mode,
    whitelist: Whitelist,
    upstream: String,
    extractor: Option<Arc<dyn EntityExtractor>>,
    config: ProxyConfig,
}

impl GateBuilder {
    pub fn new(mode: Mode, upstream: impl Into<String>) -> Self {
        Self {
            mode,
            whitelist: Whitelist::new(),
            upstream: upstream.into(),
            extractor: None,
            config: ProxyConfig::default(),
        }
    }

    pub fn whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn start(self) -> Gate {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(WhitelistStore::new(
            dir.path().join("config.yaml"),
            self.whitelist,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(self.mode, LifecycleConfig::default()));
        lifecycle.mark_whitelist_loaded();

        let mut registry = Registry::default();
        let metrics = Arc::new(GateMetrics::new(&mut registry));

        let mut controller =
            ModeController::new(self.mode, store.clone()).with_metrics(metrics.clone());
        if let Some(extractor) = self.extractor {
            controller = controller.with_extractor(extractor);
        }

        let service = ProxyService::new(
            &self.upstream,
            controller,
            lifecycle.clone(),
            self.config.clone(),
        )
        .unwrap()
        .with_metrics(metrics);
        let stack = ServiceBuilder::new().layer(logging_layer()).service(service);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        lifecycle.mark_ready();

        let server_task = tokio::spawn(server::serve(
            listener,
            stack,
            lifecycle.clone(),
            self.config,
            lifecycle.shutdown_token(),
        ));

        Gate {
            addr,
            store,
            lifecycle,
            registry: Arc::new(registry),
            server_task,
            client: Client::builder(TokioExecutor::new()).build_http(),
            _dir: dir,
        }
    }
}

pub struct Gate {
    pub addr: SocketAddr,
    pub store: Arc<WhitelistStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub registry: Arc<Registry>,
    pub server_task: JoinHandle<()>,
    client: Client<HttpConnector, Full<Bytes>>,
    _dir: TempDir,
}

/// Status, headers and body of a response from the gate.
pub struct GateResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GateResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

impl Gate {
    pub async fn get(&self, path: &str) -> GateResponse {
        self.send(Method::GET, path, &[], Bytes::new()).await
    }

    pub async fn post_json(&self, path: &str, body: &serde_json::Value) -> GateResponse {
        self.send(
            Method::POST,
            path,
            &[("content-type", "application/json")],
            Bytes::from(body.to_string()),
        )
        .await
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> GateResponse {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.addr, path));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let response = self
            .client
            .request(builder.body(Full::new(body)).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        GateResponse {
            status,
            headers,
            body,
        }
    }

    pub fn metrics_text(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry).unwrap();
        buffer
    }
}
