//! Gate-and-forward service.
//!
//! # Request Flow
//!
//! ```text
//! Request ──► /health? ──yes──► local HealthResponse
//!                │
//!                no
//!                ▼
//!        buffer body (Limited, 413 on overflow)
//!                ▼
//!        RequestContext ──► ModeController::evaluate
//!                │
//!      ┌─────────┴──────────┐
//!    Deny                 Allow
//!      │                    │
//!   403 {"error": ..}   WebSocket handshake? ──yes──► tunnel (see `websocket`)
//!                           │
//!                           no
//!                           ▼
//!                   forward to Home Assistant, stream response back
//! ```
//!
//! Request bodies are buffered because the extractor reads service-call
//! payloads; the same bytes are sent upstream. Response bodies are never
//! inspected.

use std::error::Error as _;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use hagate_core::extract::RequestContext;
use hagate_core::lifecycle::{HealthResponse, LifecycleManager};
use hagate_core::metrics::GateMetrics;
use hagate_core::mode::HEALTH_PATH;
use hagate_core::pattern::canonicalize_path;
use hagate_core::{Decision, ModeController};
use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, BodyStream, Full, LengthLimitError, Limited, StreamBody};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, header};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::Serialize;
use tower::Service;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::proxy_config::ProxyConfig;
use crate::websocket;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type for everything the proxy returns.
///
/// Local responses are `Full<Bytes>`, forwarded ones stream; both are boxed.
pub type UnifiedBody = BoxBody<Bytes, ProxyError>;

/// Headers never forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Whitelist-enforcing reverse proxy in front of one upstream.
#[derive(Clone)]
pub struct ProxyService {
    /// Upstream client; request bodies are already buffered.
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    /// Upstream base URL without trailing slash
    upstream_base: Arc<str>,
    controller: ModeController,
    lifecycle: Arc<LifecycleManager>,
    metrics: Option<Arc<GateMetrics>>,
    config: ProxyConfig,
}

impl ProxyService {
    /// Create a proxy service forwarding to `upstream_base`.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Connection` if the TLS crypto provider cannot be
    /// installed.
    pub fn new(
        upstream_base: &str,
        controller: ModeController,
        lifecycle: Arc<LifecycleManager>,
        config: ProxyConfig,
    ) -> ProxyResult<Self> {
        // Installed once per process; later calls reuse the first result.
        static RUSTLS_INIT: std::sync::OnceLock<Result<(), ()>> = std::sync::OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init_result.is_err() {
            return Err(ProxyError::Connection(
                "Failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(config.tcp_nodelay);
        http_connector.set_connect_timeout(Some(config.connect_timeout));
        http_connector.enforce_http(false);

        let tls = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!(
                    error = %e,
                    "No native TLS roots found, https upstreams will fail certificate verification"
                );
                HttpsConnectorBuilder::new().with_tls_config(
                    rustls::ClientConfig::builder()
                        .with_root_certificates(rustls::RootCertStore::empty())
                        .with_no_client_auth(),
                )
            }
        };
        let https_connector = tls
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .pool_timer(TokioTimer::new())
            .build(https_connector);

        Ok(Self {
            client,
            upstream_base: Arc::from(upstream_base.trim_end_matches('/')),
            controller,
            lifecycle,
            metrics: None,
            config,
        })
    }

    /// Count upstream failures in `hagate_upstream_errors_total`.
    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn upstream_base(&self) -> &str {
        &self.upstream_base
    }

    /// Gate one request and, if allowed, forward it.
    pub async fn handle_request<B>(&self, req: Request<B>) -> ProxyResult<Response<UnifiedBody>>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if canonicalize_path(req.uri().path()) == HEALTH_PATH {
            let health =
                HealthResponse::healthy(&self.lifecycle, Some(self.upstream_base.to_string()));
            return Ok(json_response(StatusCode::OK, &health));
        }

        let (parts, body) = req.into_parts();
        let body = self.collect_body(body).await?;

        let ctx = RequestContext::from_http_parts(&parts, &body);
        if let Decision::Deny(reason) = self.controller.evaluate(&ctx) {
            return Ok(json_response(
                StatusCode::FORBIDDEN,
                &serde_json::json!({ "error": reason.message() }),
            ));
        }

        let result = if websocket::is_upgrade_request(&parts.method, &parts.headers) {
            self.open_tunnel(parts).await
        } else {
            self.forward(parts, body).await
        };
        result.inspect_err(|e| {
            if let Some(metrics) = &self.metrics {
                metrics.record_upstream_error(e.kind());
            }
        })
    }

    /// Connect to the upstream socket, then answer `101` and relay in the
    /// background.
    async fn open_tunnel(
        &self,
        mut parts: http::request::Parts,
    ) -> ProxyResult<Response<UnifiedBody>> {
        let Some(on_upgrade) = parts.extensions.remove::<OnUpgrade>() else {
            return Err(ProxyError::Upgrade(
                "connection does not support upgrades".into(),
            ));
        };
        let Some(key) = parts.headers.get(header::SEC_WEBSOCKET_KEY) else {
            return Err(ProxyError::Upgrade("missing Sec-WebSocket-Key".into()));
        };

        let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
        let url = websocket::socket_url(&self.upstream_base, path)?;
        debug!(target = %url, "Opening upstream WebSocket");
        let upstream = websocket::connect_upstream(&url, self.config.upstream_timeout).await?;

        let response = websocket::switching_protocols(key)?;
        websocket::spawn_tunnel(
            on_upgrade,
            upstream,
            self.controller.clone(),
            Arc::clone(&self.lifecycle),
        );
        Ok(response)
    }

    async fn collect_body<B>(&self, body: B) -> ProxyResult<Bytes>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let limit = self.config.max_body_bytes;
        match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                warn!(limit, "Request body exceeds size limit");
                Err(ProxyError::BodyTooLarge { limit })
            }
            Err(e) => {
                debug!(error = %e, "Failed to read request body");
                Err(ProxyError::ClientDisconnect)
            }
        }
    }

    async fn forward(
        &self,
        parts: http::request::Parts,
        body: Bytes,
    ) -> ProxyResult<Response<UnifiedBody>> {
        let target_uri = self.target_uri(&parts.uri)?;
        debug!(method = %parts.method, target = %target_uri, "Forwarding request");

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let mut upstream_req = Request::new(Full::new(body));
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = target_uri;
        *upstream_req.headers_mut() = headers;

        let upstream_timeout = self.config.upstream_timeout;
        let upstream_res =
            match tokio::time::timeout(upstream_timeout, self.client.request(upstream_req)).await {
                Ok(result) => result.map_err(map_hyper_error)?,
                Err(_) => {
                    warn!(
                        timeout_secs = upstream_timeout.as_secs(),
                        "Upstream did not respond in time"
                    );
                    return Err(ProxyError::Timeout(format!(
                        "no response within {}s",
                        upstream_timeout.as_secs()
                    )));
                }
            };

        let (mut parts, body) = upstream_res.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let stream = BodyStream::new(body).map(|result| {
            result.map_err(|e| ProxyError::Connection(format!("Body stream error: {}", e)))
        });
        Ok(Response::from_parts(parts, BodyExt::boxed(StreamBody::new(stream))))
    }

    /// Upstream base joined with the original (still encoded) path and query.
    fn target_uri(&self, uri: &Uri) -> ProxyResult<Uri> {
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.upstream_base, path)
            .parse()
            .map_err(|e| ProxyError::InvalidUri(format!("Failed to parse upstream URI: {}", e)))
    }
}

impl<B> Service<Request<B>> for ProxyService
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<UnifiedBody>;
    type Error = ProxyError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.handle_request(req).await })
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<UnifiedBody> {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            br#"{"error":"Internal Server Error"}"#.to_vec(),
        ),
    };
    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Check if a header is hop-by-hop and must not be forwarded.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Map hyper_util client errors to `ProxyError` variants.
///
/// - Connection refused -> `ProxyError::ConnectionRefused` (502)
/// - Timeout -> `ProxyError::Timeout` (504)
/// - Other errors -> `ProxyError::Connection` (502)
fn map_hyper_error(e: hyper_util::client::legacy::Error) -> ProxyError {
    // The top-level message is generic; the cause is further down the chain.
    let mut chain = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    let lower = chain.to_lowercase();

    if lower.contains("connection refused") {
        warn!(error = %chain, "Upstream connection refused");
        return ProxyError::ConnectionRefused(chain);
    }

    if lower.contains("timeout") || lower.contains("timed out") {
        warn!(error = %chain, "Upstream timeout");
        return ProxyError::Timeout(chain);
    }

    if e.is_connect() {
        warn!(error = %chain, "Upstream connection failed");
        return ProxyError::Connection(format!("Failed to connect to upstream: {}", chain));
    }

    warn!(error = %chain, "Upstream error");
    ProxyError::Connection(format!("Upstream error: {}", chain))
}
