//! Accept loop for the proxy port.
//!
//! Every accepted connection holds a [`RequestGuard`](hagate_core::lifecycle::RequestGuard)
//! for its whole life, so shutdown can wait for open connections before the
//! final whitelist save. Connections are served by hyper's auto builder
//! (HTTP/1 and HTTP/2) with upgrades enabled, so WebSocket handshakes can hand
//! the socket to a tunnel task. When the shutdown token fires the loop returns
//! and open connections are told to finish their current exchange.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hagate_core::lifecycle::LifecycleManager;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;
use crate::proxy_config::ProxyConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WireBody = BoxBody<Bytes, BoxError>;

/// How long an open connection may keep going after shutdown begins.
const CONNECTION_GRACE: Duration = Duration::from_secs(5);

/// Raw reply for connections accepted after shutdown began.
const SHUTTING_DOWN_REPLY: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Content-Type: text/plain\r\n\
Content-Length: 24\r\n\
Connection: close\r\n\
\r\n\
hagate is shutting down\n";

/// Serve `service` on `listener` until `shutdown` is cancelled.
///
/// Returns as soon as accepting stops; connection tasks keep running and are
/// awaited through [`LifecycleManager::drain_requests`].
pub async fn serve<S, B>(
    listener: TcpListener,
    service: S,
    lifecycle: Arc<LifecycleManager>,
    config: ProxyConfig,
    shutdown: CancellationToken,
) where
    S: Service<Request<Incoming>, Response = Response<B>, Error = ProxyError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Proxy listener closed");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        let Some(guard) = lifecycle.track_request() else {
            debug!(peer = %peer, "Connection during shutdown, answering 503");
            tokio::spawn(reject_during_shutdown(stream));
            continue;
        };

        if let Err(e) = stream.set_nodelay(config.tcp_nodelay) {
            debug!(error = %e, "set_nodelay failed");
        }

        let service = service.clone();
        let shutdown = shutdown.clone();
        let limit = config.request_timeout;
        tokio::spawn(async move {
            let served = serve_connection(stream, peer, service, shutdown);
            if tokio::time::timeout(limit, served).await.is_err() {
                warn!(
                    peer = %peer,
                    limit_secs = limit.as_secs(),
                    "Connection exceeded request timeout, closing"
                );
            }
            drop(guard);
        });
    }
}

async fn serve_connection<S, B>(
    stream: TcpStream,
    peer: SocketAddr,
    service: S,
    shutdown: CancellationToken,
) where
    S: Service<Request<Incoming>, Response = Response<B>, Error = ProxyError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let hyper_service = hyper::service::service_fn(move |req| {
        let mut service = service.clone();
        async move { Ok::<_, Infallible>(into_wire(service.call(req).await)) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), hyper_service);
    tokio::pin!(conn);

    tokio::select! {
        outcome = &mut conn => {
            if let Err(e) = outcome {
                debug!(peer = %peer, error = %e, "Connection closed with error");
            }
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if tokio::time::timeout(CONNECTION_GRACE, conn).await.is_err() {
                debug!(peer = %peer, "Connection still open after grace period");
            }
        }
    }
}

/// Service errors become their status response; the connection stays up.
fn into_wire<B>(result: Result<Response<B>, ProxyError>) -> Response<WireBody>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    match result {
        Ok(response) => response.map(|body| body.map_err(|e| -> BoxError { e.into() }).boxed()),
        Err(e) => {
            debug!(error = %e, kind = e.kind(), "Answering with proxy error");
            e.to_response().map(|body| body.map_err(|never| match never {}).boxed())
        }
    }
}

async fn reject_during_shutdown(mut stream: TcpStream) {
    let written = async {
        stream.write_all(SHUTTING_DOWN_REPLY).await?;
        stream.shutdown().await
    };
    if let Err(e) = written.await {
        debug!(error = %e, "Failed to send shutdown reply");
    }
}
