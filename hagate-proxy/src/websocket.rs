//! WebSocket tunnel for `/api/websocket`.
//!
//! The handshake request has already been allowed by
//! [`ModeController::evaluate`]. The upstream socket is opened before the
//! client gets its `101`, so an unreachable Home Assistant answers `502`
//! instead of a socket that closes straight away. A spawned task then relays
//! frames:
//!
//! ```text
//! client ──text──► evaluate_frame ──forward──► Home Assistant
//!    ▲                  │
//!    └──── not_allowed ─┘
//! client ◄───────────── any frame ──────────── Home Assistant
//! ```
//!
//! In limit mode binary client frames are dropped since they cannot be
//! inspected. Each tunnel holds a lifecycle guard so the drain waits for it,
//! and both sides get a close frame when shutdown begins.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use hagate_core::lifecycle::LifecycleManager;
use hagate_core::{Mode, ModeController};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::proxy_service::UnifiedBody;

/// Socket to Home Assistant.
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// True for a `GET` that asks for `Upgrade: websocket` and carries a
/// `Sec-WebSocket-Key`.
#[must_use]
pub fn is_upgrade_request(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::GET
        && headers.contains_key(header::SEC_WEBSOCKET_KEY)
        && headers
            .get_all(header::UPGRADE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
}

/// The upstream socket URL: `http` becomes `ws` and `https` becomes `wss`.
///
/// # Errors
///
/// `InvalidUri` for any other scheme.
pub fn socket_url(upstream_base: &str, path_and_query: &str) -> ProxyResult<String> {
    if let Some(rest) = upstream_base.strip_prefix("https://") {
        Ok(format!("wss://{rest}{path_and_query}"))
    } else if let Some(rest) = upstream_base.strip_prefix("http://") {
        Ok(format!("ws://{rest}{path_and_query}"))
    } else {
        Err(ProxyError::InvalidUri(format!(
            "Cannot derive a WebSocket URL from {upstream_base}"
        )))
    }
}

/// Open the upstream socket, bounded by `timeout`.
///
/// # Errors
///
/// `ConnectionRefused`/`Connection` (502) or `Timeout` (504).
pub async fn connect_upstream(url: &str, timeout: Duration) -> ProxyResult<UpstreamSocket> {
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(WsError::Io(e))) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            warn!(error = %e, "Upstream WebSocket connection refused");
            Err(ProxyError::ConnectionRefused(e.to_string()))
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Upstream WebSocket handshake failed");
            Err(ProxyError::Connection(format!(
                "WebSocket handshake with upstream failed: {e}"
            )))
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "Upstream WebSocket handshake timed out");
            Err(ProxyError::Timeout(format!(
                "no WebSocket handshake within {}s",
                timeout.as_secs()
            )))
        }
    }
}

/// The `101` answer to a client handshake carrying `key`.
///
/// # Errors
///
/// `Upgrade` if the accept value cannot be put in a header.
pub fn switching_protocols(key: &HeaderValue) -> ProxyResult<Response<UnifiedBody>> {
    let accept = HeaderValue::from_str(&derive_accept_key(key.as_bytes()))
        .map_err(|e| ProxyError::Upgrade(format!("Bad accept key: {e}")))?;

    let mut response = Response::new(Full::new(Bytes::new()).map_err(|e| match e {}).boxed());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    Ok(response)
}

/// Relay between the upgraded client connection and `upstream` in the
/// background.
pub fn spawn_tunnel(
    on_upgrade: OnUpgrade,
    upstream: UpstreamSocket,
    controller: ModeController,
    lifecycle: Arc<LifecycleManager>,
) {
    let guard = lifecycle.track_request();
    let shutdown = lifecycle.shutdown_token();

    let tunnel = async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(error = %e, "Client connection was not upgraded");
                return;
            }
        };
        let client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        info!("WebSocket tunnel open");
        relay(client, upstream, &controller, shutdown).await;
        info!("WebSocket tunnel closed");
        drop(guard);
    };
    tokio::spawn(tunnel.in_current_span());
}

/// Pump frames both ways until either side closes or `shutdown` fires.
pub async fn relay<C, U>(
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
    controller: &ModeController,
    shutdown: CancellationToken,
) where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let drop_binary = controller.mode() == Mode::Limit;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = client_tx.send(Message::Close(None)).await;
                let _ = upstream_tx.send(Message::Close(None)).await;
                break;
            }
            frame = client_rx.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!(error = %e, "Client socket error");
                        break;
                    }
                    None => break,
                };
                match frame {
                    Message::Text(text) => {
                        let verdict = controller.evaluate_frame(text.as_str());
                        for reply in verdict.replies {
                            if client_tx.send(Message::text(reply)).await.is_err() {
                                return;
                            }
                        }
                        if let Some(forward) = verdict.forward
                            && upstream_tx.send(Message::text(forward)).await.is_err()
                        {
                            break;
                        }
                    }
                    Message::Binary(data) if drop_binary => {
                        warn!(bytes = data.len(), "Dropped binary WebSocket frame from client");
                    }
                    Message::Close(close) => {
                        let _ = upstream_tx.send(Message::Close(close)).await;
                        break;
                    }
                    // Answered by tungstenite itself.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    other => {
                        if upstream_tx.send(other).await.is_err() {
                            break;
                        }
                    }
                }
            }
            frame = upstream_rx.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!(error = %e, "Upstream socket error");
                        break;
                    }
                    None => break,
                };
                match frame {
                    Message::Close(close) => {
                        let _ = client_tx.send(Message::Close(close)).await;
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    other => {
                        if client_tx.send(other).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}
