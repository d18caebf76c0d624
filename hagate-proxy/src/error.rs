//! Error types for the hagate HTTP proxy layer.
//!
//! Whitelist denials are not errors: they are a [`hagate_core::Decision`]
//! rendered as `403` by the proxy service. Everything here is a transport
//! failure between the client, hagate and the upstream.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors that can occur while proxying a request.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Request target could not be turned into an upstream URI (400)
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Connection error to upstream (502)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection refused by upstream (502)
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Upstream did not answer in time (504)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Client went away before the request body was read (400)
    #[error("Client disconnected")]
    ClientDisconnect,

    /// Request body exceeded the configured limit (413)
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// WebSocket handshake request that cannot be upgraded (400)
    #[error("Upgrade failed: {0}")]
    Upgrade(String),
}

impl ProxyError {
    /// Short label used for the `hagate_upstream_errors_total` metric.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidUri(_) => "invalid_uri",
            ProxyError::Connection(_) => "connection",
            ProxyError::ConnectionRefused(_) => "connection_refused",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::ClientDisconnect => "client_disconnect",
            ProxyError::BodyTooLarge { .. } => "body_too_large",
            ProxyError::Upgrade(_) => "upgrade",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::ConnectionRefused(_) | ProxyError::Connection(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidUri(_) | ProxyError::ClientDisconnect | ProxyError::Upgrade(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Convert error to a plain-text HTTP response with the matching status.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let message = match self {
            ProxyError::ConnectionRefused(_) | ProxyError::Connection(_) => {
                "502 Bad Gateway\n\nFailed to connect to Home Assistant."
            }
            ProxyError::Timeout(_) => {
                "504 Gateway Timeout\n\nHome Assistant did not respond in time."
            }
            ProxyError::InvalidUri(_) => "400 Bad Request\n\nInvalid request URI.",
            ProxyError::ClientDisconnect => "400 Bad Request\n\nClient disconnected.",
            ProxyError::Upgrade(_) => "400 Bad Request\n\nWebSocket upgrade failed.",
            ProxyError::BodyTooLarge { .. } => {
                "413 Payload Too Large\n\nRequest body exceeds the configured limit."
            }
        };

        Response::builder()
            .status(self.status())
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from(message)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("500 Internal Server Error")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
