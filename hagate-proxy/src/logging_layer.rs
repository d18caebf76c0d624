//! Request/response logging around the proxy service.
//!
//! A `tower_http` [`TraceLayer`] whose callbacks all live on one
//! [`GateTrace`] type. Each request runs inside a `request` span with a
//! `request_id`, so learn and block events from the mode controller carry it
//! too. Header dumps are DEBUG only, and credentials are masked there:
//! Home Assistant long-lived tokens travel in `Authorization`.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::{HeaderMap, HeaderValue, Request, Response};
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{
    DefaultOnBodyChunk, DefaultOnEos, MakeSpan, OnFailure, OnRequest, OnResponse, TraceLayer,
};
use tracing::{Level, Span, debug, info, warn};
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Masked wherever headers are logged.
const REDACTED: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
];

/// Header dumps stop after this many entries.
const HEADER_LIMIT: usize = 50;
/// Longer values are cut to this many bytes.
const VALUE_LIMIT: usize = 1024;

pub type LoggingLayer = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    GateTrace,
    GateTrace,
    GateTrace,
    DefaultOnBodyChunk,
    DefaultOnEos,
    GateTrace,
>;

pub fn logging_layer() -> LoggingLayer {
    TraceLayer::new_for_http()
        .make_span_with(GateTrace)
        .on_request(GateTrace)
        .on_response(GateTrace)
        .on_failure(GateTrace)
}

/// Per-process prefix taken from one `Uuid::new_v4()` at first use, so ids
/// from restarts and sibling processes do not collide.
static ID_PREFIX: LazyLock<u32> = LazyLock::new(|| (Uuid::new_v4().as_u128() >> 96) as u32);

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// `{prefix}-{sequence}`, both hex. Used when the client sent no `x-request-id`.
pub fn next_request_id() -> String {
    let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{:08x}-{seq:012x}", *ID_PREFIX)
}

/// Span factory and request/response/failure logger in one.
#[derive(Clone, Copy, Debug, Default)]
pub struct GateTrace;

impl<B> MakeSpan<B> for GateTrace {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map_or_else(next_request_id, str::to_owned);

        tracing::info_span!(
            "request",
            request_id = %request_id,
            method = %request.method(),
            path = %request.uri().path(),
        )
    }
}

impl<B> OnRequest<B> for GateTrace {
    fn on_request(&mut self, request: &Request<B>, _span: &Span) {
        info!(query = request.uri().query().unwrap_or(""), "Request received");
        if tracing::enabled!(Level::DEBUG) {
            debug!(
                version = ?request.version(),
                headers = %RedactedHeaders(request.headers()),
                "Request headers"
            );
        }
    }
}

impl<B> OnResponse<B> for GateTrace {
    fn on_response(self, response: &Response<B>, latency: Duration, _span: &Span) {
        info!(
            status = response.status().as_u16(),
            latency_ms = latency.as_millis() as u64,
            "Response sent"
        );
        if tracing::enabled!(Level::DEBUG) {
            debug!(headers = %RedactedHeaders(response.headers()), "Response headers");
        }
    }
}

impl OnFailure<ServerErrorsFailureClass> for GateTrace {
    fn on_failure(&mut self, failure: ServerErrorsFailureClass, latency: Duration, _span: &Span) {
        warn!(
            failure = %failure,
            latency_ms = latency.as_millis() as u64,
            "Request failed"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Header redaction
// ─────────────────────────────────────────────────────────────────────────────

/// Renders a header map as `{name: value, ...}` with credentials masked.
pub struct RedactedHeaders<'a>(pub &'a HeaderMap);

impl fmt::Display for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if i == HEADER_LIMIT {
                write!(f, "+{} more", self.0.len() - HEADER_LIMIT)?;
                break;
            }
            write!(f, "{}: {}", name, shown_value(name.as_str(), value))?;
        }
        f.write_str("}")
    }
}

fn shown_value<'a>(name: &str, value: &'a HeaderValue) -> Cow<'a, str> {
    if REDACTED.iter().any(|r| name.eq_ignore_ascii_case(r)) {
        return Cow::Borrowed("[REDACTED]");
    }
    match value.to_str() {
        // to_str only accepts visible ASCII, so any byte index is a char boundary.
        Ok(v) if v.len() > VALUE_LIMIT => {
            Cow::Owned(format!("{}... ({} bytes)", &v[..VALUE_LIMIT], v.len()))
        }
        Ok(v) => Cow::Borrowed(v),
        Err(_) => Cow::Owned(format!("<{} non-text bytes>", value.len())),
    }
}
