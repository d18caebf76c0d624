//! Entity extraction from request paths, query strings and service-call bodies.
//!
//! An [`EntityExtractor`] turns a [`RequestContext`] into the set of entity
//! identifiers the request touches. [`StandardExtractor`] knows the Home
//! Assistant REST shapes:
//!
//! | Shape | Source |
//! |-------|--------|
//! | any matched template with `{entity_id}` | the bound segment |
//! | `/api/states/{entity_id}` | path |
//! | `/api/camera_proxy/{entity_id}` | path |
//! | `/api/camera_proxy_stream/{entity_id}` | path |
//! | `/api/services/{domain}/{service}` | body `entity_id` and `target.entity_id` |
//! | `/api/history/period[/{timestamp}]` | query `filter_entity_id` (comma list) |
//! | `/api/logbook[/{timestamp}]` | query `entity` |
//!
//! Extraction never fails. A body that cannot be decoded simply contributes
//! nothing; enforcement of the endpoint itself still applies.
//!
//! Home Assistant parses service-call bodies as JSON whatever their
//! `Content-Type`, so on the service shape a body declared as something else
//! is still read as JSON.
//!
//! Only entity identifiers are extracted. `target.area_id` and
//! `target.device_id` are not resolved to the entities they cover, so a
//! service call aimed at an area or device is judged on its endpoint alone.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use serde_json::Value;
use tracing::debug;

use crate::pattern::{EndpointMatch, EndpointTemplate, canonicalize_path};

/// Set of entity identifiers touched by one request.
pub type EntitySet = BTreeSet<String>;

/// Placeholder name that marks a path-bound entity.
pub const ENTITY_PLACEHOLDER: &str = "entity_id";

/// Body field that carries service-call targets.
pub const TARGET_FIELD: &str = "entity_id";

// ============================================================================
// Request Context
// ============================================================================

/// Decoded request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// No body bytes.
    Empty,
    /// Body declared as JSON and parsed successfully.
    Json(Value),
    /// Body declared as JSON but unparseable; carries the parser message.
    Malformed(String),
    /// Body of some other content type, kept as received.
    Opaque(Vec<u8>),
}

impl RequestBody {
    /// Decode `bytes` according to `content_type`.
    #[must_use]
    pub fn decode(content_type: Option<&str>, bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return RequestBody::Empty;
        }
        if !content_type.is_some_and(is_json_content_type) {
            return RequestBody::Opaque(bytes.to_vec());
        }
        match serde_json::from_slice(bytes) {
            Ok(value) => RequestBody::Json(value),
            Err(e) => RequestBody::Malformed(e.to_string()),
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            RequestBody::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Returns true for `application/json` and `application/*+json` media types.
#[must_use]
pub fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || (essence.starts_with("application/") && essence.ends_with("+json"))
}

/// Per-request data consulted by the mode controller and extractor.
///
/// Created when a request arrives and dropped once the decision is made.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method.
    pub method: http::Method,
    /// Percent-decoded canonical path.
    pub path: String,
    /// Raw query string (without the leading `?`).
    pub query: Option<String>,
    /// Decoded body.
    pub body: RequestBody,
}

impl RequestContext {
    /// Build a context from an already-decoded path and no body.
    #[must_use]
    pub fn new(method: http::Method, path: &str) -> Self {
        Self {
            method,
            path: canonicalize_path(path).to_string(),
            query: None,
            body: RequestBody::Empty,
        }
    }

    /// Build a context from request parts and buffered body bytes.
    ///
    /// The URI path is percent-decoded here; invalid UTF-8 sequences are
    /// replaced rather than rejected.
    #[must_use]
    pub fn from_http_parts(parts: &http::request::Parts, body: &[u8]) -> Self {
        let decoded = percent_decode_str(parts.uri.path()).decode_utf8_lossy();
        let content_type = parts
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());

        Self {
            method: parts.method.clone(),
            path: canonicalize_path(&decoded).to_string(),
            query: parts.uri.query().map(str::to_string),
            body: RequestBody::decode(content_type, body),
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, content_type: Option<&str>, bytes: &[u8]) -> Self {
        self.body = RequestBody::decode(content_type, bytes);
        self
    }

    /// All values of query parameter `key`, form-decoded.
    #[must_use]
    pub fn query_values(&self, key: &str) -> Vec<String> {
        let Some(query) = &self.query else {
            return Vec::new();
        };
        url::form_urlencoded::parse(query.as_bytes())
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .collect()
    }
}

// ============================================================================
// Service Targets
// ============================================================================

/// Entity targets carried by a service-call body, decoded once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceTarget {
    NoTarget,
    SingleTarget(String),
    MultiTarget(Vec<String>),
}

impl ServiceTarget {
    /// Decode the top-level `entity_id` and `target.entity_id` fields.
    ///
    /// Each field may hold a string or an array; non-string array members are
    /// skipped. Identifiers from both fields are merged in order of first
    /// appearance without duplicates.
    #[must_use]
    pub fn decode(body: &Value) -> Self {
        let mut ids: Vec<String> = Vec::new();
        let top = body.get(TARGET_FIELD);
        let nested = body.get("target").and_then(|t| t.get(TARGET_FIELD));

        for field in [top, nested].into_iter().flatten() {
            match field {
                Value::String(s) => push_unique(&mut ids, s),
                Value::Array(items) => {
                    for s in items.iter().filter_map(Value::as_str) {
                        push_unique(&mut ids, s);
                    }
                }
                _ => {}
            }
        }

        match ids.len() {
            0 => ServiceTarget::NoTarget,
            1 => ServiceTarget::SingleTarget(ids.remove(0)),
            _ => ServiceTarget::MultiTarget(ids),
        }
    }

    /// Identifiers as a slice-like iterator.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            ServiceTarget::NoTarget => &[],
            ServiceTarget::SingleTarget(id) => std::slice::from_ref(id),
            ServiceTarget::MultiTarget(ids) => ids,
        };
        slice.iter().map(String::as_str)
    }
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

// ============================================================================
// Extractors
// ============================================================================

/// Derives the entity identifiers a request references.
///
/// `matched` is the whitelist template that admitted the path, if any. In
/// learn mode there may be none yet.
pub trait EntityExtractor: Send + Sync {
    fn extract(&self, ctx: &RequestContext, matched: Option<&EndpointMatch>) -> EntitySet;
}

static PATH_ENTITY_SHAPES: LazyLock<Vec<EndpointTemplate>> = LazyLock::new(|| {
    [
        "/api/states/{entity_id}",
        "/api/camera_proxy/{entity_id}",
        "/api/camera_proxy_stream/{entity_id}",
    ]
    .into_iter()
    .map(EndpointTemplate::parse)
    .collect()
});

static SERVICE_SHAPE: LazyLock<EndpointTemplate> =
    LazyLock::new(|| EndpointTemplate::parse("/api/services/{domain}/{service}"));

/// (template, query key) pairs for query-bound entity filters.
static QUERY_SHAPES: LazyLock<Vec<(EndpointTemplate, &'static str)>> = LazyLock::new(|| {
    vec![
        (EndpointTemplate::parse("/api/history/period"), "filter_entity_id"),
        (EndpointTemplate::parse("/api/history/period/{timestamp}"), "filter_entity_id"),
        (EndpointTemplate::parse("/api/logbook"), "entity"),
        (EndpointTemplate::parse("/api/logbook/{timestamp}"), "entity"),
    ]
});

/// Extractor for the Home Assistant REST API.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardExtractor;

impl StandardExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn from_path(ctx: &RequestContext, matched: Option<&EndpointMatch>, out: &mut EntitySet) {
        if let Some(id) = matched.and_then(|m| m.param(ENTITY_PLACEHOLDER)) {
            out.insert(id.to_string());
        }
        for shape in PATH_ENTITY_SHAPES.iter() {
            if let Some(params) = shape.bind(&ctx.path)
                && let Some(id) = params.get(ENTITY_PLACEHOLDER)
            {
                out.insert(id.clone());
            }
        }
    }

    fn from_service_body(ctx: &RequestContext, out: &mut EntitySet) {
        if !SERVICE_SHAPE.matches(&ctx.path) {
            return;
        }
        match &ctx.body {
            RequestBody::Json(value) => {
                out.extend(ServiceTarget::decode(value).ids().map(str::to_string));
            }
            RequestBody::Opaque(bytes) => match serde_json::from_slice::<Value>(bytes) {
                Ok(value) => {
                    debug!(path = %ctx.path, "Service call body is JSON despite its content type");
                    out.extend(ServiceTarget::decode(&value).ids().map(str::to_string));
                }
                Err(e) => {
                    debug!(path = %ctx.path, reason = %e, "Service call body is not JSON");
                }
            },
            RequestBody::Malformed(reason) => {
                debug!(path = %ctx.path, reason = %reason, "Service call body is not valid JSON");
            }
            RequestBody::Empty => {}
        }
    }

    fn from_query(ctx: &RequestContext, out: &mut EntitySet) {
        for (shape, key) in QUERY_SHAPES.iter() {
            if !shape.matches(&ctx.path) {
                continue;
            }
            for value in ctx.query_values(key) {
                out.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
            }
        }
    }
}

impl EntityExtractor for StandardExtractor {
    fn extract(&self, ctx: &RequestContext, matched: Option<&EndpointMatch>) -> EntitySet {
        let mut entities = EntitySet::new();
        Self::from_path(ctx, matched, &mut entities);
        Self::from_service_body(ctx, &mut entities);
        Self::from_query(ctx, &mut entities);
        entities
    }
}

// ============================================================================
// Tests
// ============================================================================
