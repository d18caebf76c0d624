//! Learn/limit decision engine.
//!
//! The [`Mode`] is chosen once at startup and injected into the
//! [`ModeController`]; there is no runtime switch.
//!
//! ## Evaluation order
//!
//! | Step | Learn | Limit |
//! |------|-------|-------|
//! | `/health` | allow | allow |
//! | endpoint | record if new | deny if no template matches (no extraction) |
//! | entities | extract, record new | extract, deny on first unmatched |
//! | result | allow | allow |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SettingsError;
use crate::extract::{EntityExtractor, RequestContext, StandardExtractor};
use crate::metrics::GateMetrics;
use crate::pattern::canonicalize_path;
use crate::whitelist::WhitelistStore;

/// Path answered without consulting the whitelist.
pub const HEALTH_PATH: &str = "/health";

// ============================================================================
// Mode
// ============================================================================

/// Operating mode, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Observe traffic and grow the whitelist; never reject.
    Learn,
    /// Enforce the whitelist.
    Limit,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Learn => "learn",
            Mode::Limit => "limit",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "learn" => Ok(Mode::Learn),
            "limit" => Ok(Mode::Limit),
            _ => Err(SettingsError::InvalidMode {
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// Why a request was allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowReason {
    /// The health path bypasses the whitelist.
    HealthCheck,
    /// Learn mode; lists what this request added.
    Learned {
        new_endpoint: Option<String>,
        new_entities: Vec<String>,
    },
    /// Limit mode; endpoint and every entity matched.
    Whitelisted,
}

/// Why a request was rejected. Not an error: a normal limit-mode outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    EndpointNotWhitelisted { path: String },
    EntityNotWhitelisted { entity: String, path: String },
}

impl DenyReason {
    /// Client-facing message.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            DenyReason::EndpointNotWhitelisted { path } => {
                format!("Endpoint not in whitelist: {path}")
            }
            DenyReason::EntityNotWhitelisted { entity, .. } => {
                format!("Entity not in whitelist: {entity}")
            }
        }
    }

    /// Metric label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            DenyReason::EndpointNotWhitelisted { .. } => "endpoint",
            DenyReason::EntityNotWhitelisted { .. } => "entity",
        }
    }
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(AllowReason),
    Deny(DenyReason),
}

impl Decision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        if self.is_allowed() { "allow" } else { "deny" }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Per-request decision engine over a shared [`WhitelistStore`].
#[derive(Clone)]
pub struct ModeController {
    mode: Mode,
    store: Arc<WhitelistStore>,
    extractor: Arc<dyn EntityExtractor>,
    metrics: Option<Arc<GateMetrics>>,
}

impl fmt::Debug for ModeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeController")
            .field("mode", &self.mode)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ModeController {
    /// Create a controller using the standard extractor.
    #[must_use]
    pub fn new(mode: Mode, store: Arc<WhitelistStore>) -> Self {
        Self {
            mode,
            store,
            extractor: Arc::new(StandardExtractor::new()),
            metrics: None,
        }
    }

    /// Replace the entity extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Attach metrics. Publishes the current whitelist size immediately.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        let (endpoints, entities) = self.store.counts();
        metrics.set_whitelist_entries(endpoints, entities);
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn store(&self) -> &Arc<WhitelistStore> {
        &self.store
    }

    pub(crate) fn metrics(&self) -> Option<&Arc<GateMetrics>> {
        self.metrics.as_ref()
    }

    /// Decide whether `ctx` may be forwarded, recording it in learn mode.
    pub fn evaluate(&self, ctx: &RequestContext) -> Decision {
        let decision = if canonicalize_path(&ctx.path) == HEALTH_PATH {
            Decision::Allow(AllowReason::HealthCheck)
        } else {
            match self.mode {
                Mode::Learn => self.learn(ctx),
                Mode::Limit => self.limit(ctx),
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_request(self.mode.as_str(), decision.label());
            if let Decision::Deny(reason) = &decision {
                metrics.record_denial(reason.label());
            }
        }
        decision
    }

    fn learn(&self, ctx: &RequestContext) -> Decision {
        let new_endpoint = self.store.record_endpoint(&ctx.path);
        if let Some(template) = &new_endpoint {
            info!(method = %ctx.method, endpoint = %template, "Learned new endpoint");
        }

        let matched = self.store.match_endpoint(&ctx.path);
        let entities = self.extractor.extract(ctx, matched.as_ref());
        let new_entities = self.store.record_entities(&entities);
        for entity in &new_entities {
            info!(entity = %entity, path = %ctx.path, "Learned new entity");
        }

        if let Some(metrics) = &self.metrics
            && (new_endpoint.is_some() || !new_entities.is_empty())
        {
            metrics.record_learned("endpoint", u64::from(new_endpoint.is_some()));
            metrics.record_learned("entity", new_entities.len() as u64);
            let (endpoints, entities) = self.store.counts();
            metrics.set_whitelist_entries(endpoints, entities);
        }

        Decision::Allow(AllowReason::Learned {
            new_endpoint,
            new_entities,
        })
    }

    fn limit(&self, ctx: &RequestContext) -> Decision {
        let denied = self.store.read(|whitelist| {
            let Some(matched) = whitelist.match_endpoint(&ctx.path) else {
                return Some(DenyReason::EndpointNotWhitelisted {
                    path: ctx.path.clone(),
                });
            };

            let entities = self.extractor.extract(ctx, Some(&matched));
            whitelist
                .first_unmatched_entity(&entities)
                .map(|entity| DenyReason::EntityNotWhitelisted {
                    entity: entity.clone(),
                    path: ctx.path.clone(),
                })
        });

        match denied {
            None => Decision::Allow(AllowReason::Whitelisted),
            Some(reason) => {
                match &reason {
                    DenyReason::EndpointNotWhitelisted { path } => {
                        warn!(method = %ctx.method, path = %path, "Blocked endpoint");
                    }
                    DenyReason::EntityNotWhitelisted { entity, path } => {
                        warn!(method = %ctx.method, path = %path, entity = %entity, "Blocked entity");
                    }
                }
                Decision::Deny(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::EntitySet;
    use crate::pattern::{EndpointMatch, EndpointTemplate, EntityPattern};
    use crate::whitelist::Whitelist;
    use prometheus_client::registry::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn store_with(endpoints: &[&str], entities: &[&str]) -> Arc<WhitelistStore> {
        let mut w = Whitelist::new();
        for e in endpoints {
            w.insert_endpoint(EndpointTemplate::parse(e));
        }
        for e in entities {
            w.insert_entity(EntityPattern::parse(e));
        }
        Arc::new(WhitelistStore::new("unused.yaml", w))
    }

    fn get(path: &str) -> RequestContext {
        RequestContext::new(http::Method::GET, path)
    }

    /// Wraps the standard extractor and counts invocations.
    #[derive(Default)]
    struct CountingExtractor {
        calls: AtomicUsize,
    }

    impl EntityExtractor for CountingExtractor {
        fn extract(&self, ctx: &RequestContext, matched: Option<&EndpointMatch>) -> EntitySet {
            self.calls.fetch_add(1, Ordering::SeqCst);
            StandardExtractor.extract(ctx, matched)
        }
    }

    #[test]
    fn test_mode_parse_and_display() {
        assert_eq!("learn".parse::<Mode>().unwrap(), Mode::Learn);
        assert_eq!(" LIMIT ".parse::<Mode>().unwrap(), Mode::Limit);
        assert!("enforce".parse::<Mode>().is_err());
        assert_eq!(Mode::Learn.to_string(), "learn");
    }

    #[test]
    fn test_limit_state_entity_allowed_and_rejected() {
        let controller = ModeController::new(
            Mode::Limit,
            store_with(&["/api/states/{entity_id}"], &["sensor.temp"]),
        );

        assert_eq!(
            controller.evaluate(&get("/api/states/sensor.temp")),
            Decision::Allow(AllowReason::Whitelisted)
        );
        assert_eq!(
            controller.evaluate(&get("/api/states/sensor.humidity")),
            Decision::Deny(DenyReason::EntityNotWhitelisted {
                entity: "sensor.humidity".to_string(),
                path: "/api/states/sensor.humidity".to_string(),
            })
        );
    }

    #[test]
    fn test_limit_wildcard_entity() {
        let controller = ModeController::new(
            Mode::Limit,
            store_with(&["/api/states/{entity_id}"], &["light.*"]),
        );
        assert!(controller.evaluate(&get("/api/states/light.kitchen")).is_allowed());
        assert!(!controller.evaluate(&get("/api/states/switch.kitchen")).is_allowed());
    }

    #[test]
    fn test_limit_unknown_endpoint_skips_extraction() {
        let extractor = Arc::new(CountingExtractor::default());
        let controller = ModeController::new(Mode::Limit, store_with(&["/api/config"], &[]))
            .with_extractor(extractor.clone());

        let decision = controller.evaluate(&get("/api/unknown"));
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::EndpointNotWhitelisted {
                path: "/api/unknown".to_string()
            })
        );
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);

        assert!(controller.evaluate(&get("/api/config")).is_allowed());
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_limit_service_call_with_wildcard() {
        let controller = ModeController::new(
            Mode::Limit,
            store_with(&["/api/services/{domain}/{service}"], &["light.*"]),
        );
        let allowed = RequestContext::new(http::Method::POST, "/api/services/light/turn_on")
            .with_body(Some("application/json"), br#"{"entity_id": ["light.a", "light.b"]}"#);
        assert!(controller.evaluate(&allowed).is_allowed());

        let denied = RequestContext::new(http::Method::POST, "/api/services/light/turn_on")
            .with_body(Some("application/json"), br#"{"entity_id": ["light.a", "lock.door"]}"#);
        assert!(matches!(
            controller.evaluate(&denied),
            Decision::Deny(DenyReason::EntityNotWhitelisted { entity, .. }) if entity == "lock.door"
        ));
    }

    #[test]
    fn test_limit_malformed_body_judged_on_endpoint() {
        let controller = ModeController::new(
            Mode::Limit,
            store_with(&["/api/services/{domain}/{service}"], &[]),
        );
        let ctx = RequestContext::new(http::Method::POST, "/api/services/light/turn_on")
            .with_body(Some("application/json"), b"{oops");
        assert!(controller.evaluate(&ctx).is_allowed());
    }

    #[test]
    fn test_limit_is_deterministic() {
        let controller = ModeController::new(
            Mode::Limit,
            store_with(&["/api/states/{entity_id}"], &["sensor.*"]),
        );
        for path in ["/api/states/sensor.a", "/api/states/light.a", "/api/other"] {
            let first = controller.evaluate(&get(path));
            for _ in 0..5 {
                assert_eq!(controller.evaluate(&get(path)), first);
            }
        }
    }

    #[test]
    fn test_health_bypasses_whitelist_in_both_modes() {
        for mode in [Mode::Learn, Mode::Limit] {
            let store = store_with(&[], &[]);
            let controller = ModeController::new(mode, store.clone());
            assert_eq!(
                controller.evaluate(&get("/health")),
                Decision::Allow(AllowReason::HealthCheck)
            );
            assert!(store.snapshot().is_empty());
        }
    }

    #[test]
    fn test_learn_records_and_allows() {
        let store = store_with(&[], &[]);
        let controller = ModeController::new(Mode::Learn, store.clone());

        let decision = controller.evaluate(&get("/api/states/sensor.temp"));
        assert_eq!(
            decision,
            Decision::Allow(AllowReason::Learned {
                new_endpoint: Some("/api/states/sensor.temp".to_string()),
                new_entities: vec!["sensor.temp".to_string()],
            })
        );

        // Idempotent on replay.
        let again = controller.evaluate(&get("/api/states/sensor.temp"));
        assert_eq!(
            again,
            Decision::Allow(AllowReason::Learned {
                new_endpoint: None,
                new_entities: vec![],
            })
        );
        assert_eq!(store.counts(), (1, 1));
    }

    #[test]
    fn test_learn_then_reload_scenario() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let store = Arc::new(WhitelistStore::load(&path).unwrap());
        let controller = ModeController::new(Mode::Learn, store.clone());

        controller.evaluate(&get("/api/config"));
        store.save().unwrap();

        let reloaded = WhitelistStore::load(&path).unwrap();
        assert!(reloaded.snapshot().endpoints().contains(&EndpointTemplate::parse("/api/config")));
    }

    #[test]
    fn test_learn_sizes_never_decrease() {
        let store = store_with(&["/api/states/{entity_id}"], &["light.*"]);
        let controller = ModeController::new(Mode::Learn, store.clone());
        let mut last = store.counts();
        for path in [
            "/api/states/light.a",
            "/api/states/switch.b",
            "/api/config",
            "/api/states/switch.b",
            "/api/config/",
        ] {
            controller.evaluate(&get(path));
            let now = store.counts();
            assert!(now.0 >= last.0 && now.1 >= last.1);
            last = now;
        }
        assert_eq!(last, (2, 2));
    }

    #[test]
    fn test_limit_service_body_checked_without_json_content_type() {
        let controller = ModeController::new(
            Mode::Limit,
            store_with(&["/api/services/{domain}/{service}"], &["light.*"]),
        );
        let body = br#"{"entity_id":"lock.front_door"}"#;
        for content_type in [Some("application/json"), Some("text/plain"), None] {
            let ctx = RequestContext::new(http::Method::POST, "/api/services/lock/unlock")
                .with_body(content_type, body);
            assert_eq!(
                controller.evaluate(&ctx),
                Decision::Deny(DenyReason::EntityNotWhitelisted {
                    entity: "lock.front_door".to_string(),
                    path: "/api/services/lock/unlock".to_string(),
                }),
                "{content_type:?}"
            );
        }
    }

    #[test]
    fn test_area_and_device_targets_judged_on_endpoint_alone() {
        let controller = ModeController::new(
            Mode::Limit,
            store_with(&["/api/services/{domain}/{service}"], &[]),
        );
        let body = br#"{"target":{"area_id":"garage","device_id":"abc123"}}"#;
        let ctx = RequestContext::new(http::Method::POST, "/api/services/light/turn_on")
            .with_body(Some("application/json"), body);
        assert!(controller.evaluate(&ctx).is_allowed());
    }

    #[test]
    fn test_learn_never_widens_on_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let store = Arc::new(WhitelistStore::load(&path).unwrap());
        let controller = ModeController::new(Mode::Learn, store.clone());

        let star = RequestContext::new(http::Method::POST, "/api/services/light/turn_on")
            .with_body(Some("application/json"), br#"{"entity_id":"*"}"#);
        assert!(controller.evaluate(&star).is_allowed());

        let (parts, _) = http::Request::get("/api/states/%7Bx%7D")
            .body(())
            .unwrap()
            .into_parts();
        let braces = RequestContext::from_http_parts(&parts, b"");
        assert_eq!(braces.path, "/api/states/{x}");
        assert!(controller.evaluate(&braces).is_allowed());
        store.save().unwrap();

        let limit = ModeController::new(Mode::Limit, Arc::new(WhitelistStore::load(&path).unwrap()));
        let reloaded = limit.store().snapshot();
        assert!(!reloaded.contains_endpoint("/api/states/lock.front_door"));
        assert!(!reloaded.contains_entity("lock.front_door"));
        assert!(!limit.evaluate(&get("/api/states/lock.front_door")).is_allowed());
    }

    #[test]
    fn test_metrics_recorded() {
        let mut registry = Registry::default();
        let metrics = Arc::new(GateMetrics::new(&mut registry));
        let controller = ModeController::new(Mode::Limit, store_with(&["/api/config"], &[]))
            .with_metrics(metrics);

        controller.evaluate(&get("/api/config"));
        controller.evaluate(&get("/api/nope"));

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
        assert!(out.contains(r#"hagate_requests_total{mode="limit",decision="allow"} 1"#));
        assert!(out.contains(r#"hagate_denials_total{reason="endpoint"} 1"#));
        assert!(out.contains(r#"hagate_whitelist_entries{kind="endpoint"} 1"#));
    }

    #[test]
    fn test_deny_messages() {
        let endpoint = DenyReason::EndpointNotWhitelisted {
            path: "/api/x".to_string(),
        };
        assert_eq!(endpoint.message(), "Endpoint not in whitelist: /api/x");
        let entity = DenyReason::EntityNotWhitelisted {
            entity: "light.a".to_string(),
            path: "/api/states/light.a".to_string(),
        };
        assert_eq!(entity.message(), "Entity not in whitelist: light.a");
    }
}
