//! Prometheus metrics using the prometheus-client crate.
//!
//! [`GateMetrics`] registers every `hagate_` family against a caller-owned
//! `Registry`. The admin server encodes that registry at `/metrics` in
//! OpenMetrics text format.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Labels for the per-request decision counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// "learn" or "limit"
    pub mode: String,
    /// "allow" or "deny"
    pub decision: String,
}

/// Labels for denials.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DenialLabels {
    /// "endpoint", "entity" or "command"
    pub reason: String,
}

/// Labels shared by the learned counter and the entries gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    /// "endpoint" or "entity"
    pub kind: String,
}

/// Labels for whitelist saves.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SaveLabels {
    /// "success" or "error"
    pub outcome: String,
}

/// Labels for upstream forwarding failures.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamErrorLabels {
    /// e.g. "connection", "timeout"
    pub kind: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// All gate metrics. Cheap to share behind an `Arc`.
#[derive(Clone, Debug)]
pub struct GateMetrics {
    requests_total: Family<RequestLabels, Counter>,
    denials_total: Family<DenialLabels, Counter>,
    learned_total: Family<KindLabels, Counter>,
    whitelist_entries: Family<KindLabels, Gauge>,
    whitelist_saves_total: Family<SaveLabels, Counter>,
    upstream_errors_total: Family<UpstreamErrorLabels, Counter>,
}

impl GateMetrics {
    /// Create and register all metric families.
    ///
    /// Counter names are registered without the `_total` suffix; the
    /// OpenMetrics encoder appends it.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "hagate_requests",
            "Requests evaluated by the gate",
            requests_total.clone(),
        );

        let denials_total = Family::<DenialLabels, Counter>::default();
        registry.register(
            "hagate_denials",
            "Requests rejected in limit mode",
            denials_total.clone(),
        );

        let learned_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "hagate_learned",
            "Whitelist entries added in learn mode",
            learned_total.clone(),
        );

        let whitelist_entries = Family::<KindLabels, Gauge>::default();
        registry.register(
            "hagate_whitelist_entries",
            "Current whitelist size",
            whitelist_entries.clone(),
        );

        let whitelist_saves_total = Family::<SaveLabels, Counter>::default();
        registry.register(
            "hagate_whitelist_saves",
            "Whitelist save attempts",
            whitelist_saves_total.clone(),
        );

        let upstream_errors_total = Family::<UpstreamErrorLabels, Counter>::default();
        registry.register(
            "hagate_upstream_errors",
            "Failures forwarding to the upstream",
            upstream_errors_total.clone(),
        );

        Self {
            requests_total,
            denials_total,
            learned_total,
            whitelist_entries,
            whitelist_saves_total,
            upstream_errors_total,
        }
    }

    pub fn record_request(&self, mode: &str, decision: &str) {
        self.requests_total
            .get_or_create(&RequestLabels {
                mode: mode.to_string(),
                decision: decision.to_string(),
            })
            .inc();
    }

    pub fn record_denial(&self, reason: &str) {
        self.denials_total
            .get_or_create(&DenialLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    /// Count `n` newly learned entries of `kind`.
    pub fn record_learned(&self, kind: &str, n: u64) {
        if n == 0 {
            return;
        }
        self.learned_total
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc_by(n);
    }

    pub fn set_whitelist_entries(&self, endpoints: usize, entities: usize) {
        for (kind, n) in [("endpoint", endpoints), ("entity", entities)] {
            self.whitelist_entries
                .get_or_create(&KindLabels {
                    kind: kind.to_string(),
                })
                .set(i64::try_from(n).unwrap_or(i64::MAX));
        }
    }

    pub fn record_save(&self, success: bool) {
        let outcome = if success { "success" } else { "error" };
        self.whitelist_saves_total
            .get_or_create(&SaveLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn record_upstream_error(&self, kind: &str) {
        self.upstream_errors_total
            .get_or_create(&UpstreamErrorLabels {
                kind: kind.to_string(),
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(registry: &Registry) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, registry)
            .expect("encoding should succeed");
        buffer
    }

    #[test]
    fn test_metrics_registration() {
        let mut registry = Registry::default();
        let metrics = GateMetrics::new(&mut registry);

        metrics.record_request("limit", "deny");
        metrics.record_denial("entity");
        metrics.record_learned("endpoint", 2);
        metrics.set_whitelist_entries(3, 4);
        metrics.record_save(true);
        metrics.record_upstream_error("timeout");

        let buffer = encode(&registry);
        assert!(buffer.contains(r#"hagate_requests_total{mode="limit",decision="deny"} 1"#));
        assert!(buffer.contains(r#"hagate_denials_total{reason="entity"} 1"#));
        assert!(buffer.contains(r#"hagate_learned_total{kind="endpoint"} 2"#));
        assert!(buffer.contains(r#"hagate_whitelist_entries{kind="entity"} 4"#));
        assert!(buffer.contains(r#"hagate_whitelist_saves_total{outcome="success"} 1"#));
        assert!(buffer.contains(r#"hagate_upstream_errors_total{kind="timeout"} 1"#));
    }

    #[test]
    fn test_record_learned_zero_is_noop() {
        let mut registry = Registry::default();
        let metrics = GateMetrics::new(&mut registry);
        metrics.record_learned("entity", 0);
        assert!(!encode(&registry).contains(r#"hagate_learned_total{kind="entity"}"#));
    }
}
