//! End-to-end tests: client → hagate → mock Home Assistant.

mod helpers;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use hagate_core::extract::{EntityExtractor, EntitySet, RequestContext, StandardExtractor};
use hagate_core::pattern::{EndpointMatch, EndpointTemplate, EntityPattern};
use hagate_core::whitelist::{PersistConfig, WhitelistPersister};
use hagate_core::{Mode, Whitelist, WhitelistStore};
use hagate_proxy::proxy_config::ProxyConfig;
use helpers::{GateBuilder, MockUpstream};
use http::{Method, StatusCode};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn whitelist(endpoints: &[&str], entities: &[&str]) -> Whitelist {
    let mut w = Whitelist::new();
    for e in endpoints {
        w.insert_endpoint(EndpointTemplate::parse(e));
    }
    for e in entities {
        w.insert_entity(EntityPattern::parse(e));
    }
    w
}

/// Delegates to the standard extractor and counts invocations.
#[derive(Default)]
struct CountingExtractor {
    calls: AtomicUsize,
}

impl EntityExtractor for CountingExtractor {
    fn extract(&self, ctx: &RequestContext, matched: Option<&EndpointMatch>) -> EntitySet {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StandardExtractor::new().extract(ctx, matched)
    }
}

// ============================================================================
// Learn mode
// ============================================================================

#[tokio::test]
async fn test_learn_forwards_and_records() {
    let upstream = MockUpstream::start().await;
    let gate = GateBuilder::new(Mode::Learn, upstream.url()).start().await;

    let response = gate
        .send(
            Method::GET,
            "/api/states/sensor.temp?detail=1",
            &[
                ("authorization", "Bearer long-lived-token"),
                ("keep-alive", "timeout=30"),
                ("x-request-id", "req-42"),
            ],
            Bytes::new(),
        )
        .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers["x-upstream"], "mock");
    assert!(!response.headers.contains_key("keep-alive"));

    let seen = upstream.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "GET");
    assert_eq!(seen[0].path_and_query, "/api/states/sensor.temp?detail=1");
    assert_eq!(seen[0].headers["authorization"], "Bearer long-lived-token");
    assert_eq!(seen[0].headers["x-request-id"], "req-42");
    assert!(!seen[0].headers.contains_key("keep-alive"));

    assert!(gate.store.contains_endpoint("/api/states/sensor.temp"));
    assert!(gate.store.contains_entities(&["sensor.temp".to_string()]));
}

#[tokio::test]
async fn test_learn_service_call_records_body_entities() {
    let upstream = MockUpstream::start().await;
    let gate = GateBuilder::new(Mode::Learn, upstream.url()).start().await;

    let body = json!({"entity_id": ["light.a", "light.b"], "brightness": 80});
    let response = gate.post_json("/api/services/light/turn_on", &body).await;
    assert_eq!(response.status, StatusCode::OK);

    // The upstream receives the exact bytes the client sent.
    let seen = upstream.requests();
    assert_eq!(seen[0].body, Bytes::from(body.to_string()));

    assert_eq!(gate.store.counts(), (1, 2));
    let metrics = gate.metrics_text();
    assert!(metrics.contains("hagate_learned_total"));
}

#[tokio::test]
async fn test_learned_whitelist_enforces_after_reload() {
    let upstream = MockUpstream::start().await;
    let learn = GateBuilder::new(Mode::Learn, upstream.url()).start().await;

    assert_eq!(learn.get("/api/config").await.status, StatusCode::OK);
    assert_eq!(
        learn.get("/api/states/sensor.temp").await.status,
        StatusCode::OK
    );
    learn.store.save().unwrap();

    let reloaded = WhitelistStore::load(learn.store.path()).unwrap();
    let limit = GateBuilder::new(Mode::Limit, upstream.url())
        .whitelist(reloaded.snapshot())
        .start()
        .await;

    assert_eq!(limit.get("/api/config").await.status, StatusCode::OK);
    assert_eq!(
        limit.get("/api/states/sensor.temp").await.status,
        StatusCode::OK
    );
    assert_eq!(
        limit.get("/api/states/sensor.humidity").await.status,
        StatusCode::FORBIDDEN
    );
    assert_eq!(upstream.request_count(), 4);
}

#[tokio::test]
async fn test_persister_final_save_after_traffic() {
    let upstream = MockUpstream::start().await;
    let gate = GateBuilder::new(Mode::Learn, upstream.url()).start().await;

    let token = CancellationToken::new();
    let persister = tokio::spawn(
        WhitelistPersister::new(
            gate.store.clone(),
            PersistConfig {
                save_every: 1000,
                interval: Duration::from_secs(3600),
            },
        )
        .run(token.clone()),
    );

    gate.get("/api/config").await;
    gate.get("/api/states/switch.porch").await;
    token.cancel();
    persister.await.unwrap().unwrap();

    let contents = std::fs::read_to_string(gate.store.path()).unwrap();
    assert!(contents.contains("/api/config"));
    assert!(contents.contains("switch.porch"));
}

// ============================================================================
// Limit mode
// ============================================================================

#[tokio::test]
async fn test_limit_entity_on_path() {
    let upstream = MockUpstream::start().await;
    let gate = GateBuilder::new(Mode::Limit, upstream.url())
        .whitelist(whitelist(&["/api/states/{entity_id}"], &["sensor.temp"]))
        .start()
        .await;

    assert_eq!(
        gate.get("/api/states/sensor.temp").await.status,
        StatusCode::OK
    );

    let denied = gate.get("/api/states/sensor.humidity").await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);
    assert_eq!(
        denied.json()["error"],
        "Entity not in whitelist: sensor.humidity"
    );

    assert_eq!(upstream.request_count(), 1);
}

#[tokio::test]
async fn test_limit_wildcard_entities_in_service_call() {
    let upstream = MockUpstream::start().await;
    let gate = GateBuilder::new(Mode::Limit, upstream.url())
        .whitelist(whitelist(
            &["/api/services/{domain}/{service}"],
            &["light.*"],
        ))
        .start()
        .await;

    let allowed = gate
        .post_json(
            "/api/services/light/turn_on",
            &json!({"entity_id": ["light.a", "light.b"]}),
        )
        .await;
    assert_eq!(allowed.status, StatusCode::OK);

    let denied = gate
        .post_json(
            "/api/services/switch/turn_on",
            &json!({"target": {"entity_id": "switch.kitchen"}}),
        )
        .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);
    assert_eq!(denied.headers["content-type"], "application/json");

    assert_eq!(upstream.request_count(), 1);
    assert!(gate.metrics_text().contains("hagate_denials_total"));
}

#[tokio::test]
async fn test_limit_unknown_endpoint_skips_extraction() {
    let upstream = MockUpstream::start().await;
    let extractor = Arc::new(CountingExtractor::default());
    let gate = GateBuilder::new(Mode::Limit, upstream.url())
        .whitelist(whitelist(&["/api/config"], &[]))
        .extractor(extractor.clone())
        .start()
        .await;

    let denied = gate.get("/api/unknown").await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);
    assert_eq!(denied.json()["error"], "Endpoint not in whitelist: /api/unknown");
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(upstream.request_count(), 0);

    assert_eq!(gate.get("/api/config").await.status, StatusCode::OK);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_limit_query_entities() {
    let upstream = MockUpstream::start().await;
    let gate = GateBuilder::new(Mode::Limit, upstream.url())
        .whitelist(whitelist(&["/api/history/period"], &["sensor.*"]))
        .start()
        .await;

    assert_eq!(
        gate.get("/api/history/period?filter_entity_id=sensor.a,sensor.b")
            .await
            .status,
        StatusCode::OK
    );
    assert_eq!(
        gate.get("/api/history/period?filter_entity_id=sensor.a,lock.front")
            .await
            .status,
        StatusCode::FORBIDDEN
    );
}

// ============================================================================
// Local responses and failures
// ============================================================================

#[tokio::test]
async fn test_health_is_local_in_both_modes() {
    let upstream = MockUpstream::start().await;
    for mode in [Mode::Learn, Mode::Limit] {
        let gate = GateBuilder::new(mode, upstream.url()).start().await;
        let response = gate.get("/health").await;
        assert_eq!(response.status, StatusCode::OK);

        let json = response.json();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["mode"], mode.as_str());
        assert_eq!(json["ha_url"], upstream.url());
        assert_eq!(gate.store.counts(), (0, 0));
    }
    assert_eq!(upstream.request_count(), 0);
}

#[tokio::test]
async fn test_oversized_body_gets_413() {
    let upstream = MockUpstream::start().await;
    let gate = GateBuilder::new(Mode::Learn, upstream.url())
        .config(ProxyConfig {
            max_body_bytes: 16,
            ..ProxyConfig::default()
        })
        .start()
        .await;

    let response = gate
        .post_json(
            "/api/services/light/turn_on",
            &json!({"entity_id": "light.with_a_long_name"}),
        )
        .await;
    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(upstream.request_count(), 0);
    assert_eq!(gate.store.counts(), (0, 0));
}

#[tokio::test]
async fn test_unreachable_upstream_gets_502() {
    // Bind and drop to get a port with nothing listening.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let gate = GateBuilder::new(Mode::Learn, format!("http://127.0.0.1:{port}"))
        .start()
        .await;

    let response = gate.get("/api/config").await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    // Learning happens before forwarding.
    assert!(gate.store.contains_endpoint("/api/config"));
    assert!(gate.metrics_text().contains("hagate_upstream_errors_total"));
}

#[tokio::test]
async fn test_slow_upstream_gets_504() {
    let upstream = MockUpstream::start().await;
    let gate = GateBuilder::new(Mode::Learn, upstream.url())
        .config(ProxyConfig {
            upstream_timeout: Duration::from_millis(200),
            ..ProxyConfig::default()
        })
        .start()
        .await;

    let response = gate.get("/api/slow").await;
    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_shutdown_stops_accept_loop() {
    let upstream = MockUpstream::start().await;
    let gate = GateBuilder::new(Mode::Limit, upstream.url()).start().await;

    assert_eq!(gate.get("/health").await.status, StatusCode::OK);
    gate.lifecycle.begin_shutdown();

    tokio::time::timeout(Duration::from_secs(5), gate.server_task)
        .await
        .unwrap()
        .unwrap();
}
