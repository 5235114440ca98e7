//! Admin API tests: requests routed through the handler, responses
//! checked as the admin UI would consume them.

use std::sync::Arc;

use hyper::{Body, Request, StatusCode};
use palisade::admin::AdminApi;
use palisade::audit::AuditSink;
use palisade::clock::ManualClock;
use palisade::config::Config;
use palisade::pipeline::Engine;
use palisade::store::ThreatStore;

fn setup() -> (Arc<ManualClock>, Arc<Engine>, AdminApi) {
    let clock = Arc::new(ManualClock::new(5_000_000));
    let audit = Arc::new(AuditSink::in_memory(clock.clone(), 1000));
    let store = Arc::new(ThreatStore::new(clock.clone(), audit));
    let engine = Arc::new(Engine::new(Config::default(), store));
    let api = AdminApi::new(engine.clone());
    (clock, engine, api)
}

async fn call(api: &AdminApi, method: &str, path: &str, body: &str) -> (StatusCode, serde_json::Value) {
    let req = Request::builder()
        .method(method)
        .uri(path)
        .body(if body.is_empty() {
            Body::empty()
        } else {
            Body::from(body.to_string())
        })
        .unwrap();

    let response = api.handle_request(req).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

#[tokio::test]
async fn health_endpoint() {
    let (_clock, _engine, api) = setup();
    let (status, body) = call(&api, "GET", "/palisade/api/health", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "healthy");
}

#[tokio::test]
async fn status_reflects_store_state() {
    let (_clock, engine, api) = setup();
    engine.store().mark_blocked("1.2.3.4", 600, "test block");
    engine.store().add_suspicion("5.6.7.8", 40, "probing");
    engine.store().trust("9.9.9.9");

    let (status, body) = call(&api, "GET", "/palisade/api/status", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["blocked"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["blocked"][0]["client"], "1.2.3.4");
    assert_eq!(body["data"]["suspicious"][0]["client"], "5.6.7.8");
    assert_eq!(body["data"]["trusted"][0], "9.9.9.9");
    assert!(body["data"]["audit"]["events_recorded"].as_u64().unwrap() >= 2);
}

#[tokio::test]
async fn events_endpoint_honors_limit() {
    let (_clock, engine, api) = setup();
    for i in 0..10 {
        engine
            .store()
            .mark_blocked(&format!("10.0.0.{}", i), 600, "probe");
    }

    let (status, body) = call(&api, "GET", "/palisade/api/events?limit=3", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["events"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn unblock_round_trip() {
    let (_clock, engine, api) = setup();

    // No active block yet.
    let (status, body) = call(&api, "POST", "/palisade/api/unblock/1.2.3.4", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    engine.store().mark_blocked("1.2.3.4", 600, "test block");
    let (status, body) = call(&api, "POST", "/palisade/api/unblock/1.2.3.4", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(!engine.store().is_blocked("1.2.3.4"));

    // The manual override is recorded as an admin action.
    let events = engine.store().audit().recent(10);
    assert_eq!(
        events[0].event_type,
        palisade::audit::AuditEventType::AdminUnblock
    );
}

#[tokio::test]
async fn clear_all_reports_count() {
    let (_clock, engine, api) = setup();
    engine.store().mark_blocked("1.1.1.1", 600, "a");
    engine.store().mark_blocked("2.2.2.2", 600, "b");

    let (status, body) = call(&api, "POST", "/palisade/api/clear", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cleared"], 2);
    assert!(!engine.store().is_blocked("1.1.1.1"));
    assert!(!engine.store().is_blocked("2.2.2.2"));
}

#[tokio::test]
async fn audit_report_scores_active_threats() {
    let (_clock, engine, api) = setup();

    // Clean slate scores 100.
    let (_, body) = call(&api, "GET", "/palisade/api/audit", "").await;
    assert_eq!(body["data"]["securityScore"], 100);
    assert_eq!(body["data"]["grade"], "A");

    // Two blocks (-10) and one suspicious client (-2).
    engine.store().mark_blocked("1.1.1.1", 600, "a");
    engine.store().mark_blocked("2.2.2.2", 600, "b");
    engine.store().add_suspicion("3.3.3.3", 50, "probing");

    let (_, body) = call(&api, "GET", "/palisade/api/audit", "").await;
    assert_eq!(body["data"]["securityScore"], 88);
    assert_eq!(body["data"]["grade"], "B");
    assert!(!body["data"]["recommendations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn scan_endpoint_reports_findings() {
    let (_clock, _engine, api) = setup();
    let (status, body) = call(
        &api,
        "POST",
        "/palisade/api/scan",
        r#"{"https": false, "headers": {}}"#,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["securityScore"], 77);
    assert_eq!(body["data"]["summary"]["high"], 1);
}

#[tokio::test]
async fn scan_rejects_malformed_body() {
    let (_clock, _engine, api) = setup();
    let (status, body) = call(&api, "POST", "/palisade/api/scan", "{not json").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let (_clock, _engine, api) = setup();
    let (status, body) = call(&api, "GET", "/palisade/api/nope", "").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}
