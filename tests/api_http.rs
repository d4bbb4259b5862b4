// tests/api_http.rs
//
// HTTP-level tests for the control surface without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

mod common;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt as _; // for `oneshot`

use common::Harness;
use team_sync::upstream::Endpoint;
use team_sync::ResourceClass;

const BODY_LIMIT: usize = 1024 * 1024;

fn test_router(h: &Harness) -> Router {
    team_sync::api::router(h.scheduler(), None)
}

async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, bytes)
}

fn json_of(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json body")
}

#[tokio::test]
async fn health_returns_ok() {
    let h = Harness::new();
    let app = test_router(&h);
    let (status, body) = send(&app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "ok");
}

#[tokio::test]
async fn status_lists_budgets_and_scheduler_state() {
    let h = Harness::new();
    let app = test_router(&h);
    let (status, body) = send(&app, "GET", "/sync/status").await;
    assert_eq!(status, StatusCode::OK);

    let v = json_of(&body);
    assert_eq!(v["enabled"], json!(false));
    assert_eq!(v["interval_minutes"], json!(5));
    assert_eq!(v["is_running"], json!(false));
    assert_eq!(v["budgets"]["zr/rider_item"]["max_calls"], json!(100));
    assert_eq!(v["budgets"]["zr/rider_item"]["can_call"], json!(true));
}

#[tokio::test]
async fn trigger_runs_a_class_and_returns_the_summary() {
    let h = Harness::new();
    h.seed_riders([1, 2]);
    h.zr.respond(
        Endpoint::Roster,
        None,
        json!({ "riders": [{ "riderId": 1 }, { "riderId": 2 }] }),
    );
    let app = test_router(&h);

    let (status, body) = send(&app, "POST", "/sync/trigger/riders").await;
    assert_eq!(status, StatusCode::OK);
    let v = json_of(&body);
    assert_eq!(v["resource_class"], json!("riders"));
    assert_eq!(v["trigger"], json!("manual"));
    assert_eq!(v["status"], json!("success"));
    assert_eq!(v["updated"], json!(2));

    let (_, body) = send(&app, "GET", "/sync/status").await;
    assert_eq!(json_of(&body)["last_runs"]["riders"]["updated"], json!(2));
}

#[tokio::test]
async fn trigger_rejects_unknown_class() {
    let h = Harness::new();
    let app = test_router(&h);
    let (status, body) = send(&app, "POST", "/sync/trigger/teams").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json_of(&body)["error"].as_str().unwrap().contains("teams"));
}

#[tokio::test]
async fn trigger_conflicts_while_class_is_locked() {
    let h = Harness::new();
    let app = test_router(&h);
    let _guard = h
        .orchestrator
        .context()
        .locks
        .try_lock(ResourceClass::Events)
        .unwrap();

    let (status, body) = send(&app, "POST", "/sync/trigger/events").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json_of(&body)["status"], json!("skipped-conflict"));
    assert_eq!(h.zr.total_calls(), 0);
}

#[tokio::test]
async fn start_then_stop_toggles_the_loop() {
    let h = Harness::new();
    let app = test_router(&h);

    let (status, body) = send(&app, "POST", "/sync/start").await;
    assert_eq!(status, StatusCode::OK);
    let v = json_of(&body);
    assert_eq!(v["changed"], json!(true));
    assert_eq!(v["status"]["enabled"], json!(true));

    let (_, body) = send(&app, "POST", "/sync/start").await;
    assert_eq!(json_of(&body)["changed"], json!(false));

    let (_, body) = send(&app, "POST", "/sync/stop").await;
    let v = json_of(&body);
    assert_eq!(v["changed"], json!(true));
    assert_eq!(v["status"]["enabled"], json!(false));
}
