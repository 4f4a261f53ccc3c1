
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use miner_lite::api::{router, ApiState};
use miner_lite::executor::{ExecutorClass, Manifest};
use test_harness::{test_supervisor, FakeBackend};

/// Create a test app over a fake backend with `cpu-basic` capacity 2
fn create_test_app(start: u16, end: u16) -> (Router, Arc<FakeBackend>) {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 2));
    let (supervisor, _ports) = test_supervisor(backend.clone(), start, end);
    let state = ApiState {
        supervisor,
        node_name: "test-node".to_string(),
        default_executor_class: ExecutorClass::new("cpu-basic"),
    };
    (router(state), backend)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_manifest_endpoint() {
    let (app, _backend) = create_test_app(9000, 9009);

    let (status, json) = send(&app, get("/api/manifest")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["node"], "test-node");
    assert_eq!(json["backend"], "fake");
    assert_eq!(json["active"], 0);
    assert_eq!(json["manifest"]["cpu-basic"], 2);
}

#[tokio::test]
async fn test_start_and_list_executors() {
    let (app, _backend) = create_test_app(9000, 9009);

    let (status, created) = send(
        &app,
        post_json("/api/executors", json!({ "timeout_secs": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["executor_class"], "cpu-basic");
    assert_eq!(created["port"], 9000);
    assert_eq!(created["state"]["state"], "running");

    let (status, list) = send(&app, get("/api/executors")).await;
    assert_eq!(status, StatusCode::OK);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], created["id"]);

    let (_, manifest) = send(&app, get("/api/manifest")).await;
    assert_eq!(manifest["manifest"]["cpu-basic"], 1);
}

#[tokio::test]
async fn test_start_reports_backpressure() {
    let (app, _backend) = create_test_app(9000, 9000);

    let (status, _) = send(&app, post_json("/api/executors", json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, json) = send(&app, post_json("/api/executors", json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"], "ports_exhausted");
}

#[tokio::test]
async fn test_start_with_unknown_class_is_bad_gateway() {
    let (app, _backend) = create_test_app(9000, 9009);

    let (status, json) = send(
        &app,
        post_json("/api/executors", json!({ "executor_class": "gpu-h100" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["error"], "provisioning_failed");
}

#[tokio::test]
async fn test_kill_executor() {
    let (app, _backend) = create_test_app(9000, 9009);
    let (_, created) = send(&app, post_json("/api/executors", json!({}))).await;
    let uri = format!("/api/executors/{}", created["id"].as_str().unwrap());

    let (status, json) = send(&app, delete(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"]["kind"], "killed");

    let (status, json) = send(&app, delete(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "unknown_executor");
}

#[tokio::test]
async fn test_wait_endpoint() {
    let (app, backend) = create_test_app(9000, 9009);
    let (_, created) = send(&app, post_json("/api/executors", json!({}))).await;
    let id = created["id"].as_str().unwrap().to_string();
    let uri = format!("/api/executors/{}/wait", id);

    let (status, json) = send(&app, post_json(&uri, json!({ "timeout_secs": 0 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "still_running");

    backend.exit(id.parse().unwrap(), 0);
    let (status, json) = send(&app, post_json(&uri, json!({ "timeout_secs": 2 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "exited");
    assert_eq!(json["outcome"]["kind"], "completed");
    assert_eq!(json["outcome"]["code"], 0);
}

#[tokio::test]
async fn test_address_endpoint() {
    let (app, backend) = create_test_app(9000, 9009);
    let (_, created) = send(&app, post_json("/api/executors", json!({}))).await;
    let uri = format!(
        "/api/executors/{}/address",
        created["id"].as_str().unwrap()
    );

    backend.address_misses.store(1, Ordering::SeqCst);
    let (status, json) = send(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "address_unavailable");

    let (status, json) = send(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["address"], "127.0.0.1:9000");

    backend.address_misses.store(2, Ordering::SeqCst);
    let (status, _) = send(&app, get(&format!("{}?wait_ms=2000", uri))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_executor_address_is_not_found() {
    let (app, _backend) = create_test_app(9000, 9009);

    let uri = format!("/api/executors/{}/address", uuid::Uuid::new_v4());
    let (status, json) = send(&app, get(&uri)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "unknown_executor");
}

#[tokio::test]
async fn test_oversized_timeouts_are_rejected() {
    let (app, _backend) = create_test_app(9000, 9009);

    let (status, json) = send(
        &app,
        post_json("/api/executors", json!({ "timeout_secs": u64::MAX })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_config");

    let (_, list) = send(&app, get("/api/executors")).await;
    assert!(list.as_array().unwrap().is_empty());
    let (_, manifest) = send(&app, get("/api/manifest")).await;
    assert_eq!(manifest["manifest"]["cpu-basic"], 2);

    let (_, created) = send(&app, post_json("/api/executors", json!({}))).await;
    let uri = format!("/api/executors/{}/wait", created["id"].as_str().unwrap());
    let (status, _) = send(&app, post_json(&uri, json!({ "timeout_secs": u64::MAX }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
