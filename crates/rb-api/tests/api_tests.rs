//! API Endpoint Tests
//!
//! Tests for:
//! - Synchronous operations (/add, /check_human)
//! - Health endpoints (basic, liveness, readiness)
//! - Broker gateway (/math/add)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

use rb_api::{create_router, AppState, GATEWAY_ADD_PATTERN};
use rb_common::{
    default_registrations, Envelope, ReplyEnvelope, WorkerError, MATH_QUEUE,
};
use rb_dispatch::Dispatcher;
use rb_queue::{QueueError, RpcCaller, RuntimeState};
use rb_worker::HumanDetector;

/// Reports a person for any URL containing "person"
struct KeywordDetector;

#[async_trait]
impl HumanDetector for KeywordDetector {
    async fn detect(&self, url: &str) -> Result<bool, WorkerError> {
        if url.contains("offline") {
            return Err(WorkerError::Unreachable("connection refused".to_string()));
        }
        Ok(url.contains("person"))
    }
}

/// Records forwarded envelopes and answers with a canned reply
struct MockRpc {
    calls: parking_lot::Mutex<Vec<(String, Envelope)>>,
    reply: Option<ReplyEnvelope>,
    connected: bool,
}

impl MockRpc {
    fn replying(reply: ReplyEnvelope) -> Self {
        Self {
            calls: parking_lot::Mutex::new(Vec::new()),
            reply: Some(reply),
            connected: true,
        }
    }

    fn timing_out() -> Self {
        Self {
            calls: parking_lot::Mutex::new(Vec::new()),
            reply: None,
            connected: true,
        }
    }

    fn disconnected() -> Self {
        Self {
            connected: false,
            ..Self::timing_out()
        }
    }
}

#[async_trait]
impl RpcCaller for MockRpc {
    async fn call(&self, queue: &str, envelope: &Envelope) -> rb_queue::Result<ReplyEnvelope> {
        self.calls.lock().push((queue.to_string(), envelope.clone()));
        self.reply
            .clone()
            .ok_or(QueueError::RpcTimeout(Duration::from_secs(10)))
    }

    fn is_ready(&self) -> bool {
        self.connected
    }
}

fn dispatcher() -> Arc<Dispatcher> {
    Arc::new(Dispatcher::with_registrations(
        Arc::new(KeywordDetector),
        &default_registrations(),
    ))
}

fn create_test_app() -> (axum::Router, watch::Sender<RuntimeState>) {
    let (state_tx, state_rx) = watch::channel(RuntimeState::Idle);
    let app = create_router(AppState::new(dispatcher(), state_rx));
    (app, state_tx)
}

fn create_gateway_app(rpc: Arc<MockRpc>) -> axum::Router {
    let (_state_tx, state_rx) = watch::channel(RuntimeState::Running);
    create_router(AppState::new(dispatcher(), state_rx).with_gateway(rpc, MATH_QUEUE))
}

fn post_json(uri: &str, body: impl Into<String>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.into()))
        .unwrap()
}

async fn get_body_json(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Operation Tests
// ============================================================================

#[tokio::test]
async fn test_add_floats() {
    let (app, _state) = create_test_app();

    let response = app
        .oneshot(post_json("/add", r#"{"x": 1.5, "y": 2.25}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(get_body_json(response.into_body()).await, json!({"result": 3.75}));
}

#[tokio::test]
async fn test_add_integers_stay_integral() {
    let (app, _state) = create_test_app();

    let response = app
        .oneshot(post_json("/add", r#"{"x": 2, "y": 3}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = get_body_json(response.into_body()).await;
    assert_eq!(body, json!({"result": 5}));
    assert!(body["result"].is_i64());
}

#[tokio::test]
async fn test_add_matches_queue_reply() {
    let dispatcher = dispatcher();
    let queue_reply = dispatcher
        .dispatch(
            MATH_QUEUE,
            &rb_common::decode(br#"{"pattern":"sum","data":{"x":7,"y":-2.5}}"#).unwrap(),
        )
        .await
        .unwrap();

    let (app, _state) = create_test_app();
    let response = app
        .oneshot(post_json("/add", r#"{"x": 7, "y": -2.5}"#))
        .await
        .unwrap();

    let http_reply = get_body_json(response.into_body()).await;
    assert_eq!(http_reply, serde_json::to_value(queue_reply).unwrap());
}

#[tokio::test]
async fn test_add_missing_field() {
    let (app, _state) = create_test_app();

    let response = app.oneshot(post_json("/add", r#"{"x": 2}"#)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        get_body_json(response.into_body()).await,
        json!({"error": "Missing 'x' or 'y' in the request"})
    );
}

#[tokio::test]
async fn test_add_non_numeric_is_internal_error() {
    let (app, _state) = create_test_app();

    let response = app
        .oneshot(post_json("/add", r#"{"x": 2, "y": "3"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = get_body_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().contains("unsupported operand"));
}

#[tokio::test]
async fn test_malformed_body_is_internal_error() {
    let (app, _state) = create_test_app();

    let response = app.oneshot(post_json("/add", "{not json")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = get_body_json(response.into_body()).await;
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_check_human_skips_non_images() {
    let (app, _state) = create_test_app();

    let request = json!({"media": [
        {"url": "http://cdn/person.jpg", "type": "image"},
        {"url": "http://cdn/trailer.mp4", "type": "video"},
        {"type": "image"},
        {"url": "http://cdn/landscape.jpg", "type": "image"},
    ]});
    let response = app
        .oneshot(post_json("/check_human", request.to_string()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        get_body_json(response.into_body()).await,
        json!({"results": [
            {"url": "http://cdn/person.jpg", "human_detected": "human_detected"},
            {"url": "http://cdn/landscape.jpg", "human_detected": "no_human_detected"},
        ]})
    );
}

#[tokio::test]
async fn test_check_human_empty_media() {
    let (app, _state) = create_test_app();

    let response = app
        .oneshot(post_json("/check_human", r#"{"media": []}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(get_body_json(response.into_body()).await, json!({"results": []}));
}

#[tokio::test]
async fn test_check_human_missing_media() {
    let (app, _state) = create_test_app();

    let response = app
        .oneshot(post_json("/check_human", r#"{"images": []}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        get_body_json(response.into_body()).await,
        json!({"error": "Missing 'media' in the request"})
    );
}

#[tokio::test]
async fn test_check_human_detector_failure() {
    let (app, _state) = create_test_app();

    let request = json!({"media": [{"url": "http://offline/a.jpg", "type": "image"}]});
    let response = app
        .oneshot(post_json("/check_human", request.to_string()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        get_body_json(response.into_body()).await,
        json!({"error": "Detector unreachable: connection refused"})
    );
}

// ============================================================================
// Health Endpoint Tests
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _state) = create_test_app();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "UP");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_liveness_probe() {
    let (app, _state) = create_test_app();

    let response = app
        .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(get_body_json(response.into_body()).await["status"], "LIVE");
}

#[tokio::test]
async fn test_readiness_follows_runtime_state() {
    let (app, state) = create_test_app();

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(get_body_json(response.into_body()).await["status"], "NOT_READY");

    state.send(RuntimeState::Running).unwrap();

    let response = app
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(get_body_json(response.into_body()).await["status"], "READY");
}

#[tokio::test]
async fn test_readiness_requires_gateway_connection() {
    let app = create_gateway_app(Arc::new(MockRpc::disconnected()));

    let response = app
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(get_body_json(response.into_body()).await["status"], "NOT_READY");
}

#[tokio::test]
async fn test_readiness_with_connected_gateway() {
    let app = create_gateway_app(Arc::new(MockRpc::timing_out()));

    let response = app
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_without_recorder() {
    let (app, _state) = create_test_app();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_openapi_document_served() {
    let (app, _state) = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api-doc/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let doc = get_body_json(response.into_body()).await;
    assert!(doc["paths"]["/add"].is_object());
}

// ============================================================================
// Gateway Tests
// ============================================================================

#[tokio::test]
async fn test_gateway_route_absent_without_client() {
    let (app, _state) = create_test_app();

    let response = app
        .oneshot(post_json("/math/add", r#"{"x": 1, "y": 2}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_gateway_forwards_and_returns_result() {
    let rpc = Arc::new(MockRpc::replying(ReplyEnvelope::single(json!(3))));
    let app = create_gateway_app(rpc.clone());

    let response = app
        .oneshot(post_json("/math/add", r#"{"x": 1, "y": 2, "z": 9}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(get_body_json(response.into_body()).await, json!({"result": 3}));

    let calls = rpc.calls.lock();
    assert_eq!(calls.len(), 1);
    let (queue, envelope) = &calls[0];
    assert_eq!(queue, MATH_QUEUE);
    assert_eq!(envelope.pattern, GATEWAY_ADD_PATTERN);
    assert_eq!(Value::Object(envelope.data.clone()), json!({"x": 1, "y": 2}));
}

#[tokio::test]
async fn test_gateway_rejects_non_numeric_result() {
    let rpc = Arc::new(MockRpc::replying(ReplyEnvelope::single(json!("3"))));
    let app = create_gateway_app(rpc);

    let response = app
        .oneshot(post_json("/math/add", r#"{"x": 1, "y": 2}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        get_body_json(response.into_body()).await,
        json!({"error": "Invalid response from math service"})
    );
}

#[tokio::test]
async fn test_gateway_timeout() {
    let app = create_gateway_app(Arc::new(MockRpc::timing_out()));

    let response = app
        .oneshot(post_json("/math/add", r#"{"x": 1, "y": 2}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        get_body_json(response.into_body()).await,
        json!({"error": "Failed to add numbers"})
    );
}
