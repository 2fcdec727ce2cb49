//! HTTP adapter for the queue RPC bridge
//!
//! Routes:
//! - `POST /add`, `POST /check_human`: synchronous equivalents of the queue operations
//! - `POST /math/add`: gateway that forwards an addition over the broker (when configured)
//! - `GET /health`, `/health/live`, `/health/ready`: probes
//! - `GET /metrics`: Prometheus exposition
//! - `/api-doc/openapi.json`, `/swagger-ui`: API documentation

pub mod model;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rb_common::{BridgeError, Envelope, ErrorKind, Operation, ReplyEnvelope, RequestSource};
use rb_dispatch::Dispatcher;
use rb_queue::{RpcCaller, RuntimeState};
use serde_json::Map;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use model::{
    AddRequest, AddResponse, CheckHumanRequest, CheckHumanResponse, ErrorResponse, MediaItem,
    ProbeResponse, SimpleHealthResponse,
};

/// Pattern the gateway stamps on forwarded additions
pub const GATEWAY_ADD_PATTERN: &str = r#"{"cmd":"add"}"#;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub runtime_state: watch::Receiver<RuntimeState>,
    /// Broker client for the gateway route; the route is absent when `None`
    pub rpc: Option<Arc<dyn RpcCaller>>,
    pub gateway_queue: String,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, runtime_state: watch::Receiver<RuntimeState>) -> Self {
        Self {
            dispatcher,
            runtime_state,
            rpc: None,
            gateway_queue: rb_common::MATH_QUEUE.to_string(),
            metrics: None,
        }
    }

    pub fn with_gateway(mut self, rpc: Arc<dyn RpcCaller>, queue: impl Into<String>) -> Self {
        self.rpc = Some(rpc);
        self.gateway_queue = queue.into();
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        match err.kind() {
            ErrorKind::SchemaViolation => ApiError::bad_request(err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Queue RPC Bridge API",
        description = "Synchronous access to the bridge operations plus health probes"
    ),
    paths(
        add_handler,
        check_human_handler,
        gateway_add_handler,
        health_handler,
        liveness_probe,
        readiness_probe,
    ),
    components(schemas(
        AddRequest,
        AddResponse,
        MediaItem,
        CheckHumanRequest,
        CheckHumanResponse,
        ErrorResponse,
        SimpleHealthResponse,
        ProbeResponse,
    )),
    tags(
        (name = "operations", description = "Addition and human detection"),
        (name = "gateway", description = "Requests forwarded over the broker"),
        (name = "health", description = "Liveness and readiness probes"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/add", post(add_handler))
        .route("/check_human", post(check_human_handler))
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/metrics", get(metrics_handler));

    if state.rpc.is_some() {
        router = router.route("/math/add", post(gateway_add_handler));
    }

    router
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
}

// ============================================================================
// Operations
// ============================================================================

/// Add two numbers
#[utoipa::path(
    post,
    path = "/add",
    tag = "operations",
    request_body = AddRequest,
    responses(
        (status = 200, description = "Sum of x and y", body = AddResponse),
        (status = 400, description = "x or y missing", body = ErrorResponse),
        (status = 500, description = "Invalid body or non-numeric operands", body = ErrorResponse)
    )
)]
async fn add_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ReplyEnvelope>, ApiError> {
    execute(&state, Operation::Add, &body).await
}

/// Check a list of images for people
#[utoipa::path(
    post,
    path = "/check_human",
    tag = "operations",
    request_body = CheckHumanRequest,
    responses(
        (status = 200, description = "One result per examined image, in input order", body = CheckHumanResponse),
        (status = 400, description = "media missing", body = ErrorResponse),
        (status = 500, description = "Invalid body or detector failure", body = ErrorResponse)
    )
)]
async fn check_human_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ReplyEnvelope>, ApiError> {
    execute(&state, Operation::CheckHuman, &body).await
}

async fn execute(
    state: &AppState,
    operation: Operation,
    body: &[u8],
) -> Result<Json<ReplyEnvelope>, ApiError> {
    let data = rb_common::parse_object(body)?;

    match state
        .dispatcher
        .execute(operation, &data, RequestSource::Http)
        .await
    {
        Ok(reply) => Ok(Json(reply)),
        Err(e) => {
            warn!(operation = operation.as_str(), kind = e.kind().as_str(), error = %e, "Request failed");
            Err(e.into())
        }
    }
}

/// Add two numbers through the broker
#[utoipa::path(
    post,
    path = "/math/add",
    tag = "gateway",
    request_body = AddRequest,
    responses(
        (status = 200, description = "Sum computed by the math queue consumer", body = AddResponse),
        (status = 500, description = "No valid reply received", body = ErrorResponse)
    )
)]
async fn gateway_add_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AddResponse>, ApiError> {
    let Some(rpc) = state.rpc.as_ref() else {
        return Err(ApiError::internal("Failed to add numbers"));
    };

    let request = rb_common::parse_object(&body)?;
    let mut data = Map::new();
    for field in ["x", "y"] {
        if let Some(value) = request.get(field) {
            data.insert(field.to_string(), value.clone());
        }
    }

    let envelope = Envelope::new(GATEWAY_ADD_PATTERN, data);
    let reply = match rpc.call(&state.gateway_queue, &envelope).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(queue = %state.gateway_queue, error = %e, "Gateway call failed");
            return Err(ApiError::internal("Failed to add numbers"));
        }
    };

    debug!(reply = ?reply, "Gateway reply received");
    match reply {
        ReplyEnvelope::Single { result } if result.is_number() => Ok(Json(AddResponse { result })),
        other => {
            error!(reply = ?other, "Gateway reply has no numeric result");
            Err(ApiError::internal("Invalid response from math service"))
        }
    }
}

// ============================================================================
// Health Endpoints
// ============================================================================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Service is up", body = SimpleHealthResponse))
)]
async fn health_handler() -> Json<SimpleHealthResponse> {
    Json(SimpleHealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Kubernetes liveness probe - returns 200 if the application is running
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses((status = 200, description = "Process is alive", body = ProbeResponse))
)]
async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "LIVE".to_string(),
    })
}

/// Kubernetes readiness probe - 200 only while the queue consumer is running
/// and, when the broker gateway is enabled, its connection is up
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Consuming", body = ProbeResponse),
        (status = 503, description = "Not consuming", body = ProbeResponse)
    )
)]
async fn readiness_probe(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    let current = *state.runtime_state.borrow();
    let gateway_ready = state.rpc.as_ref().map_or(true, |rpc| rpc.is_ready());
    if current.is_ready() && gateway_ready {
        (
            StatusCode::OK,
            Json(ProbeResponse {
                status: "READY".to_string(),
            }),
        )
    } else {
        debug!(state = current.as_str(), gateway_ready, "Readiness probe failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse {
                status: "NOT_READY".to_string(),
            }),
        )
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "Metrics recorder not installed").into_response(),
    }
}
