//! HTTP control surface used by the dispatcher-side glue.
//!
//! | Method   | Path                           | Operation                    |
//! |----------|--------------------------------|------------------------------|
//! | `GET`    | `/api/manifest`                | remaining capacity per class |
//! | `GET`    | `/api/executors`               | live executors               |
//! | `POST`   | `/api/executors`               | start an executor            |
//! | `DELETE` | `/api/executors/{id}`          | kill an executor             |
//! | `POST`   | `/api/executors/{id}/wait`     | bounded wait for exit        |
//! | `GET`    | `/api/executors/{id}/address`  | public address               |
//!
//! Errors are returned as `{"error": <label>, "message": <text>}`.
//! Backpressure is `503`, unknown executors `404`, an address that is not
//! known yet `409`, and backend provisioning failures `502`.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::MinerError;
use crate::executor::{
    ExecutorClass, ExecutorId, ExecutorInfo, ExecutorToken, ExitOutcome, Manifest, WaitOutcome,
};
use crate::supervisor::LifecycleSupervisor;

/// Lifetime given to executors when the start request does not name one.
pub const DEFAULT_EXECUTOR_TIMEOUT: Duration = Duration::from_secs(3600);
/// Wait timeout when the request body does not name one.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest executor lifetime a start request may ask for.
pub const MAX_EXECUTOR_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);
/// Longest a single wait request may block.
pub const MAX_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct ApiState {
    pub supervisor: LifecycleSupervisor,
    pub node_name: String,
    pub default_executor_class: ExecutorClass,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestResponse {
    pub node: String,
    pub backend: String,
    pub active: usize,
    pub manifest: Manifest,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StartExecutorRequest {
    /// Minted here when absent
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub executor_class: Option<ExecutorClass>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WaitRequest {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KillResponse {
    pub executor_id: ExecutorId,
    pub outcome: Option<ExitOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddressResponse {
    pub executor_id: ExecutorId,
    pub address: SocketAddr,
}

#[derive(Debug, Deserialize)]
pub struct AddressQuery {
    /// Keep polling for up to this long instead of answering at once
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// [`MinerError`] rendered as an HTTP response.
pub struct ApiError(MinerError);

impl From<MinerError> for ApiError {
    fn from(err: MinerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorResponse {
            error: self.0.as_label().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn status_for(err: &MinerError) -> StatusCode {
    match err {
        e if e.is_backpressure() => StatusCode::SERVICE_UNAVAILABLE,
        MinerError::UnknownExecutor(_) => StatusCode::NOT_FOUND,
        MinerError::AddressUnavailable(_) | MinerError::TokenInUse => StatusCode::CONFLICT,
        MinerError::Provisioning(_) | MinerError::Backend(_) => StatusCode::BAD_GATEWAY,
        MinerError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/manifest", get(manifest_handler))
        .route(
            "/api/executors",
            get(list_executors_handler).post(start_executor_handler),
        )
        .route("/api/executors/{id}", delete(kill_executor_handler))
        .route("/api/executors/{id}/wait", post(wait_executor_handler))
        .route("/api/executors/{id}/address", get(address_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the control API until `shutdown` is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting control API");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind control API");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Control API failed");
    }
}

async fn manifest_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let manifest = state.supervisor.manifest().await;
    Json(ManifestResponse {
        node: state.node_name.clone(),
        backend: state.supervisor.backend_name().to_string(),
        active: state.supervisor.active().await,
        manifest,
    })
}

async fn list_executors_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let executors: Vec<ExecutorInfo> = state
        .supervisor
        .executors()
        .await
        .iter()
        .map(ExecutorInfo::from)
        .collect();
    Json(executors)
}

async fn start_executor_handler(
    State(state): State<ApiState>,
    Json(payload): Json<StartExecutorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = payload
        .token
        .map(ExecutorToken::new)
        .unwrap_or_else(ExecutorToken::generate);
    let executor_class = payload
        .executor_class
        .unwrap_or_else(|| state.default_executor_class.clone());
    let timeout = timeout_from(
        payload.timeout_secs,
        DEFAULT_EXECUTOR_TIMEOUT,
        MAX_EXECUTOR_TIMEOUT,
    )?;

    let handle = state
        .supervisor
        .start(token, executor_class, timeout)
        .await?;
    Ok((StatusCode::CREATED, Json(ExecutorInfo::from(&handle))))
}

async fn kill_executor_handler(
    State(state): State<ApiState>,
    Path(id): Path<ExecutorId>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state
        .supervisor
        .get(id)
        .await
        .ok_or(MinerError::UnknownExecutor(id))?;
    state.supervisor.kill(&handle).await?;
    Ok(Json(KillResponse {
        executor_id: id,
        outcome: handle.state().outcome(),
    }))
}

async fn wait_executor_handler(
    State(state): State<ApiState>,
    Path(id): Path<ExecutorId>,
    payload: Option<Json<WaitRequest>>,
) -> Result<Json<WaitOutcome>, ApiError> {
    let handle = state
        .supervisor
        .get(id)
        .await
        .ok_or(MinerError::UnknownExecutor(id))?;
    let timeout = timeout_from(
        payload.and_then(|Json(req)| req.timeout_secs),
        DEFAULT_WAIT_TIMEOUT,
        MAX_WAIT_TIMEOUT,
    )?;

    Ok(Json(state.supervisor.wait(&handle, timeout).await))
}

/// Requested `timeout_secs`, or `default`. Values above `max` are rejected.
fn timeout_from(
    secs: Option<u64>,
    default: Duration,
    max: Duration,
) -> Result<Duration, MinerError> {
    match secs.map(Duration::from_secs) {
        None => Ok(default),
        Some(timeout) if timeout <= max => Ok(timeout),
        Some(_) => Err(MinerError::Config(format!(
            "timeout_secs must not exceed {}",
            max.as_secs()
        ))),
    }
}

async fn address_handler(
    State(state): State<ApiState>,
    Path(id): Path<ExecutorId>,
    Query(query): Query<AddressQuery>,
) -> Result<Json<AddressResponse>, ApiError> {
    let address = match query.wait_ms {
        Some(ms) => {
            state
                .supervisor
                .await_address(id, Duration::from_millis(ms))
                .await?
        }
        None => state.supervisor.executor_address(id).await?,
    };
    Ok(Json(AddressResponse {
        executor_id: id,
        address,
    }))
}
