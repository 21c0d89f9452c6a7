//! HTTP control endpoint.
//!
//! Each route maps onto exactly one agent operation. Successful lifecycle
//! calls answer with the resulting instance status.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::agent::Agent;
use crate::error::AgentError;
use crate::instance::InstanceStatus;

/// Create the control router.
pub fn create_router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/instance/status", get(status))
        .route("/api/instance/start", post(start))
        .route("/api/instance/stop", post(stop))
        .route("/api/instance/restart", post(restart))
        .route("/api/instance/pause", post(pause))
        .route("/api/instance/continue", post(resume))
        .route("/api/instance/backup", post(backup))
        .route("/api/instance/cleanup", post(cleanup))
        .route("/api/instance/dropport", post(drop_port))
        .route("/api/instance/recoverport", post(recover_port))
        .route("/api/agent/shutdown", post(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

/// Error body returned by every failing route.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        let status = match &err {
            e if e.is_conflict() => StatusCode::CONFLICT,
            AgentError::Fault(dt_netfault::FaultError::InvalidPort(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %err, code = err.reason_code(), "Control request failed");
        }

        Self {
            status,
            body: ErrorBody {
                code: err.reason_code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Parse an optional JSON body; an empty body yields the default.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request("invalid_body", e.to_string()))
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BackupRequest {
    #[serde(default)]
    pub dest: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct BackupResponse {
    pub dest: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct PortQuery {
    pub port: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct PortResponse {
    pub port: String,
    pub action: String,
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "dt-agent".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn status(State(agent): State<Arc<Agent>>) -> Json<InstanceStatus> {
    Json(agent.status().await)
}

async fn start(
    State(agent): State<Arc<Agent>>,
    body: Bytes,
) -> Result<Json<InstanceStatus>, ApiError> {
    let request: StartRequest = parse_body(&body)?;
    Ok(Json(agent.start_instance(&request.args).await?))
}

async fn stop(State(agent): State<Arc<Agent>>) -> Result<Json<InstanceStatus>, ApiError> {
    Ok(Json(agent.stop_instance().await?))
}

async fn restart(
    State(agent): State<Arc<Agent>>,
    body: Bytes,
) -> Result<Json<InstanceStatus>, ApiError> {
    let request: StartRequest = parse_body(&body)?;
    Ok(Json(agent.restart_instance(&request.args).await?))
}

async fn pause(State(agent): State<Arc<Agent>>) -> Result<Json<InstanceStatus>, ApiError> {
    Ok(Json(agent.pause_instance().await?))
}

async fn resume(State(agent): State<Arc<Agent>>) -> Result<Json<InstanceStatus>, ApiError> {
    Ok(Json(agent.continue_instance().await?))
}

async fn backup(
    State(agent): State<Arc<Agent>>,
    body: Bytes,
) -> Result<Json<BackupResponse>, ApiError> {
    let request: BackupRequest = parse_body(&body)?;
    let dest = agent.backup_instance(request.dest).await?;
    Ok(Json(BackupResponse { dest }))
}

async fn cleanup(State(agent): State<Arc<Agent>>) -> Result<Json<InstanceStatus>, ApiError> {
    Ok(Json(agent.cleanup_instance().await?))
}

async fn drop_port(
    State(agent): State<Arc<Agent>>,
    Query(query): Query<PortQuery>,
) -> Result<Json<PortResponse>, ApiError> {
    agent.drop_port(&query.port).await?;
    Ok(Json(PortResponse {
        port: query.port,
        action: "drop".to_string(),
    }))
}

async fn recover_port(
    State(agent): State<Arc<Agent>>,
    Query(query): Query<PortQuery>,
) -> Result<Json<PortResponse>, ApiError> {
    agent.recover_port(&query.port).await?;
    Ok(Json(PortResponse {
        port: query.port,
        action: "recover".to_string(),
    }))
}

/// Always answers with the final status: the agent shuts down even when the
/// instance did not stop cleanly.
async fn shutdown(State(agent): State<Arc<Agent>>) -> Json<InstanceStatus> {
    if let Err(e) = agent.shutdown().await {
        warn!(error = %e, code = e.reason_code(), "Instance did not stop cleanly during shutdown");
    }
    Json(agent.status().await)
}
