//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::debug;

use crate::errors::AgentError;
use crate::models::deployment::{DeploymentRequest, PortAllocation};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "rollout-agent".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Error body returned by the API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub error: String,
}

/// Wraps [`AgentError`] for handlers
pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::ValidationError(_) | AgentError::JsonError(_) => StatusCode::BAD_REQUEST,
            AgentError::ConflictError(_) => StatusCode::CONFLICT,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            kind: self.0.kind().to_string(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Accepted deployment response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployAccepted {
    pub deployment_id: String,
    pub status: String,
}

/// Start a rollout in the background
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Json(mut payload): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(object) = payload.as_object_mut() {
        object
            .entry("deploymentId")
            .or_insert_with(|| serde_json::Value::String(uuid::Uuid::new_v4().to_string()));
    }

    let request = DeploymentRequest::from_value(payload)?;
    if state
        .orchestrator
        .locks()
        .is_locked(&request.service_name, &request.environment)
    {
        return Err(AgentError::ConflictError(request.lock_key()).into());
    }

    let deployment_id = request.deployment_id.clone();
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        if let Err(e) = orchestrator.deploy(request).await {
            debug!("Deployment ended with {}", e.kind());
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployAccepted {
            deployment_id,
            status: "accepted".to_string(),
        }),
    ))
}

/// Persisted port allocations
pub async fn ports_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<PortAllocation>>, ApiError> {
    Ok(Json(state.orchestrator.ports().allocations().await?))
}

/// Currently held deployment locks
pub async fn locks_handler(State(state): State<Arc<ServerState>>) -> Json<Vec<String>> {
    Json(state.orchestrator.locks().held())
}
