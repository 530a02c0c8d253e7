use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use loam_core::{FieldId, NodeId};
use loam_edge::FieldConditions;
use serde::{Deserialize, Serialize};

use crate::failover::{FailoverError, FailoverStatus};
use crate::pipeline::PipelineSnapshot;
use crate::state::GatewayState;
use crate::transport::{EndpointStatus, QueueDepth};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = ErrorResponse {
            success: false,
            message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<FailoverError> for ApiError {
    fn from(e: FailoverError) -> Self {
        match e {
            FailoverError::UnknownNode(_) => ApiError::NotFound(e.to_string()),
            FailoverError::Stopped => ApiError::Unavailable(e.to_string()),
            _ => ApiError::Conflict(e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub gateway_id: String,
    pub uptime_secs: u64,
    pub write_gate_open: bool,
    pub failover: FailoverStatus,
    pub endpoints: Vec<EndpointStatus>,
    pub queue: QueueDepth,
    pub pipeline: PipelineSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct ConditionsRequest {
    pub irrigation_active: bool,
    #[serde(default)]
    pub dormant: bool,
}

#[derive(Debug, Serialize)]
pub struct RecoveryResponse {
    pub node_id: u16,
    pub accepted: bool,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/fields/{field_id}/conditions", put(update_conditions))
        .route("/nodes/{node_id}/recovered", post(node_recovered))
        .route("/failover/retry", post(retry_promotion))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<GatewayState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        gateway_id: state.gateway_id.0.to_string(),
        uptime_secs: state.uptime_secs(),
        write_gate_open: state.transport.gate().is_open(),
        failover: state.failover.status(),
        endpoints: state.transport.endpoint_health(),
        queue: state.transport.queue_depth(),
        pipeline: state.pipeline.snapshot(),
    })
}

// Irrigation control pushes the whole state of a field; repeating it is harmless.
async fn update_conditions(
    State(state): State<GatewayState>,
    Path(field_id): Path<u32>,
    Json(request): Json<ConditionsRequest>,
) -> Json<FieldConditions> {
    let conditions = FieldConditions::new(request.irrigation_active, request.dormant);
    state
        .sampling
        .update_field_conditions(FieldId(field_id), conditions);
    Json(conditions)
}

async fn node_recovered(
    State(state): State<GatewayState>,
    Path(node_id): Path<u16>,
) -> Result<(StatusCode, Json<RecoveryResponse>), ApiError> {
    state.failover.signal_recovered(NodeId(node_id)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RecoveryResponse {
            node_id,
            accepted: true,
        }),
    ))
}

async fn retry_promotion(State(state): State<GatewayState>) -> Result<StatusCode, ApiError> {
    state.failover.retry_promotion().await?;
    Ok(StatusCode::ACCEPTED)
}
