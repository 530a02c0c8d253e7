use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use loam_core::{DeviceId, FieldId, StorageRow};
use serde::Serialize;

use crate::ingest::IngestSnapshot;
use crate::session::SessionSummary;
use crate::state::NodeState;
use crate::storage::RowStorage;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = ErrorResponse {
            success: false,
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: u16,
    pub uptime_secs: u64,
    pub state_checksum: u64,
    pub rows: usize,
    pub tracked_devices: usize,
    pub sessions: Vec<SessionSummary>,
    pub ingest: IngestSnapshot,
}

pub fn router<R: RowStorage>(state: NodeState<R>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status::<R>))
        .route("/devices/{device_id}/rows", get(device_rows::<R>))
        .route("/fields/{field_id}/rows", get(field_rows::<R>))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn status<R: RowStorage>(
    State(state): State<NodeState<R>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let storage = state.ingest.storage();
    let rows = storage
        .count()
        .await
        .map_err(|e| ApiError::InternalServerError(e.to_string()))?;

    Ok(Json(StatusResponse {
        node_id: state.node_id().0,
        uptime_secs: state.uptime_secs(),
        state_checksum: storage.checksum(),
        rows,
        tracked_devices: state.ingest.tracked_devices(),
        sessions: state.sessions.summaries(),
        ingest: state.ingest.stats(),
    }))
}

async fn device_rows<R: RowStorage>(
    State(state): State<NodeState<R>>,
    Path(device_id): Path<u32>,
) -> Result<Json<Vec<StorageRow>>, ApiError> {
    state
        .ingest
        .storage()
        .rows_for_device(DeviceId(device_id))
        .await
        .map(Json)
        .map_err(|e| ApiError::InternalServerError(e.to_string()))
}

async fn field_rows<R: RowStorage>(
    State(state): State<NodeState<R>>,
    Path(field_id): Path<u32>,
) -> Result<Json<Vec<StorageRow>>, ApiError> {
    state
        .ingest
        .storage()
        .rows_for_field(FieldId(field_id))
        .await
        .map(Json)
        .map_err(|e| ApiError::InternalServerError(e.to_string()))
}
