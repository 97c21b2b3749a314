//! Frame handlers.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use rqd_protocol::{KillFrameRequest, RunFrame, RunningFrameInfo};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::validation::validate_run_frame;

/// POST /api/v1/frames - Launch a frame.
///
/// Returns once cores are reserved; the frame runs on in the background.
pub async fn launch_frame(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<RunFrame>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(frame) = body?;
    validate_run_frame(&frame)?;
    state.call(move |agent| agent.launch_frame(frame)).await?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /api/v1/frames/:id - Telemetry of a running frame.
pub async fn get_frame(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<RunningFrameInfo>, ApiError> {
    let info = state
        .call(move |agent| agent.get_running_frame_status(&id))
        .await?;
    Ok(Json(info))
}

/// POST /api/v1/frames/:id/kill - Kill a running frame.
pub async fn kill_frame(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Option<Json<KillFrameRequest>>,
) -> Result<StatusCode, ApiError> {
    let reason = body
        .map(|Json(req)| req.reason)
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "killed by control request".to_string());
    state.call(move |agent| agent.kill_frame(&id, &reason)).await?;
    Ok(StatusCode::NO_CONTENT)
}
