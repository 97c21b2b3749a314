//! Health check endpoint.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::state::ApiState;
use crate::api::types::HealthResponse;

/// GET /health - Health check endpoint.
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
        hardware_state: state.agent().hardware_state(),
    })
}
