//! Host handlers: status, locks, NIMBY and lifecycle.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use rqd_protocol::{CoresRequest, HostReport};
use std::sync::Arc;

use crate::agent::Agent;
use crate::api::error::ApiError;
use crate::api::state::ApiState;

/// GET /api/v1/host/status - Full host report.
pub async fn status(State(state): State<Arc<ApiState>>) -> Result<Json<HostReport>, ApiError> {
    let report = state.call(|agent| Ok(agent.status())).await?;
    Ok(Json(report))
}

fn cores(body: Result<Json<CoresRequest>, JsonRejection>) -> Result<i32, ApiError> {
    let Json(req) = body?;
    if req.cores <= 0 {
        return Err(ApiError::bad_request(format!(
            "cores must be positive, got {}",
            req.cores
        )));
    }
    Ok(req.cores)
}

/// POST /api/v1/host/lock - Lock some cores.
pub async fn lock(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<CoresRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let n = cores(body)?;
    state
        .call(move |agent| {
            agent.lock(n);
            Ok(())
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/host/unlock - Unlock some cores.
pub async fn unlock(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<CoresRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let n = cores(body)?;
    state
        .call(move |agent| {
            agent.unlock(n);
            Ok(())
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run(
    state: Arc<ApiState>,
    op: fn(&Agent) -> crate::Result<()>,
) -> Result<StatusCode, ApiError> {
    state.call(move |agent| op(agent)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/host/lock-all
pub async fn lock_all(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    run(state, |a| {
        a.lock_all();
        Ok(())
    })
    .await
}

/// POST /api/v1/host/unlock-all
pub async fn unlock_all(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    run(state, |a| {
        a.unlock_all();
        Ok(())
    })
    .await
}

/// POST /api/v1/host/nimby/on
pub async fn nimby_on(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    run(state, Agent::nimby_on).await
}

/// POST /api/v1/host/nimby/off
pub async fn nimby_off(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    run(state, Agent::nimby_off).await
}

/// POST /api/v1/host/shutdown-now
pub async fn shutdown_now(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    run(state, Agent::shutdown_now).await
}

/// POST /api/v1/host/shutdown-idle
pub async fn shutdown_when_idle(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    run(state, Agent::shutdown_when_idle).await
}

/// POST /api/v1/host/reboot-now
pub async fn reboot_now(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    run(state, Agent::reboot_now).await
}

/// POST /api/v1/host/reboot-idle
pub async fn reboot_when_idle(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    run(state, Agent::reboot_when_idle).await
}

/// POST /api/v1/host/restart-now
pub async fn restart_now(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    run(state, Agent::restart_now).await
}

/// POST /api/v1/host/restart-idle
pub async fn restart_when_idle(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    run(state, Agent::restart_when_idle).await
}
