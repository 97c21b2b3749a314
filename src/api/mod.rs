//! HTTP control plane for the render-host agent.
//!
//! The dispatcher drives the agent through these endpoints: launching and
//! killing frames, locking cores, toggling NIMBY and host lifecycle.
//!
//! # Example
//!
//! ```bash
//! # Lock two cores
//! curl -X POST http://localhost:8444/api/v1/host/lock \
//!   -H "Content-Type: application/json" \
//!   -d '{"cores": 200}'
//! ```

pub mod error;
pub mod handlers;
pub mod state;
pub mod types;
pub mod validation;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use state::ApiState;

/// Create the API router with all endpoints.
pub fn create_router(state: Arc<ApiState>) -> Router {
    let health_route = Router::new().route("/health", get(handlers::health::health));

    let frame_routes = Router::new()
        .route("/", post(handlers::frames::launch_frame))
        .route("/:id", get(handlers::frames::get_frame))
        .route("/:id/kill", post(handlers::frames::kill_frame));

    let host_routes = Router::new()
        .route("/status", get(handlers::host::status))
        .route("/lock", post(handlers::host::lock))
        .route("/unlock", post(handlers::host::unlock))
        .route("/lock-all", post(handlers::host::lock_all))
        .route("/unlock-all", post(handlers::host::unlock_all))
        .route("/nimby/on", post(handlers::host::nimby_on))
        .route("/nimby/off", post(handlers::host::nimby_off))
        .route("/shutdown-now", post(handlers::host::shutdown_now))
        .route("/shutdown-idle", post(handlers::host::shutdown_when_idle))
        .route("/reboot-now", post(handlers::host::reboot_now))
        .route("/reboot-idle", post(handlers::host::reboot_when_idle))
        .route("/restart-now", post(handlers::host::restart_now))
        .route("/restart-idle", post(handlers::host::restart_when_idle));

    let api_v1 = Router::new()
        .nest("/frames", frame_routes)
        .nest("/host", host_routes);

    Router::new()
        .merge(health_route)
        .nest("/api/v1", api_v1)
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(60)))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::config::{InputSourceKind, RqdConfig};
    use crate::dispatcher::RecordingDispatcher;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use rqd_protocol::{ErrorBody, ErrorKind, HostReport};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_agent(dir: &std::path::Path, nimby: bool) -> Arc<Agent> {
        let mut config = RqdConfig::default();
        config.overrides.num_procs = Some(1);
        config.overrides.cores_per_proc = Some(4);
        config.overrides.threads_per_proc = Some(8);
        config.overrides.is_desktop = Some(false);
        config.overrides.nimby = Some(nimby);
        config.overrides.hostname = Some("render01".into());
        config.nimby.input_source = InputSourceKind::None;
        config.launch.become_job_user = false;
        config.paths.temp_dir = dir.to_path_buf();
        config.report.min_interval = Duration::from_secs(3600);
        config.report.max_interval = Duration::from_secs(3600);
        Agent::new(Arc::new(config), Arc::new(RecordingDispatcher::new())).unwrap()
    }

    fn router(agent: &Arc<Agent>) -> Router {
        create_router(Arc::new(ApiState::new(Arc::clone(agent))))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path(), false);
        let response = router(&agent)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_lock_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path(), false);

        let response = router(&agent)
            .oneshot(post_json("/api/v1/host/lock", r#"{"cores": 200}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router(&agent)
            .oneshot(Request::get("/api/v1/host/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: HostReport = body_json(response).await;
        assert_eq!(report.core_info.total_cores, 800);
        assert_eq!(report.core_info.locked_cores, 200);
        assert_eq!(report.core_info.idle_cores, 600);
    }

    #[tokio::test]
    async fn test_bad_cores_request() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path(), false);

        let response = router(&agent)
            .oneshot(post_json("/api/v1/host/lock", r#"{"cores": -5}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router(&agent)
            .oneshot(post_json("/api/v1/host/lock", "not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.kind, ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_unknown_frame() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path(), false);

        let response = router(&agent)
            .oneshot(Request::get("/api/v1/frames/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.kind, ErrorKind::FrameNotFound);

        let response = router(&agent)
            .oneshot(post_json("/api/v1/frames/nope/kill", r#"{"reason": "test"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_launch_rejects_invalid_user() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path(), false);
        let body = serde_json::json!({
            "frame_id": "f1",
            "job_id": "j1",
            "layer_id": "l1",
            "job_name": "job",
            "frame_name": "0001-render",
            "command": "true",
            "uid": 0,
            "user_name": "root",
            "log_dir": dir.path().to_str().unwrap(),
            "num_cores": 100,
        });

        let response = router(&agent)
            .oneshot(post_json("/api/v1/frames", &body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.kind, ErrorKind::InvalidUser);
        assert_eq!(agent.ledger().idle_cores(), 800);
    }

    #[tokio::test]
    async fn test_nimby_off_without_nimby() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path(), false);
        let response = router(&agent)
            .oneshot(post_json("/api/v1/host/nimby/off", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
