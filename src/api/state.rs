//! API server state.

use crate::agent::Agent;
use crate::api::error::ApiError;
use std::sync::Arc;

/// Shared API server state.
pub struct ApiState {
    agent: Arc<Agent>,
}

impl ApiState {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Run an agent operation on the blocking pool.
    ///
    /// Agent operations take locks, fork children and send blocking reports,
    /// none of which belong on the async executor.
    pub async fn call<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Agent>) -> crate::Result<T> + Send + 'static,
    {
        let agent = Arc::clone(&self.agent);
        let result = tokio::task::spawn_blocking(move || op(&agent)).await?;
        result.map_err(ApiError::from)
    }
}
