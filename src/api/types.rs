//! API request and response types not shared with the dispatcher.

use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub hardware_state: rqd_protocol::HardwareState,
}
