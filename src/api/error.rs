//! API error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rqd_protocol::{ErrorBody, ErrorKind};

/// A failed control request.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::BadRequest,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::RqdException,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            ErrorKind::CoreReservationFailure => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InvalidUser | ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::DuplicateFrameViolation => StatusCode::CONFLICT,
            ErrorKind::NimbyLocked => StatusCode::LOCKED,
            ErrorKind::FrameNotFound => StatusCode::NOT_FOUND,
            ErrorKind::RqdException => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = ?self.kind, message = %self.message, "request failed");
        } else {
            tracing::debug!(kind = ?self.kind, message = %self.message, "request refused");
        }
        let body = ErrorBody {
            kind: self.kind,
            message: self.message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<crate::Error> for ApiError {
    fn from(err: crate::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::internal(format!("task failed: {}", err))
    }
}

impl From<axum::extract::rejection::JsonRejection> for ApiError {
    fn from(err: axum::extract::rejection::JsonRejection) -> Self {
        ApiError::bad_request(err.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (crate::Error::NimbyLocked, StatusCode::LOCKED),
            (crate::Error::InvalidUser(0), StatusCode::BAD_REQUEST),
            (
                crate::Error::DuplicateFrameViolation("f".into()),
                StatusCode::CONFLICT,
            ),
            (
                crate::Error::CoreReservationFailure("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (crate::Error::FrameNotFound("f".into()), StatusCode::NOT_FOUND),
            (crate::Error::rqd("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status_code(), status, "{}", api);
        }
    }
}
