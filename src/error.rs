//! Error types for rqd.

use rqd_protocol::ErrorKind;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The ledger could not satisfy a request, or the host refuses work.
    #[error("core reservation failure: {0}")]
    CoreReservationFailure(String),

    /// A frame asked to run as root or an invalid uid.
    #[error("invalid user: uid {0}")]
    InvalidUser(i32),

    /// A frame with this id is already running.
    #[error("frame {0} is already running")]
    DuplicateFrameViolation(String),

    /// NIMBY holds the host.
    #[error("host is nimby locked")]
    NimbyLocked,

    /// No running frame with this id.
    #[error("frame {0} not found")]
    FrameNotFound(String),

    /// Generic internal failure.
    #[error("{0}")]
    Rqd(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A report could not be delivered to the dispatcher.
    #[error("dispatcher error: {0}")]
    Dispatcher(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a generic internal error.
    pub fn rqd(message: impl Into<String>) -> Self {
        Self::Rqd(message.into())
    }

    /// Create a generic internal error for a failed operation.
    pub fn op(operation: &str, reason: impl std::fmt::Display) -> Self {
        Self::Rqd(format!("failed to {}: {}", operation, reason))
    }

    /// The kind reported to control-plane callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CoreReservationFailure(_) => ErrorKind::CoreReservationFailure,
            Error::InvalidUser(_) => ErrorKind::InvalidUser,
            Error::DuplicateFrameViolation(_) => ErrorKind::DuplicateFrameViolation,
            Error::NimbyLocked => ErrorKind::NimbyLocked,
            Error::FrameNotFound(_) => ErrorKind::FrameNotFound,
            Error::Rqd(_) | Error::Config(_) | Error::Dispatcher(_) | Error::Io(_) => {
                ErrorKind::RqdException
            }
        }
    }
}

impl From<crate::ledger::LedgerError> for Error {
    fn from(e: crate::ledger::LedgerError) -> Self {
        Error::CoreReservationFailure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let cases = [
            (
                Error::CoreReservationFailure("x".into()),
                ErrorKind::CoreReservationFailure,
            ),
            (Error::InvalidUser(0), ErrorKind::InvalidUser),
            (
                Error::DuplicateFrameViolation("f".into()),
                ErrorKind::DuplicateFrameViolation,
            ),
            (Error::NimbyLocked, ErrorKind::NimbyLocked),
            (Error::FrameNotFound("f".into()), ErrorKind::FrameNotFound),
            (Error::rqd("boom"), ErrorKind::RqdException),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "{}", err);
        }
    }

    #[test]
    fn test_ledger_error_converts_to_reservation_failure() {
        let err: Error = crate::ledger::LedgerError::InsufficientCores {
            requested: 900,
            idle: 800,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::CoreReservationFailure);
    }
}
