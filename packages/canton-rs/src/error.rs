//! Error taxonomy shared by every bridge component.
//!
//! Library code returns [`Error`], a tagged kind plus an optional wrapped
//! cause. Binaries map kinds to HTTP statuses at the edge and decide retry
//! policy from [`ErrorKind::is_retryable`] instead of matching on message
//! strings. gRPC statuses and database errors are classified here, in the
//! one place that is allowed to look at their structured codes.
//!
//! The participant-facing taxonomy of the ledger client collapses onto these
//! kinds as: retryable → `Dependency`/`Timeout`, conflict → `Conflict`,
//! invalid → `InvalidInput`, auth → `Unauthorized`/`Forbidden`, corrupt →
//! `Internal` (fatal to the current operation, never retried).

use std::fmt;

/// The ten error kinds surfaced across the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Locked,
    Dependency,
    Timeout,
    Recovering,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid-input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Locked => "locked",
            ErrorKind::Dependency => "dependency-failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Recovering => "recovering",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status used by the JSON error envelope.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidInput => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Locked => 423,
            ErrorKind::Internal => 500,
            ErrorKind::Dependency => 502,
            ErrorKind::Recovering => 503,
            ErrorKind::Timeout => 504,
        }
    }

    /// Whether a pipeline may retry the failed operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Dependency | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified bridge error: kind, human-readable message, optional cause.
#[derive(Debug, thiserror::Error)]
#[error("{}: {}", .kind.as_str(), .message)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dependency, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// A value read from the ledger or the key store failed to decode or
    /// authenticate. Fatal to the current operation.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, format!("corrupt: {}", message.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;
        let kind = match status.code() {
            Code::DeadlineExceeded => ErrorKind::Timeout,
            Code::Unavailable | Code::ResourceExhausted => ErrorKind::Dependency,
            Code::AlreadyExists | Code::Aborted => ErrorKind::Conflict,
            Code::FailedPrecondition | Code::InvalidArgument => ErrorKind::InvalidInput,
            Code::Unauthenticated => ErrorKind::Unauthorized,
            Code::PermissionDenied => ErrorKind::Forbidden,
            Code::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        };
        Self::with_source(kind, format!("participant: {}", status.message()), status)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => ErrorKind::NotFound,
            sqlx::Error::PoolTimedOut => ErrorKind::Timeout,
            sqlx::Error::Database(db) => {
                // 23505 = unique_violation
                if db.code().as_deref() == Some("23505") {
                    ErrorKind::Conflict
                } else {
                    ErrorKind::Dependency
                }
            }
            _ => ErrorKind::Dependency,
        };
        Self::with_source(kind, "database error", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorKind::InvalidInput.http_status(), 400);
        assert_eq!(ErrorKind::Unauthorized.http_status(), 401);
        assert_eq!(ErrorKind::Forbidden.http_status(), 403);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
        assert_eq!(ErrorKind::Locked.http_status(), 423);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
        assert_eq!(ErrorKind::Dependency.http_status(), 502);
        assert_eq!(ErrorKind::Recovering.http_status(), 503);
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
    }

    #[test]
    fn grpc_status_classification() {
        let err = Error::from(tonic::Status::unavailable("node down"));
        assert_eq!(err.kind(), ErrorKind::Dependency);
        assert!(err.kind().is_retryable());

        let err = Error::from(tonic::Status::already_exists("command id seen"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.kind().is_retryable());

        let err = Error::from(tonic::Status::deadline_exceeded("slow"));
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err = Error::from(tonic::Status::invalid_argument("bad record"));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = Error::from(tonic::Status::unauthenticated("expired token"));
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn display_carries_kind_and_message() {
        let err = Error::conflict("user already registered");
        assert_eq!(err.to_string(), "conflict: user already registered");
    }
}
