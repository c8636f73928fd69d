//! Error taxonomy for the PostgreSQL client core.
//!
//! [`PgError`] is the internal, `?`-propagated error every module returns.
//! [`PgOpError`] is the smaller sum-type payload the public, `Result`-based
//! API surface prefers (see `transaction` and `reflect`): it carries a
//! closed [`ErrorCode`] plus optional [`Diagnostics`] instead of an
//! arbitrary error chain, so callers can match on it without downcasting.

use std::io;
use thiserror::Error;

/// Result type used throughout the wire/connection/pool layers.
pub type PgResult<T> = Result<T, PgError>;

/// Internal error type. Every fallible operation below the public
/// transaction/reflect surface returns this via `?`.
#[derive(Error, Debug)]
pub enum PgError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{severity}: {message} ({code})")]
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    #[error("type error: {0}")]
    Type(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("prepared statement not found: {0}")]
    StatementNotFound(String),

    #[error("operation timed out")]
    Timeout,

    #[error("pool error: {0}")]
    Pool(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid operation: {0}")]
    InvalidFuture(String),
}

impl PgError {
    /// SQLSTATE code carried by a `Server` error, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Map this error onto the closed [`ErrorCode`] taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            PgError::Io(_) => ErrorCode::SocketReadFailed,
            PgError::Protocol(_) => ErrorCode::ProtocolCorrupt,
            PgError::Auth(_) => ErrorCode::AuthFailed,
            PgError::Server { .. } => ErrorCode::ServerError,
            PgError::ConnectionClosed => ErrorCode::ConnectionClosed,
            PgError::Timeout => ErrorCode::AwaitCanceled,
            PgError::Type(_) | PgError::StatementNotFound(_) | PgError::Pool(_)
            | PgError::Config(_) => ErrorCode::Unknown,
            PgError::InvalidFuture(_) => ErrorCode::InvalidFuture,
        }
    }

    /// Build the [`Diagnostics`] carried alongside a `Server` error, if any.
    pub fn diagnostics(&self) -> Option<Diagnostics> {
        match self {
            PgError::Server {
                code,
                message,
                detail,
                hint,
                ..
            } => Some(Diagnostics {
                sqlstate: code.clone(),
                message: message.clone(),
                detail: detail.clone(),
                hint: hint.clone(),
                category: SqlStateCategory::from_sqlstate(code),
            }),
            _ => None,
        }
    }
}

/// Closed taxonomy of failure modes a caller can match on without
/// inspecting the underlying `PgError` chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    InvalidFuture,
    ConnectionClosed,
    SocketReadFailed,
    ProtocolCorrupt,
    ParserTruncatedField,
    ParserTruncatedRow,
    ParserTruncatedHeader,
    ServerError,
    AuthFailed,
    AwaitCanceled,
    Unknown,
}

/// Classification of a PostgreSQL SQLSTATE code into the categories callers
/// commonly branch on (retry on serialization failure, surface a friendlier
/// message on unique violation, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlStateCategory {
    UniqueViolation,
    ForeignKeyViolation,
    Deadlock,
    SerializationFailure,
    NotNullViolation,
    CheckViolation,
    LockNotAvailable,
    QueryCanceled,
    Other,
}

impl SqlStateCategory {
    /// Classify a five-character SQLSTATE code.
    ///
    /// See https://www.postgresql.org/docs/current/errcodes-appendix.html.
    pub fn from_sqlstate(sqlstate: &str) -> Self {
        match sqlstate {
            "23505" => SqlStateCategory::UniqueViolation,
            "23503" => SqlStateCategory::ForeignKeyViolation,
            "23502" => SqlStateCategory::NotNullViolation,
            "23514" => SqlStateCategory::CheckViolation,
            "40P01" => SqlStateCategory::Deadlock,
            "40001" => SqlStateCategory::SerializationFailure,
            "55P03" => SqlStateCategory::LockNotAvailable,
            "57014" => SqlStateCategory::QueryCanceled,
            _ => SqlStateCategory::Other,
        }
    }
}

/// Structured detail attached to a server-originated error or notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub sqlstate: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub category: SqlStateCategory,
}

/// The sum-type error payload returned by the `Result<T, PgOpError>`
/// surface (`Transaction::query_reflect_expected*`, `Router::route*`, ...).
#[derive(Debug, Clone)]
pub struct PgOpError {
    pub code: ErrorCode,
    pub message: String,
    pub diagnostics: Option<Diagnostics>,
}

impl std::fmt::Display for PgOpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for PgOpError {}

impl From<&PgError> for PgOpError {
    fn from(err: &PgError) -> Self {
        PgOpError {
            code: err.code(),
            message: err.to_string(),
            diagnostics: err.diagnostics(),
        }
    }
}

impl From<PgError> for PgOpError {
    fn from(err: PgError) -> Self {
        PgOpError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(
            SqlStateCategory::from_sqlstate("23505"),
            SqlStateCategory::UniqueViolation
        );
        assert_eq!(
            SqlStateCategory::from_sqlstate("40001"),
            SqlStateCategory::SerializationFailure
        );
        assert_eq!(SqlStateCategory::from_sqlstate("99999"), SqlStateCategory::Other);
    }

    #[test]
    fn test_pg_op_error_from_server_error() {
        let err = PgError::Server {
            severity: "ERROR".to_string(),
            code: "23505".to_string(),
            message: "duplicate key".to_string(),
            detail: None,
            hint: None,
        };
        let op_err: PgOpError = (&err).into();
        assert_eq!(op_err.code, ErrorCode::ServerError);
        assert_eq!(
            op_err.diagnostics.unwrap().category,
            SqlStateCategory::UniqueViolation
        );
    }

    #[test]
    fn test_connection_closed_maps_to_code() {
        let err = PgError::ConnectionClosed;
        assert_eq!(err.code(), ErrorCode::ConnectionClosed);
        assert!(err.diagnostics().is_none());
    }
}
