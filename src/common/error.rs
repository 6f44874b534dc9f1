//! Error types for clustermeta

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Registry Errors ===
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not empty: {0}")]
    NotEmpty(String),

    // === Placement Errors ===
    #[error("No eligible instance (resource tag: {resource_tag:?})")]
    NoEligibleInstance { resource_tag: String },

    // === Consensus Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Commit timeout: {0}")]
    Timeout(String),

    // === Snapshot Errors ===
    #[error("Malformed snapshot record {key}: {reason}")]
    MalformedSnapshotRecord { key: String, reason: String },

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Client Errors ===
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === Request / Config Errors ===
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Retrying is always the caller's job; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::NotLeader(_))
    }

    /// Stable status code carried in admin responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::NotFound(_) => "NOT_FOUND",
            Error::NotEmpty(_) => "NOT_EMPTY",
            Error::NoEligibleInstance { .. } => "NO_ELIGIBLE_INSTANCE",
            Error::NotLeader(_) => "NOT_LEADER",
            Error::Timeout(_) => "TIMEOUT",
            Error::MalformedSnapshotRecord { .. } => "MALFORMED_SNAPSHOT_RECORD",
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => "INVALID_ARGUMENT",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::NotEmpty(_) => StatusCode::CONFLICT,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NoEligibleInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("add_instance".into()).is_retryable());
        assert!(Error::NotLeader("node-2".into()).is_retryable());
        assert!(!Error::NotFound("10.0.0.1:8010".into()).is_retryable());
    }

    #[test]
    fn test_codes_and_http_status() {
        let err = Error::NotEmpty("logical room bj".into());
        assert_eq!(err.code(), "NOT_EMPTY");
        assert_eq!(err.to_http_status(), StatusCode::CONFLICT);

        let err = Error::NoEligibleInstance {
            resource_tag: "ssd".into(),
        };
        assert_eq!(err.code(), "NO_ELIGIBLE_INSTANCE");
        assert_eq!(err.to_http_status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
