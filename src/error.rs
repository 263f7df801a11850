//! Error types shared by the storage engine and the ingestion pipeline.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or conflicting input: field definitions, filters, params.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A project, task or storage unit that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The external data source could not be fetched.
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn fetch(msg: impl Into<String>) -> Self {
        Error::Fetch(msg.into())
    }

    /// Whether an external retry policy may reasonably try again.
    ///
    /// Validation and not-found errors are permanent; fetch, storage and io
    /// errors are treated as transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Fetch(_) | Error::Storage(_) | Error::Io(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Fetch(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::fetch("timeout").is_retryable());
        assert!(Error::Storage(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!Error::validation("bad key").is_retryable());
        assert!(!Error::not_found("project x").is_retryable());
    }

    #[test]
    fn test_display_includes_message() {
        let err = Error::validation("duplicate field key: uid");
        assert_eq!(err.to_string(), "validation failed: duplicate field key: uid");
    }
}
