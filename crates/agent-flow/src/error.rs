//! Error types for the NoETL agent flow engine.
//!
//! Only infrastructure failures travel as [`AppError`]. Domain failures
//! (unparseable condition answers, exceeded loop bounds, failed runs) are
//! written into the `error` field of the step or execution instead.

use thiserror::Error;

/// Application-level errors for the agent flow engine.
#[derive(Error, Debug)]
pub enum AppError {
    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Create of an object that already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency failure on update
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object store backend unavailable
    #[error("Store error: {0}")]
    Store(String),

    /// Resumed watch no longer covered by the change history
    #[error("Watch expired: {0}")]
    Expired(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Parse error (YAML, JSON, etc.)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Expression parse or evaluation error
    #[error("Expression error: {0}")]
    Expression(String),

    /// External execution runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Workspace provider error
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// Dataset reader error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Compression or blob decoding error
    #[error("Codec error: {0}")]
    Codec(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a retry of the same operation may succeed without any other change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Conflict(_) | AppError::Store(_) | AppError::Expired(_)
        )
    }

    /// Whether this error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Parse(err.to_string())
    }
}

impl From<minijinja::Error> for AppError {
    fn from(err: minijinja::Error) -> Self {
        AppError::Expression(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("run r1".to_string());
        assert_eq!(err.to_string(), "Resource not found: run r1");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::Conflict("step".into()).is_transient());
        assert!(AppError::Store("down".into()).is_transient());
        assert!(!AppError::Validation("bad".into()).is_transient());
        assert!(!AppError::Codec("gzip".into()).is_transient());
    }
}
