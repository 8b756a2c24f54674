//! Error types for stanza-rs.
//!
//! Errors are classified as retryable or not so that a driver polling
//! `advance` can back off instead of giving up.

use thiserror::Error;

use crate::llm::UpstreamError;
use crate::model::JobId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Compare-and-swap kept losing to concurrent writers.
    #[error("version conflict on job {id} after {attempts} attempts")]
    VersionConflict { id: JobId, attempts: u32 },

    #[error("recipe generation contention on {key} after {attempts} attempts")]
    RecipeGenerationContention { key: String, attempts: u32 },

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("monotonicity violation: {0}")]
    Monotonicity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::VersionConflict { .. } | Error::RecipeGenerationContention { .. } => true,
            Error::Upstream(e) => e.is_retryable(),
            Error::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Stable machine-readable code, surfaced to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::VersionConflict { .. } => "VERSION_CONFLICT",
            Error::RecipeGenerationContention { .. } => "RECIPE_GENERATION_CONTENTION",
            Error::Upstream(_) => "UPSTREAM_ERROR",
            Error::Monotonicity(_) => "MONOTONICITY_VIOLATION",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Other(_) => "INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::UpstreamErrorKind;

    #[test]
    fn contention_is_retryable_with_stable_code() {
        let err = Error::RecipeGenerationContention {
            key: "recipe-gen:x".to_string(),
            attempts: 8,
        };
        assert!(err.is_retryable());
        assert_eq!(err.code(), "RECIPE_GENERATION_CONTENTION");
    }

    #[test]
    fn fatal_upstream_is_not_retryable() {
        let err = Error::from(UpstreamError::new(UpstreamErrorKind::Fatal, "bad key"));
        assert!(!err.is_retryable());
        let err = Error::from(UpstreamError::new(UpstreamErrorKind::RateLimited, "429"));
        assert!(err.is_retryable());
    }
}
