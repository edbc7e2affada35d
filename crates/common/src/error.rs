//! Error types for meshprov

use thiserror::Error;

/// Result type alias using meshprov Error
pub type Result<T> = std::result::Result<T, Error>;

/// Meshprov error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} {id} already exists")]
    Conflict { kind: String, id: String },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Address pool {pool} is exhausted")]
    PoolExhausted { pool: String },

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Live peer table update failed: {0}")]
    LiveApplyFailed(String),

    #[error("Live peer table updated but snapshot was not persisted: {0}")]
    PartiallyApplied(String),

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn conflict(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::Conflict { kind: kind.into(), id: id.into() }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound { kind: kind.into(), id: id.into() }
    }

    pub fn timeout(operation: impl Into<String>, limit: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            millis: limit.as_millis() as u64,
        }
    }

    /// Whether a later `enable` or sweep may succeed where this failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LiveApplyFailed(_) | Error::PartiallyApplied(_) | Error::Timeout { .. }
        )
    }

    /// Stable machine-readable code for transport layers.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Database(_) => "database",
            Error::Serialization(_) => "serialization",
            Error::Conflict { .. } => "conflict",
            Error::NotFound { .. } => "not_found",
            Error::Forbidden(_) => "forbidden",
            Error::PoolExhausted { .. } => "pool_exhausted",
            Error::KeyGenerationFailed(_) => "key_generation_failed",
            Error::LiveApplyFailed(_) => "live_apply_failed",
            Error::PartiallyApplied(_) => "partially_applied",
            Error::Timeout { .. } => "timeout",
            Error::InvalidInput(_) => "invalid_input",
            Error::InvalidStateTransition { .. } => "invalid_state_transition",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Internal(_) => "internal",
        }
    }
}
