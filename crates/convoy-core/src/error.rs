//! Core error types.

use thiserror::Error;

/// Result type alias for core validation.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while validating identifiers and specs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("invalid app id {id:?}: {reason}")]
    InvalidAppId { id: String, reason: String },

    #[error("invalid spec for {app_id}: {reason}")]
    InvalidSpec { app_id: String, reason: String },

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),
}

/// Result type alias for calls into external collaborators.
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Failure of a call into an external collaborator.
///
/// None of these are fatal to the orchestration core: callers log them and
/// retry on their next cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} timed out")]
    Timeout { operation: String },
}

impl CollaboratorError {
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}
