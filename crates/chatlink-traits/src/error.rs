//! Error types for collaborator calls

use thiserror::Error;

/// Failure reported by an external collaborator.
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// A create hit an existing record (duplicate key).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The collaborator refused the request (bad code, undeliverable address, ...).
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CollaboratorError {
    /// Whether this error is a duplicate-key outcome.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Reason text suitable for surfacing to an end user.
    pub fn reason(&self) -> String {
        match self {
            Self::Rejected(reason) | Self::NotFound(reason) => reason.clone(),
            _ => "the service is temporarily unavailable".to_string(),
        }
    }
}

/// Result type alias for collaborator operations
pub type Result<T> = std::result::Result<T, CollaboratorError>;
