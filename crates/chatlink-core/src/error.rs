//! Error types for the core crate

use chatlink_traits::CollaboratorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatlinkError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, ChatlinkError>;
