//! Error types for ArborDB.

use thiserror::Error;

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in ArborDB operations.
#[derive(Debug, Error)]
pub enum ArborError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("degree must be at least 2, got {degree}")]
    InvalidDegree { degree: usize },

    // Storage errors
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    // Unimplemented operations
    #[error("not implemented: {0}")]
    Unsupported(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}
