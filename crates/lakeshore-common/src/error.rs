//! Error types shared across Lakeshore crates

use thiserror::Error;

/// Result type alias for Lakeshore operations
pub type Result<T> = std::result::Result<T, LakeError>;

/// Main error type for the shared layer
#[derive(Error, Debug)]
pub enum LakeError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),
}
