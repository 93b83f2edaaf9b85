//! Error types for `ScoreGen` core library.

use thiserror::Error;

/// Result type alias using `ScoreGen` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `ScoreGen` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Request line could not be built
    #[error("Invalid request: {0}")]
    Protocol(String),

    /// Completion frame could not be parsed
    #[error("Failed to parse frame: {0}")]
    FrameParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
