//! Error types for posthog-agent

use thiserror::Error;

/// Main error type for the posthog-agent library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("storage error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/API error
    #[error("transport error: {0}")]
    Transport(String),

    /// Image decode or encode error
    #[error("image encoding error: {0}")]
    Encoding(#[from] image::ImageError),
}

/// Result type alias for posthog-agent
pub type Result<T> = std::result::Result<T, Error>;
