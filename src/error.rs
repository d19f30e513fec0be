//! Error types for echoscribe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscriberError {
    // Capture errors
    #[error("Audio permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Audio device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCaptureFailed { message: String },

    // Recognition errors
    #[error("Recognition engine error: {message}")]
    Engine { message: String },

    #[error("Recognition model not found at {path}")]
    ModelNotFound { path: String },

    // Lifecycle errors
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, TranscriberError>;
