//! # Error Handling
//!
//! Error types for the breakwater control plane, defined with `thiserror`.
//! Compilation problems with individual source objects are *not* errors:
//! they become per-object statuses (`dag::ObjectStatus`) and never abort a
//! compile pass. The variants here cover process-level failures only.

/// Custom result type for breakwater operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the breakwater control plane
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Network transport errors (gRPC)
    #[error("transport error: {0}")]
    Transport(String),

    /// Resource serialization errors
    #[error("encoding error: {0}")]
    Encode(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new encoding error
    pub fn encode<S: Into<String>>(message: S) -> Self {
        Self::Encode(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }
}
