//! WolfRegistry Error Types

use thiserror::Error;

/// Result type alias for WolfRegistry operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfRegistry error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Distro transport errors
    #[error("Distro transport to {target} failed: {reason}")]
    Transport { target: String, reason: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // Cluster client errors
    #[error("Cluster client not initialized: {0}")]
    ClientNotInitialized(String),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a transport fault for `target`
    pub fn transport(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Transport {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Transport { .. }
                | Error::Network(_)
                | Error::Http(_)
        )
    }
}
