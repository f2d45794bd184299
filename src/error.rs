//! Error types for the Edgeguard service.
//!
//! Per-request outcomes (unknown key, blocked address, quota exhaustion) are
//! not errors; they are reported through [`crate::gateway::Decision`]. The
//! variants here cover configuration, rule sources, usage storage and I/O.

use thiserror::Error;

/// Main error type for Edgeguard operations.
#[derive(Error, Debug)]
pub enum EdgeguardError {
    /// A rule source could not be read or parsed into a usable registry.
    #[error("Configuration error in {origin}: {message}")]
    Config {
        /// The source that failed (file path or logical name)
        origin: String,
        /// What went wrong
        message: String,
    },

    /// A signed artifact failed verification or a required signature is missing.
    #[error("Signature error in {origin}: {message}")]
    Signature {
        /// The artifact that failed verification
        origin: String,
        /// What went wrong
        message: String,
    },

    /// Process settings could not be assembled from file and environment.
    #[error("Settings error: {0}")]
    Settings(#[from] ::config::ConfigError),

    /// The usage store could not complete an operation.
    #[error("Quota store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EdgeguardError {
    /// Build a [`EdgeguardError::Config`] for the given source.
    pub fn config(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// Build a [`EdgeguardError::Signature`] for the given artifact.
    pub fn signature(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Signature {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// Whether this error signals tampering rather than a malformed source.
    pub fn is_signature(&self) -> bool {
        matches!(self, Self::Signature { .. })
    }
}

/// Result type alias for Edgeguard operations.
pub type Result<T> = std::result::Result<T, EdgeguardError>;
