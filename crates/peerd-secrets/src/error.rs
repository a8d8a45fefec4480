use std::path::PathBuf;

use thiserror::Error;

/// Errors from parsing or resolving a secret reference
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Invalid secret reference '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// Backend compiled out
    #[error("Secret backend '{backend}' not available (feature not enabled)")]
    BackendDisabled { backend: &'static str },

    #[error("Failed to read secret file '{}': {message}", path.display())]
    FileError { path: PathBuf, message: String },

    #[error("Environment variable '{var}' not set")]
    EnvNotSet { var: String },

    #[error("Failed to decode base64 secret: {0}")]
    Decode(String),

    /// Resolved, but nothing left after trimming
    #[error("Secret from {backend} is empty")]
    Empty { backend: &'static str },
}

impl SecretError {
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub fn disabled(backend: &'static str) -> Self {
        Self::BackendDisabled { backend }
    }
}
