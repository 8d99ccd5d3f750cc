//! Error types for yc-watchdog.

use thiserror::Error;
use yc_control::Version;

/// Watchdog error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Control-plane CLI is older than required.
    #[error("yc version {found} is not supported (require >= {required})")]
    Version { found: Version, required: Version },

    /// Host dependency missing and could not be installed.
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// Control-plane tool setup failed. The caller may retry.
    #[error("Setup failed: {0}")]
    Setup(String),

    /// Control-plane CLI error.
    #[error("yc error: {0}")]
    Control(#[from] yc_control::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a bootstrap attempt failing with this error is worth repeating.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Setup(_))
    }
}

/// Result type alias for yc-watchdog.
pub type Result<T, E = Error> = std::result::Result<T, E>;
