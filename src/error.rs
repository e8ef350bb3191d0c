//! Error types for media-dl
//!
//! Every failure inside a download attempt is expressed as an [`Error`]. The task
//! downloader does not distinguish retryable from fatal variants: any error fails the
//! attempt and a persistently broken source simply exhausts its retry budget.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for media-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download.concurrent")
        key: Option<String>,
    },

    /// The resolver could not turn a task into a resource locator
    #[error("failed to resolve {source_key} `{url}`: {reason}")]
    Resolution {
        /// Source key the task was submitted with
        source_key: String,
        /// Seed url handed to the resolver
        url: String,
        /// Why resolution failed
        reason: String,
    },

    /// Transport-level HTTP failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Requested url
        url: String,
    },

    /// A download attempt exceeded its time budget
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Manifest is malformed, empty, or has no usable variant
    #[error("manifest error: {0}")]
    ManifestParse(String),

    /// Locator type is neither mp4 nor m3u8 and could not be inferred
    #[error("unknown media format for `{url}`")]
    UnknownFormat {
        /// The resolved url whose format could not be determined
        url: String,
    },

    /// The remux tool exited unsuccessfully
    #[error("remux failed: {0}")]
    Remux(String),

    /// A fragment could not be fingerprinted at a position where that is not tolerated
    #[error("fingerprint error: {0}")]
    FingerprintParse(String),

    /// The per-attempt scratch area could not be created or used
    #[error("scratch space error at {path}: {reason}")]
    ScratchSpace {
        /// Scratch root or file involved
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// External tool could not be executed (missing binary, spawn failure)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Work was submitted to a scheduler that is joining or stopped
    #[error("scheduler is closed: cannot submit after join")]
    SchedulerClosed,

    /// The operation was cancelled by a stop request
    #[error("operation cancelled")]
    Cancelled,

    /// A completion callback reported a failure
    #[error("callback failed: {0}")]
    Callback(String),
}

impl Error {
    /// Build a [`Error::Config`] for a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Build a [`Error::ScratchSpace`] from an I/O failure at `path`
    pub fn scratch(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::ScratchSpace {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Whether this error came from a stop request rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
