//! Common error types for ess2bids

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for ess2bids operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared by the converter and the finalizer
#[derive(Error, Debug)]
pub enum Error {
    /// Study description could not be decoded (malformed XML, bad encoding)
    #[error("Unable to decode study description {path}: {reason}")]
    SourceDecode { path: PathBuf, reason: String },

    /// A file the layout cannot do without is absent
    #[error("Missing required file: {0}")]
    MissingRequiredFile(PathBuf),

    /// A JSON or TSV sidecar exists but cannot be parsed
    #[error("Corrupt sidecar {path}: {reason}")]
    CorruptSidecar { path: PathBuf, reason: String },

    /// An external collaborator (electrode extractor, validator) failed
    #[error("External tool error: {0}")]
    ExternalTool(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No field declared at exactly the requested scope
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Invalid caller input (bad scope, bad identifier)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Requested entity not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Build a `CorruptSidecar` error for `path`
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::CorruptSidecar {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
