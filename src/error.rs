//! Error types for cryptsync

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cryptsync
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Invalid index entry '{name}': {reason}")]
    InvalidEntry { name: String, reason: String },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    // Crypto / format errors
    #[error("Undecryptable data: {0}")]
    Undecryptable(String),

    // Filesystem errors
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // Task pipeline errors
    #[error("Task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error("Task {0} panicked")]
    TaskPanicked(String),

    #[error("Task queue is already being drained")]
    DrainInProgress,

    // Notification source errors
    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means stored data could not be decrypted or parsed
    pub fn is_undecryptable(&self) -> bool {
        matches!(self, Error::Undecryptable(_) | Error::Deserialization(_))
    }

    /// Whether this error is a contract violation by the caller
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::KeyDerivation(_)
                | Error::InvalidEntry { .. }
                | Error::InvalidTask(_)
                | Error::InvalidConfig(_)
        )
    }

    /// Convert a stream read failure into the crypto taxonomy.
    ///
    /// Cipher streams signal bad padding and truncated blocks with
    /// `InvalidData`; everything else is a plain I/O failure.
    pub fn from_stream(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            Error::Undecryptable(e.to_string())
        } else {
            Error::Io(e)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::Serialization(e.to_string())
        } else {
            Error::Deserialization(e.to_string())
        }
    }
}
