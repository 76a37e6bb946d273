//! Common error types for vaultdrive.

use std::fmt;

use thiserror::Error;

/// One document that could not be persisted during a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistFailure {
    /// Virtual path of the document.
    pub path: String,
    /// Human readable cause.
    pub reason: String,
}

impl fmt::Display for PersistFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// Top-level error type for vaultdrive operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// A single encrypted document could not be decoded.
    #[error("Failed to decrypt {path}: {reason}")]
    Decrypt { path: String, reason: String },

    /// A single document could not be encoded.
    #[error("Failed to encrypt {path}: {reason}")]
    Encrypt { path: String, reason: String },

    /// Lock attempted every document but some could not be persisted.
    #[error("Lock failed for {} document(s): {}", failures.len(), join_failures(failures))]
    LockFailed { failures: Vec<PersistFailure> },

    /// Vault operation failed.
    #[error("Vault error: {0}")]
    Vault(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Mount or unmount failed.
    #[error("Mount error: {0}")]
    Mount(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

fn join_failures(failures: &[PersistFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
