//! Error types for Tabvault
//!
//! Per-table and per-file errors are captured into run results by the
//! orchestrator; only [`VaultError::Configuration`] aborts a whole run.

use thiserror::Error;

/// Result type alias for Tabvault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Main error type for Tabvault
#[derive(Error, Debug)]
pub enum VaultError {
    /// A call to a remote service failed. Retried only for idempotent
    /// operations (batch writes and deletes).
    #[error("Remote call {operation} failed: {message}")]
    RemoteCall { operation: String, message: String },

    /// Missing table, export, manifest or object.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No data files located under an export prefix after every layout
    /// strategy was tried.
    #[error("No data files found under {prefix} (sample listing: {sample:?})")]
    DiscoveryExhausted { prefix: String, sample: Vec<String> },

    /// Data files were found but cannot be handed to a bulk import as one
    /// key prefix with one compression type.
    #[error("Unsupported export layout: {0}")]
    UnsupportedLayout(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A bounded-deadline poll stopped waiting on a remote job. Reported
    /// alongside the job's last known status, never as a failure.
    #[error("Timed out after {waited_secs}s waiting for {handle}")]
    Timeout { handle: String, waited_secs: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    /// Build a [`VaultError::RemoteCall`] from an operation name and any
    /// displayable error.
    pub fn remote(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        VaultError::RemoteCall {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::NotFound(_))
    }
}
