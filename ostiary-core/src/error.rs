//! Error types for Ostiary operations
//!
//! Governed failures (denials, violations, workflow failures) travel as
//! [`ToolError`] values inside result envelopes. [`OstiaryError`] covers the
//! operational layer around them: configuration, storage, serialization and
//! the one fatal condition, an audit chain that cannot be persisted.

use crate::store::StoreError;
use crate::tools::{ErrorCode, RegistryError, ToolError};

/// Result type for Ostiary operations
pub type Result<T> = std::result::Result<T, OstiaryError>;

/// Error types for the Ostiary framework
#[derive(Debug, thiserror::Error)]
pub enum OstiaryError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Durable store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The audit chain could not be appended to its required persistence.
    ///
    /// This is the only process-level failure of the pipeline and must be
    /// surfaced to the operator.
    #[error("Audit persistence failure: {0}")]
    AuditPersistence(String),

    /// A persisted audit chain failed verification when it was opened
    #[error("Audit chain corrupted at index {index}")]
    AuditCorrupted {
        /// First index whose hash or linkage does not verify
        index: u64,
    },

    /// A governed failure escalated outside of an envelope
    #[error(transparent)]
    Governance(#[from] ToolError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML manifest error
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl OstiaryError {
    /// Error code used for response and exit code mapping.
    ///
    /// Operational errors that are not part of the governance taxonomy map to
    /// [`ErrorCode::Internal`].
    pub fn code(&self) -> ErrorCode {
        match self {
            OstiaryError::Governance(error) => error.code,
            _ => ErrorCode::Internal,
        }
    }
}

impl From<String> for OstiaryError {
    fn from(s: String) -> Self {
        OstiaryError::Other(s)
    }
}

impl From<&str> for OstiaryError {
    fn from(s: &str) -> Self {
        OstiaryError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for OstiaryError {
    fn from(err: anyhow::Error) -> Self {
        OstiaryError::Other(err.to_string())
    }
}

impl From<RegistryError> for OstiaryError {
    fn from(err: RegistryError) -> Self {
        OstiaryError::Governance(err.into())
    }
}

impl From<figment::Error> for OstiaryError {
    fn from(err: figment::Error) -> Self {
        OstiaryError::Configuration(err.to_string())
    }
}
