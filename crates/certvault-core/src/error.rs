//! Error types for the core library.

use thiserror::Error;

/// Errors that can occur in archival and read-path operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IMAP operation failed.
    #[error("IMAP error: {0}")]
    Imap(#[from] certvault_imap::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Storage layout or write failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Archive creation or reading failure.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Sealed archive bytes no longer match their digest.
    ///
    /// Non-retriable: the archive must be excluded from read-path use
    /// until regenerated.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest recorded at sealing time.
        expected: String,
        /// Digest recomputed from the archive bytes.
        actual: String,
    },

    /// On-demand extraction from a sealed archive failed.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Configuration object is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
