//! Error types for dirmeta
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for dirmeta operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for dirmeta
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("metafile not found: {0}")]
    MetafileNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Document errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a deserialization error
    pub fn deserialization(msg: impl Into<String>) -> Self {
        Self::Deserialization(msg.into())
    }

    /// Check if this is a not found error
    ///
    /// A missing sidecar is the normal state of a directory that never
    /// had metadata, so loaders treat it as an empty document.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::MetafileNotFound(_) => true,
            Self::DiskIo(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if the error means the stored document could not be parsed
    #[must_use]
    pub fn is_corrupt_document(&self) -> bool {
        matches!(self, Self::Deserialization(_))
    }
}
