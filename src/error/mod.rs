//! Error types for Flowline
//!
//! This module defines the main error type used throughout the commit log
//! and a structured storage error domain for operation-level failures.

use thiserror::Error;

mod domain;

pub use domain::StorageError;

/// Result type alias for Flowline operations
pub type Result<T> = std::result::Result<T, FlowlineError>;

/// Main error type for Flowline
#[derive(Error, Debug)]
pub enum FlowlineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage error: {0}")]
    StorageDomain(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid offset: {0}")]
    InvalidOffset(i64),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowlineError {
    /// Create a storage error from an operation name and detail
    pub fn storage_op(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::StorageDomain(StorageError::operation(operation, detail))
    }

    /// Create a storage error from a plain message
    pub fn storage_msg(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}
