//! Domain-specific error types for Flowline

use thiserror::Error;

/// Structured storage error domain
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
    #[error("segment {offset}: {operation}: {detail}")]
    Segment {
        offset: i64,
        operation: String,
        detail: String,
    },
    #[error("{0}")]
    Message(String),
}

impl StorageError {
    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn segment(
        offset: i64,
        operation: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Segment {
            offset,
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

impl From<String> for StorageError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for StorageError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}
