//! Error types for the engine.

use crate::id::StreamId;
use thiserror::Error;

/// Boxed error returned by application handlers and commands.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Write conflict on {stream}: expected position {position}")]
    WriteConflict { stream: StreamId, position: i64 },

    #[error("Record {stream}@{number} already has a group number")]
    AssignmentConflict { stream: StreamId, number: i64 },

    #[error("Invalid sequence on {stream}: got {got}, expected {expected}")]
    InvalidSequence {
        stream: StreamId,
        got: i64,
        expected: i64,
    },

    #[error("Record not found: {stream}@{number}")]
    RecordNotFound { stream: StreamId, number: i64 },

    #[error("Handler error: {0}")]
    Handler(#[source] BoxError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Type not registered: {0}")]
    UnregisteredType(String),

    #[error("Unknown content type: {0}")]
    UnknownContentType(String),

    #[error("Invalid stream id: {0:?}")]
    InvalidStreamId(String),

    #[error("Invalid message id: {0:?}")]
    InvalidMessageId(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl Error {
    /// Wrap an application handler failure.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Error::Handler(err.into())
    }

    /// True for optimistic-concurrency failures, the only retryable kind.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Error::WriteConflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Serialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
