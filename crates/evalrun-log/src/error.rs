//! Error types for evalrun-log

use thiserror::Error;

use crate::model::SampleId;

/// Errors that can occur in the log storage layer
#[derive(Error, Debug)]
pub enum LogError {
    /// Location does not exist
    #[error("log not found: {location}")]
    NotFound { location: String },

    /// Requested (id, epoch) pair is not present in the log
    #[error("sample {id} (epoch {epoch}) not found in log {location}")]
    SampleNotFound {
        id: SampleId,
        epoch: u32,
        location: String,
    },

    /// Log file is structurally invalid
    #[error("invalid log {location}: {reason}")]
    InvalidLog { location: String, reason: String },

    /// Unknown format name or extension
    #[error("unsupported log format: {0}")]
    UnsupportedFormat(String),

    /// Write was attempted against a log that was never initialised
    #[error("log is not open for writing: {0}")]
    NotOpen(String),

    /// A log is already open at this location
    #[error("log is already open: {0}")]
    AlreadyOpen(String),

    /// `read_eval_log_samples` preconditions
    #[error("cannot stream samples from {location}: {reason}")]
    SamplesUnavailable { location: String, reason: String },

    /// Attachment reference without stored content
    #[error("attachment not found: {0}")]
    AttachmentNotFound(String),

    /// Blocking worker was cancelled or panicked
    #[error("storage task failed: {0}")]
    Task(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for log storage operations
pub type LogResult<T> = std::result::Result<T, LogError>;

impl From<tokio::task::JoinError> for LogError {
    fn from(err: tokio::task::JoinError) -> Self {
        LogError::Task(err.to_string())
    }
}

impl LogError {
    /// True for errors that mean "the thing asked for is absent".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LogError::NotFound { .. }
                | LogError::SampleNotFound { .. }
                | LogError::AttachmentNotFound(_)
        )
    }
}
