//! Error types for the scheduling core.

use thiserror::Error;

use crate::status::{Status, StatusCode};

/// Errors returned by the deadline-priority queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has been shut down and no longer accepts work.
    #[error("queue closed")]
    Closed,
}

/// Errors returned by the value pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("value pool exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },
}

/// Errors returned by batch registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Batch ID was in use")]
    InUse,

    #[error("Batch command without a batch")]
    NotFound,

    #[error("Exceed maximum allowable number of batches")]
    TooMany,

    #[error("Exceed maximum allowable batch's size")]
    TooLarge,

    #[error("Exceed maximum allowable number of deletes")]
    TooManyDeletes,

    #[error("Number of batched commands mismatched")]
    CountMismatch { declared: u32, received: usize },

    /// A member failed commit validation.
    #[error("batch member {failed_sequence} failed validation: {status}")]
    Validation { failed_sequence: u64, status: Status },

    /// The batch already committed, aborted or expired.
    #[error("batch already complete")]
    AlreadyComplete,
}

impl BatchError {
    /// The status reported to the client for this failure.
    pub fn status(&self) -> Status {
        match self {
            BatchError::Validation { status, .. } => status.clone(),
            BatchError::CountMismatch { .. } => Status::new(
                StatusCode::InvalidBatch,
                "Number of batched commands mismatched",
            ),
            other => Status::new(StatusCode::InvalidBatch, other.to_string()),
        }
    }

    /// Sequence of the first failing member, for validation failures.
    pub fn failed_sequence(&self) -> Option<u64> {
        match self {
            BatchError::Validation {
                failed_sequence, ..
            } => Some(*failed_sequence),
            _ => None,
        }
    }
}

/// Errors raised while starting or running the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline is shut down")]
    ShutDown,
}

/// Errors a command source may report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// A frame could not be turned into a command.
    #[error("malformed command: {0}")]
    Malformed(String),
}

/// Errors a response sink may report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("connection closed")]
    Closed,
}
