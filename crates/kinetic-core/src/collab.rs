//! Interfaces to the collaborators the core schedules work for.
//!
//! The core never parses wire bytes, touches storage or decides who may do
//! what. It reaches those concerns only through the traits below, which
//! the server (or a test) implements.

use bytes::Bytes;

use crate::batch::AtomicWrite;
use crate::command::{Command, IncomingCommand, OpKind};
use crate::error::{SinkError, SourceError};
use crate::memory::PooledValue;
use crate::status::{Response, Status};

/// Yields decoded commands from one connection.
pub trait CommandSource: Send + Sync {
    /// Returns the next complete command, or `Ok(None)` when none is
    /// buffered right now. Must not block.
    fn read_next_command(&self) -> Result<Option<IncomingCommand>, SourceError>;
}

impl<T: CommandSource + ?Sized> CommandSource for std::sync::Arc<T> {
    fn read_next_command(&self) -> Result<Option<IncomingCommand>, SourceError> {
        (**self).read_next_command()
    }
}

/// Carries responses back to one connection.
pub trait ResponseSink: Send + Sync {
    /// Size `response` would occupy on the wire.
    fn encoded_len(&self, response: &Response) -> usize {
        response.estimated_len()
    }

    fn send(&self, response: Response) -> Result<(), SinkError>;

    /// Tears the transport down. Further sends fail.
    fn close(&self);
}

/// What executing a single command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: Status,
    pub value: Option<Bytes>,
    pub db_version: Option<Bytes>,
}

impl Outcome {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            value: None,
            db_version: None,
        }
    }
}

/// Runs one non-batch command against the drive.
pub trait CommandProcessor: Send + Sync {
    fn execute(&self, command: &Command, value: Option<&PooledValue>) -> Outcome;
}

/// Applies writes to persistent storage.
pub trait StorageWrite: Send + Sync {
    /// Applies every operation in `write` as one unit.
    fn apply_atomic(&self, write: AtomicWrite) -> Status;

    /// Persists everything written so far.
    fn flush(&self) -> Status;
}

/// Checks a batch member may be committed.
pub trait Validator: Send + Sync {
    fn validate_cluster_version(&self, cluster_version: i64) -> Result<(), Status>;

    fn authorize(&self, user_id: i64, op: OpKind, key: &[u8]) -> Result<(), Status>;

    fn validate_key(&self, key: &[u8]) -> Result<(), Status>;

    /// Compares `expected` against the stored version of `key`.
    fn validate_version(&self, key: &[u8], expected: Option<&[u8]>) -> Result<(), Status>;
}

/// Whether the drive currently accepts a kind of command.
pub trait DriveLifecycle: Send + Sync {
    fn permits(&self, op: OpKind) -> bool;
}

/// Hooks for metrics. Every method defaults to doing nothing.
pub trait PipelineObserver: Send + Sync {
    fn on_command_complete(&self, _op: OpKind, _status: &Status, _total_us: u64) {}

    fn on_request_expired(&self, _op: OpKind) {}

    fn on_batch_committed(&self, _members: usize) {}

    fn on_batch_aborted(&self) {}

    fn on_batch_expired(&self) {}

    fn on_response_retained(&self) {}

    fn on_connection_closed(&self, _conn_id: u64) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}
