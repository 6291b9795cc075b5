//! Commands as yielded by a command source.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::priority::Priority;

/// The operation a command asks the drive to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OpKind {
    Get,
    GetVersion,
    GetNext,
    GetPrevious,
    Put,
    Delete,
    Flush,
    #[default]
    Noop,
    StartBatch,
    EndBatch,
    AbortBatch,
}

impl OpKind {
    /// START_BATCH, END_BATCH and ABORT_BATCH.
    pub fn is_batch_control(self) -> bool {
        matches!(
            self,
            OpKind::StartBatch | OpKind::EndBatch | OpKind::AbortBatch
        )
    }

    /// Operations that may be grouped into a batch.
    pub fn is_batchable(self) -> bool {
        matches!(self, OpKind::Put | OpKind::Delete)
    }

    /// Operations that modify stored data.
    pub fn is_write(self) -> bool {
        matches!(self, OpKind::Put | OpKind::Delete)
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Get => "get",
            OpKind::GetVersion => "getversion",
            OpKind::GetNext => "getnext",
            OpKind::GetPrevious => "getprevious",
            OpKind::Put => "put",
            OpKind::Delete => "delete",
            OpKind::Flush => "flush",
            OpKind::Noop => "noop",
            OpKind::StartBatch => "startbatch",
            OpKind::EndBatch => "endbatch",
            OpKind::AbortBatch => "abortbatch",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Durability a write asks for before it is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Synchronization {
    /// Acknowledge once persisted. Responses are retained until a flush.
    WriteThrough,
    /// Acknowledge immediately; persistence happens later.
    WriteBack,
    /// Persist this and every earlier write before acknowledging.
    Flush,
}

impl FromStr for Synchronization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "writethrough" => Ok(Synchronization::WriteThrough),
            "writeback" => Ok(Synchronization::WriteBack),
            "flush" => Ok(Synchronization::Flush),
            _ => Err(format!("unknown synchronization '{s}'")),
        }
    }
}

/// One decoded client command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub op: OpKind,
    /// Per-connection sequence number, strictly increasing.
    pub sequence: u64,
    pub priority: Priority,
    /// Client timeout in milliseconds; zero selects the server default.
    pub timeout_ms: u64,
    pub batch_id: Option<u32>,
    pub cluster_version: i64,
    pub user_id: i64,
    pub key: Bytes,
    /// Version the client expects the stored entry to have.
    pub db_version: Option<Bytes>,
    /// Version to store alongside a put.
    pub new_version: Option<Bytes>,
    /// Skip the version check.
    pub force: bool,
    pub synchronization: Option<Synchronization>,
    /// Declared number of members, carried by END_BATCH.
    pub batch_count: u32,
}

impl Command {
    pub fn new(op: OpKind, sequence: u64) -> Self {
        Self {
            op,
            sequence,
            ..Self::default()
        }
    }

    /// True for batch-control commands and for batch members.
    pub fn is_batch_command(&self) -> bool {
        self.op.is_batch_control() || self.is_batch_member()
    }

    /// A put or delete that belongs to a batch.
    pub fn is_batch_member(&self) -> bool {
        self.op.is_batchable() && self.batch_id.is_some()
    }

    /// Whether a successful response to this command is held until a flush.
    pub fn wants_retain(&self) -> bool {
        match self.op {
            OpKind::EndBatch => true,
            OpKind::Put | OpKind::Delete => {
                self.batch_id.is_none()
                    && self.synchronization == Some(Synchronization::WriteThrough)
            }
            _ => false,
        }
    }

    /// Whether this command asks for everything to be persisted.
    pub fn wants_flush(&self) -> bool {
        self.op == OpKind::Flush || self.synchronization == Some(Synchronization::Flush)
    }
}

/// A command together with the value payload it carried, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCommand {
    pub command: Command,
    pub value: Option<Bytes>,
}

impl IncomingCommand {
    pub fn new(command: Command, value: Option<Bytes>) -> Self {
        Self { command, value }
    }

    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, Bytes::len)
    }
}
