//! Ingest role: reads commands off ready connections, validates them and
//! queues them by priority.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use super::request::{effective_timeout, Outgoing, QueuedRequest};
use super::{bump, Shared};
use crate::batch::{BatchHandle, BatchKey};
use crate::command::{Command, IncomingCommand, OpKind};
use crate::connection::Connection;
use crate::error::{BatchError, SourceError};
use crate::memory::PooledValue;
use crate::status::{Response, Status, StatusCode};
use crate::time;

/// An entry on the ready queue.
pub(crate) enum Ready {
    Conn(u64),
    /// Tells one ingest worker to exit.
    PoisonPill,
}

/// Unbounded queue of connections with input waiting.
pub(crate) struct ReadyQueue {
    tx: Sender<Ready>,
    rx: Receiver<Ready>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, item: Ready) {
        // the receiver lives as long as self, so the channel stays open
        let _ = self.tx.send(item);
    }

    pub fn pop(&self) -> Ready {
        self.rx.recv().unwrap_or(Ready::PoisonPill)
    }
}

/// Ingest worker loop.
pub(crate) fn run(shared: Arc<Shared>) {
    loop {
        match shared.ready.pop() {
            Ready::PoisonPill => break,
            Ready::Conn(id) => {
                if let Some(conn) = shared.conns.get(id) {
                    ingest_ready(&shared, &conn);
                }
            }
        }
    }
    debug!("ingest worker exiting");
}

/// What the caller should do after one command was handled.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    /// Done with this connection for now.
    Yield,
    /// Inside a batch; keep reading from the same connection.
    Continue,
}

/// Reads one command from `conn`, or a whole run of batch commands.
fn ingest_ready(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    // one reader per connection keeps queue order equal to arrival order
    let _guard = conn.lock_ingest();
    loop {
        if !conn.is_live() || shared.is_shutting_down() {
            return;
        }
        let incoming = match conn.source().read_next_command() {
            Ok(Some(incoming)) => incoming,
            Ok(None) => return,
            Err(SourceError::Closed) => {
                shared.close_connection(conn.id(), "");
                return;
            }
            Err(SourceError::Malformed(msg)) => {
                debug!(conn_id = conn.id(), %msg, "malformed command");
                bump(&shared.stats.commands_rejected);
                let status = Status::new(StatusCode::InvalidRequest, msg);
                let out = Outgoing::immediate(Arc::clone(conn), Response::unsolicited(status), OpKind::Noop);
                shared.respond(out, true);
                return;
            }
        };
        if ingest_one(shared, conn, incoming) == Next::Yield {
            return;
        }
    }
}

fn ingest_one(shared: &Arc<Shared>, conn: &Arc<Connection>, incoming: IncomingCommand) -> Next {
    let value_len = incoming.value_len();
    let IncomingCommand { mut command, value } = incoming;

    if let Err(status) = admit(shared, conn, &command, value_len) {
        debug!(conn_id = conn.id(), seq = command.sequence, status = %status, "command rejected");
        bump(&shared.stats.commands_rejected);
        let out = Outgoing::immediate(
            Arc::clone(conn),
            Response::ack(command.sequence, status),
            command.op,
        );
        shared.respond(out, true);
        return Next::Yield;
    }
    conn.mark_established();

    if command.is_batch_command() {
        return match ingest_batch(shared, conn, &mut command, value) {
            Ok(request) => {
                let next = if matches!(command.op, OpKind::EndBatch | OpKind::AbortBatch) {
                    Next::Yield
                } else {
                    Next::Continue
                };
                enqueue(shared, request);
                next
            }
            Err(status) => {
                warn!(conn_id = conn.id(), seq = command.sequence, status = %status, "batch ingest failed");
                shared.send_and_close(conn, status);
                Next::Yield
            }
        };
    }

    let (value, admission) = match value {
        Some(bytes) => match shared.pool.admit(bytes) {
            Ok(pooled) => (Some(pooled), Status::success()),
            Err(e) => {
                warn!(conn_id = conn.id(), seq = command.sequence, "{e}");
                (None, Status::new(StatusCode::NoSpace, "Drive is full"))
            }
        },
        None => (None, Status::success()),
    };
    let request = QueuedRequest::new(
        Arc::clone(conn),
        command,
        value,
        admission,
        shared.config.default_timeout_ms,
    );
    enqueue(shared, request);
    Next::Yield
}

/// Admission checks, in order. The sequence number is only recorded once
/// it has been accepted.
fn admit(shared: &Shared, conn: &Connection, command: &Command, value_len: usize) -> Result<(), Status> {
    let limits = &shared.config.limits;
    let invalid = |msg: &str| Status::new(StatusCode::InvalidRequest, msg);

    if !conn.advance_sequence(command.sequence) {
        return Err(invalid("Invalid sequence ID"));
    }
    if !shared.collab.lifecycle.permits(command.op) {
        return Err(invalid("Drive does not support this command now"));
    }
    if value_len > limits.max_value_size {
        return Err(invalid("Received value that was too large"));
    }
    if command.op.is_write() && command.synchronization.is_none() {
        return Err(invalid("Synchronization Field Invalid / Not Provided"));
    }
    if command.key.len() > limits.max_key_size {
        return Err(invalid("Key too long"));
    }
    let too_long = |v: &Option<bytes::Bytes>| v.as_ref().is_some_and(|v| v.len() > limits.max_version_size);
    if too_long(&command.db_version) || too_long(&command.new_version) {
        return Err(invalid("Version too long"));
    }
    Ok(())
}

/// Resolves the batch a batch command belongs to and builds its request.
fn ingest_batch(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    command: &mut Command,
    value: Option<bytes::Bytes>,
) -> Result<QueuedRequest, Status> {
    let batch_id = command.batch_id.ok_or_else(|| BatchError::NotFound.status())?;
    let key = BatchKey::new(conn.id(), batch_id);

    let txn: BatchHandle = if command.op == OpKind::StartBatch {
        let weak = Arc::downgrade(shared);
        let txn = shared
            .batches
            .create(conn.id(), command, shared.config.default_timeout_ms, move |event| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_batch_timeout(event);
                }
            })
            .map_err(|e| e.status())?;
        txn.inherit_into(command);
        let remaining = time::remaining_ms(txn.deadline_ms(), time::now_ms()).max(1) as u64;
        shared.timer.arm(remaining.min(shared.config.retain_ceiling_ms));
        txn
    } else {
        shared.batches.inherit(&key, command).map_err(|e| e.status())?
    };

    let pooled: Option<PooledValue> = match value {
        Some(bytes) => Some(shared.pool.admit(bytes).map_err(|e| {
            warn!(conn_id = conn.id(), batch_id, "{e}");
            Status::new(StatusCode::InternalError, "Cannot allocate memory for batched command")
        })?),
        None => None,
    };

    if command.is_batch_member() {
        txn.note_ingested();
    }

    let timeout = effective_timeout(command.timeout_ms, shared.config.default_timeout_ms);
    debug!(
        conn_id = conn.id(),
        batch_id,
        seq = command.sequence,
        op = %command.op,
        timeout,
        "batch command ingested"
    );
    let request = QueuedRequest::new(
        Arc::clone(conn),
        command.clone(),
        pooled,
        Status::success(),
        shared.config.default_timeout_ms,
    );
    Ok(request.with_batch(txn))
}

fn enqueue(shared: &Shared, request: QueuedRequest) {
    let conn = Arc::clone(&request.conn);
    conn.begin_command();
    bump(&shared.stats.commands_ingested);
    if shared.queue.enqueue(request).is_err() {
        debug!(conn_id = conn.id(), "queue closed, command dropped");
        conn.finish_command();
    }
}
