//! Units of work passed between the pipeline roles.

use std::sync::Arc;

use crate::batch::BatchHandle;
use crate::command::{Command, OpKind};
use crate::connection::Connection;
use crate::latency::Timings;
use crate::memory::PooledValue;
use crate::priority::Priority;
use crate::queue::Scheduled;
use crate::status::{Response, Status};
use crate::time;

/// One admitted command waiting in the priority queue.
pub(crate) struct QueuedRequest {
    pub conn: Arc<Connection>,
    pub command: Command,
    pub value: Option<PooledValue>,
    /// Set at ingest when the value couldn't be admitted.
    pub admission: Status,
    pub deadline_ms: u64,
    pub timings: Timings,
    /// The open batch, for batch commands.
    pub batch: Option<BatchHandle>,
}

impl QueuedRequest {
    pub fn new(
        conn: Arc<Connection>,
        command: Command,
        value: Option<PooledValue>,
        admission: Status,
        default_timeout_ms: u64,
    ) -> Self {
        let timings = Timings::starting_now();
        let timeout = effective_timeout(command.timeout_ms, default_timeout_ms);
        Self {
            conn,
            deadline_ms: timings.enqueued_ms.saturating_add(timeout),
            command,
            value,
            admission,
            timings,
            batch: None,
        }
    }

    pub fn with_batch(mut self, batch: BatchHandle) -> Self {
        self.batch = Some(batch);
        self
    }
}

impl Scheduled for QueuedRequest {
    fn priority(&self) -> Priority {
        self.command.priority
    }

    fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    fn enqueued_ms(&self) -> u64 {
        self.timings.enqueued_ms
    }
}

/// A response on its way to the response role.
pub(crate) struct Outgoing {
    pub conn: Arc<Connection>,
    pub response: Response,
    pub op: OpKind,
    pub timings: Timings,
    /// Counts against the connection's in-flight commands.
    pub in_flight: bool,
    /// Close the connection once this response has been sent.
    pub close_after: bool,
}

impl Outgoing {
    pub fn reply(conn: Arc<Connection>, response: Response, op: OpKind, timings: Timings) -> Self {
        Self {
            conn,
            response,
            op,
            timings,
            in_flight: true,
            close_after: false,
        }
    }

    /// A response to something that never entered the queue.
    pub fn immediate(conn: Arc<Connection>, response: Response, op: OpKind) -> Self {
        let now = time::now_ms();
        Self {
            conn,
            response,
            op,
            timings: Timings {
                enqueued_ms: now,
                dequeued_ms: now,
                processed_ms: now,
                responded_ms: 0,
            },
            in_flight: false,
            close_after: false,
        }
    }

    pub fn closing(mut self) -> Self {
        self.close_after = true;
        self
    }
}

/// Client timeout, or the default when the client sent zero. Capped at
/// [`time::MAX_TIMEOUT_MS`].
pub(crate) fn effective_timeout(timeout_ms: u64, default_timeout_ms: u64) -> u64 {
    let timeout_ms = if timeout_ms == 0 {
        default_timeout_ms
    } else {
        timeout_ms
    };
    timeout_ms.min(time::MAX_TIMEOUT_MS)
}
