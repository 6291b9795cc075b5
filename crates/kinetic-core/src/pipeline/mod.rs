//! The three-role connection pipeline.
//!
//! ```text
//!   notify_readable ──► ready queue ──► ingest ──► DeadlinePriorityQueue
//!                                                        │
//!                 sink ◄── respond ◄── BoundedResponseQueue ◄── execute
//! ```
//!
//! Each role is a small pool of named OS threads that only talk through
//! the queues. The aging timer runs beside them; when it fires it flushes
//! storage, releases retained write acknowledgements and publishes batch
//! timeouts.
//!
//! All state lives in one [`Shared`] owned by the [`Pipeline`]. Worker
//! threads hold strong references until shutdown joins them; the timer
//! and batch-timeout subscriptions hold weak ones.

mod execute;
mod ingest;
mod request;
mod respond;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::aging::{AgingConfig, AgingTimer, TimerHandler};
use crate::batch::BatchRegistry;
use crate::collab::{
    CommandProcessor, CommandSource, DriveLifecycle, NoopObserver, PipelineObserver,
    ResponseSink, StorageWrite, Validator,
};
use crate::command::OpKind;
use crate::connection::{Connection, ConnectionMap, PROVISIONAL_EXCLUSIVITY_THRESHOLD};
use crate::error::PipelineError;
use crate::events::BatchTimeout;
use crate::latency::{LatencyLog, LatencyLogConfig};
use crate::limits::Limits;
use crate::memory::ValuePool;
use crate::queue::{DeadlinePriorityQueue, QueueConfig};
use crate::response_queue::{BoundedResponseQueue, DEFAULT_RESPONSE_QUEUE_CAPACITY};
use crate::status::{Response, Status, StatusCode};
use crate::time;

use ingest::{Ready, ReadyQueue};
use request::{Outgoing, QueuedRequest};

/// Timeout applied to commands that don't carry one.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 3_600_000;

/// Longest a retained write acknowledgement may wait for a flush.
pub const DEFAULT_RETAIN_CEILING_MS: u64 = 7_000;

pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Tunables for a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ingest_threads: usize,
    pub exec_threads: usize,
    pub respond_threads: usize,
    pub queue: QueueConfig,
    pub response_queue_capacity: usize,
    pub aging: AgingConfig,
    pub limits: Limits,
    pub default_timeout_ms: u64,
    pub retain_ceiling_ms: u64,
    /// Bytes of inbound values that may be held at once.
    pub value_pool_bytes: usize,
    pub max_connections: usize,
    pub provisional_threshold: usize,
    pub latency: LatencyLogConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_threads: 2,
            exec_threads: 4,
            respond_threads: 1,
            queue: QueueConfig::default(),
            response_queue_capacity: DEFAULT_RESPONSE_QUEUE_CAPACITY,
            aging: AgingConfig::default(),
            limits: Limits::default(),
            default_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            retain_ceiling_ms: DEFAULT_RETAIN_CEILING_MS,
            value_pool_bytes: 512 * 1024 * 1024,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            provisional_threshold: PROVISIONAL_EXCLUSIVITY_THRESHOLD,
            latency: LatencyLogConfig::default(),
        }
    }
}

/// The external services the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub processor: Arc<dyn CommandProcessor>,
    pub storage: Arc<dyn StorageWrite>,
    pub validator: Arc<dyn Validator>,
    pub lifecycle: Arc<dyn DriveLifecycle>,
    pub observer: Arc<dyn PipelineObserver>,
}

impl Collaborators {
    /// Uses one value for every collaborator role and no observer.
    pub fn from_drive<D>(drive: Arc<D>) -> Self
    where
        D: CommandProcessor + StorageWrite + Validator + DriveLifecycle + 'static,
    {
        Self {
            processor: drive.clone(),
            storage: drive.clone(),
            validator: drive.clone(),
            lifecycle: drive,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// Running counters. Gauges are read from the owning structures instead.
#[derive(Debug, Default)]
pub(crate) struct PipelineStats {
    commands_ingested: AtomicU64,
    commands_rejected: AtomicU64,
    commands_executed: AtomicU64,
    requests_expired: AtomicU64,
    batches_committed: AtomicU64,
    batches_aborted: AtomicU64,
    batches_expired: AtomicU64,
    responses_sent: AtomicU64,
    responses_oversize: AtomicU64,
    responses_retained: AtomicU64,
    /// Retained responses currently waiting for a flush.
    retained_held: AtomicU64,
    send_failures: AtomicU64,
    flushes: AtomicU64,
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,
    connections_evicted: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time view of pipeline counters and gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub commands_ingested: u64,
    pub commands_rejected: u64,
    pub commands_executed: u64,
    pub requests_expired: u64,
    pub batches_committed: u64,
    pub batches_aborted: u64,
    pub batches_expired: u64,
    pub responses_sent: u64,
    pub responses_oversize: u64,
    pub responses_retained: u64,
    pub send_failures: u64,
    pub flushes: u64,
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub connections_evicted: u64,
    pub queue_depth: usize,
    pub response_queue_depth: usize,
    pub open_batches: usize,
    pub connections: usize,
    pub pool_used_bytes: usize,
    pub pending_responses: usize,
}

/// State shared by every role.
pub(crate) struct Shared {
    config: PipelineConfig,
    collab: Collaborators,
    ready: ReadyQueue,
    queue: DeadlinePriorityQueue<QueuedRequest>,
    responses: BoundedResponseQueue<Outgoing>,
    batches: BatchRegistry,
    timer: AgingTimer,
    pool: ValuePool,
    conns: ConnectionMap,
    latency: LatencyLog,
    stats: PipelineStats,
    shutting_down: AtomicBool,
}

impl Shared {
    fn new(config: PipelineConfig, collab: Collaborators) -> Self {
        Self {
            ready: ReadyQueue::new(),
            queue: DeadlinePriorityQueue::new(config.queue.clone()),
            responses: BoundedResponseQueue::new(config.response_queue_capacity),
            batches: BatchRegistry::new(config.limits.clone()),
            timer: AgingTimer::new(config.aging.clone()),
            pool: ValuePool::new(config.value_pool_bytes),
            conns: ConnectionMap::new(),
            latency: LatencyLog::new(config.latency),
            stats: PipelineStats::default(),
            shutting_down: AtomicBool::new(false),
            config,
            collab,
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Queues a response for delivery.
    ///
    /// Normal replies take the conditional path and feel backpressure.
    /// `must_deliver` bypasses capacity for statuses that can't be lost.
    fn respond(&self, out: Outgoing, must_deliver: bool) {
        let conn = out.conn.clone();
        let in_flight = out.in_flight;
        if !self.responses.enqueue(out, !must_deliver) {
            debug!(conn_id = conn.id(), "response dropped during shutdown");
            if in_flight {
                conn.finish_command();
            }
        }
    }

    /// Pushes an unsolicited status and closes the connection after it
    /// has been sent.
    fn send_and_close(&self, conn: &Arc<Connection>, status: Status) {
        conn.mark_should_close();
        let out = Outgoing::immediate(Arc::clone(conn), Response::unsolicited(status), OpKind::Noop)
            .closing();
        self.respond(out, true);
    }

    /// Tears a connection down: drops retained responses and open batches
    /// and removes it from the map. Returns false if it was already gone.
    fn close_connection(&self, conn_id: u64, reason: &str) -> bool {
        let Some(conn) = self.conns.remove(conn_id) else {
            return false;
        };
        self.forget_retained(conn.take_pending().len());
        if !conn.close() {
            return false;
        }
        let batches = self.batches.remove_connection(conn_id);
        bump(&self.stats.connections_closed);
        self.collab.observer.on_connection_closed(conn_id);
        if reason.is_empty() {
            debug!(conn_id, batches, "connection closed");
        } else {
            warn!(conn_id, peer = conn.peer(), batches, reason, "connection closed");
        }
        true
    }

    /// Releases every retained acknowledgement with `status`.
    fn release_retained(&self, status: &Status) -> usize {
        let mut released = 0;
        for conn in self.conns.all() {
            for retained in conn.take_pending() {
                let mut response = retained.response;
                if !status.is_success() {
                    response.status = status.clone();
                }
                let out = Outgoing::reply(Arc::clone(&conn), response, retained.op, retained.timings);
                self.respond(out, true);
                released += 1;
            }
        }
        if released > 0 {
            self.forget_retained(released);
            debug!(released, "retained responses released");
        }
        released
    }

    fn forget_retained(&self, n: usize) {
        let _ = self
            .stats
            .retained_held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                Some(held.saturating_sub(n as u64))
            });
    }

    fn has_retained(&self) -> bool {
        self.stats.retained_held.load(Ordering::Acquire) > 0
    }

    /// Runs when a batch's deadline passes before it completed.
    fn on_batch_timeout(&self, event: &BatchTimeout) {
        if !self.batches.expire(&event.key) {
            return;
        }
        bump(&self.stats.batches_expired);
        self.collab.observer.on_batch_expired();
        warn!(
            conn_id = event.key.conn_id,
            batch_id = event.key.batch_id,
            "batch timed out"
        );
        if let Some(conn) = self.conns.get(event.key.conn_id) {
            self.send_and_close(&conn, Status::new(StatusCode::Expired, "Timed out"));
        }
    }

    /// Arms the timer for the nearest open batch deadline, capped.
    fn arm_for_batches(&self) {
        if let Some(deadline) = self.batches.next_deadline() {
            let remaining = time::remaining_ms(deadline, time::now_ms()).max(1) as u64;
            self.timer.arm(remaining.min(self.config.retain_ceiling_ms));
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let s = &self.stats;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            commands_ingested: load(&s.commands_ingested),
            commands_rejected: load(&s.commands_rejected),
            commands_executed: load(&s.commands_executed),
            requests_expired: load(&s.requests_expired),
            batches_committed: load(&s.batches_committed),
            batches_aborted: load(&s.batches_aborted),
            batches_expired: load(&s.batches_expired),
            responses_sent: load(&s.responses_sent),
            responses_oversize: load(&s.responses_oversize),
            responses_retained: load(&s.responses_retained),
            send_failures: load(&s.send_failures),
            flushes: load(&s.flushes),
            connections_accepted: load(&s.connections_accepted),
            connections_closed: load(&s.connections_closed),
            connections_evicted: load(&s.connections_evicted),
            queue_depth: self.queue.len(),
            response_queue_depth: self.responses.len(),
            open_batches: self.batches.len(),
            connections: self.conns.len(),
            pool_used_bytes: self.pool.used_bytes(),
            pending_responses: self.conns.all().iter().map(|c| c.pending_len()).sum(),
        }
    }
}

impl TimerHandler for Shared {
    /// Flushes storage, releases retained acknowledgements, then expires
    /// overdue batches and re-arms for the next one.
    fn service_timer(&self) {
        let status = self.collab.storage.flush();
        bump(&self.stats.flushes);
        if !status.is_success() {
            tracing::error!(status = %status, "timed flush failed");
        }
        self.release_retained(&status);

        for event in self.batches.expired(time::now_ms()) {
            self.batches.publish_timeout(&event);
        }
        self.arm_for_batches();
    }
}

#[derive(Default)]
struct Workers {
    ingest: Vec<JoinHandle<()>>,
    exec: Vec<JoinHandle<()>>,
    respond: Vec<JoinHandle<()>>,
}

/// A running pipeline. Dropping it shuts it down.
pub struct Pipeline {
    shared: Arc<Shared>,
    workers: Mutex<Workers>,
}

impl Pipeline {
    /// Builds the shared state and spawns every worker thread plus the
    /// aging timer.
    pub fn start(config: PipelineConfig, collab: Collaborators) -> Result<Self, PipelineError> {
        let shared = Arc::new(Shared::new(config, collab));
        let pipeline = Pipeline {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Workers::default()),
        };

        let handler: Weak<dyn TimerHandler> = {
            let as_handler: Arc<dyn TimerHandler> = shared.clone();
            Arc::downgrade(&as_handler)
        };
        shared.timer.start(handler)?;

        {
            let mut workers = pipeline.workers.lock();
            let cfg = &shared.config;
            for i in 0..cfg.ingest_threads.max(1) {
                let s = Arc::clone(&shared);
                workers.ingest.push(spawn(format!("kinetic-ingest-{i}"), move || ingest::run(s))?);
            }
            for i in 0..cfg.exec_threads.max(1) {
                let s = Arc::clone(&shared);
                workers.exec.push(spawn(format!("kinetic-exec-{i}"), move || execute::run(s))?);
            }
            for i in 0..cfg.respond_threads.max(1) {
                let s = Arc::clone(&shared);
                workers.respond.push(spawn(format!("kinetic-resp-{i}"), move || respond::run(s))?);
            }
            info!(
                ingest = workers.ingest.len(),
                exec = workers.exec.len(),
                respond = workers.respond.len(),
                "pipeline started"
            );
        }
        Ok(pipeline)
    }

    /// Adds a connection. At the connection limit the least recently used
    /// connection is told "Too Many Connections" and closed first.
    pub fn register_connection(
        &self,
        peer: impl Into<String>,
        source: Box<dyn CommandSource>,
        sink: Box<dyn ResponseSink>,
    ) -> Result<Arc<Connection>, PipelineError> {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Err(PipelineError::ShutDown);
        }

        let live = shared.conns.all().iter().filter(|c| c.is_live()).count();
        if live >= shared.config.max_connections {
            if let Some(victim) = shared.conns.find_connection_to_close(shared.config.provisional_threshold) {
                warn!(conn_id = victim.id(), peer = victim.peer(), "evicting connection at limit");
                bump(&shared.stats.connections_evicted);
                shared.send_and_close(
                    &victim,
                    Status::new(StatusCode::InvalidRequest, "Too Many Connections"),
                );
            }
        }

        let id = shared.conns.next_id();
        let conn = Arc::new(Connection::new(id, peer, source, sink));
        shared.conns.insert(Arc::clone(&conn));
        bump(&shared.stats.connections_accepted);
        debug!(conn_id = id, peer = conn.peer(), "connection registered");
        Ok(conn)
    }

    /// Signals that `conn_id` has a command ready to read.
    pub fn notify_readable(&self, conn_id: u64) {
        if !self.shared.is_shutting_down() {
            self.shared.ready.push(Ready::Conn(conn_id));
        }
    }

    /// Closes `conn_id`, discarding its batches and retained responses.
    pub fn close_connection(&self, conn_id: u64) -> bool {
        self.shared.close_connection(conn_id, "")
    }

    pub fn connection(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.shared.conns.get(conn_id)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.snapshot()
    }

    pub fn latency_log(&self) -> &LatencyLog {
        &self.shared.latency
    }

    pub fn pool(&self) -> &ValuePool {
        &self.shared.pool
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn open_batches(&self) -> usize {
        self.shared.batches.len()
    }

    pub fn is_timer_armed(&self) -> bool {
        self.shared.timer.is_armed()
    }

    /// Stops every role and joins its threads. Idempotent.
    ///
    /// Ingest stops first, then the priority queue drains, then the
    /// response queue drains, then the timer stops and any remaining
    /// connections are closed.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("pipeline shutting down");
        let workers = std::mem::take(&mut *self.workers.lock());

        for _ in 0..workers.ingest.len() {
            shared.ready.push(Ready::PoisonPill);
        }
        join_all(workers.ingest);

        shared.queue.close();
        join_all(workers.exec);

        shared.responses.shutdown();
        join_all(workers.respond);

        shared.timer.stop();
        for conn in shared.conns.all() {
            shared.close_connection(conn.id(), "");
        }
        info!("pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn<F>(name: String, f: F) -> Result<JoinHandle<()>, PipelineError>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| PipelineError::Spawn { name, source })
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let name = handle.thread().name().unwrap_or("worker").to_owned();
        if handle.join().is_err() {
            tracing::error!(thread = %name, "worker panicked");
        }
    }
}
