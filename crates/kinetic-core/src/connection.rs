//! Connection bookkeeping for the pipeline.
//!
//! The pipeline doesn't own sockets. A [`Connection`] pairs the
//! collaborator endpoints for one client (a command source and a response
//! sink) with the state the scheduler needs: lifecycle state, the last
//! accepted sequence number, access time for LRU eviction, and the
//! responses retained until the next flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::collab::{CommandSource, ResponseSink};
use crate::command::OpKind;
use crate::latency::Timings;
use crate::status::Response;
use crate::time;

/// Once this many provisional connections exist, eviction only considers
/// provisional ones.
pub const PROVISIONAL_EXCLUSIVITY_THRESHOLD: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, no valid command yet.
    Provisional,
    Idle,
    Busy,
    /// Teardown requested; no new commands are read.
    ShouldBeClosed,
    Closed,
}

impl ConnectionState {
    pub fn is_live(self) -> bool {
        !matches!(self, ConnectionState::ShouldBeClosed | ConnectionState::Closed)
    }
}

/// A successful write response held back until storage is flushed.
#[derive(Debug, Clone)]
pub struct Retained {
    pub response: Response,
    pub op: OpKind,
    pub timings: Timings,
}

#[derive(Debug)]
struct ConnInner {
    state: ConnectionState,
    established: bool,
    in_flight: usize,
    last_sequence: Option<u64>,
    last_access_ms: u64,
    pending: Vec<Retained>,
}

pub struct Connection {
    id: u64,
    peer: String,
    source: Box<dyn CommandSource>,
    sink: Box<dyn ResponseSink>,
    /// Held while one ingest worker reads from this connection.
    ingest: Mutex<()>,
    inner: Mutex<ConnInner>,
}

impl Connection {
    pub fn new(
        id: u64,
        peer: impl Into<String>,
        source: Box<dyn CommandSource>,
        sink: Box<dyn ResponseSink>,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            source,
            sink,
            ingest: Mutex::new(()),
            inner: Mutex::new(ConnInner {
                state: ConnectionState::Provisional,
                established: false,
                in_flight: 0,
                last_sequence: None,
                last_access_ms: time::now_ms(),
                pending: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn source(&self) -> &dyn CommandSource {
        self.source.as_ref()
    }

    pub fn sink(&self) -> &dyn ResponseSink {
        self.sink.as_ref()
    }

    /// Serializes ingest for this connection. Held from the read until
    /// the command is queued.
    pub fn lock_ingest(&self) -> MutexGuard<'_, ()> {
        self.ingest.lock()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    pub fn is_provisional(&self) -> bool {
        !self.inner.lock().established
    }

    pub fn last_access_ms(&self) -> u64 {
        self.inner.lock().last_access_ms
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.inner.lock().last_sequence
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Accepts `sequence` if it is strictly greater than the last accepted
    /// one, recording it. Rejected sequences leave the record untouched.
    pub fn advance_sequence(&self, sequence: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.last_sequence {
            Some(last) if sequence <= last => false,
            _ => {
                inner.last_sequence = Some(sequence);
                true
            }
        }
    }

    /// Records that a valid command arrived.
    pub fn mark_established(&self) {
        let mut inner = self.inner.lock();
        inner.last_access_ms = time::now_ms();
        if !inner.established {
            inner.established = true;
            if inner.state == ConnectionState::Provisional {
                inner.state = ConnectionState::Idle;
            }
        }
    }

    /// A command from this connection entered the queue.
    pub fn begin_command(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight += 1;
        inner.last_access_ms = time::now_ms();
        if matches!(inner.state, ConnectionState::Idle | ConnectionState::Provisional) {
            inner.state = ConnectionState::Busy;
        }
    }

    /// A command from this connection left the pipeline.
    pub fn finish_command(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.in_flight == 0 && inner.state == ConnectionState::Busy {
            inner.state = if inner.established {
                ConnectionState::Idle
            } else {
                ConnectionState::Provisional
            };
        }
    }

    /// Requests teardown. Returns true if this call changed the state.
    pub fn mark_should_close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_live() {
            inner.state = ConnectionState::ShouldBeClosed;
            true
        } else {
            false
        }
    }

    /// Final transition. Drops retained responses and closes the sink.
    /// Returns false if already closed.
    pub fn close(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return false;
            }
            inner.state = ConnectionState::Closed;
            inner.pending.clear();
        }
        self.sink.close();
        true
    }

    /// Holds `retained` until the next flush. Returns how many are held.
    pub fn retain(&self, retained: Retained) -> usize {
        let mut inner = self.inner.lock();
        inner.pending.push(retained);
        inner.pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn take_pending(&self) -> Vec<Retained> {
        std::mem::take(&mut self.inner.lock().pending)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Registry of live connections keyed by id.
pub struct ConnectionMap {
    conns: DashMap<u64, Arc<Connection>>,
    next_id: AtomicU64,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.conns.insert(conn.id(), conn);
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.conns.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        self.conns.remove(&id).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Snapshot of every registered connection.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.conns.iter().map(|c| Arc::clone(c.value())).collect()
    }

    pub fn provisional_count(&self) -> usize {
        self.conns
            .iter()
            .filter(|c| c.is_live() && c.is_provisional())
            .count()
    }

    /// Picks the least recently used live connection to evict.
    ///
    /// When at least `provisional_threshold` provisional connections exist,
    /// only those are considered.
    pub fn find_connection_to_close(&self, provisional_threshold: usize) -> Option<Arc<Connection>> {
        let live = self.all().into_iter().filter(|c| c.is_live());
        let only_provisional = self.provisional_count() >= provisional_threshold;
        live.filter(|c| !only_provisional || c.is_provisional())
            .min_by_key(|c| c.last_access_ms())
    }
}

impl Default for ConnectionMap {
    fn default() -> Self {
        Self::new()
    }
}
