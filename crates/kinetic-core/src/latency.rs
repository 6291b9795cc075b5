//! Per-command latency accounting.
//!
//! Every queued request carries [`Timings`] stamped as it moves through
//! the pipeline. Commands whose end-to-end time crosses a threshold are
//! kept in a fixed-size ring buffer, [`LatencyLog`]. Only slow commands
//! take the lock, so contention is negligible.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::command::OpKind;
use crate::time;

/// Pipeline timestamps for one command, in [`time::now_ms`] milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    pub enqueued_ms: u64,
    pub dequeued_ms: u64,
    pub processed_ms: u64,
    pub responded_ms: u64,
}

impl Timings {
    pub fn starting_now() -> Self {
        Self {
            enqueued_ms: time::now_ms(),
            ..Self::default()
        }
    }

    pub fn queue_wait_ms(&self) -> u64 {
        self.dequeued_ms.saturating_sub(self.enqueued_ms)
    }

    pub fn execute_ms(&self) -> u64 {
        self.processed_ms.saturating_sub(self.dequeued_ms)
    }

    pub fn respond_ms(&self) -> u64 {
        self.responded_ms.saturating_sub(self.processed_ms)
    }

    pub fn total_ms(&self) -> u64 {
        self.responded_ms.saturating_sub(self.enqueued_ms)
    }
}

/// A single latency log entry.
#[derive(Debug, Clone)]
pub struct LatencyEntry {
    /// Monotonically increasing entry id.
    pub id: u64,
    pub timestamp: SystemTime,
    pub conn_id: u64,
    pub sequence: Option<u64>,
    pub op: OpKind,
    pub timings: Timings,
}

impl LatencyEntry {
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.timings.total_ms())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LatencyLogConfig {
    /// Commands at or above this end-to-end time are logged.
    pub slower_than: Duration,
    /// Oldest entries are evicted past this many.
    pub max_len: usize,
    pub enabled: bool,
}

impl Default for LatencyLogConfig {
    fn default() -> Self {
        Self {
            slower_than: Duration::from_millis(10),
            max_len: 128,
            enabled: true,
        }
    }
}

struct LatencyLogInner {
    entries: VecDeque<LatencyEntry>,
    next_id: u64,
}

/// Thread-safe log of slow commands backed by a ring buffer.
pub struct LatencyLog {
    config: LatencyLogConfig,
    inner: Mutex<LatencyLogInner>,
}

impl LatencyLog {
    pub fn new(config: LatencyLogConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(LatencyLogInner {
                entries: VecDeque::with_capacity(config.max_len),
                next_id: 0,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Records a finished command if it was slow enough.
    pub fn maybe_record(&self, conn_id: u64, sequence: Option<u64>, op: OpKind, timings: Timings) {
        let total = Duration::from_millis(timings.total_ms());
        if !self.config.enabled || total < self.config.slower_than || self.config.max_len == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.entries.len() >= self.config.max_len {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LatencyEntry {
            id,
            timestamp: SystemTime::now(),
            conn_id,
            sequence,
            op,
            timings,
        });
    }

    /// The most recent entries, newest first. `None` returns them all.
    pub fn get(&self, count: Option<usize>) -> Vec<LatencyEntry> {
        let inner = self.inner.lock();
        let n = count.unwrap_or(inner.entries.len()).min(inner.entries.len());
        inner.entries.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.inner.lock().entries.clear();
    }
}
