//! Deadline-aware priority queue.
//!
//! One FIFO bucket per [`Priority`] level, each with a fixed depth. Producers
//! block while their bucket is full; consumers block until any bucket has
//! work. Which bucket a consumer is served from is decided by
//! [`select_bucket`]: heads close to their deadline jump ahead of everything
//! that isn't, otherwise the highest priority wins.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::error::QueueError;
use crate::priority::Priority;
use crate::time;

/// Default per-bucket depth.
pub const DEFAULT_BUCKET_DEPTH: usize = 210;

/// Heads with less than this much time left are treated as urgent.
pub const DEFAULT_URGENCY_MS: u64 = 100;

/// Anything the queue can order.
pub trait Scheduled {
    fn priority(&self) -> Priority;

    /// Absolute deadline, in [`time::now_ms`] milliseconds.
    fn deadline_ms(&self) -> u64;

    /// When the item entered the queue.
    fn enqueued_ms(&self) -> u64;
}

/// Snapshot of the item [`DeadlinePriorityQueue::dequeue`] would return next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peek {
    pub priority: Priority,
    pub deadline_ms: u64,
    pub enqueued_ms: u64,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub bucket_depth: usize,
    pub urgency_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bucket_depth: DEFAULT_BUCKET_DEPTH,
            urgency_ms: DEFAULT_URGENCY_MS,
        }
    }
}

/// Picks the bucket to serve given each bucket's head deadline.
///
/// `heads[i]` is the head deadline of the bucket for priority index `i`,
/// or `None` when that bucket is empty. A head with less than `urgency_ms`
/// remaining outranks any non-urgent head; between two urgent heads the
/// one with less time left wins, ties going to the higher priority. With
/// nothing urgent the highest non-empty priority wins.
pub fn select_bucket(heads: &[Option<u64>], now_ms: u64, urgency_ms: u64) -> Option<usize> {
    let urgency = i64::try_from(urgency_ms).unwrap_or(i64::MAX);
    let mut best: Option<(usize, i64, bool)> = None;

    // highest priority first, so ties keep the earlier pick
    for (index, head) in heads.iter().enumerate().rev() {
        let Some(deadline) = *head else { continue };
        let remaining = time::remaining_ms(deadline, now_ms);
        let urgent = remaining < urgency;

        let take = match best {
            None => true,
            Some((_, best_remaining, best_urgent)) => {
                urgent && (!best_urgent || remaining < best_remaining)
            }
        };
        if take {
            best = Some((index, remaining, urgent));
        }
    }

    best.map(|(index, _, _)| index)
}

struct QueueState<T> {
    buckets: [VecDeque<T>; Priority::COUNT],
    len: usize,
    closed: bool,
}

impl<T: Scheduled> QueueState<T> {
    fn heads(&self) -> [Option<u64>; Priority::COUNT] {
        std::array::from_fn(|i| self.buckets[i].front().map(Scheduled::deadline_ms))
    }
}

/// Blocking multi-producer, multi-consumer queue ordered by
/// [`select_bucket`]. Items within a bucket are served in arrival order.
pub struct DeadlinePriorityQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: [Condvar; Priority::COUNT],
    config: QueueConfig,
}

impl<T: Scheduled> DeadlinePriorityQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buckets: std::array::from_fn(|_| VecDeque::new()),
                len: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: std::array::from_fn(|_| Condvar::new()),
            config,
        }
    }

    /// Appends `item` to its priority bucket, blocking while that bucket
    /// is at capacity.
    ///
    /// Returns [`QueueError::Closed`] if the queue is (or becomes) closed;
    /// the item is dropped in that case.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let bucket = item.priority().index();
        let mut state = self.state.lock();
        while !state.closed && state.buckets[bucket].len() >= self.config.bucket_depth {
            self.not_full[bucket].wait(&mut state);
        }
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.buckets[bucket].push_back(item);
        state.len += 1;
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the next item, blocking until one is available.
    ///
    /// After [`close`](Self::close), remaining items are still handed out;
    /// `None` is returned once the queue is both closed and empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = self.pop_locked(&mut state) {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Non-blocking variant of [`dequeue`](Self::dequeue).
    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.state.lock();
        self.pop_locked(&mut state)
    }

    fn pop_locked(&self, state: &mut QueueState<T>) -> Option<T> {
        let bucket = select_bucket(&state.heads(), time::now_ms(), self.config.urgency_ms)?;
        let item = state.buckets[bucket].pop_front()?;
        state.len -= 1;
        self.not_full[bucket].notify_one();
        Some(item)
    }

    /// Describes the item that would be dequeued next, without removing it.
    pub fn peek_top(&self) -> Option<Peek> {
        let state = self.state.lock();
        let bucket = select_bucket(&state.heads(), time::now_ms(), self.config.urgency_ms)?;
        state.buckets[bucket].front().map(|item| Peek {
            priority: item.priority(),
            deadline_ms: item.deadline_ms(),
            enqueued_ms: item.enqueued_ms(),
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_len(&self, priority: Priority) -> usize {
        self.state.lock().buckets[priority.index()].len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Stops accepting new items and wakes every blocked caller.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        for cv in &self.not_full {
            cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Item {
        id: u32,
        priority: Priority,
        deadline: u64,
    }

    impl Scheduled for Item {
        fn priority(&self) -> Priority {
            self.priority
        }
        fn deadline_ms(&self) -> u64 {
            self.deadline
        }
        fn enqueued_ms(&self) -> u64 {
            0
        }
    }

    fn item(id: u32, priority: Priority, timeout: u64) -> Item {
        Item {
            id,
            priority,
            deadline: time::deadline_after(timeout),
        }
    }

    #[test]
    fn select_prefers_highest_priority_when_nothing_urgent() {
        let heads = [Some(10_000), None, Some(5_000), None, Some(9_000)];
        assert_eq!(select_bucket(&heads, 0, 100), Some(4));
    }

    #[test]
    fn select_prefers_urgent_over_priority() {
        let heads = [Some(50), None, None, None, Some(9_000)];
        assert_eq!(select_bucket(&heads, 0, 100), Some(0));
    }

    #[test]
    fn select_picks_most_urgent_then_priority() {
        let heads = [Some(20), Some(80), None, Some(20), None];
        assert_eq!(select_bucket(&heads, 0, 100), Some(3));

        // overdue heads are more urgent than merely close ones
        let heads = [Some(10), None, Some(60), None, None];
        assert_eq!(select_bucket(&heads, 40, 100), Some(0));
    }

    #[test]
    fn select_empty() {
        assert_eq!(select_bucket(&[None; 5], 0, 100), None);
    }

    #[test]
    fn dequeue_serves_by_priority_then_fifo() {
        let q = DeadlinePriorityQueue::new(QueueConfig::default());
        q.enqueue(item(1, Priority::Lowest, 60_000)).unwrap();
        q.enqueue(item(2, Priority::Highest, 60_000)).unwrap();
        q.enqueue(item(3, Priority::Highest, 60_000)).unwrap();
        q.enqueue(item(4, Priority::Normal, 60_000)).unwrap();

        let order: Vec<u32> = (0..4).map(|_| q.dequeue().unwrap().id).collect();
        assert_eq!(order, vec![2, 3, 4, 1]);
        assert!(q.is_empty());
    }

    #[test]
    fn urgent_low_priority_jumps_ahead() {
        let q = DeadlinePriorityQueue::new(QueueConfig::default());
        q.enqueue(item(1, Priority::Highest, 60_000)).unwrap();
        q.enqueue(item(2, Priority::Lowest, 10)).unwrap();
        assert_eq!(q.peek_top().unwrap().priority, Priority::Lowest);
        assert_eq!(q.dequeue().unwrap().id, 2);
        assert_eq!(q.dequeue().unwrap().id, 1);
    }

    #[test]
    fn far_deadline_never_counts_as_urgent() {
        let heads = [Some(u64::MAX), None, None, None, Some(60_000)];
        assert_eq!(select_bucket(&heads, 1_000, 100), Some(4));

        let q = DeadlinePriorityQueue::new(QueueConfig::default());
        q.enqueue(item(1, Priority::Highest, 60_000)).unwrap();
        q.enqueue(item(2, Priority::Lowest, u64::MAX)).unwrap();
        assert_eq!(q.dequeue().unwrap().id, 1);
        assert_eq!(q.dequeue().unwrap().id, 2);
    }

    #[test]
    fn enqueue_blocks_on_full_bucket() {
        let q = Arc::new(DeadlinePriorityQueue::new(QueueConfig {
            bucket_depth: 1,
            urgency_ms: DEFAULT_URGENCY_MS,
        }));
        q.enqueue(item(1, Priority::Normal, 60_000)).unwrap();
        // other buckets are unaffected
        q.enqueue(item(2, Priority::Higher, 60_000)).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.enqueue(item(3, Priority::Normal, 60_000)))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.bucket_len(Priority::Normal), 1);

        assert_eq!(q.dequeue().unwrap().id, 2);
        assert_eq!(q.dequeue().unwrap().id, 1);
        producer.join().unwrap().unwrap();
        assert_eq!(q.dequeue().unwrap().id, 3);
    }

    #[test]
    fn close_drains_then_returns_none() {
        let q = DeadlinePriorityQueue::new(QueueConfig::default());
        q.enqueue(item(1, Priority::Normal, 60_000)).unwrap();
        q.close();
        assert_eq!(
            q.enqueue(item(2, Priority::Normal, 60_000)),
            Err(QueueError::Closed)
        );
        assert_eq!(q.dequeue().unwrap().id, 1);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let q: Arc<DeadlinePriorityQueue<Item>> =
            Arc::new(DeadlinePriorityQueue::new(QueueConfig::default()));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.dequeue())
        };
        thread::sleep(Duration::from_millis(30));
        q.close();
        assert!(consumer.join().unwrap().is_none());
    }
}
