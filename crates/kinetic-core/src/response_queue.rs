//! Capacity-limited hand-off between execution and response delivery.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Default capacity.
pub const DEFAULT_RESPONSE_QUEUE_CAPACITY: usize = 15;

struct State<T> {
    items: VecDeque<T>,
    shutting_down: bool,
}

/// A bounded FIFO with two ways in.
///
/// Conditional pushes block while the queue is full, which is how normal
/// traffic gets backpressure. Unconditional pushes always succeed, even
/// past capacity, and are reserved for responses that must not be lost.
pub struct BoundedResponseQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedResponseQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                shutting_down: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Pushes `item`.
    ///
    /// With `conditional` set this waits for space and returns `false`
    /// without enqueuing if the queue is shutting down. Otherwise the item
    /// is always accepted.
    #[must_use]
    pub fn enqueue(&self, item: T, conditional: bool) -> bool {
        let mut state = self.state.lock();
        if conditional {
            while !state.shutting_down && state.items.len() >= self.capacity {
                self.not_full.wait(&mut state);
            }
            if state.shutting_down {
                return false;
            }
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Pops the oldest item, blocking while empty.
    ///
    /// Returns `None` once shut down and drained.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.shutting_down {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Drops conditional pushes from now on and wakes everyone waiting.
    /// Items already queued are still handed out by `dequeue`.
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
