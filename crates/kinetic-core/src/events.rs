//! Keyed publish/subscribe.
//!
//! Subscriptions are entries in a registration table keyed by whatever the
//! publisher names its events after (for batch timeouts, the batch key).
//! Each subscription carries a token so a stale handle can't remove a
//! newer registration that reused the same key.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::batch::BatchKey;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Cancellable handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription<K> {
    pub key: K,
    token: u64,
}

/// A registration table of one handler per key.
pub struct EventBus<K, E> {
    handlers: DashMap<K, (u64, Handler<E>)>,
    next_token: AtomicU64,
}

impl<K, E> EventBus<K, E>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for `key`, replacing any earlier registration.
    pub fn subscribe<F>(&self, key: K, handler: F) -> Subscription<K>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .insert(key.clone(), (token, Arc::new(handler)));
        Subscription { key, token }
    }

    /// Removes the registration `sub` refers to. Returns false if it was
    /// already gone or had been replaced.
    pub fn unsubscribe(&self, sub: &Subscription<K>) -> bool {
        self.handlers
            .remove_if(&sub.key, |_, (token, _)| *token == sub.token)
            .is_some()
    }

    /// Removes whatever is registered for `key`.
    pub fn unsubscribe_key(&self, key: &K) -> bool {
        self.handlers.remove(key).is_some()
    }

    /// Calls the handler registered for `key`, if any. Returns whether a
    /// handler ran.
    ///
    /// The handler is invoked after the table's shard lock is released, so
    /// it may subscribe or unsubscribe freely.
    pub fn publish(&self, key: &K, event: &E) -> bool {
        let handler = self.handlers.get(key).map(|entry| Arc::clone(&entry.1));
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, key: &K) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<K: Eq + Hash + Clone, E> Default for EventBus<K, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Published when a batch's deadline passes before it was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTimeout {
    pub key: BatchKey,
    pub deadline_ms: u64,
}
