//! Bounded accounting for inbound value payloads.
//!
//! Every value read off a connection is charged against a shared
//! [`ValuePool`] before it is queued. The charge travels with the payload
//! as a [`PooledValue`] and is returned when that value is dropped, no
//! matter which path (commit, abort, timeout, error, connection close)
//! lets go of it last.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::PoolError;

#[derive(Debug)]
struct PoolInner {
    capacity: usize,
    used: AtomicUsize,
}

impl PoolInner {
    fn reserve(&self, bytes: usize) -> Result<(), PoolError> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let next = used.saturating_add(bytes);
            if next > self.capacity {
                return Err(PoolError::Exhausted {
                    requested: bytes,
                    available: self.capacity.saturating_sub(used),
                });
            }
            match self.used.compare_exchange_weak(
                used,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Shared byte budget for inbound values. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ValuePool {
    inner: Arc<PoolInner>,
}

impl ValuePool {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity: capacity_bytes,
                used: AtomicUsize::new(0),
            }),
        }
    }

    /// Charges `value` against the pool.
    ///
    /// Fails without side effects when the pool can't cover the payload.
    pub fn admit(&self, value: Bytes) -> Result<PooledValue, PoolError> {
        let len = value.len();
        self.inner.reserve(len)?;
        Ok(PooledValue {
            bytes: value,
            charged: len,
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    pub fn available_bytes(&self) -> usize {
        self.capacity().saturating_sub(self.used_bytes())
    }
}

/// A value payload whose size is charged to a [`ValuePool`] until drop.
pub struct PooledValue {
    bytes: Bytes,
    charged: usize,
    pool: Arc<PoolInner>,
}

impl PooledValue {
    /// A cheap handle to the payload. Does not carry the pool charge.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl Deref for PooledValue {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for PooledValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledValue")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Drop for PooledValue {
    fn drop(&mut self) {
        self.pool.release(self.charged);
    }
}
