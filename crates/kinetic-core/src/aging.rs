//! Deferred-commit ("aging") timer.
//!
//! A single background thread polls one shared deadline. When the deadline
//! passes, the timer disarms itself and calls the registered handler,
//! which flushes storage and releases whatever was waiting on that flush.
//! Arming only ever pulls the deadline closer, so the worst-case wait of
//! any retained write is bounded by the nearest deadline anyone asked for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::error::PipelineError;
use crate::time;

/// Poll interval of the timer thread.
pub const DEFAULT_POLL: Duration = Duration::from_millis(20);

/// Window adopted when armed with a zero timeout.
pub const DEFAULT_WINDOW_MS: u64 = 30_000;

/// Receives timer expirations.
pub trait TimerHandler: Send + Sync {
    fn service_timer(&self);
}

#[derive(Debug, Clone)]
pub struct AgingConfig {
    pub poll: Duration,
    pub default_window_ms: u64,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            poll: DEFAULT_POLL,
            default_window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Armed {
    /// Absolute fire time.
    finish_ms: u64,
    /// The timeout that produced `finish_ms`.
    timeout_ms: u64,
}

struct TimerInner {
    armed: Mutex<Option<Armed>>,
    wake: Condvar,
    stop: AtomicBool,
    config: AgingConfig,
}

/// The shared aging timer. See the module docs.
pub struct AgingTimer {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AgingTimer {
    pub fn new(config: AgingConfig) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                armed: Mutex::new(None),
                wake: Condvar::new(),
                stop: AtomicBool::new(false),
                config,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Spawns the `kinetic-aging` thread.
    ///
    /// The handler is held weakly; the thread exits on its own once the
    /// handler is gone. Calling `start` twice is a no-op.
    pub fn start(&self, handler: Weak<dyn TimerHandler>) -> Result<(), PipelineError> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("kinetic-aging".into())
            .spawn(move || run(inner, handler))
            .map_err(|source| PipelineError::Spawn {
                name: "kinetic-aging".into(),
                source,
            })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Requests a fire no later than `timeout_ms` from now.
    ///
    /// A zero timeout selects the default window. If the timer is already
    /// armed, only an earlier deadline replaces the current one.
    pub fn arm(&self, timeout_ms: u64) {
        let timeout_ms = if timeout_ms == 0 {
            self.inner.config.default_window_ms
        } else {
            timeout_ms
        };
        let finish_ms = time::now_ms().saturating_add(timeout_ms);

        let mut armed = self.inner.armed.lock();
        match *armed {
            Some(current) if current.finish_ms <= finish_ms => {}
            _ => {
                *armed = Some(Armed {
                    finish_ms,
                    timeout_ms,
                });
                debug!(timeout_ms, "aging timer armed");
            }
        }
    }

    /// Makes the timer fire on the next poll.
    pub fn fire_now(&self) {
        let now = time::now_ms();
        *self.inner.armed.lock() = Some(Armed {
            finish_ms: now,
            timeout_ms: 0,
        });
        self.inner.wake.notify_one();
    }

    /// Clears any pending deadline.
    pub fn disarm(&self) {
        *self.inner.armed.lock() = None;
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.lock().is_some()
    }

    /// Absolute fire time, if armed.
    pub fn deadline_ms(&self) -> Option<u64> {
        self.inner.armed.lock().map(|a| a.finish_ms)
    }

    /// The timeout the current deadline was armed with.
    pub fn armed_timeout_ms(&self) -> Option<u64> {
        self.inner.armed.lock().map(|a| a.timeout_ms)
    }

    /// Stops and joins the timer thread. Safe to call more than once.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.wake.notify_all();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!("aging timer thread panicked");
            }
        }
    }
}

impl Drop for AgingTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: Arc<TimerInner>, handler: Weak<dyn TimerHandler>) {
    info!("aging timer started");
    loop {
        let fire = {
            let mut armed = inner.armed.lock();
            if inner.stop.load(Ordering::Acquire) {
                break;
            }
            match *armed {
                Some(a) if time::now_ms() >= a.finish_ms => {
                    *armed = None;
                    true
                }
                _ => {
                    inner.wake.wait_for(&mut armed, inner.config.poll);
                    false
                }
            }
        };

        if fire {
            let Some(handler) = handler.upgrade() else {
                break;
            };
            debug!("aging timer fired");
            handler.service_timer();
        }
    }
    info!("aging timer stopped");
}
