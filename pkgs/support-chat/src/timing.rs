//! Clocks and periodic task guards

use std::sync::atomic::{AtomicI64, Ordering};
use tokio::task::JoinHandle;

/// Source of wall-clock milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for deterministic timelines
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Owns a background task and aborts it when dropped
#[derive(Debug)]
pub struct TaskGuard {
    handle: JoinHandle<()>,
}

impl TaskGuard {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
