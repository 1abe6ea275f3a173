//! Monotonic clock abstraction
//!
//! Every timer in the session orchestrator reasons in `now - thenMs` deltas
//! (spec §5). A trait keeps that math deterministic under test without
//! sleeping in real time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A source of monotonic milliseconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since some fixed but arbitrary epoch. Only differences
    /// between two calls are meaningful.
    fn now_ms(&self) -> u64;
}

/// Wall-clock implementation backed by [`std::time::Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Test clock that only advances when told to. Shareable across a test's
/// session and its fake collaborators via [`ManualClock::handle`].
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { millis: Arc::new(AtomicU64::new(0)) }
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn advance(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, ms: u64) {
        self.millis.store(ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
