//! Clock abstractions used by token buckets, the janitor and the call window.
//!
//! Readings are whole nanoseconds: token refill at high rates, or at periods
//! that are not a whole number of milliseconds, depends on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Nanoseconds since an arbitrary, fixed origin. Must never go backwards.
    fn now_nanos(&self) -> u64;

    /// The same reading truncated to whole milliseconds.
    fn now_millis(&self) -> u64 {
        self.now_nanos() / 1_000_000
    }
}

/// Shared, type-erased clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Monotonic clock backed by `Instant::now()`.
///
/// Notes: resets when the process restarts; quota state is never persisted, so
/// nothing needs timing that survives restarts.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let _ = self.now.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
            Some(now.saturating_add(nanos))
        });
    }

    /// Current reading as a `Duration` since the origin.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.now_nanos())
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub(crate) fn default_clock() -> SharedClock {
    Arc::new(MonotonicClock::default())
}
