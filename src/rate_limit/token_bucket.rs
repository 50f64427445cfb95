use crate::clock::{default_clock, SharedClock};
use crate::rate_limit::Decision;
use std::sync::Mutex;
use std::time::Duration;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// A single client's token bucket.
///
/// Holds a fractional token count that refills lazily at `refill_rate`
/// tokens per second, up to `capacity`. Each admitted call consumes exactly
/// one token; a call is denied (and consumes nothing) while fewer than one
/// token is available. Starts full.
///
/// All state transitions of one bucket are serialised by its own mutex, which
/// is held only for the arithmetic.
#[derive(Debug)]
pub struct TokenBucket {
    refill_rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
    clock: SharedClock,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill_nanos: u64,
}

impl TokenBucket {
    /// Create a full bucket on the monotonic clock.
    ///
    /// Negative or NaN inputs are treated as zero.
    pub fn new(refill_rate: f64, capacity: f64) -> Self {
        Self::with_clock(refill_rate, capacity, default_clock())
    }

    /// Create a full bucket reading time from `clock`.
    pub fn with_clock(refill_rate: f64, capacity: f64, clock: SharedClock) -> Self {
        let refill_rate = refill_rate.max(0.0);
        let capacity = capacity.max(0.0);
        let now = clock.now_nanos();
        Self {
            refill_rate,
            capacity,
            state: Mutex::new(BucketState { tokens: capacity, last_refill_nanos: now }),
            clock,
        }
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Admit one call if a whole token is available.
    pub fn allow(&self) -> bool {
        self.check().is_allowed()
    }

    /// Like [`allow`](Self::allow) but reports what is left, or how long to wait.
    pub fn check(&self) -> Decision {
        let now = self.clock.now_nanos();
        let mut state = self.state.lock().expect("token bucket poisoned");
        state.tokens = self.refilled(&state, now);
        state.last_refill_nanos = state.last_refill_nanos.max(now);

        if state.tokens >= 1.0 - self.tick_slack() {
            state.tokens = (state.tokens - 1.0).max(0.0);
            Decision::Allowed { remaining: state.tokens }
        } else {
            Decision::Denied { wait: self.time_to_next_token(state.tokens) }
        }
    }

    /// Current token level, refilled up to now. Does not change the bucket.
    pub fn tokens_available(&self) -> f64 {
        let now = self.clock.now_nanos();
        let state = self.state.lock().expect("token bucket poisoned");
        self.refilled(&state, now)
    }

    fn refilled(&self, state: &BucketState, now_nanos: u64) -> f64 {
        let elapsed_secs = now_nanos.saturating_sub(state.last_refill_nanos) as f64 / NANOS_PER_SEC;
        (state.tokens + elapsed_secs * self.refill_rate).min(self.capacity)
    }

    // Clock readings are truncated to whole nanoseconds, so a refill period
    // like 1/3 s lands a fraction of a tick short of a full token.
    fn tick_slack(&self) -> f64 {
        self.refill_rate / NANOS_PER_SEC + 1e-12
    }

    fn time_to_next_token(&self, tokens: f64) -> Duration {
        if self.refill_rate <= 0.0 || self.capacity < 1.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64((1.0 - tokens) / self.refill_rate).unwrap_or(Duration::MAX)
    }
}
