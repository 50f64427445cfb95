//! Fixed-window pacing for a single sequential caller.
//!
//! Unlike the token bucket, which arbitrates between many concurrent clients,
//! [`CallWindow`] paces one consumer against an external quota of "at most N
//! calls per window". The window opens at the first call; once N calls have
//! been made, the next call waits until the window has run its full length,
//! then a fresh window opens with that call.
//!
//! ```
//! use floodgate::flow_control::CallWindow;
//! use floodgate::{ManualClock, TrackingSleeper};
//! use std::time::Duration;
//!
//! # #[tokio::main] async fn main() {
//! let clock = ManualClock::new();
//! let sleeper = TrackingSleeper::advancing(clock.clone());
//! let mut window = CallWindow::new(2, Duration::from_secs(60))
//!     .with_clock(clock.clone())
//!     .with_sleeper(sleeper.clone());
//!
//! window.acquire().await;
//! window.acquire().await;
//! clock.advance(Duration::from_secs(10));
//! assert_eq!(window.acquire().await, Some(Duration::from_secs(50)));
//! # }
//! ```

use crate::clock::{default_clock, Clock, SharedClock};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Call counter over a fixed window.
#[derive(Debug, Clone)]
pub struct CallWindow {
    quota: u32,
    window: Duration,
    count: u32,
    window_start_nanos: u64,
    clock: SharedClock,
    sleeper: Arc<dyn Sleeper>,
}

impl CallWindow {
    /// At most `quota` calls per `window`. A zero quota is treated as one.
    pub fn new(quota: u32, window: Duration) -> Self {
        Self {
            quota: quota.max(1),
            window,
            count: 0,
            window_start_nanos: 0,
            clock: default_clock(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Calls made in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// How long the next call must wait, if the quota is spent and the window
    /// has not yet run out.
    pub fn delay_before_next_call(&self) -> Option<Duration> {
        if self.count < self.quota {
            return None;
        }
        let elapsed = self.elapsed();
        (elapsed < self.window).then(|| self.window - elapsed)
    }

    /// Count a call happening now, opening a new window when the previous
    /// one is spent.
    pub fn record_call(&mut self) {
        if self.count >= self.quota {
            self.count = 0;
        }
        if self.count == 0 {
            self.window_start_nanos = self.clock.now_nanos();
        }
        self.count += 1;
    }

    /// Sleep through the window if needed, then record the call.
    /// Returns the pause taken, if any.
    pub async fn acquire(&mut self) -> Option<Duration> {
        let delay = self.delay_before_next_call();
        if let Some(delay) = delay {
            self.sleep(delay).await;
        }
        self.record_call();
        delay
    }

    pub(crate) fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.sleeper.sleep(duration)
    }

    fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.clock.now_nanos().saturating_sub(self.window_start_nanos))
    }
}
