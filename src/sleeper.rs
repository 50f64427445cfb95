//! Abstraction for sleeping/waiting
//!
//! The throttled consumer sleeps through this trait so tests can observe the
//! requested pauses without waiting for them.

use crate::clock::ManualClock;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that doesn't actually sleep
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Test sleeper that records every pause and, optionally, moves a
/// [`ManualClock`] forward by the same amount.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
    clock: Option<ManualClock>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each sleep advances `clock`, so code reading the clock after waking
    /// sees the time it asked to skip.
    pub fn advancing(clock: ManualClock) -> Self {
        Self { calls: Arc::default(), clock: Some(clock) }
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().expect("sleeper log poisoned").clone()
    }

    /// Sum of all recorded pauses.
    pub fn total(&self) -> Duration {
        self.calls().into_iter().sum()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().expect("sleeper log poisoned").push(duration);
        if let Some(clock) = &self.clock {
            clock.advance(duration);
        }
        Box::pin(async {})
    }
}
