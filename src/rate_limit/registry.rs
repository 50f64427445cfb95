//! Registry of per-client token buckets.
//!
//! Keys are hashed into independently locked shards. A shard lock covers only
//! the lookup/insert (and the janitor's scan of that shard); it is never held
//! while a bucket decides, so unrelated clients do not queue behind each
//! other.

use crate::clock::{default_clock, SharedClock};
use crate::config::LimiterConfig;
use crate::rate_limit::{Decision, KeyedLimiter, TokenBucket};
use crate::task::BackgroundTask;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug)]
struct ClientEntry {
    bucket: Arc<TokenBucket>,
    last_seen_millis: u64,
}

type Shard = Mutex<HashMap<String, ClientEntry>>;

/// Concurrent map from client key to its [`TokenBucket`].
#[derive(Debug)]
pub struct ClientLimiterRegistry {
    shards: Box<[Shard]>,
    hasher: RandomState,
    refill_rate: f64,
    capacity: f64,
    cleanup_interval: Duration,
    staleness: Duration,
    clock: SharedClock,
}

impl ClientLimiterRegistry {
    /// Empty registry on the monotonic clock.
    pub fn new(config: &LimiterConfig) -> Self {
        Self::with_clock(config, default_clock())
    }

    /// Empty registry reading time from `clock` (shared with every bucket).
    pub fn with_clock(config: &LimiterConfig, clock: SharedClock) -> Self {
        let shards = (0..config.shards()).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            hasher: RandomState::new(),
            refill_rate: config.refill_rate(),
            capacity: config.capacity(),
            cleanup_interval: config.cleanup_interval(),
            staleness: config.staleness(),
            clock,
        }
    }

    /// Bucket for `key`, created full on first sight. Marks the key as seen now.
    pub fn get_or_create(&self, key: &str) -> Arc<TokenBucket> {
        let now = self.clock.now_millis();
        let mut shard = self.shard(key).lock().expect("client registry shard poisoned");

        if let Some(entry) = shard.get_mut(key) {
            entry.last_seen_millis = entry.last_seen_millis.max(now);
            return entry.bucket.clone();
        }

        let bucket =
            Arc::new(TokenBucket::with_clock(self.refill_rate, self.capacity, self.clock.clone()));
        shard.insert(key.to_owned(), ClientEntry { bucket: bucket.clone(), last_seen_millis: now });
        debug!(target: "floodgate::registry", key, "tracking new client");
        bucket
    }

    /// Remove every client idle for longer than the staleness threshold.
    /// Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let staleness = u64::try_from(self.staleness.as_millis()).unwrap_or(u64::MAX);
        let mut evicted = 0;
        let mut remaining = 0;

        for shard in self.shards.iter() {
            let mut map = shard.lock().expect("client registry shard poisoned");
            let before = map.len();
            map.retain(|_, entry| now.saturating_sub(entry.last_seen_millis) <= staleness);
            evicted += before - map.len();
            remaining += map.len();
        }

        if evicted > 0 {
            info!(target: "floodgate::registry", evicted, remaining, "evicted idle clients");
        } else {
            debug!(target: "floodgate::registry", remaining, "sweep found no idle clients");
        }
        evicted
    }

    /// Start the janitor: one [`sweep`](Self::sweep) per cleanup interval
    /// until the returned task is stopped.
    ///
    /// A panic inside a sweep is not caught; it kills the janitor and is
    /// re-raised by [`BackgroundTask::shutdown`].
    pub fn spawn_janitor(self: &Arc<Self>) -> BackgroundTask {
        let registry = Arc::clone(self);
        let period = self.cleanup_interval;
        BackgroundTask::spawn("janitor", move |mut stop| async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.stopped() => break,
                    _ = ticker.tick() => {
                        registry.sweep();
                    }
                }
            }
            debug!(target: "floodgate::registry", "janitor stopped");
        })
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("client registry shard poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).lock().expect("client registry shard poisoned").contains_key(key)
    }

    /// Clock reading at which `key` was last requested.
    pub fn last_seen_millis(&self, key: &str) -> Option<u64> {
        self.shard(key)
            .lock()
            .expect("client registry shard poisoned")
            .get(key)
            .map(|e| e.last_seen_millis)
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    fn shard(&self, key: &str) -> &Shard {
        let idx = (self.hasher.hash_one(key) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }
}

impl KeyedLimiter for ClientLimiterRegistry {
    fn check(&self, key: &str) -> Decision {
        let bucket = self.get_or_create(key);
        bucket.check()
    }
}
