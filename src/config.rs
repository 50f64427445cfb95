//! Validated configuration for every policy, plus a JSON settings loader.
//!
//! Configuration is read once at construction; nothing here is hot-reloadable.

use crate::error::{ConfigError, SettingsError};
use crate::rate_limit::key::ProxyTrust;
use serde::Deserialize;
use std::time::Duration;

/// Tokens per second granted to each client by default.
pub const DEFAULT_REFILL_RATE: f64 = 20.0;
/// Burst size (bucket capacity) per client by default.
pub const DEFAULT_CAPACITY: f64 = 5.0;
/// How often the janitor sweeps idle clients.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Idle time after which a client entry is evicted.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(180);
/// Independently locked partitions of the client map.
pub const DEFAULT_SHARDS: usize = 16;
/// Pending-task bound of a leaky bucket.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Drain period of a leaky bucket.
pub const DEFAULT_DRAIN_RATE: Duration = Duration::from_secs(1);
/// Calls allowed per window against the external classifier.
pub const DEFAULT_QUOTA: u32 = 16;
/// Length of the consumer's quota window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Upper bound on a single classifier call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-client token bucket and janitor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    refill_rate: f64,
    capacity: f64,
    cleanup_interval: Duration,
    staleness: Duration,
    shards: usize,
    proxy_trust: ProxyTrust,
}

impl LimiterConfig {
    /// Rate in tokens/second and burst capacity; other fields take defaults.
    pub fn new(refill_rate: f64, capacity: f64) -> Result<Self, ConfigError> {
        let cfg = Self { refill_rate, capacity, ..Self::default() };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Override the sweep period and the idle threshold.
    pub fn with_cleanup(
        mut self,
        interval: Duration,
        staleness: Duration,
    ) -> Result<Self, ConfigError> {
        self.cleanup_interval = interval;
        self.staleness = staleness;
        self.validate()?;
        Ok(self)
    }

    /// Override the number of map shards; must be > 0.
    pub fn with_shards(mut self, shards: usize) -> Result<Self, ConfigError> {
        self.shards = shards;
        self.validate()?;
        Ok(self)
    }

    /// Decide when forwarding headers are believed.
    pub fn with_proxy_trust(mut self, trust: ProxyTrust) -> Self {
        self.proxy_trust = trust;
        self
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    pub fn shards(&self) -> usize {
        self.shards
    }

    pub fn proxy_trust(&self) -> &ProxyTrust {
        &self.proxy_trust
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(ConfigError::InvalidRefillRate { provided: self.refill_rate });
        }
        if !self.capacity.is_finite() || self.capacity < 0.0 {
            return Err(ConfigError::InvalidCapacity { provided: self.capacity });
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "cleanup_interval" });
        }
        if self.shards == 0 {
            return Err(ConfigError::ZeroCount { field: "shards" });
        }
        Ok(())
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            refill_rate: DEFAULT_REFILL_RATE,
            capacity: DEFAULT_CAPACITY,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            staleness: DEFAULT_STALENESS,
            shards: DEFAULT_SHARDS,
            proxy_trust: ProxyTrust::default(),
        }
    }
}

/// Bound and drain period of a [`QueuedLeakyBucket`](crate::QueuedLeakyBucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakyBucketConfig {
    capacity: usize,
    rate: Duration,
}

impl LeakyBucketConfig {
    pub fn new(capacity: usize, rate: Duration) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCount { field: "capacity" });
        }
        if rate.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "rate" });
        }
        Ok(Self { capacity, rate })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Time between two drain ticks.
    pub fn rate(&self) -> Duration {
        self.rate
    }
}

impl Default for LeakyBucketConfig {
    fn default() -> Self {
        Self { capacity: DEFAULT_QUEUE_CAPACITY, rate: DEFAULT_DRAIN_RATE }
    }
}

/// What the consumer does with a message whose classifier call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Acknowledge and forget it (at-most-once).
    #[default]
    Drop,
    /// Hand it back to the broker for redelivery (at-least-once).
    Requeue,
}

/// Quota window and failure handling of the flow-controlled consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlConfig {
    quota: u32,
    window: Duration,
    call_timeout: Duration,
    failure_policy: FailurePolicy,
}

impl FlowControlConfig {
    /// At most `quota` calls per `window`.
    pub fn new(quota: u32, window: Duration) -> Result<Self, ConfigError> {
        let cfg = Self { quota, window, ..Self::default() };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        self.call_timeout = timeout;
        self.validate()?;
        Ok(self)
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.quota == 0 {
            return Err(ConfigError::ZeroCount { field: "quota" });
        }
        if self.window.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "window" });
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "call_timeout" });
        }
        Ok(())
    }
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            quota: DEFAULT_QUOTA,
            window: DEFAULT_WINDOW,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            failure_policy: FailurePolicy::Drop,
        }
    }
}

/// Validated configuration for all three policies.
///
/// ```
/// let settings = floodgate::config::Settings::from_json_str(
///     r#"{ "limiter": { "refill_rate": 1.0, "capacity": 10.0 },
///          "flow_control": { "quota": 15 } }"#,
/// ).unwrap();
/// assert_eq!(settings.limiter.capacity(), 10.0);
/// assert_eq!(settings.flow_control.quota(), 15);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    pub limiter: LimiterConfig,
    pub leaky_bucket: LeakyBucketConfig,
    pub flow_control: FlowControlConfig,
}

impl Settings {
    /// Parse a JSON document; absent sections and fields keep their defaults.
    /// Durations are given in milliseconds.
    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        let raw: RawSettings = serde_json::from_str(json)?;
        raw.validate()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawSettings {
    limiter: RawLimiter,
    leaky_bucket: RawLeakyBucket,
    flow_control: RawFlowControl,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawLimiter {
    refill_rate: Option<f64>,
    capacity: Option<f64>,
    cleanup_interval_ms: Option<u64>,
    staleness_ms: Option<u64>,
    shards: Option<usize>,
    proxy_trust: Option<ProxyTrust>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawLeakyBucket {
    capacity: Option<usize>,
    rate_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawFlowControl {
    quota: Option<u32>,
    window_ms: Option<u64>,
    call_timeout_ms: Option<u64>,
    failure_policy: Option<FailurePolicy>,
}

impl RawSettings {
    fn validate(self) -> Result<Settings, SettingsError> {
        let defaults = Settings::default();

        let l = self.limiter;
        let limiter = LimiterConfig::new(
            l.refill_rate.unwrap_or(defaults.limiter.refill_rate()),
            l.capacity.unwrap_or(defaults.limiter.capacity()),
        )?
        .with_cleanup(
            l.cleanup_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.limiter.cleanup_interval()),
            l.staleness_ms.map(Duration::from_millis).unwrap_or(defaults.limiter.staleness()),
        )?
        .with_shards(l.shards.unwrap_or(defaults.limiter.shards()))?
        .with_proxy_trust(l.proxy_trust.unwrap_or_default());

        let b = self.leaky_bucket;
        let leaky_bucket = LeakyBucketConfig::new(
            b.capacity.unwrap_or(defaults.leaky_bucket.capacity()),
            b.rate_ms.map(Duration::from_millis).unwrap_or(defaults.leaky_bucket.rate()),
        )?;

        let f = self.flow_control;
        let flow_control = FlowControlConfig::new(
            f.quota.unwrap_or(defaults.flow_control.quota()),
            f.window_ms.map(Duration::from_millis).unwrap_or(defaults.flow_control.window()),
        )?
        .with_call_timeout(
            f.call_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.flow_control.call_timeout()),
        )?
        .with_failure_policy(f.failure_policy.unwrap_or_default());

        Ok(Settings { limiter, leaky_bucket, flow_control })
    }
}
