//! Error types.
//!
//! Admission denial is deliberately absent: a denied request is a
//! [`Decision`](crate::rate_limit::Decision), not an error.

use std::time::Duration;

/// Rejections from [`QueuedLeakyBucket::add_task`](crate::QueuedLeakyBucket::add_task).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakyBucketError {
    /// The queue already holds `capacity` pending tasks.
    #[error("bucket is full ({capacity} pending tasks)")]
    BucketFull {
        /// Configured queue bound.
        capacity: usize,
    },
    /// The drain loop was stopped; no more tasks are accepted.
    #[error("bucket is stopped")]
    Stopped,
}

impl LeakyBucketError {
    /// True for the backpressure case, false once the bucket is stopped.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::BucketFull { .. })
    }
}

/// Invalid configuration values.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Refill rate must be finite and non-negative.
    #[error("refill_rate must be finite and >= 0 (got {provided})")]
    InvalidRefillRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// Capacity must be finite and non-negative.
    #[error("capacity must be finite and >= 0 (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: f64,
    },
    /// A period that drives a loop must be non-zero.
    #[error("{field} must be > 0")]
    ZeroDuration {
        /// Name of the offending field.
        field: &'static str,
    },
    /// A count that bounds a queue, window or shard set must be non-zero.
    #[error("{field} must be > 0")]
    ZeroCount {
        /// Name of the offending field.
        field: &'static str,
    },
}

/// Failure to load [`Settings`](crate::config::Settings).
#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    /// The document is not valid JSON for the settings schema.
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
    /// The document parsed but a value is out of range.
    #[error("invalid settings: {0}")]
    Invalid(#[from] ConfigError),
}

/// Failures of the external classification call.
///
/// None of these are retried by the consumer; see
/// [`FailurePolicy`](crate::config::FailurePolicy).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifierError {
    /// Network or client-side failure before a response arrived.
    #[error("transport error: {0}")]
    Transport(String),
    /// The service answered with a non-success status.
    #[error("classifier returned status {status}")]
    Status {
        /// HTTP-like status code.
        status: u16,
    },
    /// The service answered but the payload was not a verdict.
    #[error("malformed classifier response: {0}")]
    MalformedResponse(String),
    /// The call did not finish within the configured timeout.
    #[error("classifier call timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure to settle (ack or reject) a queue delivery.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("queue error: {0}")]
pub struct QueueError(pub String);
