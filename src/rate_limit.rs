//! Per-client admission control.
//!
//! - [`TokenBucket`](token_bucket::TokenBucket): the per-client arithmetic.
//! - [`ClientLimiterRegistry`](registry::ClientLimiterRegistry): key → bucket map with a janitor.
//! - [`AdmissionLayer`](middleware::AdmissionLayer): tower middleware answering 429 on denial.
//! - [`ClientKeyExtractor`](key::ClientKeyExtractor): who is calling.
//!
//! # Architecture
//!
//! The middleware does not know how limiting works, only that it should ask a
//! [`KeyedLimiter`] about the caller's key. The registry is the production
//! implementation; tests can substitute anything that returns a [`Decision`].

use std::time::Duration;

pub mod key;
pub mod middleware;
pub mod registry;
pub mod token_bucket;

pub use key::{ClientKeyExtractor, PeerAddr, ProxyTrust};
pub use middleware::{AdmissionController, AdmissionLayer, AdmissionService};
pub use registry::ClientLimiterRegistry;
pub use token_bucket::TokenBucket;

/// The decision returned by a limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Tokens left after this admission.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: f64,
    },
    /// The request is rejected.
    Denied {
        /// How long until one whole token is back.
        /// Useful for `Retry-After` headers.
        wait: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Admission keyed by client identity.
///
/// Implementations must not block: the answer is immediate.
pub trait KeyedLimiter: Send + Sync {
    /// Consume one unit for `key` if possible.
    fn check(&self, key: &str) -> Decision;
}

impl<L: KeyedLimiter + ?Sized> KeyedLimiter for std::sync::Arc<L> {
    fn check(&self, key: &str) -> Decision {
        (**self).check(key)
    }
}
