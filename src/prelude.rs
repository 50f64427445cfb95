//! Convenient re-exports for common floodgate types.
pub use crate::{
    config::{
        FailurePolicy, FlowControlConfig, LeakyBucketConfig, LimiterConfig, Settings,
        DEFAULT_CAPACITY, DEFAULT_QUOTA, DEFAULT_REFILL_RATE, DEFAULT_WINDOW,
    },
    consumer::{
        Classifier, ConsumerHandle, ConsumerState, ConsumerStats, Delivery, FlowControlledConsumer,
        MessageSource, ModerationRequest, ModerationVerdict, VerdictHandler,
    },
    error::{ClassifierError, ConfigError, LeakyBucketError},
    flow_control::CallWindow,
    leaky_bucket::{QueuedLeakyBucket, Task},
    rate_limit::{
        AdmissionController, AdmissionLayer, ClientKeyExtractor, ClientLimiterRegistry, Decision,
        KeyedLimiter, PeerAddr, ProxyTrust, TokenBucket,
    },
};
