#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # floodgate
//!
//! Rate limiting, admission control and flow control for async services.
//!
//! ## Features
//!
//! - **Per-client token buckets** behind a tower middleware that answers
//!   `429 Too Many Requests`, with a janitor that forgets idle clients
//! - **Leaky bucket task queue**: a bounded FIFO drained at a fixed cadence
//! - **Flow-controlled consumer** that paces calls to a quota-limited
//!   dependency, sleeping through the window instead of failing
//! - **Deterministic testing** via injectable clocks and sleepers
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::{AdmissionController, LimiterConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = LimiterConfig::new(20.0, 5.0).unwrap();
//!     let controller = AdmissionController::start(config);
//!
//!     // Wrap your service: `ServiceBuilder::new().layer(controller.layer()).service(app)`
//!     let _layer = controller.layer();
//!
//!     controller.shutdown().await;
//! }
//! ```

pub mod clock;
pub mod config;
pub mod consumer;
pub mod error;
pub mod flow_control;
pub mod leaky_bucket;
pub mod prelude;
pub mod rate_limit;
pub mod sleeper;
pub mod task;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use config::{FailurePolicy, FlowControlConfig, LeakyBucketConfig, LimiterConfig, Settings};
pub use consumer::{ConsumerHandle, ConsumerState, ConsumerStats, FlowControlledConsumer};
pub use error::{ClassifierError, ConfigError, LeakyBucketError, QueueError, SettingsError};
pub use flow_control::CallWindow;
pub use leaky_bucket::{QueuedLeakyBucket, Task};
pub use rate_limit::{
    AdmissionController, AdmissionLayer, AdmissionService, ClientKeyExtractor,
    ClientLimiterRegistry, Decision, KeyedLimiter, PeerAddr, ProxyTrust, TokenBucket,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use task::{BackgroundTask, StopSignal};
