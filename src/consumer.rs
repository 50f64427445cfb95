//! Flow-controlled queue consumer.
//!
//! [`FlowControlledConsumer`] drains a [`MessageSource`] one message at a time
//! and forwards each request to a [`Classifier`] whose provider enforces a
//! quota of N calls per window. The consumer paces itself with a
//! [`CallWindow`]: when the quota is spent it sleeps until the window closes
//! rather than letting calls fail upstream.
//!
//! ```no_run
//! use floodgate::consumer::{ChannelSource, FlowControlledConsumer};
//! use floodgate::consumer::{Classifier, ModerationRequest, ModerationVerdict};
//! use floodgate::{ClassifierError, FlowControlConfig};
//!
//! struct AlwaysSafe;
//!
//! #[async_trait::async_trait]
//! impl Classifier for AlwaysSafe {
//!     async fn classify(
//!         &self,
//!         _: &ModerationRequest,
//!     ) -> Result<ModerationVerdict, ClassifierError> {
//!         Ok(ModerationVerdict { safe: true, reason: String::new(), caption: String::new() })
//!     }
//! }
//!
//! # #[tokio::main] async fn main() {
//! let (publisher, source) = ChannelSource::new(64);
//! let config = FlowControlConfig::default();
//! let handle = FlowControlledConsumer::new(source, AlwaysSafe, config).spawn();
//! publisher.publish_json(&ModerationRequest::new("cat.png", ["cat"])).await.unwrap();
//! let stats = handle.shutdown().await;
//! # let _ = stats;
//! # }
//! ```

pub mod classifier;
pub mod message;
pub mod source;

pub use classifier::{Classifier, LogVerdicts, VerdictHandler};
pub use message::{ModerationRequest, ModerationVerdict};
pub use source::{
    ChannelDelivery, ChannelPublisher, ChannelSource, Delivery, DeliveryOutcome, DeliveryReceipt,
    MessageSource,
};

use crate::clock::Clock;
use crate::config::{FailurePolicy, FlowControlConfig};
use crate::error::ClassifierError;
use crate::flow_control::CallWindow;
use crate::sleeper::Sleeper;
use crate::task::{BackgroundTask, StopSignal};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where the consumer loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Pulling and processing messages.
    Draining,
    /// Quota spent; sleeping until the window closes.
    Throttled,
    /// The source closed or a stop was requested.
    Stopped,
}

/// Counters accumulated over a consumer's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries taken off the source.
    pub received: u64,
    /// Deliveries that did not parse as a [`ModerationRequest`].
    pub malformed: u64,
    /// Classifier calls that produced a verdict.
    pub classified: u64,
    /// Classifier calls that failed or timed out.
    pub failed: u64,
    /// Failed messages handed back for redelivery.
    pub requeued: u64,
    /// Times the consumer slept because the quota was spent.
    pub throttled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    classified: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    throttled: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            classified: self.classified.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
        }
    }
}

/// Sequential consumer pacing its classifier calls through a [`CallWindow`].
pub struct FlowControlledConsumer<S, C, H = LogVerdicts> {
    source: S,
    classifier: C,
    handler: H,
    window: CallWindow,
    config: FlowControlConfig,
    state: watch::Sender<ConsumerState>,
    counters: Arc<Counters>,
}

impl<S, C> FlowControlledConsumer<S, C, LogVerdicts>
where
    S: MessageSource,
    C: Classifier,
{
    /// Consumer that logs verdicts. Use [`with_handler`](Self::with_handler)
    /// to act on them.
    pub fn new(source: S, classifier: C, config: FlowControlConfig) -> Self {
        let (state, _) = watch::channel(ConsumerState::Draining);
        Self {
            source,
            classifier,
            handler: LogVerdicts,
            window: CallWindow::new(config.quota(), config.window()),
            config,
            state,
            counters: Arc::new(Counters::default()),
        }
    }
}

impl<S, C, H> FlowControlledConsumer<S, C, H>
where
    S: MessageSource,
    C: Classifier,
    H: VerdictHandler,
{
    pub fn with_handler<H2: VerdictHandler>(self, handler: H2) -> FlowControlledConsumer<S, C, H2> {
        FlowControlledConsumer {
            source: self.source,
            classifier: self.classifier,
            handler,
            window: self.window,
            config: self.config,
            state: self.state,
            counters: self.counters,
        }
    }

    /// Override the clock the window reads (useful for deterministic tests).
    pub fn with_clock<K: Clock + 'static>(mut self, clock: K) -> Self {
        self.window = self.window.with_clock(clock);
        self
    }

    /// Provide a custom sleeper for throttled pauses.
    pub fn with_sleeper<Z: Sleeper + 'static>(mut self, sleeper: Z) -> Self {
        self.window = self.window.with_sleeper(sleeper);
        self
    }

    pub fn config(&self) -> &FlowControlConfig {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Process messages until the source closes.
    pub async fn run(mut self) -> ConsumerStats {
        self.drive(None).await
    }

    async fn drive(&mut self, mut stop: Option<StopSignal>) -> ConsumerStats {
        self.set_state(ConsumerState::Draining);
        info!(
            target: "floodgate::consumer",
            quota = self.window.quota(),
            window = ?self.window.window(),
            failure_policy = ?self.config.failure_policy(),
            "consumer started"
        );

        loop {
            let delivery = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => {
                    info!(target: "floodgate::consumer", "stop requested");
                    break;
                }
                next = self.source.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        info!(target: "floodgate::consumer", "message source closed");
                        break;
                    }
                },
            };
            if self.process(delivery, &mut stop).await.is_break() {
                break;
            }
        }

        self.set_state(ConsumerState::Stopped);
        let stats = self.stats();
        info!(
            target: "floodgate::consumer",
            received = stats.received,
            classified = stats.classified,
            failed = stats.failed,
            malformed = stats.malformed,
            "consumer stopped"
        );
        stats
    }

    async fn process(
        &mut self,
        mut delivery: S::Delivery,
        stop: &mut Option<StopSignal>,
    ) -> ControlFlow<()> {
        Counters::bump(&self.counters.received);

        let request: ModerationRequest = match serde_json::from_slice(delivery.body()) {
            Ok(request) => request,
            Err(e) => {
                Counters::bump(&self.counters.malformed);
                error!(
                    target: "floodgate::consumer",
                    error = %e,
                    bytes = delivery.body().len(),
                    "failed to parse moderation request"
                );
                ack(&mut delivery).await;
                return ControlFlow::Continue(());
            }
        };

        if let Some(delay) = self.window.delay_before_next_call() {
            Counters::bump(&self.counters.throttled);
            self.set_state(ConsumerState::Throttled);
            info!(
                target: "floodgate::consumer",
                calls = self.window.count(),
                sleep = ?delay,
                "call quota reached, sleeping until the window closes"
            );
            tokio::select! {
                biased;
                _ = stop_requested(stop) => {
                    info!(
                        target: "floodgate::consumer",
                        name = %request.name,
                        "stopped while throttled, message left unacknowledged"
                    );
                    return ControlFlow::Break(());
                }
                _ = self.window.sleep(delay) => {}
            }
            info!(target: "floodgate::consumer", "woke up, starting a new window");
            self.set_state(ConsumerState::Draining);
        }
        self.window.record_call();

        info!(
            target: "floodgate::consumer",
            call = self.window.count(),
            quota = self.window.quota(),
            name = %request.name,
            tags = ?request.tags,
            "received moderation request"
        );

        let timeout = self.config.call_timeout();
        let result = match tokio::time::timeout(timeout, self.classifier.classify(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::Timeout(timeout)),
        };

        match result {
            Ok(verdict) => {
                Counters::bump(&self.counters.classified);
                self.handler.handle(&request, &verdict).await;
                ack(&mut delivery).await;
            }
            Err(e) => {
                Counters::bump(&self.counters.failed);
                error!(
                    target: "floodgate::consumer",
                    error = %e,
                    name = %request.name,
                    "classification failed"
                );
                match self.config.failure_policy() {
                    FailurePolicy::Drop => ack(&mut delivery).await,
                    FailurePolicy::Requeue => {
                        Counters::bump(&self.counters.requeued);
                        warn!(
                            target: "floodgate::consumer",
                            name = %request.name,
                            "requeueing message"
                        );
                        if let Err(e) = delivery.reject(true).await {
                            warn!(
                                target: "floodgate::consumer",
                                error = %e,
                                "failed to requeue message"
                            );
                        }
                    }
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn set_state(&self, next: ConsumerState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(target: "floodgate::consumer", from = ?prev, to = ?next, "state changed");
        }
    }
}

impl<S, C, H> FlowControlledConsumer<S, C, H>
where
    S: MessageSource + 'static,
    C: Classifier + 'static,
    H: VerdictHandler + 'static,
{
    /// Run the loop on its own task. Requires a tokio runtime.
    pub fn spawn(self) -> ConsumerHandle {
        let state = self.subscribe();
        let counters = self.counters.clone();
        let mut consumer = self;
        let task = BackgroundTask::spawn("consumer", move |stop| async move {
            consumer.drive(Some(stop)).await;
        });
        ConsumerHandle { task, state, counters }
    }
}

/// Owner of a spawned consumer loop.
#[derive(Debug)]
pub struct ConsumerHandle {
    task: BackgroundTask,
    state: watch::Receiver<ConsumerState>,
    counters: Arc<Counters>,
}

impl ConsumerHandle {
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Ask the loop to exit; it notices while waiting for a message or while
    /// throttled. A classifier call already in flight is allowed to finish.
    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop, wait for the loop to exit, and return the final counters.
    pub async fn shutdown(&self) -> ConsumerStats {
        self.task.shutdown().await;
        self.stats()
    }
}

async fn stop_requested(stop: &mut Option<StopSignal>) {
    match stop {
        Some(signal) => signal.stopped().await,
        None => std::future::pending().await,
    }
}

async fn ack<D: Delivery>(delivery: &mut D) {
    if let Err(e) = delivery.ack().await {
        warn!(target: "floodgate::consumer", error = %e, "failed to acknowledge message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sleeper::TrackingSleeper;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Classifier for Recording {
        async fn classify(
            &self,
            request: &ModerationRequest,
        ) -> Result<ModerationVerdict, ClassifierError> {
            self.seen.lock().unwrap().push(request.name.clone());
            Ok(ModerationVerdict {
                safe: true,
                reason: String::new(),
                caption: request.name.clone(),
            })
        }
    }

    fn config(quota: u32) -> FlowControlConfig {
        FlowControlConfig::new(quota, Duration::from_secs(60)).unwrap()
    }

    #[tokio::test]
    async fn malformed_messages_are_acked_without_spending_quota() {
        let (publisher, source) = ChannelSource::new(8);
        let bad = publisher.publish("not json").await.unwrap();
        let good = publisher.publish_json(&ModerationRequest::new("a", ["x"])).await.unwrap();
        drop(publisher);

        let clock = ManualClock::new();
        let sleeper = TrackingSleeper::advancing(clock.clone());
        let classifier = Arc::new(Recording::default());
        let stats = FlowControlledConsumer::new(source, classifier.clone(), config(1))
            .with_clock(clock)
            .with_sleeper(sleeper.clone())
            .run()
            .await;

        assert_eq!(bad.outcome().await, Some(DeliveryOutcome::Acked));
        assert_eq!(good.outcome().await, Some(DeliveryOutcome::Acked));
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.classified, 1);
        assert!(sleeper.calls().is_empty(), "the bad message must not count against the quota");
        assert_eq!(*classifier.seen.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn run_ends_in_stopped_state() {
        let (publisher, source) = ChannelSource::new(1);
        drop(publisher);
        let consumer = FlowControlledConsumer::new(source, Recording::default(), config(1));
        let mut states = consumer.subscribe();
        let stats = consumer.run().await;
        assert_eq!(stats, ConsumerStats::default());
        assert_eq!(*states.borrow_and_update(), ConsumerState::Stopped);
    }
}
