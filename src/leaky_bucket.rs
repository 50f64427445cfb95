//! Leaky bucket as a task queue.
//!
//! Instead of rejecting work outright, callers enqueue [`Task`]s into a
//! bounded FIFO that a background loop drains at a fixed cadence: one task per
//! tick. Only when the queue is full does [`QueuedLeakyBucket::add_task`]
//! push back with [`LeakyBucketError::BucketFull`].
//!
//! ```
//! use floodgate::{LeakyBucketConfig, QueuedLeakyBucket, Task};
//! use std::time::Duration;
//!
//! # #[tokio::main] async fn main() {
//! let config = LeakyBucketConfig::new(2, Duration::from_millis(10)).unwrap();
//! let bucket = QueuedLeakyBucket::start(config, |task: Task<&'static str>| async move {
//!     println!("processing {}", task.payload);
//!     Ok::<_, std::io::Error>(())
//! });
//! bucket.add_task(Task::new("resize")).unwrap();
//! bucket.shutdown().await;
//! # }
//! ```

use crate::config::LeakyBucketConfig;
use crate::error::LeakyBucketError;
use crate::task::BackgroundTask;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq)]
pub struct Task<T> {
    pub id: String,
    pub payload: T,
    /// When the task was created.
    pub timestamp: SystemTime,
}

impl<T> Task<T> {
    /// Task with a random UUID id.
    pub fn new(payload: T) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn with_id(id: impl Into<String>, payload: T) -> Self {
        Self { id: id.into(), payload, timestamp: SystemTime::now() }
    }
}

struct Shared<T> {
    queue: Mutex<VecDeque<Task<T>>>,
    capacity: usize,
    stopped: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl<T> Shared<T> {
    fn pop(&self) -> Option<Task<T>> {
        self.queue.lock().expect("leaky bucket queue poisoned").pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().expect("leaky bucket queue poisoned").len()
    }
}

/// Bounded FIFO drained at a fixed rate by a caller-supplied processor.
pub struct QueuedLeakyBucket<T> {
    shared: Arc<Shared<T>>,
    rate: Duration,
    worker: BackgroundTask,
}

impl<T> fmt::Debug for QueuedLeakyBucket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedLeakyBucket")
            .field("capacity", &self.shared.capacity)
            .field("rate", &self.rate)
            .field("queued", &self.shared.len())
            .field("stopped", &self.shared.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Send + 'static> QueuedLeakyBucket<T> {
    /// Create an empty bucket and start draining it.
    ///
    /// The first tick fires one `rate` after start. On each tick at most one
    /// task is popped and handed to `processor`; a processor error is logged
    /// and the loop carries on. Requires a tokio runtime.
    pub fn start<F, Fut, E>(config: LeakyBucketConfig, processor: F) -> Self
    where
        F: Fn(Task<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity())),
            capacity: config.capacity(),
            stopped: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let rate = config.rate();
        let drain = shared.clone();

        let worker = BackgroundTask::spawn("leaky-bucket", move |mut stop| async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + rate, rate);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.stopped() => break,
                    _ = ticker.tick() => {
                        let Some(task) = drain.pop() else { continue };
                        let id = task.id.clone();
                        match processor(task).await {
                            Ok(()) => {
                                drain.processed.fetch_add(1, Ordering::Relaxed);
                                debug!(
                                    target: "floodgate::leaky_bucket",
                                    task_id = %id,
                                    "task processed"
                                );
                            }
                            Err(e) => {
                                drain.failed.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    target: "floodgate::leaky_bucket",
                                    task_id = %id,
                                    error = %e,
                                    "task failed"
                                );
                            }
                        }
                    }
                }
            }
            debug!(target: "floodgate::leaky_bucket", "drain loop stopped");
        });

        Self { shared, rate, worker }
    }
}

impl<T> QueuedLeakyBucket<T> {
    /// Append `task` to the tail. Never blocks.
    pub fn add_task(&self, task: Task<T>) -> Result<(), LeakyBucketError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(LeakyBucketError::Stopped);
        }
        let mut queue = self.shared.queue.lock().expect("leaky bucket queue poisoned");
        if queue.len() >= self.shared.capacity {
            return Err(LeakyBucketError::BucketFull { capacity: self.shared.capacity });
        }
        queue.push_back(task);
        Ok(())
    }

    /// Halt the drain loop. Tasks still queued are left unprocessed.
    /// Further calls are no-ops.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.worker.stop();
    }

    /// Stop and wait for the drain loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        self.worker.shutdown().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub fn queue_size(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue_size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.queue_size() >= self.shared.capacity
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn rate(&self) -> Duration {
        self.rate
    }

    /// Tasks whose processor returned `Ok`.
    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Tasks whose processor returned an error.
    pub fn failed_count(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }
}

impl<T> Drop for QueuedLeakyBucket<T> {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
    }
}
