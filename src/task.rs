//! Owned handles for the long-lived loops (janitor, drain ticker, consumer).
//!
//! Every loop is started by the component that owns it and is given a
//! [`StopSignal`]. Dropping or stopping the [`BackgroundTask`] flips the
//! signal; loops check it at each suspension point, so they exit within one
//! period.

use std::future::Future;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Receiving half of a stop request.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Completes once stop has been requested (or the owner is gone).
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    /// Non-blocking check.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }
}

/// A spawned loop plus the means to stop it.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    /// Spawn `body` on the current tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, rx) = watch::channel(false);
        let handle = tokio::spawn(body(StopSignal { rx }));
        tracing::debug!(target: "floodgate::task", task = name, "background task started");
        Self { name, stop, handle: Mutex::new(Some(handle)) }
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the loop to exit. Calling it again is a no-op.
    pub fn stop(&self) {
        let already = self.stop.send_replace(true);
        if !already {
            tracing::debug!(target: "floodgate::task", task = self.name, "stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// True once the loop has returned (or was already joined).
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .expect("task handle poisoned")
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// A panic inside the loop is re-raised here rather than swallowed.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().expect("task handle poisoned").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
            }
            tracing::debug!(target: "floodgate::task", task = self.name, "background task joined");
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn ticking(
        counter: Arc<AtomicUsize>,
    ) -> impl FnOnce(StopSignal) -> futures::future::BoxFuture<'static, ()> {
        move |mut stop| {
            Box::pin(async move {
                loop {
                    tokio::select! {
                        _ = stop.stopped() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_joins_the_loop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::spawn("ticker", ticking(counter.clone()));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        task.shutdown().await;

        assert!(task.is_finished());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let task = BackgroundTask::spawn("ticker", ticking(Arc::new(AtomicUsize::new(0))));
        task.stop();
        task.stop();
        assert!(task.is_stopped());
        task.shutdown().await;
        task.shutdown().await;
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_loop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::spawn("ticker", ticking(counter.clone()));
        drop(task);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "sweep exploded")]
    async fn shutdown_resurfaces_panics() {
        let task = BackgroundTask::spawn("boom", |_stop| async { panic!("sweep exploded") });
        task.shutdown().await;
    }
}
