//! Queue boundary: where messages come from and how they are settled.

use crate::error::QueueError;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// One message taken off a queue, awaiting settlement.
#[async_trait]
pub trait Delivery: Send + 'static {
    /// Raw message bytes.
    fn body(&self) -> &[u8];

    /// Mark the message as handled.
    async fn ack(&mut self) -> Result<(), QueueError>;

    /// Give the message back. With `requeue` the broker redelivers it later;
    /// without, it is discarded (or dead-lettered).
    async fn reject(&mut self, requeue: bool) -> Result<(), QueueError>;
}

/// A stream of deliveries. `None` means the source is closed for good.
#[async_trait]
pub trait MessageSource: Send {
    type Delivery: Delivery;

    async fn next(&mut self) -> Option<Self::Delivery>;
}

/// How a [`ChannelDelivery`] was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Requeued,
    Rejected,
}

/// In-process queue backed by a bounded tokio mpsc channel.
///
/// Requeued deliveries, and deliveries dropped without being settled, go
/// back onto the same channel while any [`ChannelPublisher`] is alive.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<ChannelDelivery>,
}

/// Publishing half of a [`ChannelSource`]. The source closes once every
/// publisher is dropped and the buffer is drained.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<ChannelDelivery>,
}

impl ChannelSource {
    /// A source holding up to `buffer` unconsumed messages.
    pub fn new(buffer: usize) -> (ChannelPublisher, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (ChannelPublisher { tx }, Self { rx })
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    type Delivery = ChannelDelivery;

    async fn next(&mut self) -> Option<ChannelDelivery> {
        self.rx.recv().await
    }
}

impl ChannelPublisher {
    /// Enqueue `body`, waiting for buffer space.
    pub async fn publish(&self, body: impl Into<Vec<u8>>) -> Result<DeliveryReceipt, QueueError> {
        let (delivery, receipt) = ChannelDelivery::new(body.into(), false, self.tx.downgrade());
        self.tx
            .send(delivery)
            .await
            .map_err(|_| QueueError("channel source is closed".into()))?;
        Ok(receipt)
    }

    /// Serialize `message` as JSON and enqueue it.
    pub async fn publish_json<T: serde::Serialize>(
        &self,
        message: &T,
    ) -> Result<DeliveryReceipt, QueueError> {
        let body = serde_json::to_vec(message).map_err(|e| QueueError(e.to_string()))?;
        self.publish(body).await
    }
}

/// Resolves to the [`DeliveryOutcome`] of one published message.
#[derive(Debug)]
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryReceipt {
    /// `None` if the delivery was dropped without being settled.
    pub async fn outcome(self) -> Option<DeliveryOutcome> {
        self.rx.await.ok()
    }
}

/// A message from a [`ChannelSource`].
#[derive(Debug)]
pub struct ChannelDelivery {
    body: Vec<u8>,
    redelivered: bool,
    settle: Option<oneshot::Sender<DeliveryOutcome>>,
    requeue_to: mpsc::WeakSender<ChannelDelivery>,
}

impl ChannelDelivery {
    fn new(
        body: Vec<u8>,
        redelivered: bool,
        requeue_to: mpsc::WeakSender<ChannelDelivery>,
    ) -> (Self, DeliveryReceipt) {
        let (settle, rx) = oneshot::channel();
        (Self { body, redelivered, settle: Some(settle), requeue_to }, DeliveryReceipt { rx })
    }

    /// True when this message was requeued at least once before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Put a copy of this message back on the channel, marked redelivered.
    fn redeliver(&mut self) -> Result<(), QueueError> {
        let Some(tx) = self.requeue_to.upgrade() else {
            return Err(QueueError("no publisher left to requeue to".into()));
        };
        let (again, _receipt) =
            ChannelDelivery::new(std::mem::take(&mut self.body), true, self.requeue_to.clone());
        tx.try_send(again).map_err(|e| {
            let reason = e.to_string();
            // The copy never reached the channel; it must not requeue itself on drop.
            e.into_inner().settle = None;
            QueueError(format!("requeue failed: {reason}"))
        })
    }

    fn settle(&mut self, outcome: DeliveryOutcome) -> Result<(), QueueError> {
        let settle =
            self.settle.take().ok_or_else(|| QueueError("delivery already settled".into()))?;
        // The publisher may have discarded the receipt.
        let _ = settle.send(outcome);
        Ok(())
    }
}

#[async_trait]
impl Delivery for ChannelDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(&mut self) -> Result<(), QueueError> {
        self.settle(DeliveryOutcome::Acked)
    }

    async fn reject(&mut self, requeue: bool) -> Result<(), QueueError> {
        if !requeue {
            return self.settle(DeliveryOutcome::Rejected);
        }
        self.settle(DeliveryOutcome::Requeued)?;
        self.redeliver()
    }
}

/// A delivery dropped without ack or reject goes back on the channel, as an
/// unacknowledged message would on a broker. Its receipt resolves to `None`.
impl Drop for ChannelDelivery {
    fn drop(&mut self) {
        if self.settle.take().is_none() {
            return;
        }
        match self.redeliver() {
            Ok(()) => debug!(target: "floodgate::consumer", "unsettled delivery requeued"),
            Err(e) => debug!(target: "floodgate::consumer", error = %e, "unsettled delivery lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_then_closes() {
        let (publisher, mut source) = ChannelSource::new(4);
        publisher.publish("a").await.unwrap();
        publisher.publish("b").await.unwrap();
        drop(publisher);

        assert_eq!(source.next().await.unwrap().body(), b"a");
        assert_eq!(source.next().await.unwrap().body(), b"b");
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn receipt_reports_ack_and_reject() {
        let (publisher, mut source) = ChannelSource::new(4);
        let first = publisher.publish("1").await.unwrap();
        let second = publisher.publish("2").await.unwrap();

        source.next().await.unwrap().ack().await.unwrap();
        source.next().await.unwrap().reject(false).await.unwrap();

        assert_eq!(first.outcome().await, Some(DeliveryOutcome::Acked));
        assert_eq!(second.outcome().await, Some(DeliveryOutcome::Rejected));
    }

    #[tokio::test]
    async fn double_settle_is_an_error() {
        let (publisher, mut source) = ChannelSource::new(1);
        publisher.publish("x").await.unwrap();
        let mut d = source.next().await.unwrap();
        d.ack().await.unwrap();
        assert!(d.ack().await.is_err());
    }

    #[tokio::test]
    async fn requeue_redelivers_while_publishers_live() {
        let (publisher, mut source) = ChannelSource::new(2);
        let receipt = publisher.publish("again").await.unwrap();

        let mut d = source.next().await.unwrap();
        assert!(!d.redelivered());
        d.reject(true).await.unwrap();
        assert_eq!(receipt.outcome().await, Some(DeliveryOutcome::Requeued));

        let again = source.next().await.unwrap();
        assert!(again.redelivered());
        assert_eq!(again.body(), b"again");
    }

    #[tokio::test]
    async fn requeue_without_publisher_fails() {
        let (publisher, mut source) = ChannelSource::new(1);
        publisher.publish("x").await.unwrap();
        drop(publisher);
        let mut d = source.next().await.unwrap();
        assert!(d.reject(true).await.is_err());
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let (publisher, mut source) = ChannelSource::new(1);
        let receipt = publisher.publish("x").await.unwrap();
        drop(source.next().await.unwrap());
        assert_eq!(receipt.outcome().await, None);

        let again = source.next().await.unwrap();
        assert!(again.redelivered());
        assert_eq!(again.body(), b"x");
    }

    #[tokio::test]
    async fn dropped_delivery_without_publisher_is_lost() {
        let (publisher, mut source) = ChannelSource::new(1);
        publisher.publish("x").await.unwrap();
        drop(publisher);
        drop(source.next().await.unwrap());
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_delivery_into_full_channel_is_lost() {
        let (publisher, mut source) = ChannelSource::new(1);
        publisher.publish("first").await.unwrap();
        let first = source.next().await.unwrap();
        publisher.publish("second").await.unwrap();

        drop(first);
        assert_eq!(source.next().await.unwrap().body(), b"second");
        drop(publisher);
        // "second" was redelivered on drop above; nothing else remains.
        assert_eq!(source.next().await.unwrap().body(), b"second");
        assert!(source.next().await.is_none());
    }
}
