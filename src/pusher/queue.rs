use crate::{
    error::{PushError, TopicError},
    pusher::PushMessage,
    BrokerHandle,
};
use bytes::Bytes;
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// A message taken from a queue, awaiting ack or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue-assigned delivery tag.
    pub tag: u64,
    /// Raw message body.
    pub body: Bytes,
    /// True if the queue has delivered this message before.
    pub redelivered: bool,
}

/// An external message queue, seen from a consumer.
pub trait MessageQueue: Send {
    /// Wait for the next delivery. `None` once the queue is closed.
    fn next(&mut self) -> impl Future<Output = Option<Delivery>> + Send;

    /// Acknowledge a delivery, removing it from the queue.
    fn ack(&mut self, tag: u64) -> impl Future<Output = ()> + Send;

    /// Reject a delivery. With `requeue`, it will be delivered again.
    /// Without, it is dead-lettered.
    fn reject(&mut self, tag: u64, requeue: bool) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Default)]
struct Ledger {
    acked: Vec<u64>,
    dead_letters: Vec<Bytes>,
}

/// An in-process [`MessageQueue`], fed by a [`ChannelQueueProducer`].
#[derive(Debug)]
pub struct ChannelQueue {
    rx: mpsc::UnboundedReceiver<Delivery>,
    requeued: VecDeque<Delivery>,
    in_flight: HashMap<u64, Delivery>,
    ledger: Arc<Mutex<Ledger>>,
}

/// The producing side of a [`ChannelQueue`]. It also records what happened
/// to each message.
#[derive(Debug, Clone)]
pub struct ChannelQueueProducer {
    tx: mpsc::UnboundedSender<Delivery>,
    next_tag: Arc<AtomicU64>,
    ledger: Arc<Mutex<Ledger>>,
}

impl ChannelQueue {
    /// Create a queue and its producer. The queue closes when every producer
    /// has been dropped.
    pub fn new() -> (Self, ChannelQueueProducer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ledger = Arc::<Mutex<Ledger>>::default();
        let queue = Self {
            rx,
            requeued: VecDeque::new(),
            in_flight: HashMap::new(),
            ledger: ledger.clone(),
        };
        let producer = ChannelQueueProducer {
            tx,
            next_tag: Arc::new(AtomicU64::new(1)),
            ledger,
        };
        (queue, producer)
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageQueue for ChannelQueue {
    async fn next(&mut self) -> Option<Delivery> {
        let delivery = match self.requeued.pop_front() {
            Some(delivery) => delivery,
            None => self.rx.recv().await?,
        };
        self.in_flight.insert(delivery.tag, delivery.clone());
        Some(delivery)
    }

    async fn ack(&mut self, tag: u64) {
        if self.in_flight.remove(&tag).is_some() {
            self.ledger().acked.push(tag);
        }
    }

    async fn reject(&mut self, tag: u64, requeue: bool) {
        let Some(mut delivery) = self.in_flight.remove(&tag) else {
            return;
        };
        if requeue {
            delivery.redelivered = true;
            self.requeued.push_back(delivery);
        } else {
            self.ledger().dead_letters.push(delivery.body);
        }
    }
}

impl ChannelQueueProducer {
    /// Enqueue a raw body. Returns the delivery tag, or `None` if the queue
    /// has been dropped.
    pub fn publish(&self, body: impl Into<Bytes>) -> Option<u64> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Delivery {
                tag,
                body: body.into(),
                redelivered: false,
            })
            .ok()
            .map(|_| tag)
    }

    /// Enqueue a [`PushMessage`] envelope.
    pub fn publish_message(&self, msg: &PushMessage) -> Result<Option<u64>, PushError> {
        Ok(self.publish(serde_json::to_vec(msg)?))
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tags acknowledged so far, in order.
    pub fn acked(&self) -> Vec<u64> {
        self.ledger().acked.clone()
    }

    /// Bodies rejected without requeue, in order.
    pub fn dead_letters(&self) -> Vec<Bytes> {
        self.ledger().dead_letters.clone()
    }
}

/// Consumes [`PushMessage`] envelopes from a [`MessageQueue`] and publishes
/// them through a [`BrokerHandle`].
///
/// Acknowledgement follows the outcome of the publish:
/// - delivered (including to no one): ack;
/// - undecodable envelope, or a publish vetoed by the topic handler: reject
///   without requeue;
/// - handler failure: requeue once, then dead-letter;
/// - broker shut down: requeue, and stop consuming.
#[derive(Debug)]
pub struct QueueConsumer<Q> {
    queue: Q,
    broker: BrokerHandle,
}

impl<Q: MessageQueue> QueueConsumer<Q> {
    /// Create a consumer.
    pub const fn new(queue: Q, broker: BrokerHandle) -> Self {
        Self { queue, broker }
    }

    /// Consume until the queue closes or the broker shuts down. Returns the
    /// queue.
    #[instrument(name = "QueueConsumer", skip_all)]
    pub async fn run(mut self) -> Q {
        while let Some(delivery) = self.queue.next().await {
            if self.process(delivery).await.is_break() {
                debug!("broker has shut down, stopping");
                break;
            }
        }
        self.queue
    }

    /// Handle one delivery.
    pub async fn process(&mut self, delivery: Delivery) -> ControlFlow<()> {
        let msg: PushMessage = match serde_json::from_slice(&delivery.body) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, tag = delivery.tag, "invalid queue envelope, dead-lettering");
                crate::metrics::record_push("queue", "invalid");
                self.queue.reject(delivery.tag, false).await;
                return ControlFlow::Continue(());
            }
        };

        let topic = msg.topic.clone();
        match self.broker.publish(msg).await {
            Ok(delivered) => {
                debug!(%topic, delivered, tag = delivery.tag, "queue message published");
                crate::metrics::record_push("queue", "delivered");
                self.queue.ack(delivery.tag).await;
            }
            Err(PushError::Rejected(TopicError::HandlerFailure(reason))) => {
                let requeue = !delivery.redelivered;
                warn!(%topic, %reason, requeue, "topic handler failed");
                crate::metrics::record_push("queue", "failed");
                self.queue.reject(delivery.tag, requeue).await;
            }
            Err(PushError::BrokerClosed) => {
                self.queue.reject(delivery.tag, true).await;
                return ControlFlow::Break(());
            }
            Err(err) => {
                warn!(%topic, %err, "queue message rejected");
                crate::metrics::record_push("queue", "rejected");
                self.queue.reject(delivery.tag, false).await;
            }
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn requeued_deliveries_come_back_marked() {
        let (mut queue, producer) = ChannelQueue::new();
        let tag = producer.publish("a").unwrap();

        let first = queue.next().await.unwrap();
        assert!(!first.redelivered);
        queue.reject(tag, true).await;

        let second = queue.next().await.unwrap();
        assert_eq!(second.tag, tag);
        assert!(second.redelivered);
        queue.reject(tag, false).await;

        assert_eq!(producer.dead_letters(), vec![Bytes::from("a")]);
        drop(producer);
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn consumer_requeues_when_the_broker_is_gone() {
        let (queue, producer) = ChannelQueue::new();
        producer
            .publish_message(&PushMessage::new("/t", serde_json::json!(1)))
            .unwrap();
        producer.publish("not json").unwrap();

        let mut consumer = QueueConsumer::new(queue, BrokerHandle::detached());
        let delivery = consumer.queue.next().await.unwrap();
        assert!(consumer.process(delivery).await.is_break());

        // the first message is requeued, ahead of the rest
        let delivery = consumer.queue.next().await.unwrap();
        assert!(delivery.redelivered);

        // the undecodable message never reaches the broker
        let delivery = consumer.queue.next().await.unwrap();
        assert_eq!(delivery.body, Bytes::from("not json"));
        assert!(consumer.process(delivery).await.is_continue());
        assert_eq!(producer.dead_letters(), vec![Bytes::from("not json")]);
        assert!(producer.acked().is_empty());
    }
}
