//! Injecting messages into a running broker from outside its connection
//! set.
//!
//! Every strategy ends at the same place: the topic dispatcher, running the
//! topic's `on_publish` hook and fanning the event out, exactly as for a
//! `PUBLISH` frame.
//!
//! - [`BrokerHandle`] pushes in-process, over the event loop's command
//!   queue.
//! - [`PeerPusher`] connects to the broker's own WebSocket listener as the
//!   trusted internal peer, and sends ordinary `PUBLISH` frames.
//! - [`QueueConsumer`] drains an external [`MessageQueue`], and pushes each
//!   delivery through a [`BrokerHandle`].

mod peer;
pub use peer::{Backoff, PeerPusher};

mod queue;
pub use queue::{ChannelQueue, ChannelQueueProducer, Delivery, MessageQueue, QueueConsumer};

use crate::{error::PushError, primitives::ConnectionId, BrokerHandle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

/// A message injected from outside the connection set.
///
/// This is also the envelope consumed from queues:
/// `{"topic": "...", "payload": ..., "exclude": [id], "eligible": [id]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Target topic URI.
    pub topic: String,
    /// Event payload.
    pub payload: Value,
    /// Connections that must not receive the event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<ConnectionId>,
    /// If present, only these connections receive the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligible: Option<Vec<ConnectionId>>,
}

impl PushMessage {
    /// Create a message for every subscriber of `topic`.
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            exclude: Vec::new(),
            eligible: None,
        }
    }

    /// Skip these connections.
    pub fn with_exclude(mut self, exclude: impl IntoIterator<Item = ConnectionId>) -> Self {
        self.exclude = exclude.into_iter().collect();
        self
    }

    /// Only deliver to these connections.
    pub fn with_eligible(mut self, eligible: impl IntoIterator<Item = ConnectionId>) -> Self {
        self.eligible = Some(eligible.into_iter().collect());
        self
    }
}

/// A way of getting a [`PushMessage`] to the broker.
pub trait Pusher: Send + Sync {
    /// Push a message. Pushing to a topic without subscribers succeeds and
    /// delivers nothing.
    fn push(&self, msg: PushMessage) -> impl Future<Output = Result<(), PushError>> + Send;
}

impl Pusher for BrokerHandle {
    async fn push(&self, msg: PushMessage) -> Result<(), PushError> {
        self.publish(msg).await.map(drop)
    }
}
