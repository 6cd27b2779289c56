use crate::{
    error::{PushError, TopicError},
    primitives::ConnectionId,
    pusher::PushMessage,
    server::{Handshake, HandshakePolicy},
    tasks::TaskSet,
    types::{InboundFrame, ProtocolError},
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

/// Normal closure.
pub(crate) const CLOSE_NORMAL: u16 = 1000;
/// The broker is going away.
pub(crate) const CLOSE_GOING_AWAY: u16 = 1001;
/// The peer violated the protocol.
pub(crate) const CLOSE_PROTOCOL: u16 = 1002;

/// An item queued for a connection's write task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    /// A serialized frame.
    Text(Arc<str>),
    /// A keepalive ping.
    Ping,
    /// A close frame. Nothing is written after it.
    Close { code: u16, reason: &'static str },
}

/// Why a connection is being closed.
#[derive(Debug)]
pub(crate) enum CloseReason {
    /// The peer went away, or its socket failed.
    Disconnected,
    /// The peer sent a malformed frame.
    Protocol(ProtocolError),
    /// Closed through [`BrokerHandle::disconnect`].
    Forced,
    /// The broker is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Metric label for this reason.
    pub(crate) const fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Protocol(_) => "protocol",
            Self::Forced => "forced",
            Self::Shutdown => "shutdown",
        }
    }

    /// The close frame to send the peer, if it is still there to read it.
    pub(crate) fn close_frame(&self) -> Option<Outbound> {
        match self {
            Self::Disconnected => None,
            Self::Protocol(_) => Some(Outbound::Close {
                code: CLOSE_PROTOCOL,
                reason: "protocol error",
            }),
            Self::Forced => Some(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "closed by broker",
            }),
            Self::Shutdown => Some(Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: "broker shutting down",
            }),
        }
    }
}

/// Commands processed by the broker event loop.
#[derive(Debug)]
pub(crate) enum Command {
    /// A connection completed its handshake.
    Open {
        conn_id: ConnectionId,
        handshake: Handshake,
        outbound: mpsc::Sender<Outbound>,
        tasks: TaskSet,
    },
    /// A decoded frame, in receipt order.
    Frame {
        conn_id: ConnectionId,
        frame: InboundFrame,
    },
    /// A connection ended.
    Close {
        conn_id: ConnectionId,
        reason: CloseReason,
    },
    /// A message injected from outside the connection set.
    Push {
        msg: PushMessage,
        reply: oneshot::Sender<Result<usize, TopicError>>,
    },
    /// Ping every open connection.
    Keepalive,
    /// Report live counts.
    Stats { reply: oneshot::Sender<BrokerStats> },
    /// Force a connection closed.
    Disconnect { conn_id: ConnectionId },
    /// Describe open connections, optionally only those of one principal.
    Connections {
        principal: Option<String>,
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
}

/// A snapshot of the broker's live state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Open connections.
    pub connections: usize,
    /// Live topic instances.
    pub topics: usize,
}

/// An open connection, as reported by [`BrokerHandle::connections`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The connection id, also its WAMP session id.
    pub id: ConnectionId,
    /// The principal established at handshake, if any.
    pub principal: Option<String>,
    /// The `Origin` header sent at handshake, if any.
    pub origin: Option<String>,
    /// The remote socket address, if known.
    pub remote_addr: Option<SocketAddr>,
    /// Topics the connection is subscribed to, sorted.
    pub topics: Vec<String>,
}

/// State shared by the event loop, its handles and the listeners.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) policy: Arc<HandshakePolicy>,
    pub(crate) handshake_timeout: Duration,
    pub(crate) next_id: AtomicU64,
    pub(crate) outbound_buffer: usize,
    pub(crate) tasks: TaskSet,
}

impl Shared {
    pub(crate) fn new(
        policy: HandshakePolicy,
        handshake_timeout: Duration,
        outbound_buffer: usize,
        tasks: TaskSet,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            handshake_timeout,
            next_id: AtomicU64::new(1),
            outbound_buffer: outbound_buffer.max(1),
            tasks,
        }
    }
}

/// A cloneable handle to a running broker.
///
/// The handle is the only way into the event loop from other tasks. It is
/// given to RPC handlers and periodic tasks through their contexts, and
/// implements [`Pusher`] for in-process publishing.
///
/// [`Pusher`]: crate::Pusher
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    commands: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl BrokerHandle {
    pub(crate) const fn new(commands: mpsc::Sender<Command>, shared: Arc<Shared>) -> Self {
        Self { commands, shared }
    }

    /// A handle whose event loop never runs. Every command fails with
    /// [`PushError::BrokerClosed`].
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (commands, _) = mpsc::channel(1);
        let shared = Shared::new(
            HandshakePolicy::default(),
            Duration::from_secs(10),
            64,
            TaskSet::default(),
        );
        Self::new(commands, Arc::new(shared))
    }

    /// Allocate a connection id. Ids start at 1 and are never reused.
    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Queue a command for the event loop, waiting for capacity.
    pub(crate) async fn send(&self, command: Command) -> Result<(), PushError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PushError::BrokerClosed)
    }

    /// Publish a message through the topic dispatcher, as an external
    /// caller. Returns the number of connections the event was queued for.
    ///
    /// Publishing to a topic without subscribers, or one that matches no
    /// pattern, delivers nothing and returns `Ok(0)`.
    pub async fn publish(&self, msg: PushMessage) -> Result<usize, PushError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Push { msg, reply }).await?;
        rx.await
            .map_err(|_| PushError::BrokerClosed)?
            .map_err(Into::into)
    }

    /// Close a connection. Closing an unknown or already closed connection
    /// does nothing.
    pub async fn disconnect(&self, conn_id: ConnectionId) -> Result<(), PushError> {
        self.send(Command::Disconnect { conn_id }).await
    }

    /// Send a WebSocket ping to every open connection.
    pub async fn ping_all(&self) -> Result<(), PushError> {
        self.send(Command::Keepalive).await
    }

    /// Get a snapshot of the broker's live state.
    pub async fn stats(&self) -> Result<BrokerStats, PushError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| PushError::BrokerClosed)
    }

    /// Describe every open connection, ordered by id.
    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, PushError> {
        self.query_connections(None).await
    }

    /// Describe the open connections authenticated as `principal`, ordered
    /// by id. Their ids can be used as a publish's eligible list to target
    /// one user.
    pub async fn find_by_principal(
        &self,
        principal: &str,
    ) -> Result<Vec<ConnectionInfo>, PushError> {
        self.query_connections(Some(principal.to_owned())).await
    }

    async fn query_connections(
        &self,
        principal: Option<String>,
    ) -> Result<Vec<ConnectionInfo>, PushError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connections { principal, reply }).await?;
        rx.await.map_err(|_| PushError::BrokerClosed)
    }

    /// True if the event loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Resolves when the event loop has stopped.
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn detached_handles_report_a_closed_broker() {
        let handle = BrokerHandle::detached();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.publish(PushMessage::new("/t", json!(1))).await,
            Err(PushError::BrokerClosed)
        ));
        assert!(matches!(handle.stats().await, Err(PushError::BrokerClosed)));
        assert!(matches!(
            handle.find_by_principal("alice").await,
            Err(PushError::BrokerClosed)
        ));
    }

    #[test]
    fn connection_ids_start_at_one() {
        let handle = BrokerHandle::detached();
        assert_eq!(handle.next_connection_id(), 1);
        assert_eq!(handle.clone().next_connection_id(), 2);
    }

    #[test]
    fn only_live_peers_get_a_close_frame() {
        assert_eq!(CloseReason::Disconnected.close_frame(), None);
        assert_eq!(
            CloseReason::Protocol(ProtocolError::Empty).close_frame(),
            Some(Outbound::Close {
                code: CLOSE_PROTOCOL,
                reason: "protocol error"
            })
        );
    }
}
