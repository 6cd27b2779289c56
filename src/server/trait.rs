use crate::{
    server::{
        shared::{ConnectionManager, ListenerTask},
        Handshake, HandshakePolicy, ServerShutdown,
    },
    Broker,
};
use bytes::Bytes;
use std::{future::Future, sync::Arc};
use tokio_stream::Stream;

/// Configuration objects for connecting a [`Listener`].
///
/// This object is intended to capture all connection-related configuration
/// and setup, and output only the configured [`Listener`]. This allows it to
/// configure (e.g.) TLS or socket options without leaking transport logic
/// into the broker.
///
/// [`Connect`] is implemented for [`SocketAddr`], producing a WebSocket
/// server on a [`TcpListener`].
///
/// [`SocketAddr`]: std::net::SocketAddr
/// [`TcpListener`]: tokio::net::TcpListener
pub trait Connect: Send + Sync + Sized {
    /// The listener type produced by the connect object.
    type Listener: Listener;

    /// The error type for instantiating a [`Listener`].
    type Error: core::error::Error + 'static;

    /// Create the listener
    fn make_listener(self) -> impl Future<Output = Result<Self::Listener, Self::Error>> + Send;

    /// Start the broker, and a task accepting connections on this listener.
    /// Returns the shutdown guard of the running broker.
    fn serve(self, broker: Broker) -> impl Future<Output = Result<ServerShutdown, Self::Error>> + Send {
        async move {
            let listener = self.make_listener().await?;
            let shutdown = broker.start();
            ListenerTask {
                listener,
                manager: ConnectionManager::new(shutdown.broker()),
            }
            .spawn();
            Ok(shutdown)
        }
    }

    /// Accept connections on this listener for an already running broker.
    fn attach(
        self,
        shutdown: &ServerShutdown,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let manager = ConnectionManager::new(shutdown.broker());
        async move {
            ListenerTask {
                listener: self.make_listener().await?,
                manager,
            }
            .spawn();
            Ok(())
        }
    }
}

/// A [`Listener`] accepts incoming connections, runs the WebSocket
/// handshake under a [`HandshakePolicy`], and produces [`FrameSink`] and
/// [`FrameStream`] objects.
///
/// Accepting and handshaking are separate steps. The accept loop only waits
/// on [`Listener::accept`]. Each [`Listener::handshake`] runs on its own
/// task, bounded by `server.handshake_timeout`, so a peer that never sends
/// its upgrade request holds up nobody else.
///
/// Handshakes refused by the policy must be answered at the transport level
/// (e.g. with an HTTP 403) and reported as an error, so that the connection
/// never reaches the broker.
pub trait Listener: Send + 'static {
    /// An accepted connection whose handshake has not yet run.
    type Conn: Send + 'static;
    /// The sink type produced by the listener.
    type Sink: FrameSink;
    /// The stream type produced by the listener.
    type Stream: FrameStream;
    /// The error type for the listener.
    type Error: core::error::Error + Send;

    /// Accept an inbound connection.
    fn accept(&self) -> impl Future<Output = Result<Self::Conn, Self::Error>> + Send;

    /// Run the handshake on an accepted connection, and split it into a sink
    /// and stream.
    fn handshake(
        conn: Self::Conn,
        policy: Arc<HandshakePolicy>,
    ) -> impl Future<Output = Result<(Handshake, Self::Sink, Self::Stream), Self::Error>> + Send;
}

/// A sink for outbound WebSocket messages.
pub trait FrameSink: Send + 'static {
    /// Error type for the sink.
    type Error: core::error::Error + 'static;

    /// Send a text message.
    fn send_text(&mut self, text: Arc<str>) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Send a ping.
    fn send_ping(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Send a close frame.
    fn send_close(
        &mut self,
        code: u16,
        reason: &'static str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A stream of inbound message payloads.
pub trait FrameStream: Stream<Item = Bytes> + Send + Unpin + 'static {}

impl<T> FrameStream for T where T: Stream<Item = Bytes> + Send + Unpin + 'static {}
