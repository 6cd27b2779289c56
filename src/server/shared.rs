use crate::{
    primitives::ConnectionId,
    server::{
        handle::{CloseReason, Command, Outbound},
        FrameSink, FrameStream, Handshake, Listener,
    },
    tasks::TaskSet,
    types::InboundFrame,
    BrokerHandle,
};
use core::fmt;
use tokio::{select, sync::mpsc, task::JoinHandle, time::timeout};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

/// The `ListenerTask` listens for new connections, and enrolls each one
/// with the [`ConnectionManager`].
pub(crate) struct ListenerTask<T: Listener> {
    pub(crate) listener: T,
    pub(crate) manager: ConnectionManager,
}

impl<T> ListenerTask<T>
where
    T: Listener,
{
    /// Task future, which will be run by [`Self::spawn`].
    ///
    /// This future is a simple loop that accepts new connections. Each
    /// handshake runs on its own task, bounded by the handshake timeout, and
    /// hands the connection to the [`ConnectionManager`] once it completes.
    /// Failed, rejected and stalled handshakes only affect the connection
    /// that attempted them.
    pub(crate) async fn task_future(self) {
        let ListenerTask { listener, manager } = self;
        let shared = manager.broker.shared();
        let policy = shared.policy.clone();
        let handshake_timeout = shared.handshake_timeout;
        let tasks = shared.tasks.clone();

        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    debug!(%err, "Failed to accept connection");
                    continue;
                }
            };

            let manager = manager.clone();
            let policy = policy.clone();
            tasks.spawn(async move {
                match timeout(handshake_timeout, T::handshake(conn, policy)).await {
                    Ok(Ok((handshake, sink, stream))) => {
                        manager.handle_new_connection(handshake, stream, sink)
                    }
                    Ok(Err(err)) => debug!(%err, "handshake failed"),
                    Err(_) => {
                        debug!(?handshake_timeout, "handshake timed out");
                        crate::metrics::record_handshake_rejected("timeout");
                    }
                }
            });
        }
    }

    /// Spawn the future produced by [`Self::task_future`].
    pub(crate) fn spawn(self) -> JoinHandle<Option<()>> {
        let tasks = self.manager.broker.shared().tasks.clone();
        let future = self.task_future();
        tasks.spawn(future)
    }
}

/// The `ConnectionManager` gives connections their ids, and spawns the
/// [`RouteTask`] and [`WriteTask`] for each.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionManager {
    pub(crate) broker: BrokerHandle,
}

impl ConnectionManager {
    pub(crate) const fn new(broker: BrokerHandle) -> Self {
        Self { broker }
    }

    /// Create new [`RouteTask`] and [`WriteTask`] for a connection.
    fn make_tasks<S: FrameSink, R: FrameStream>(
        &self,
        handshake: Handshake,
        frames: R,
        sink: S,
    ) -> (RouteTask<R>, WriteTask<S>) {
        let shared = self.broker.shared();
        let conn_id = self.broker.next_connection_id();
        let (tx, rx) = mpsc::channel(shared.outbound_buffer);
        let tasks = shared.tasks.child();

        let rt = RouteTask {
            conn_id,
            broker: self.broker.clone(),
            open: Command::Open {
                conn_id,
                handshake,
                outbound: tx,
                tasks: tasks.clone(),
            },
            frames,
            tasks: tasks.clone(),
        };

        let wt = WriteTask {
            tasks,
            conn_id,
            outbound: rx,
            sink,
        };

        (rt, wt)
    }

    /// Handle a new connection, spawning its route and write tasks.
    pub(crate) fn handle_new_connection<S: FrameSink, R: FrameStream>(
        &self,
        handshake: Handshake,
        frames: R,
        sink: S,
    ) {
        let (rt, wt) = self.make_tasks(handshake, frames, sink);
        rt.spawn();
        wt.spawn();
    }
}

/// Task that reads frames from a connection, decodes them, and forwards them
/// to the event loop in receipt order.
///
/// The first command it sends is the connection's `Open`, and the last is
/// its `Close`, so the loop sees every connection's lifecycle in order.
struct RouteTask<R> {
    /// Connection ID for the connection serviced by this task.
    conn_id: ConnectionId,
    /// Handle to the event loop.
    broker: BrokerHandle,
    /// The open command, sent before any frame.
    open: Command,
    /// Stream of inbound payloads.
    frames: R,
    /// The task set for this connection.
    tasks: TaskSet,
}

impl<R> fmt::Debug for RouteTask<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTask")
            .field("conn_id", &self.conn_id)
            .finish_non_exhaustive()
    }
}

impl<R> RouteTask<R>
where
    R: FrameStream,
{
    /// Task future, which will be run by [`Self::spawn`].
    ///
    /// The future is not dropped on cancellation. It observes the token
    /// itself, so that it always reports the close to the event loop.
    #[instrument(name = "RouteTask", skip_all, fields(conn_id = self.conn_id))]
    async fn task_future(self, token: CancellationToken) {
        let RouteTask {
            conn_id,
            broker,
            open,
            mut frames,
            ..
        } = self;

        if broker.send(open).await.is_err() {
            debug!("broker has shut down");
            return;
        }

        let reason = loop {
            select! {
                biased;
                _ = token.cancelled() => {
                    trace!("connection tasks cancelled");
                    break CloseReason::Disconnected;
                }
                item = frames.next() => {
                    let Some(item) = item else {
                        trace!("inbound read stream has closed");
                        break CloseReason::Disconnected;
                    };

                    match InboundFrame::decode(&item) {
                        Ok(frame) => {
                            trace!(kind = ?frame.kind(), "frame received");
                            if broker.send(Command::Frame { conn_id, frame }).await.is_err() {
                                debug!("broker has shut down");
                                return;
                            }
                        }
                        Err(err) => {
                            debug!(%err, "protocol error");
                            crate::metrics::record_protocol_error();
                            break CloseReason::Protocol(err);
                        }
                    }
                }
            }
        };

        let _ = broker.send(Command::Close { conn_id, reason }).await;
    }

    /// Spawn the future produced by [`Self::task_future`].
    fn spawn(self) -> JoinHandle<()> {
        let tasks = self.tasks.clone();
        tasks.spawn_graceful(|token| self.task_future(token))
    }
}

/// The Write Task is responsible for writing queued messages to the
/// outbound connection.
struct WriteTask<S> {
    /// Task set
    tasks: TaskSet,

    /// ID of the connection.
    conn_id: ConnectionId,

    /// Messages to be written to the outbound connection. Filled by the
    /// event loop and by in-flight RPC calls.
    outbound: mpsc::Receiver<Outbound>,

    /// Outbound connection.
    sink: S,
}

impl<S: FrameSink> WriteTask<S> {
    /// Task future, which will be run by [`Self::spawn`].
    ///
    /// This is a simple loop, that reads messages from the outbound channel,
    /// and writes them. A close message is written last. When the loop ends,
    /// for any reason, the connection's task set is cancelled, which stops
    /// its [`RouteTask`].
    #[instrument(name = "WriteTask", skip_all, fields(conn_id = self.conn_id))]
    async fn task_future(self) {
        let WriteTask {
            tasks,
            mut outbound,
            mut sink,
            ..
        } = self;

        loop {
            select! {
                biased;

                _ = tasks.cancelled() => {
                    debug!("Shutdown signal received");
                    break;
                }
                item = outbound.recv() => {
                    let Some(item) = item else {
                        debug!("outbound channel has closed");
                        break;
                    };
                    let res = match item {
                        Outbound::Text(text) => sink.send_text(text).await,
                        Outbound::Ping => sink.send_ping().await,
                        Outbound::Close { code, reason } => {
                            if let Err(err) = sink.send_close(code, reason).await {
                                debug!(%err, "Failed to send close frame");
                            }
                            break;
                        }
                    };
                    if let Err(err) = res {
                        debug!(%err, "Failed to write message");
                        break;
                    }
                }
            }
        }
        tasks.cancel();
    }

    /// Spawn the future produced by [`Self::task_future`].
    fn spawn(self) -> JoinHandle<Option<()>> {
        let tasks = self.tasks.clone();
        let future = self.task_future();
        tasks.spawn(future)
    }
}
