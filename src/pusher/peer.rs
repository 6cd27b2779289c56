use crate::{
    config::PeerPusherConfig,
    error::PushError,
    pusher::{PushMessage, Pusher},
    tasks::TaskSet,
    types::InboundFrame,
};
use futures_util::{SinkExt, StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{
            header::{AUTHORIZATION, ORIGIN},
            HeaderValue,
        },
        Message,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Bounded exponential backoff: `base`, doubled after every failure, capped
/// at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff. `max` is raised to `base` if it is smaller.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// The delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        delay
    }

    /// Start over from `base`, after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Pushes messages by connecting to the broker's own listener as the
/// trusted peer, and sending ordinary `PUBLISH` frames.
///
/// Messages are queued in a bounded buffer, drained whenever the link is up.
/// When the buffer is full, [`Pusher::push`] fails with
/// [`PushError::BufferFull`] and the message is dropped. A lost link is
/// re-established in the background with [`Backoff`]. Dropping the pusher
/// stops the background task.
#[derive(Debug)]
pub struct PeerPusher {
    tx: mpsc::Sender<PushMessage>,
    connected: Arc<AtomicBool>,
    tasks: TaskSet,
}

impl PeerPusher {
    /// Start the background link task.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime.
    pub fn spawn(config: PeerPusherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let connected = Arc::new(AtomicBool::new(false));
        let tasks = TaskSet::default();

        let link = Link {
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            config,
            rx,
            pending: None,
            connected: connected.clone(),
        };
        tasks.spawn_graceful(|token| link.run(token));

        Self {
            tx,
            connected,
            tasks,
        }
    }

    /// True while the link to the broker is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Pusher for PeerPusher {
    async fn push(&self, msg: PushMessage) -> Result<(), PushError> {
        self.tx.try_send(msg).map_err(|err| match err {
            TrySendError::Full(msg) => {
                warn!(topic = %msg.topic, "peer pusher buffer is full, dropping message");
                crate::metrics::record_push("peer", "dropped");
                PushError::BufferFull
            }
            TrySendError::Closed(_) => PushError::BrokerClosed,
        })
    }
}

impl Drop for PeerPusher {
    fn drop(&mut self) {
        self.tasks.cancel();
    }
}

/// Why a connected session ended.
enum SessionEnd {
    Cancelled,
    Lost,
}

/// The background side of a [`PeerPusher`].
struct Link {
    config: PeerPusherConfig,
    backoff: Backoff,
    rx: mpsc::Receiver<PushMessage>,
    /// A message taken from the buffer whose send failed. Sent first after
    /// reconnecting.
    pending: Option<PushMessage>,
    connected: Arc<AtomicBool>,
}

impl Link {
    #[instrument(name = "PeerPusher", skip_all, fields(url = %self.config.url))]
    async fn run(mut self, token: CancellationToken) {
        loop {
            match self.connect().await {
                Ok(ws) => {
                    info!("connected to broker");
                    self.backoff.reset();
                    self.connected.store(true, Ordering::Release);
                    let end = self.session(ws, &token).await;
                    self.connected.store(false, Ordering::Release);
                    if let SessionEnd::Cancelled = end {
                        return;
                    }
                }
                Err(err) => debug!(%err, "failed to connect to broker"),
            }

            let delay = self.backoff.next_delay();
            debug!(?delay, "reconnecting after delay");
            select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        PushError,
    > {
        let header = |value: &str| {
            HeaderValue::from_str(value).map_err(|err| {
                tokio_tungstenite::tungstenite::Error::HttpFormat(err.into())
            })
        };

        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(origin) = &self.config.origin {
            request.headers_mut().insert(ORIGIN, header(origin)?);
        }
        if let Some(token) = &self.config.token {
            request
                .headers_mut()
                .insert(AUTHORIZATION, header(&format!("Bearer {token}"))?);
        }

        let (ws, _) = connect_async(request).await?;
        Ok(ws)
    }

    async fn session<S>(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        token: &CancellationToken,
    ) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        loop {
            let msg = match self.pending.take() {
                Some(msg) => msg,
                None => select! {
                    biased;
                    _ = token.cancelled() => {
                        let _ = sink.close().await;
                        return SessionEnd::Cancelled;
                    }
                    incoming = stream.next() => match incoming {
                        // WELCOME and pongs need no answer. Pings are
                        // answered by the stream itself.
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            warn!(%err, "link to broker failed");
                            return SessionEnd::Lost;
                        }
                        None => {
                            warn!("broker closed the link");
                            return SessionEnd::Lost;
                        }
                    },
                    msg = self.rx.recv() => match msg {
                        Some(msg) => msg,
                        // every pusher handle is gone
                        None => return SessionEnd::Cancelled,
                    },
                },
            };

            let frame = InboundFrame::Publish {
                topic: msg.topic.clone(),
                payload: msg.payload.clone(),
                exclude: msg.exclude.clone().into(),
                eligible: msg.eligible.clone(),
            };
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, topic = %msg.topic, "dropping unserializable message");
                    crate::metrics::record_push("peer", "invalid");
                    continue;
                }
            };

            if let Err(err) = sink.send(Message::text(text)).await {
                warn!(%err, "failed to send to broker, will retry after reconnecting");
                self.pending = Some(msg);
                return SessionEnd::Lost;
            }
            crate::metrics::record_push("peer", "sent");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(700));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 700, 700]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn buffer_overflow_drops_messages() {
        // nothing listens on port 1, so the link never comes up
        let pusher = PeerPusher::spawn(PeerPusherConfig {
            url: "ws://127.0.0.1:1".into(),
            buffer: 2,
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(60),
            ..Default::default()
        });

        pusher.push(PushMessage::new("/t", json!(1))).await.unwrap();
        pusher.push(PushMessage::new("/t", json!(2))).await.unwrap();
        assert!(matches!(
            pusher.push(PushMessage::new("/t", json!(3))).await,
            Err(PushError::BufferFull)
        ));
        assert!(!pusher.is_connected());
    }
}
