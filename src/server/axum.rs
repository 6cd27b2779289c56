//! WebSocket connection manager for [`axum`]
//!
//! How this works:
//! `axum` does not provide a connection pattern that allows us to implement
//! [`Listener`] directly. Instead, it uses a [`WebSocketUpgrade`] to upgrade
//! a connection to a WebSocket. We make an [`AxumWsCfg`] that will be the
//! [`State`] for our handler, and the [`broker_websocket`] handler serves the
//! role of the [`Listener`]: it applies the broker's [`HandshakePolicy`]
//! before upgrading, and enrolls the upgraded socket with the broker.
//!
//! [`Listener`]: crate::server::Listener
//! [`HandshakePolicy`]: crate::server::HandshakePolicy

use crate::{
    server::{shared::ConnectionManager, FrameSink},
    BrokerHandle,
};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{
        header::{AUTHORIZATION, ORIGIN},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, Stream, StreamExt,
};
use std::{
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tracing::debug;

pub(crate) type SendHalf = SplitSink<WebSocket, Message>;
pub(crate) type RecvHalf = SplitStream<WebSocket>;

/// Connection state for WebSocket connections using [`axum::extract::ws`].
///
/// This struct is used as the [`State`] for the [`broker_websocket`]
/// handler, and is created from the [`BrokerHandle`] of a running broker.
///
/// # Example
///
/// ```no_run
/// # use wsbroker::{Broker, server::{broker_websocket, AxumWsCfg}};
/// # async fn _main(broker: Broker) -> axum::Router<()> {
/// let shutdown = broker.start();
/// let cfg = AxumWsCfg::new(shutdown.broker());
///
/// axum::Router::new()
///     .route("/ws", axum::routing::any(broker_websocket))
///     .with_state(cfg)
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AxumWsCfg {
    inner: ConnectionManager,
}

impl From<BrokerHandle> for AxumWsCfg {
    fn from(broker: BrokerHandle) -> Self {
        Self::new(broker)
    }
}

impl AxumWsCfg {
    /// Create a new [`AxumWsCfg`] for the broker behind `broker`.
    pub fn new(broker: BrokerHandle) -> Self {
        Self {
            inner: ConnectionManager::new(broker),
        }
    }
}

fn header(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Axum handler for broker WebSocket connections.
///
/// The handshake policy is applied to the upgrade request. A refused
/// handshake is answered with its HTTP status and never upgraded.
pub async fn broker_websocket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AxumWsCfg>,
) -> Response {
    let policy = &state.inner.broker.shared().policy;
    let origin = header(&headers, ORIGIN);
    let handshake = match policy.authorize(origin, header(&headers, AUTHORIZATION), None) {
        Ok(handshake) => handshake,
        Err(rejection) => {
            debug!(%rejection, ?origin, "handshake rejected");
            crate::metrics::record_handshake_rejected(rejection.label());
            let status = StatusCode::from_u16(rejection.status()).unwrap_or(StatusCode::FORBIDDEN);
            return (status, rejection.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |ws| {
        let (sink, stream) = ws.split();

        state
            .inner
            .handle_new_connection(handshake, AxumFrameStream::from(stream), sink);

        async {}
    })
}

/// Simple stream adapter for extracting frame payloads from a [`WebSocket`].
#[derive(Debug)]
struct AxumFrameStream {
    inner: RecvHalf,
    complete: bool,
}

impl From<RecvHalf> for AxumFrameStream {
    fn from(inner: RecvHalf) -> Self {
        Self {
            inner,
            complete: false,
        }
    }
}

impl AxumFrameStream {
    /// Handle an incoming [`Message`]
    fn handle(&self, message: Message) -> Result<Option<Bytes>, &'static str> {
        match message {
            Message::Text(text) => Ok(Some(text.into())),
            Message::Binary(bytes) => Ok(Some(bytes)),
            Message::Close(Some(frame)) => {
                let s = "Received close frame with data";
                let reason = format!("{} ({})", frame.reason, frame.code);
                debug!(%reason, "{}", &s);
                Err(s)
            }
            Message::Close(None) => {
                let s = "WS client has gone away";
                debug!("{}", &s);
                Err(s)
            }
            _ => Ok(None),
        }
    }
}

impl Stream for AxumFrameStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.complete {
                return Poll::Ready(None);
            }

            let Some(Ok(msg)) = ready!(self.inner.poll_next_unpin(cx)) else {
                self.complete = true;
                return Poll::Ready(None);
            };

            match self.handle(msg) {
                Ok(Some(item)) => return Poll::Ready(Some(item)),
                Ok(None) => continue,
                Err(_) => self.complete = true,
            }
        }
    }
}

impl FrameSink for SendHalf {
    type Error = axum::Error;

    async fn send_text(&mut self, text: Arc<str>) -> Result<(), Self::Error> {
        self.send(Message::text(&*text)).await
    }

    async fn send_ping(&mut self) -> Result<(), Self::Error> {
        self.send(Message::Ping(Bytes::new())).await
    }

    async fn send_close(&mut self, code: u16, reason: &'static str) -> Result<(), Self::Error> {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        self.send(Message::Close(Some(frame))).await
    }
}
