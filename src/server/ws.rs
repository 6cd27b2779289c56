use crate::server::{Connect, FrameSink, Handshake, HandshakePolicy, Listener};
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, Stream, StreamExt,
};
use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{
            header::{HeaderName, AUTHORIZATION, ORIGIN},
            StatusCode,
        },
        protocol::{frame::coding::CloseCode, CloseFrame, Message},
    },
    WebSocketStream,
};
use tracing::{debug, debug_span, Instrument};

/// Sending half of a [`WebSocketStream`]
pub(crate) type SendHalf = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Receiving half of a [`WebSocketStream`].
pub(crate) type RecvHalf = SplitStream<WebSocketStream<TcpStream>>;

/// Simple stream adapter for extracting frame payloads from a
/// [`WebSocketStream`]. Text and binary messages are both passed on, and
/// decoding checks that they are UTF-8.
#[derive(Debug)]
pub struct WsFrameStream {
    inner: RecvHalf,
    complete: bool,
}

impl From<RecvHalf> for WsFrameStream {
    fn from(inner: RecvHalf) -> Self {
        Self {
            inner,
            complete: false,
        }
    }
}

impl WsFrameStream {
    /// Handle an incoming [`Message`]
    fn handle(&self, message: Message) -> Result<Option<Bytes>, &'static str> {
        match message {
            Message::Text(text) => Ok(Some(text.into())),
            Message::Binary(bytes) => Ok(Some(bytes)),
            Message::Close(Some(frame)) => {
                let s = "Received close frame with data";
                debug!(reason = %frame, "{}", &s);
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

impl Stream for WsFrameStream {
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
    type Error = tokio_tungstenite::tungstenite::Error;

    async fn send_text(&mut self, text: Arc<str>) -> Result<(), Self::Error> {
        self.send(Message::text(&*text)).await
    }

    async fn send_ping(&mut self) -> Result<(), Self::Error> {
        self.send(Message::Ping(Bytes::new())).await
    }

    async fn send_close(&mut self, code: u16, reason: &'static str) -> Result<(), Self::Error> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        self.send(Message::Close(Some(frame))).await
    }
}

/// Read a header as a string, ignoring values that are not visible ASCII.
fn header(req: &Request, name: HeaderName) -> Option<&str> {
    req.headers().get(name).and_then(|value| value.to_str().ok())
}

impl Listener for TcpListener {
    type Conn = (TcpStream, SocketAddr);

    type Sink = SendHalf;

    type Stream = WsFrameStream;

    type Error = tokio_tungstenite::tungstenite::Error;

    async fn accept(&self) -> Result<Self::Conn, Self::Error> {
        Ok(TcpListener::accept(self).await?)
    }

    async fn handshake(
        (stream, socket_addr): Self::Conn,
        policy: Arc<HandshakePolicy>,
    ) -> Result<(Handshake, Self::Sink, Self::Stream), Self::Error> {
        let span = debug_span!("ws connection", remote_addr = %socket_addr);

        let mut admitted = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let origin = header(req, ORIGIN);
            match policy.authorize(origin, header(req, AUTHORIZATION), Some(socket_addr)) {
                Ok(handshake) => {
                    admitted = Some(handshake);
                    Ok(resp)
                }
                Err(rejection) => {
                    debug!(%rejection, ?origin, "handshake rejected");
                    crate::metrics::record_handshake_rejected(rejection.label());
                    let mut resp = ErrorResponse::new(Some(rejection.to_string()));
                    *resp.status_mut() =
                        StatusCode::from_u16(rejection.status()).unwrap_or(StatusCode::FORBIDDEN);
                    Err(resp)
                }
            }
        };

        let ws_stream = accept_hdr_async(stream, callback).instrument(span).await?;

        let Some(handshake) = admitted else {
            return Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        };

        let (send, recv) = ws_stream.split();

        Ok((handshake, send, recv.into()))
    }
}

impl Connect for SocketAddr {
    type Listener = TcpListener;
    type Error = std::io::Error;

    fn make_listener(self) -> impl Future<Output = Result<Self::Listener, Self::Error>> + Send {
        TcpListener::bind(self)
    }
}
