#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::{
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::CloseFrame,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use wsbroker::{
    rpc::{RpcCtx, RpcError},
    topic::{PassThrough, TopicHandler, TopicRequest},
    BrokerBuilder, BrokerConfig, TopicError,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Chat rooms. Subscribing to `/room/private` is refused, and publishing a
/// payload with `"forbidden": true` is vetoed. Everything else is relayed,
/// tagged with the room id.
#[derive(Debug, Default)]
pub struct Rooms;

impl TopicHandler for Rooms {
    fn on_subscribe(&self, req: &TopicRequest<'_>) -> Result<(), TopicError> {
        if req.params.get("id") == Some("private") {
            return Err(TopicError::unauthorized("private room"));
        }
        Ok(())
    }

    fn on_publish(&self, req: &TopicRequest<'_>, payload: Value) -> Result<Value, TopicError> {
        if payload.get("forbidden") == Some(&Value::Bool(true)) {
            return Err(TopicError::unauthorized("forbidden payload"));
        }
        Ok(json!({ "room": req.params.get("id"), "body": payload }))
    }
}

/// Fails every publish.
#[derive(Debug, Default)]
pub struct Broken;

impl TopicHandler for Broken {
    fn on_publish(&self, _req: &TopicRequest<'_>, _payload: Value) -> Result<Value, TopicError> {
        Err(TopicError::handler_failure("backend unavailable"))
    }
}

/// Log broker traces to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A config listening on `port`, with a short RPC timeout.
pub fn test_config(port: u16) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.server.port = port;
    config.server.rpc_timeout = Duration::from_millis(200);
    config
}

/// Instantiate a broker for testing.
pub fn test_broker(config: BrokerConfig) -> BrokerBuilder {
    init_tracing();
    wsbroker::Broker::builder(config)
        .topic("/room/{id}", Rooms)
        .unwrap()
        .topic("/broken", Broken)
        .unwrap()
        .topic("/news", PassThrough)
        .unwrap()
        .rpc("echo", |_ctx: RpcCtx, args: Vec<Value>| async move {
            Ok::<_, RpcError>(args)
        })
        .unwrap()
        .rpc("add", |_ctx: RpcCtx, (a, b): (i64, i64)| async move {
            Ok::<_, RpcError>(a + b)
        })
        .unwrap()
        .rpc("whoami", |ctx: RpcCtx, _: ()| async move {
            Ok::<_, RpcError>(json!({
                "id": ctx.conn_id(),
                "principal": ctx.principal(),
                "origin": ctx.origin(),
                "session": ctx.session(),
            }))
        })
        .unwrap()
        .rpc("slow", |_ctx: RpcCtx, _: ()| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, RpcError>(())
        })
        .unwrap()
        .rpc("deny", |_ctx: RpcCtx, _: ()| async move {
            Err::<(), _>(RpcError::unauthorized("not for you"))
        })
        .unwrap()
}

/// A WebSocket client speaking raw frames.
pub struct WsClient {
    socket: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    pub session_id: u64,
    next_call: u64,
}

/// Connect without headers, and consume the `WELCOME` frame.
pub async fn ws_client(url: &str) -> WsClient {
    ws_client_with(url, None, None).await.unwrap()
}

/// Connect with optional `Origin` and bearer token headers, and consume the
/// `WELCOME` frame.
pub async fn ws_client_with(
    url: &str,
    origin: Option<&str>,
    token: Option<&str>,
) -> Result<WsClient, tokio_tungstenite::tungstenite::Error> {
    let mut request = url.into_client_request().unwrap();
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert(header::ORIGIN, HeaderValue::from_str(origin).unwrap());
    }
    if let Some(token) = token {
        request.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
    }
    let (socket, _) = tokio_tungstenite::connect_async(request).await?;

    let mut client = WsClient {
        socket,
        session_id: 0,
        next_call: 0,
    };
    let welcome = client.recv().await;
    assert_eq!(welcome[0], 0);
    assert_eq!(welcome[2], 1);
    client.session_id = welcome[1].as_u64().unwrap();
    Ok(client)
}

impl WsClient {
    pub async fn send(&mut self, frame: Value) {
        self.send_raw(frame.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: impl Into<String>) {
        self.socket
            .send(Message::text(text.into()))
            .await
            .unwrap();
    }

    /// The next text frame. Pings and pongs are skipped.
    pub async fn recv(&mut self) -> Value {
        loop {
            match self.next_message().await {
                Some(Message::Text(text)) => return serde_json::from_str(&text).unwrap(),
                Some(Message::Ping(_) | Message::Pong(_)) => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    /// The next message of any kind, or `None` once the connection is gone.
    pub async fn next_message(&mut self) -> Option<Message> {
        tokio::time::timeout(TIMEOUT, self.socket.next())
            .await
            .expect("timed out waiting for a message")
            .and_then(Result::ok)
    }

    /// Wait for the server's close frame.
    pub async fn recv_close(&mut self) -> Option<CloseFrame> {
        loop {
            match self.next_message().await {
                Some(Message::Close(frame)) => return frame,
                Some(Message::Ping(_) | Message::Pong(_)) => continue,
                None => return None,
                other => panic!("expected close, got {other:?}"),
            }
        }
    }

    /// Assert nothing but control frames arrives within `ms` milliseconds.
    pub async fn expect_silence(&mut self, ms: u64) {
        let deadline = tokio::time::sleep(Duration::from_millis(ms));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return,
                msg = self.socket.next() => match msg {
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    other => panic!("expected silence, got {other:?}"),
                },
            }
        }
    }

    /// Call a procedure and return the response frame.
    pub async fn call(&mut self, procedure: &str, args: &[Value]) -> Value {
        self.next_call += 1;
        let call_id = format!("call-{}", self.next_call);
        let mut frame = vec![json!(2), json!(call_id), json!(procedure)];
        frame.extend_from_slice(args);
        self.send(Value::Array(frame)).await;

        let response = self.recv().await;
        assert_eq!(response[1], json!(call_id));
        response
    }

    /// Wait until the broker has processed every frame sent so far.
    pub async fn sync(&mut self) {
        let response = self.call("echo", &[]).await;
        assert_eq!(response[0], 3);
    }

    pub async fn subscribe(&mut self, topic: &str) {
        self.send(json!([5, topic])).await;
        self.sync().await;
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

/// Poll `check` until it holds, or fail after a few seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while !check().await {
        assert!(start.elapsed() < TIMEOUT, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
