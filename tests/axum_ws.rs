#![cfg(feature = "axum")]

mod common;
use common::{test_broker, test_config, ws_client, ws_client_with};

use axum::routing::any;
use serde_json::json;
use wsbroker::{
    server::{broker_websocket, AxumWsCfg},
    PushMessage, ServerShutdown,
};

const SOCKET_STR: &str = "127.0.0.1:3399";
const URL: &str = "ws://127.0.0.1:3399/ws";

/// Serve the broker using Axum. Origin checking is on.
async fn serve() -> ServerShutdown {
    let mut config = test_config(0);
    config.server.origin_check = true;
    config.origins = vec!["https://app.example".into()];

    let shutdown = test_broker(config).build().unwrap().start();

    let axum_router = axum::Router::new()
        .route("/ws", any(broker_websocket))
        .with_state::<()>(AxumWsCfg::new(shutdown.broker()));

    let listener = tokio::net::TcpListener::bind(SOCKET_STR).await.unwrap();
    tokio::spawn(async move { axum::serve(listener, axum_router).await.unwrap() });
    shutdown
}

#[tokio::test]
async fn test_axum_ws() {
    let server = serve().await;

    assert!(ws_client_with(URL, Some("https://evil.example"), None).await.is_err());

    let mut alice = ws_client_with(URL, Some("https://app.example"), None)
        .await
        .unwrap();
    let response = alice.call("add", &[json!(20), json!(22)]).await;
    assert_eq!(response, json!([3, "call-1", 42]));

    // no remote address behind axum
    let response = alice.call("whoami", &[]).await;
    assert_eq!(response[2]["session"]["remote_addr"], json!(null));

    alice.subscribe("/news").await;
    let delivered = server
        .broker()
        .publish(PushMessage::new("/news", json!("extra")))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(alice.recv().await, json!([8, "/news", "extra"]));

    alice.send_raw("garbage").await;
    assert!(alice.recv_close().await.is_some());
}

#[tokio::test]
async fn unknown_routes_are_not_upgraded() {
    let _server = serve_other().await;
    assert!(ws_client_with("ws://127.0.0.1:3398/elsewhere", None, None)
        .await
        .is_err());

    // the socket itself works
    let _client = ws_client("ws://127.0.0.1:3398/ws").await;
}

async fn serve_other() -> ServerShutdown {
    let shutdown = test_broker(test_config(0)).build().unwrap().start();
    let axum_router = axum::Router::new()
        .route("/ws", any(broker_websocket))
        .with_state::<()>(AxumWsCfg::from(shutdown.broker()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3398").await.unwrap();
    tokio::spawn(async move { axum::serve(listener, axum_router).await.unwrap() });
    shutdown
}
