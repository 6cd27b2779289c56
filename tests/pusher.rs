mod common;
use common::{eventually, test_broker, test_config, ws_client};

use serde_json::json;
use std::time::Duration;
use wsbroker::{
    config::PeerPusherConfig,
    pusher::{ChannelQueue, PeerPusher, QueueConsumer},
    PushMessage, Pusher,
};

#[tokio::test]
async fn peer_pusher_publishes_over_the_socket() {
    let mut config = test_config(3395);
    config.server.origin_check = true;
    config.server.peer_token = Some("peer-token".into());
    config.origins = vec!["https://app.example".into()];
    let _server = test_broker(config).build().unwrap().serve().await.unwrap();

    // ordinary clients need an allowed origin
    assert!(common::ws_client_with("ws://127.0.0.1:3395", Some("https://evil.example"), None)
        .await
        .is_err());

    // the peer bypasses the origin check, and can subscribe like anyone
    let mut watcher =
        common::ws_client_with("ws://127.0.0.1:3395", None, Some("peer-token")).await.unwrap();
    watcher.subscribe("/news").await;

    let pusher = PeerPusher::spawn(PeerPusherConfig {
        url: "ws://127.0.0.1:3395".into(),
        token: Some("peer-token".into()),
        backoff_base: Duration::from_millis(20),
        ..Default::default()
    });
    pusher
        .push(PushMessage::new("/news", json!({"n": 1})))
        .await
        .unwrap();
    assert_eq!(watcher.recv().await, json!([8, "/news", {"n": 1}]));
    assert!(pusher.is_connected());

    // the pusher is excluded by id like any other publisher
    let msg = PushMessage::new("/news", json!(2)).with_exclude([watcher.session_id]);
    pusher.push(msg).await.unwrap();
    pusher.push(PushMessage::new("/news", json!(3))).await.unwrap();
    assert_eq!(watcher.recv().await[2], 3);
}

#[tokio::test]
async fn peer_pusher_reconnects() {
    let pusher = PeerPusher::spawn(PeerPusherConfig {
        url: "ws://127.0.0.1:3396".into(),
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(50),
        ..Default::default()
    });

    // queued while the broker is down
    pusher.push(PushMessage::new("/news", json!("early"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pusher.is_connected());

    let server = test_broker(test_config(3396)).build().unwrap().serve().await.unwrap();
    eventually(|| async { pusher.is_connected() }).await;

    let mut client = ws_client("ws://127.0.0.1:3396").await;
    client.subscribe("/news").await;
    pusher.push(PushMessage::new("/news", json!("late"))).await.unwrap();
    assert_eq!(client.recv().await[2], "late");

    // the early message went out before anyone subscribed
    let stats = server.broker().stats().await.unwrap();
    assert_eq!(stats.connections, 2);
}

#[tokio::test]
async fn queue_consumer_acks_and_dead_letters() {
    let server = test_broker(test_config(3397)).build().unwrap().serve().await.unwrap();
    let mut client = ws_client("ws://127.0.0.1:3397").await;
    client.subscribe("/room/9").await;

    let (queue, producer) = ChannelQueue::new();
    let consumer = tokio::spawn(QueueConsumer::new(queue, server.broker()).run());

    let delivered = producer
        .publish_message(&PushMessage::new("/room/9", json!("queued")))
        .unwrap()
        .unwrap();
    assert_eq!(
        client.recv().await,
        json!([8, "/room/9", {"room": "9", "body": "queued"}])
    );

    // a publish with no subscribers is still a success
    let nobody = producer
        .publish_message(&PushMessage::new("/news", json!(1)))
        .unwrap()
        .unwrap();
    // vetoed by the topic handler
    producer
        .publish_message(&PushMessage::new("/room/9", json!({"forbidden": true})))
        .unwrap();
    // the handler fails every time: tried twice, then dead-lettered
    producer
        .publish_message(&PushMessage::new("/broken", json!(1)))
        .unwrap();
    producer.publish("not an envelope").unwrap();

    eventually(|| async { producer.dead_letters().len() == 3 }).await;
    assert_eq!(producer.acked(), vec![delivered, nobody]);
    client.expect_silence(100).await;

    drop(producer);
    consumer.await.unwrap();
}
