use std::{net::SocketAddr, time::Duration};

use axum::{
    body::{self, Body},
    http::Request,
};
use futures_util::{SinkExt, StreamExt};
use harbor_api::realtime::{self, RealtimeState};
use log_relay::{BusEvent, ChannelRouter, LogRelay};
use serde_json::{json, Value};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    addr: SocketAddr,
    router: ChannelRouter,
    bus: mpsc::Sender<BusEvent>,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        let router = ChannelRouter::new();
        let shutdown = CancellationToken::new();
        let (bus, bus_rx) = mpsc::channel(64);
        LogRelay::new(router.clone()).spawn(bus_rx);

        let app = realtime::build_router(RealtimeState::new(router.clone(), shutdown.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await
                .unwrap();
        });

        Self {
            addr,
            router,
            bus,
            shutdown,
        }
    }

    async fn connect(&self) -> Client {
        let (client, _) = connect_async(format!("ws://{}/ws", self.addr)).await.unwrap();
        client
    }

    async fn publish(&self, channel: &str, payload: Value) {
        self.bus
            .send(BusEvent::new(channel, payload.to_string()))
            .await
            .unwrap();
    }
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if frame.is_text() {
            return serde_json::from_str(frame.to_text().unwrap()).unwrap();
        }
    }
}

async fn assert_silent(client: &mut Client) {
    if let Ok(Some(Ok(frame))) = timeout(Duration::from_millis(200), client.next()).await {
        panic!("unexpected frame: {frame:?}");
    }
}

async fn subscribe(client: &mut Client, channel: &str) {
    let frame = json!({ "event": "subscribe", "data": channel }).to_string();
    client.send(Message::text(frame)).await.unwrap();
    let ack = next_json(client).await;
    assert_eq!(
        ack,
        json!({
            "event": "message",
            "data": { "status": "success", "message": format!("Joined {channel}") }
        })
    );
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn relays_only_to_subscribed_channel() {
    let harness = Harness::start().await;
    let mut a = harness.connect().await;
    let mut b = harness.connect().await;

    subscribe(&mut a, "logs:demo123").await;
    subscribe(&mut b, "logs:other").await;

    harness
        .publish("logs:demo123", json!({ "log": "Build Started..." }))
        .await;

    let relayed = next_json(&mut a).await;
    assert_eq!(
        relayed,
        json!({ "event": "message", "data": { "log": "Build Started..." } })
    );
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;

    harness.shutdown.cancel();
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn fans_out_in_publish_order() {
    let harness = Harness::start().await;
    let mut a = harness.connect().await;
    let mut b = harness.connect().await;

    subscribe(&mut a, "logs:shared").await;
    subscribe(&mut b, "logs:shared").await;
    assert_eq!(harness.router.subscriber_count("logs:shared"), 2);

    for line in ["one", "two", "three"] {
        harness.publish("logs:shared", json!({ "log": line })).await;
    }

    for client in [&mut a, &mut b] {
        for line in ["one", "two", "three"] {
            assert_eq!(next_json(client).await["data"]["log"], line);
        }
    }

    harness.shutdown.cancel();
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn invalid_frame_gets_error_and_connection_survives() {
    let harness = Harness::start().await;
    let mut a = harness.connect().await;

    a.send(Message::text("not json".to_string())).await.unwrap();
    let error = next_json(&mut a).await;
    assert_eq!(error["event"], "error");
    assert!(error["data"]["message"].is_string());

    subscribe(&mut a, "logs:demo123").await;

    harness.shutdown.cancel();
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn disconnect_prunes_membership() {
    let harness = Harness::start().await;
    let mut a = harness.connect().await;
    subscribe(&mut a, "logs:gone").await;
    subscribe(&mut a, "logs:also-gone").await;
    assert_eq!(harness.router.channel_count(), 2);

    a.close(None).await.unwrap();
    drop(a);

    let mut pruned = false;
    for _ in 0..100 {
        if harness.router.channel_count() == 0 {
            pruned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(pruned, "channels still present: {:?}", harness.router.snapshot());

    // Publishing to the vacated channel is a no-op.
    harness.publish("logs:gone", json!({ "log": "late" })).await;

    let stats_app = realtime::build_router(RealtimeState::new(
        harness.router.clone(),
        CancellationToken::new(),
    ));
    let response = stats_app
        .oneshot(Request::get("/debug/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let stats: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(stats["active_channels"], 0);
    assert_eq!(stats["channels"], json!([]));

    harness.shutdown.cancel();
}

#[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
async fn build_output_bursts_arrive_complete_and_in_order() {
    let harness = Harness::start().await;
    let mut a = harness.connect().await;
    subscribe(&mut a, "logs:burst").await;

    for seq in 0..500 {
        harness.publish("logs:burst", json!({ "seq": seq })).await;
    }

    for seq in 0..500 {
        assert_eq!(next_json(&mut a).await["data"]["seq"], seq);
    }
    assert_silent(&mut a).await;
    assert_eq!(harness.router.subscriber_count("logs:burst"), 1);

    harness.shutdown.cancel();
}
