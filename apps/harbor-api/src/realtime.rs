use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use log_relay::{
    protocol::{decode_client_bytes, decode_client_text},
    ChannelRouter, ClientMessage, ProtocolError, ServerMessage, Subscriber,
};
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::json;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared state of the realtime log server.
#[derive(Clone)]
pub struct RealtimeState {
    router: ChannelRouter,
    shutdown: CancellationToken,
    active_connections: Arc<AtomicUsize>,
}

impl RealtimeState {
    pub fn new(router: ChannelRouter, shutdown: CancellationToken) -> Self {
        Self {
            router,
            shutdown,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_connections: usize,
    active_channels: usize,
    channels: Vec<ChannelStatsEntry>,
}

#[derive(Debug, Serialize)]
struct ChannelStatsEntry {
    channel: String,
    subscribers: usize,
}

pub fn build_router(state: RealtimeState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<RealtimeState>) -> impl IntoResponse {
    let channels: Vec<ChannelStatsEntry> = state
        .router
        .snapshot()
        .into_iter()
        .map(|entry| ChannelStatsEntry {
            channel: entry.channel,
            subscribers: entry.subscribers,
        })
        .collect();
    Json(StatsResponse {
        active_connections: state.active_connections(),
        active_channels: channels.len(),
        channels,
    })
}

async fn ws_handler(State(state): State<RealtimeState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: RealtimeState) {
    let (subscriber, mut rx) = Subscriber::channel();
    let connection_id = subscriber.id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let active = state.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
    gauge!("harbor_realtime_connections_active").set(active as f64);
    counter!("harbor_realtime_connections_total").increment(1);
    info!(connection_id = %connection_id, "realtime connection established");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = match message.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "skipping frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => {
                debug!(connection_id = %connection_id, "closing connection for shutdown");
                break;
            }
            frame = ws_rx.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                handle_client_frame(decode_client_text(&text), &state, &subscriber);
            }
            Some(Ok(Message::Binary(bytes))) => {
                handle_client_frame(decode_client_bytes(&bytes), &state, &subscriber);
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving frame");
                break;
            }
            None => break,
        }
    }

    let left = state.router.leave_all(connection_id);
    drop(subscriber);
    writer.abort();

    let active = state
        .active_connections
        .fetch_sub(1, Ordering::Relaxed)
        .saturating_sub(1);
    gauge!("harbor_realtime_connections_active").set(active as f64);
    info!(
        connection_id = %connection_id,
        channels_left = left,
        "realtime connection closed"
    );
}

fn handle_client_frame(
    decoded: Result<ClientMessage, ProtocolError>,
    state: &RealtimeState,
    subscriber: &Subscriber,
) {
    match decoded {
        Ok(ClientMessage::Subscribe(channel)) => {
            let outcome = state.router.join(&channel, subscriber);
            info!(
                connection_id = %subscriber.id(),
                channel = %channel,
                newly_joined = outcome.newly_joined,
                members = outcome.members,
                "client subscribed"
            );
            if let Err(err) = subscriber.send(ServerMessage::joined(&channel)) {
                warn!(connection_id = %subscriber.id(), error = %err, "failed to queue ack");
            }
        }
        Err(err) => {
            warn!(connection_id = %subscriber.id(), error = %err, "rejecting client frame");
            if let Err(send_err) = subscriber.send(ServerMessage::error(err.to_string())) {
                warn!(
                    connection_id = %subscriber.id(),
                    error = %send_err,
                    "failed to queue error frame"
                );
            }
        }
    }
}
