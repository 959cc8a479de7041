use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    bus::BusEvent,
    protocol::ServerMessage,
    router::{ChannelRouter, DeliveryMetrics},
};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed payload on {channel}: {source}")]
    MalformedPayload {
        channel: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Consumes bus events in arrival order and fans each one out to the
/// channel's current subscribers.
#[derive(Clone)]
pub struct LogRelay {
    router: ChannelRouter,
}

impl LogRelay {
    pub fn new(router: ChannelRouter) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    /// Decodes one bus payload and delivers it to the channel's members.
    pub fn relay(&self, event: &BusEvent) -> Result<DeliveryMetrics, RelayError> {
        let payload: Value =
            serde_json::from_slice(&event.payload).map_err(|source| {
                RelayError::MalformedPayload {
                    channel: event.channel.clone(),
                    source,
                }
            })?;

        Ok(self
            .router
            .deliver(&event.channel, &ServerMessage::Message(payload)))
    }

    pub async fn run(self, mut events: mpsc::Receiver<BusEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(&event);
        }
        info!("bus event stream closed; relay stopped");
    }

    /// Relays one event, logging and counting the outcome instead of failing.
    pub fn dispatch(&self, event: &BusEvent) {
        match self.relay(event) {
            Ok(metrics) => {
                debug!(
                    channel = %event.channel,
                    delivered = metrics.delivered,
                    closed = metrics.closed,
                    "relayed log message"
                );
                counter!("harbor_relay_messages_delivered_total")
                    .increment(metrics.delivered as u64);
                if metrics.closed > 0 {
                    counter!("harbor_relay_evictions_total").increment(metrics.closed as u64);
                }
            }
            Err(err) => {
                counter!("harbor_relay_malformed_total").increment(1);
                warn!(error = %err, "dropping log message");
            }
        }
    }

    pub fn spawn(self, events: mpsc::Receiver<BusEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Subscriber;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::json;

    #[test_timeout::timeout]
    fn relays_decoded_payload_to_channel_members() {
        let router = ChannelRouter::new();
        let (a, mut a_rx) = Subscriber::channel();
        let (b, mut b_rx) = Subscriber::channel();
        router.join("logs:demo123", &a);
        router.join("logs:other", &b);

        let relay = LogRelay::new(router);
        let metrics = relay
            .relay(&BusEvent::new(
                "logs:demo123",
                r#"{"line":"build started"}"#.as_bytes().to_vec(),
            ))
            .expect("well-formed payload");
        assert_eq!(metrics.delivered, 1);

        assert_eq!(
            a_rx.try_recv().unwrap(),
            ServerMessage::Message(json!({ "line": "build started" }))
        );
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn malformed_payload_is_reported() {
        let relay = LogRelay::new(ChannelRouter::new());
        let err = relay
            .relay(&BusEvent::new("logs:demo", "{not json".as_bytes().to_vec()))
            .expect_err("malformed payload");
        let RelayError::MalformedPayload { channel, .. } = err;
        assert_eq!(channel, "logs:demo");
    }

    #[test_timeout::timeout]
    fn dispatch_outcomes_reach_the_prometheus_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        let router = ChannelRouter::new();
        let (a, _a_rx) = Subscriber::channel();
        let (gone, gone_rx) = Subscriber::channel();
        router.join("logs:demo", &a);
        router.join("logs:demo", &gone);
        drop(gone_rx);

        let relay = LogRelay::new(router.clone());
        metrics::with_local_recorder(&recorder, || {
            relay.dispatch(&BusEvent::new("logs:demo", r#"{"line":"ok"}"#));
            relay.dispatch(&BusEvent::new("logs:demo", "{not json"));
        });

        let rendered = handle.render();
        assert!(rendered.contains("harbor_relay_messages_delivered_total 1"), "{rendered}");
        assert!(rendered.contains("harbor_relay_evictions_total 1"), "{rendered}");
        assert!(rendered.contains("harbor_relay_malformed_total 1"), "{rendered}");
        assert_eq!(router.subscriber_count("logs:demo"), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn malformed_payload_does_not_stop_the_loop() -> anyhow::Result<()> {
        let router = ChannelRouter::new();
        let (a, mut a_rx) = Subscriber::channel();
        let (b, mut b_rx) = Subscriber::channel();
        router.join("logs:demo", &a);
        router.join("logs:other", &b);

        let (bus_tx, bus_rx) = mpsc::channel(8);
        let handle = LogRelay::new(router).spawn(bus_rx);

        bus_tx
            .send(BusEvent::new("logs:demo", "garbage".as_bytes().to_vec()))
            .await?;
        bus_tx
            .send(BusEvent::new("logs:demo", r#"{"line":"ok"}"#.as_bytes().to_vec()))
            .await?;
        bus_tx
            .send(BusEvent::new("logs:other", r#"{"line":"also ok"}"#.as_bytes().to_vec()))
            .await?;

        assert_eq!(
            a_rx.recv().await,
            Some(ServerMessage::Message(json!({ "line": "ok" })))
        );
        assert_eq!(
            b_rx.recv().await,
            Some(ServerMessage::Message(json!({ "line": "also ok" })))
        );

        drop(bus_tx);
        handle.await?;
        assert!(a_rx.try_recv().is_err());
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn preserves_bus_order_per_channel() -> anyhow::Result<()> {
        let router = ChannelRouter::new();
        let (a, mut a_rx) = Subscriber::channel();
        router.join("logs:demo", &a);

        let (bus_tx, bus_rx) = mpsc::channel(64);
        let handle = LogRelay::new(router).spawn(bus_rx);
        for i in 0..20 {
            let payload = json!({ "seq": i }).to_string();
            bus_tx.send(BusEvent::new("logs:demo", payload)).await?;
        }
        drop(bus_tx);
        handle.await?;

        for i in 0..20 {
            assert_eq!(
                a_rx.recv().await,
                Some(ServerMessage::Message(json!({ "seq": i })))
            );
        }
        Ok(())
    }
}
