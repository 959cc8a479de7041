use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use metrics::counter;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

/// One message received from the bus: the exact channel the publisher used and
/// the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub channel: String,
    pub payload: Bytes,
}

impl BusEvent {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(#[from] redis::RedisError),
}

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// Holds a single wildcard `PSUBSCRIBE` on Redis and forwards every matching
/// message into the relay.
///
/// The subscription is re-established after a dropped connection. Messages
/// published while disconnected are lost.
pub struct RedisLogSubscriber {
    client: redis::Client,
    pattern: String,
    policy: ReconnectPolicy,
}

enum StreamEnd {
    Disconnected,
    ConsumerClosed,
}

impl RedisLogSubscriber {
    pub fn new(redis_url: &str, pattern: impl Into<String>) -> BusResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            pattern: pattern.into(),
            policy: ReconnectPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn spawn(self, sink: mpsc::Sender<BusEvent>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(sink).await })
    }

    /// Runs until the consumer side of `sink` is dropped.
    pub async fn run(self, sink: mpsc::Sender<BusEvent>) {
        let mut delay = self.policy.initial_delay;
        loop {
            match self.stream_once(&sink, &mut delay).await {
                Ok(StreamEnd::ConsumerClosed) => break,
                Ok(StreamEnd::Disconnected) => {
                    warn!(pattern = %self.pattern, "bus subscription ended; reconnecting");
                }
                Err(err) => {
                    counter!("harbor_bus_connection_errors_total").increment(1);
                    warn!(
                        pattern = %self.pattern,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "bus connection unavailable"
                    );
                }
            }

            if sink.is_closed() {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = self.policy.next_delay(delay);
        }
        info!(pattern = %self.pattern, "bus subscriber stopped");
    }

    async fn stream_once(
        &self,
        sink: &mpsc::Sender<BusEvent>,
        delay: &mut Duration,
    ) -> BusResult<StreamEnd> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(&self.pattern).await?;
        info!(pattern = %self.pattern, "subscribed to log channels");
        *delay = self.policy.initial_delay;

        let messages = pubsub.on_message();
        futures_util::pin_mut!(messages);
        while let Some(msg) = messages.next().await {
            let event = BusEvent {
                channel: msg.get_channel_name().to_string(),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            };
            debug!(channel = %event.channel, bytes = event.payload.len(), "bus message");
            if sink.send(event).await.is_err() {
                return Ok(StreamEnd::ConsumerClosed);
            }
        }

        Ok(StreamEnd::Disconnected)
    }
}
