//! Live build-log relay.
//!
//! Workers publish JSON log lines to `logs:<project>` on Redis. A single
//! wildcard subscription ([`bus::RedisLogSubscriber`]) feeds every message to
//! the [`relay::LogRelay`], which hands it to the [`router::ChannelRouter`] for
//! fan-out to the realtime connections that subscribed to that exact channel.

pub mod bus;
pub mod protocol;
pub mod relay;
pub mod router;

pub use bus::{BusError, BusEvent, ReconnectPolicy, RedisLogSubscriber};
pub use protocol::{
    log_channel, ClientMessage, ProtocolError, ServerMessage, LOG_CHANNEL_PATTERN,
    LOG_CHANNEL_PREFIX,
};
pub use relay::{LogRelay, RelayError};
pub use router::{
    ChannelRouter, ChannelSnapshot, ConnectionId, DeliveryMetrics, JoinOutcome, Subscriber,
};
