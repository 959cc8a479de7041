use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Prefix shared by every per-project log channel on the bus.
pub const LOG_CHANNEL_PREFIX: &str = "logs:";

/// Wildcard pattern covering every log channel.
pub const LOG_CHANNEL_PATTERN: &str = "logs:*";

/// Channel a worker publishes its build logs to.
pub fn log_channel(project_id: &str) -> String {
    format!("{LOG_CHANNEL_PREFIX}{project_id}")
}

/// Frames sent by a realtime client.
///
/// Encoded as `{"event": "subscribe", "data": "logs:<project>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(String),
}

/// Frames sent to a realtime client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Either a subscribe acknowledgement or a relayed log payload.
    Message(Value),
    Error { message: String },
}

impl ServerMessage {
    /// Acknowledgement sent to a client after it joined `channel`.
    pub fn joined(channel: &str) -> Self {
        ServerMessage::Message(json!({
            "status": "success",
            "message": format!("Joined {channel}"),
        }))
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid client frame: {0}")]
    InvalidFrame(#[source] serde_json::Error),
    #[error("failed to encode server frame: {0}")]
    Encode(#[source] serde_json::Error),
}

pub fn decode_client_text(text: &str) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::InvalidFrame)
}

pub fn decode_client_bytes(bytes: &[u8]) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_slice(bytes).map_err(ProtocolError::InvalidFrame)
}
