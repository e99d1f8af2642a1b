//! WebSocket wire protocol.
//!
//! JSON frames tagged by `type`; field names stay camelCase for the UI
//! clients consuming them.

use iotbridge_shared::now_utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame sent from a client to the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Register one widget's interest in one device.
    SubscribeWidget {
        device_id: String,
        widget_id: String,
    },
    /// Remove one widget's interest in one device.
    UnsubscribeWidget {
        device_id: String,
        widget_id: String,
    },
    /// Publish a command to a device.
    Command {
        device_id: String,
        command: String,
        #[serde(default)]
        payload: Value,
    },
    /// Keepalive; answered with `pong` even while the broker is down.
    Ping,
}

/// Frame sent from the relay to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Current broker connectivity; sent on connect and on every transition.
    ConnectionStatus { connected: bool },
    /// One inbound broker message, tagged with the receiving connection's
    /// own widget ids for the device.
    DeviceData {
        device_id: String,
        topic: String,
        message: String,
        timestamp: String,
        widgets: Vec<String>,
    },
    Success { message: String },
    Error { message: String },
    Pong,
}

/// Envelope published to `{root}/device/{id}/command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    pub payload: Value,
    pub timestamp: String,
}

impl CommandEnvelope {
    pub fn new(command: String, payload: Value) -> Self {
        Self {
            command,
            payload,
            timestamp: now_utc().to_rfc3339(),
        }
    }
}
