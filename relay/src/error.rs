//! Relay error types.

use thiserror::Error;

/// Errors raised while serving one connection or relaying one message.
///
/// None of these are fatal to the service; at worst they end the connection
/// they belong to.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bearer credential missing or rejected. Fatal to the connection.
    #[error("authentication failed: {0}")]
    Authentication(#[from] iotbridge_shared::AuthError),

    /// Malformed JSON or unknown frame type. Reported to the client,
    /// connection stays open.
    #[error("invalid message format: {0}")]
    Protocol(#[from] serde_json::Error),

    /// Broker currently disconnected; subscribe and command frames are
    /// rejected until it comes back.
    #[error("MQTT broker is not connected")]
    BrokerUnavailable,

    /// The authorization collaborator refused this principal/device pair.
    #[error("access to device {0} denied")]
    DeviceAccessDenied(String),

    /// A specific publish was rejected by the broker client.
    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
