//! Topic relay gateway bridging an MQTT broker to WebSocket clients.
//!
//! Clients authenticate at connect time, then express interest in devices
//! at widget granularity. The relay keeps exactly one broker subscription
//! per device with live interest, fans inbound device messages out to the
//! interested connections, and publishes client commands back onto the
//! broker.
//!
//! ```text
//! MQTT broker (iot/device/{id}/+)
//!         ↕
//! broker adapter (request/event channels)
//!         ↕
//! gateway + subscription index (refcounted)
//!         ↕
//! WebSocket clients (widget-tagged frames)
//! ```

pub mod auth;
pub mod broker;
pub mod error;
pub mod gateway;
pub mod index;
pub mod protocol;
pub mod ws;

pub use auth::{AllowAll, Authenticator, DeviceAuthorizer, JwtAuthenticator};
pub use broker::{BrokerEvent, BrokerHandle, BrokerRequest};
pub use error::{RelayError, Result};
pub use gateway::Gateway;
pub use index::{ConnectionId, SubscriptionIndex};
pub use protocol::{ClientFrame, CommandEnvelope, ServerFrame};
pub use ws::{create_router, AppState};
