//! MQTT broker adapter.
//!
//! The gateway never touches `rumqttc` directly: it sends [`BrokerRequest`]
//! values through a handle and consumes [`BrokerEvent`] values from one
//! channel, which keeps per-topic arrival order (a single event loop feeds
//! a single queue) and lets tests script the broker end to end.

use iotbridge_shared::MqttConfig;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Request from the gateway to the broker task.
#[derive(Debug)]
pub enum BrokerRequest {
    Subscribe {
        pattern: String,
    },
    Unsubscribe {
        pattern: String,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        /// Completed with the submission result so the gateway can answer
        /// the originating client.
        ack: oneshot::Sender<Result<(), String>>,
    },
}

/// Event surfaced from the broker task to the gateway dispatch loop.
#[derive(Debug)]
pub enum BrokerEvent {
    /// Transport established (also after a reconnect).
    Up,
    /// Transport lost; flips the client-visible broker status.
    Down,
    /// One inbound broker message.
    Message { topic: String, payload: Vec<u8> },
}

/// Cloneable handle the gateway uses to talk to the broker task.
///
/// Subscribe and unsubscribe are fire-and-forget; failures are logged by
/// the broker task, never fatal. A failed unsubscribe leaves a stale broker
/// subscription behind, which is an acceptable degraded state.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<BrokerRequest>,
}

impl BrokerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<BrokerRequest>) -> Self {
        Self { tx }
    }

    pub fn subscribe(&self, pattern: String) {
        if self.tx.send(BrokerRequest::Subscribe { pattern }).is_err() {
            error!("broker task gone, dropping subscribe request");
        }
    }

    pub fn unsubscribe(&self, pattern: String) {
        if self.tx.send(BrokerRequest::Unsubscribe { pattern }).is_err() {
            error!("broker task gone, dropping unsubscribe request");
        }
    }

    pub fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        ack: oneshot::Sender<Result<(), String>>,
    ) {
        let request = BrokerRequest::Publish {
            topic,
            payload,
            qos,
            ack,
        };
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request) {
            error!("broker task gone, dropping publish request");
            if let BrokerRequest::Publish { ack, .. } = request {
                let _ = ack.send(Err("broker task unavailable".to_string()));
            }
        }
    }
}

/// Spawn the broker client tasks. Returns the request handle and the event
/// stream the gateway dispatch loop consumes.
pub fn spawn(config: MqttConfig) -> (BrokerHandle, mpsc::UnboundedReceiver<BrokerEvent>) {
    let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    let (client, eventloop) = AsyncClient::new(options, 10);
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    info!(
        broker = %config.broker,
        port = config.port,
        client_id = %config.client_id,
        "starting MQTT client"
    );

    tokio::spawn(run_requests(client, request_rx));
    tokio::spawn(run_eventloop(eventloop, event_tx, config));

    (BrokerHandle::new(request_tx), event_rx)
}

/// Forwards gateway requests to the MQTT client.
async fn run_requests(client: AsyncClient, mut requests: mpsc::UnboundedReceiver<BrokerRequest>) {
    while let Some(request) = requests.recv().await {
        match request {
            BrokerRequest::Subscribe { pattern } => {
                match client.subscribe(&pattern, QoS::AtLeastOnce).await {
                    Ok(()) => info!(%pattern, "subscribed to MQTT topic"),
                    Err(e) => error!(%pattern, error = %e, "MQTT subscribe failed"),
                }
            }
            BrokerRequest::Unsubscribe { pattern } => match client.unsubscribe(&pattern).await {
                Ok(()) => info!(%pattern, "unsubscribed from MQTT topic"),
                Err(e) => error!(%pattern, error = %e, "MQTT unsubscribe failed"),
            },
            BrokerRequest::Publish {
                topic,
                payload,
                qos,
                ack,
            } => {
                let result = client
                    .publish(&topic, qos, false, payload)
                    .await
                    .map_err(|e| e.to_string());
                if let Err(e) = &result {
                    error!(%topic, error = %e, "MQTT publish failed");
                }
                // Receiver may be gone if the connection closed mid-command
                let _ = ack.send(result);
            }
        }
    }
    debug!("broker request channel closed");
}

/// Drives the MQTT event loop, surfacing connectivity transitions and
/// inbound messages. Reconnects with the configured interval; an attempt
/// budget of 0 retries forever.
async fn run_eventloop(
    mut eventloop: rumqttc::EventLoop,
    events: mpsc::UnboundedSender<BrokerEvent>,
    config: MqttConfig,
) {
    let mut attempts: u32 = 0;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to MQTT broker");
                attempts = 0;
                if events.send(BrokerEvent::Up).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(topic = %publish.topic, "received MQTT message");
                let message = BrokerEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if events.send(message).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error");
                if events.send(BrokerEvent::Down).is_err() {
                    break;
                }

                attempts += 1;
                if config.max_reconnect_attempts > 0 && attempts >= config.max_reconnect_attempts {
                    error!("max MQTT reconnect attempts reached, giving up");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(config.reconnect_interval_ms)).await;
            }
        }
    }
}
