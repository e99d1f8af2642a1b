//! Gateway orchestration: frame dispatch, reference-counted broker
//! subscriptions, command publication and fan-out.
//!
//! Connections hand their inbound frames to [`Gateway::handle_frame`] in
//! arrival order; a single dispatch loop ([`Gateway::run`]) consumes broker
//! events. The subscription index serializes every reference-count
//! decision, so the gateway itself never races on subscribe/unsubscribe.

use crate::auth::DeviceAuthorizer;
use crate::broker::{BrokerEvent, BrokerHandle};
use crate::error::{RelayError, Result};
use crate::index::{ConnectionId, SubscriptionIndex};
use crate::protocol::{ClientFrame, CommandEnvelope, ServerFrame};
use dashmap::DashMap;
use iotbridge_shared::{now_utc, Principal, TopicScheme};
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ClientHandle {
    tx: mpsc::UnboundedSender<ServerFrame>,
}

/// The relay core. One instance serves all connections.
pub struct Gateway {
    index: SubscriptionIndex,
    connections: DashMap<ConnectionId, ClientHandle>,
    broker: BrokerHandle,
    broker_up: AtomicBool,
    scheme: TopicScheme,
    authorizer: Box<dyn DeviceAuthorizer>,
}

impl Gateway {
    pub fn new(
        broker: BrokerHandle,
        scheme: TopicScheme,
        authorizer: Box<dyn DeviceAuthorizer>,
    ) -> Self {
        Self {
            index: SubscriptionIndex::new(),
            connections: DashMap::new(),
            broker,
            broker_up: AtomicBool::new(false),
            scheme,
            authorizer,
        }
    }

    /// Register an authenticated connection. Returns the connection id and
    /// the outbound frame stream; the first frame is the current broker
    /// status.
    pub fn register(&self, principal: Principal) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let conn = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(conn, ClientHandle { tx });

        // A displaced entry only exists if the transport reused an id;
        // release its broker subscriptions either way.
        self.index.add_connection(conn, principal, |device_id| {
            self.broker.unsubscribe(self.scheme.device_pattern(device_id));
        });

        self.send_to(conn, ServerFrame::ConnectionStatus {
            connected: self.broker_connected(),
        });

        info!(%conn, connections = self.connections.len(), "client registered");
        (conn, rx)
    }

    /// Tear down a closed connection. Safe to call more than once; index
    /// state is purged exactly once.
    pub fn disconnect(&self, conn: ConnectionId) {
        if self.connections.remove(&conn).is_none() {
            return;
        }

        self.index.remove_connection(conn, |device_id| {
            self.broker.unsubscribe(self.scheme.device_pattern(device_id));
        });

        info!(%conn, connections = self.connections.len(), "client disconnected");
    }

    /// Decode and dispatch one inbound frame. Any per-frame failure is
    /// answered with an `error` frame on the same connection; it never
    /// closes the connection or touches other connections.
    pub fn handle_frame(&self, conn: ConnectionId, text: &str) {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%conn, error = %e, "undecodable client frame");
                self.send_to(conn, ServerFrame::Error {
                    message: RelayError::Protocol(e).to_string(),
                });
                return;
            }
        };

        if let Err(e) = self.dispatch(conn, frame) {
            self.send_to(conn, ServerFrame::Error {
                message: e.to_string(),
            });
        }
    }

    fn dispatch(&self, conn: ConnectionId, frame: ClientFrame) -> Result<()> {
        match frame {
            ClientFrame::Ping => {
                // Answered even while the broker is down
                self.send_to(conn, ServerFrame::Pong);
                Ok(())
            }
            ClientFrame::SubscribeWidget {
                device_id,
                widget_id,
            } => self.subscribe_widget(conn, &device_id, &widget_id),
            ClientFrame::UnsubscribeWidget {
                device_id,
                widget_id,
            } => {
                self.unsubscribe_widget(conn, &device_id, &widget_id);
                Ok(())
            }
            ClientFrame::Command {
                device_id,
                command,
                payload,
            } => self.publish_command(conn, &device_id, command, payload),
        }
    }

    fn subscribe_widget(&self, conn: ConnectionId, device_id: &str, widget_id: &str) -> Result<()> {
        if !self.broker_connected() {
            return Err(RelayError::BrokerUnavailable);
        }

        let Some(principal) = self.index.principal(conn) else {
            // Frame racing the close; the connection is gone
            return Ok(());
        };
        if !self.authorizer.allow(&principal, device_id) {
            return Err(RelayError::DeviceAccessDenied(device_id.to_string()));
        }

        // First interested connection anywhere: one broker subscribe,
        // enqueued by the index before it releases its lock so a racing
        // last-widget removal on another connection cannot reorder the
        // subscribe behind its unsubscribe.
        self.index.add_widget(conn, device_id, widget_id, |device_id| {
            self.broker.subscribe(self.scheme.device_pattern(device_id));
        });

        debug!(%conn, device_id, widget_id, "widget subscribed");
        Ok(())
    }

    fn unsubscribe_widget(&self, conn: ConnectionId, device_id: &str, widget_id: &str) {
        // Applied even while the broker is down; at worst the unsubscribe
        // request is logged as failed and the broker keeps a stale
        // subscription until reconnect replay corrects it.
        self.index.remove_widget(conn, device_id, widget_id, |device_id| {
            self.broker.unsubscribe(self.scheme.device_pattern(device_id));
        });
        debug!(%conn, device_id, widget_id, "widget unsubscribed");
    }

    fn publish_command(
        &self,
        conn: ConnectionId,
        device_id: &str,
        command: String,
        payload: serde_json::Value,
    ) -> Result<()> {
        if !self.broker_connected() {
            return Err(RelayError::BrokerUnavailable);
        }

        let Some(principal) = self.index.principal(conn) else {
            return Ok(());
        };
        if !self.authorizer.allow(&principal, device_id) {
            return Err(RelayError::DeviceAccessDenied(device_id.to_string()));
        }

        let topic = self.scheme.device_command_topic(device_id);
        let envelope = CommandEnvelope::new(command, payload);
        let body = serde_json::to_vec(&envelope)?;

        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        self.broker
            .publish(topic.clone(), body, QoS::AtLeastOnce, ack_tx);

        // Await the acknowledgment off the frame path so this connection's
        // later frames (and everyone else's) are not held up. If the
        // connection closes first, the response simply has nowhere to go.
        let Some(reply) = self.connections.get(&conn).map(|h| h.tx.clone()) else {
            return Ok(());
        };
        tokio::spawn(async move {
            let frame = match ack_rx.await {
                Ok(Ok(())) => ServerFrame::Success {
                    message: "Command sent successfully".to_string(),
                },
                Ok(Err(reason)) => ServerFrame::Error {
                    message: RelayError::Publish { topic, reason }.to_string(),
                },
                Err(_) => ServerFrame::Error {
                    message: "Failed to send command".to_string(),
                },
            };
            let _ = reply.send(frame);
        });

        Ok(())
    }

    /// Dispatch loop over broker events. Runs until the broker task ends.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_broker_event(event);
        }
        warn!("broker event stream ended");
    }

    pub fn handle_broker_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Up => {
                // Status frames report transitions; a repeated Up from the
                // adapter changes nothing and must stay silent.
                if self.broker_up.swap(true, Ordering::SeqCst) {
                    return;
                }
                info!("broker up, replaying active subscriptions");

                // The adapter is not trusted to resubscribe after a
                // reconnect: replay every device with live interest.
                for device_id in self.index.active_devices() {
                    self.broker.subscribe(self.scheme.device_pattern(&device_id));
                }
                self.broadcast(ServerFrame::ConnectionStatus { connected: true });
            }
            BrokerEvent::Down => {
                // The adapter reports Down on every failed reconnect
                // attempt; clients hear about the first one only.
                if !self.broker_up.swap(false, Ordering::SeqCst) {
                    return;
                }
                warn!("broker down");
                self.broadcast(ServerFrame::ConnectionStatus { connected: false });
            }
            BrokerEvent::Message { topic, payload } => self.fan_out(&topic, &payload),
        }
    }

    /// Deliver one broker message to every interested connection, each
    /// frame tagged with that connection's own widget ids.
    fn fan_out(&self, topic: &str, payload: &[u8]) {
        let Some(device_id) = self.scheme.extract_device_id(topic) else {
            warn!(%topic, "dropping message with unrecognized topic shape");
            return;
        };

        let interested = self.index.connections_for_device(device_id);
        if interested.is_empty() {
            debug!(device_id, "no connections interested in device");
            return;
        }

        let message = String::from_utf8_lossy(payload).into_owned();
        let timestamp = now_utc().to_rfc3339();

        for (conn, widgets) in interested {
            self.send_to(conn, ServerFrame::DeviceData {
                device_id: device_id.to_string(),
                topic: topic.to_string(),
                message: message.clone(),
                timestamp: timestamp.clone(),
                widgets,
            });
        }
    }

    fn broadcast(&self, frame: ServerFrame) {
        for entry in self.connections.iter() {
            let _ = entry.value().tx.send(frame.clone());
        }
    }

    fn send_to(&self, conn: ConnectionId, frame: ServerFrame) {
        if let Some(handle) = self.connections.get(&conn) {
            if handle.tx.send(frame).is_err() {
                debug!(%conn, "outbound channel closed");
            }
        }
    }

    pub fn broker_connected(&self) -> bool {
        self.broker_up.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn watched_device_count(&self) -> usize {
        self.index.device_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::broker::BrokerRequest;
    use serde_json::json;

    fn test_gateway() -> (Arc<Gateway>, mpsc::UnboundedReceiver<BrokerRequest>) {
        test_gateway_with(Box::new(AllowAll))
    }

    fn test_gateway_with(
        authorizer: Box<dyn DeviceAuthorizer>,
    ) -> (Arc<Gateway>, mpsc::UnboundedReceiver<BrokerRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(Gateway::new(
            BrokerHandle::new(tx),
            TopicScheme::new("iot"),
            authorizer,
        ));
        (gateway, rx)
    }

    fn alice() -> Principal {
        Principal {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
        }
    }

    fn bob() -> Principal {
        Principal {
            user_id: "u2".to_string(),
            username: "bob".to_string(),
        }
    }

    /// Register a connection and swallow the initial status frame.
    fn connect(
        gateway: &Gateway,
        principal: Principal,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let (conn, mut rx) = gateway.register(principal);
        match rx.try_recv() {
            Ok(ServerFrame::ConnectionStatus { .. }) => {}
            other => panic!("expected initial connection_status, got {:?}", other),
        }
        (conn, rx)
    }

    fn subscribe(gateway: &Gateway, conn: ConnectionId, device: &str, widget: &str) {
        gateway.handle_frame(
            conn,
            &json!({"type": "subscribe_widget", "deviceId": device, "widgetId": widget})
                .to_string(),
        );
    }

    fn unsubscribe(gateway: &Gateway, conn: ConnectionId, device: &str, widget: &str) {
        gateway.handle_frame(
            conn,
            &json!({"type": "unsubscribe_widget", "deviceId": device, "widgetId": widget})
                .to_string(),
        );
    }

    fn deliver(gateway: &Gateway, topic: &str, payload: &[u8]) {
        gateway.handle_broker_event(BrokerEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    fn expect_error(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> String {
        match rx.try_recv() {
            Ok(ServerFrame::Error { message }) => message,
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_pong_regardless_of_broker_state() {
        let (gateway, _broker) = test_gateway();
        let (conn, mut rx) = connect(&gateway, alice());

        // Broker never came up
        gateway.handle_frame(conn, r#"{"type":"ping"}"#);
        assert!(matches!(rx.try_recv(), Ok(ServerFrame::Pong)));

        gateway.handle_broker_event(BrokerEvent::Up);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerFrame::ConnectionStatus { connected: true })
        ));
        gateway.handle_frame(conn, r#"{"type":"ping"}"#);
        assert!(matches!(rx.try_recv(), Ok(ServerFrame::Pong)));
    }

    #[tokio::test]
    async fn test_subscribe_rejected_while_broker_down() {
        let (gateway, mut broker) = test_gateway();
        let (conn, mut rx) = connect(&gateway, alice());

        subscribe(&gateway, conn, "d1", "w1");
        expect_error(&mut rx);
        assert!(broker.try_recv().is_err());
        assert_eq!(gateway.watched_device_count(), 0);
    }

    #[tokio::test]
    async fn test_command_rejected_while_broker_down() {
        let (gateway, mut broker) = test_gateway();
        let (conn, mut rx) = connect(&gateway, alice());

        gateway.handle_frame(
            conn,
            r#"{"type":"command","deviceId":"d1","command":"reboot","payload":{}}"#,
        );
        expect_error(&mut rx);
        // No publish was attempted
        assert!(broker.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_client_fan_out_with_widget_tag() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (conn, mut rx) = connect(&gateway, alice());

        subscribe(&gateway, conn, "d1", "w1");
        match broker.try_recv() {
            Ok(BrokerRequest::Subscribe { pattern }) => assert_eq!(pattern, "iot/device/d1/+"),
            other => panic!("expected broker subscribe, got {:?}", other),
        }

        deliver(&gateway, "iot/device/d1/data", br#"{"temp":21}"#);
        match rx.try_recv() {
            Ok(ServerFrame::DeviceData {
                device_id,
                topic,
                message,
                widgets,
                ..
            }) => {
                assert_eq!(device_id, "d1");
                assert_eq!(topic, "iot/device/d1/data");
                assert_eq!(message, r#"{"temp":21}"#);
                assert_eq!(widgets, vec!["w1".to_string()]);
            }
            other => panic!("expected device_data frame, got {:?}", other),
        }
        // Exactly one frame
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeated_subscribe_is_idempotent() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (conn, _rx) = connect(&gateway, alice());

        subscribe(&gateway, conn, "d1", "w1");
        subscribe(&gateway, conn, "d1", "w1");

        assert!(matches!(
            broker.try_recv(),
            Ok(BrokerRequest::Subscribe { .. })
        ));
        assert!(broker.try_recv().is_err());
        assert_eq!(gateway.watched_device_count(), 1);
    }

    #[tokio::test]
    async fn test_two_clients_each_get_their_own_widget_list() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (c1, mut rx1) = connect(&gateway, alice());
        let (c2, mut rx2) = connect(&gateway, bob());

        subscribe(&gateway, c1, "d1", "w1");
        subscribe(&gateway, c2, "d1", "w2");

        // Second interest in d1 must not subscribe again
        assert!(matches!(
            broker.try_recv(),
            Ok(BrokerRequest::Subscribe { .. })
        ));
        assert!(broker.try_recv().is_err());

        deliver(&gateway, "iot/device/d1/status", b"online");

        match rx1.try_recv() {
            Ok(ServerFrame::DeviceData { widgets, .. }) => {
                assert_eq!(widgets, vec!["w1".to_string()]);
            }
            other => panic!("expected device_data for c1, got {:?}", other),
        }
        match rx2.try_recv() {
            Ok(ServerFrame::DeviceData { widgets, .. }) => {
                assert_eq!(widgets, vec!["w2".to_string()]);
            }
            other => panic!("expected device_data for c2, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_widgets_one_frame() {
        let (gateway, _broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (conn, mut rx) = connect(&gateway, alice());

        subscribe(&gateway, conn, "d1", "w1");
        subscribe(&gateway, conn, "d1", "w2");
        subscribe(&gateway, conn, "d1", "w3");

        deliver(&gateway, "iot/device/d1/data", b"42");

        // One frame listing all three widget ids, not three frames
        match rx.try_recv() {
            Ok(ServerFrame::DeviceData { widgets, .. }) => {
                assert_eq!(
                    widgets,
                    vec!["w1".to_string(), "w2".to_string(), "w3".to_string()]
                );
            }
            other => panic!("expected device_data frame, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_broker_subscription_while_needed() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (c1, _rx1) = connect(&gateway, alice());
        let (c2, mut rx2) = connect(&gateway, bob());

        subscribe(&gateway, c1, "d1", "w1");
        subscribe(&gateway, c2, "d1", "w2");
        assert!(matches!(
            broker.try_recv(),
            Ok(BrokerRequest::Subscribe { .. })
        ));

        unsubscribe(&gateway, c1, "d1", "w1");
        // c2 still holds d1: no broker unsubscribe
        assert!(broker.try_recv().is_err());

        deliver(&gateway, "iot/device/d1/data", b"still flowing");
        assert!(matches!(rx2.try_recv(), Ok(ServerFrame::DeviceData { .. })));
    }

    #[tokio::test]
    async fn test_last_disconnect_unsubscribes_exactly_once() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (c1, _rx1) = connect(&gateway, alice());
        let (c2, _rx2) = connect(&gateway, bob());

        subscribe(&gateway, c1, "d1", "w1");
        subscribe(&gateway, c2, "d1", "w2");
        assert!(matches!(
            broker.try_recv(),
            Ok(BrokerRequest::Subscribe { .. })
        ));

        gateway.disconnect(c1);
        assert!(broker.try_recv().is_err());

        gateway.disconnect(c2);
        match broker.try_recv() {
            Ok(BrokerRequest::Unsubscribe { pattern }) => {
                assert_eq!(pattern, "iot/device/d1/+");
            }
            other => panic!("expected broker unsubscribe, got {:?}", other),
        }
        assert!(broker.try_recv().is_err());

        // Double disconnect is a no-op
        gateway.disconnect(c2);
        assert!(broker.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_command_publishes_and_reports_ack() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (conn, mut rx) = connect(&gateway, alice());

        gateway.handle_frame(
            conn,
            r#"{"type":"command","deviceId":"d1","command":"set_led","payload":{"on":true}}"#,
        );

        let (topic, payload, ack) = match broker.try_recv() {
            Ok(BrokerRequest::Publish {
                topic,
                payload,
                qos,
                ack,
            }) => {
                assert_eq!(qos, QoS::AtLeastOnce);
                (topic, payload, ack)
            }
            other => panic!("expected broker publish, got {:?}", other),
        };
        assert_eq!(topic, "iot/device/d1/command");

        let envelope: CommandEnvelope = serde_json::from_slice(&payload).unwrap();
        assert_eq!(envelope.command, "set_led");
        assert_eq!(envelope.payload, json!({"on": true}));

        ack.send(Ok(())).unwrap();
        match rx.recv().await {
            Some(ServerFrame::Success { .. }) => {}
            other => panic!("expected success frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_publish_reported_per_command() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (conn, mut rx) = connect(&gateway, alice());

        gateway.handle_frame(
            conn,
            r#"{"type":"command","deviceId":"d1","command":"reboot"}"#,
        );

        match broker.try_recv() {
            Ok(BrokerRequest::Publish { ack, .. }) => {
                ack.send(Err("request queue closed".to_string())).unwrap();
            }
            other => panic!("expected broker publish, got {:?}", other),
        }

        match rx.recv().await {
            Some(ServerFrame::Error { message }) => {
                assert!(message.contains("iot/device/d1/command"));
            }
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ack_after_disconnect_is_discarded() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (conn, rx) = connect(&gateway, alice());

        gateway.handle_frame(
            conn,
            r#"{"type":"command","deviceId":"d1","command":"reboot"}"#,
        );
        let ack = match broker.try_recv() {
            Ok(BrokerRequest::Publish { ack, .. }) => ack,
            other => panic!("expected broker publish, got {:?}", other),
        };

        drop(rx);
        gateway.disconnect(conn);

        // The response has no connection to be sent to; nothing panics
        let _ = ack.send(Ok(()));
        tokio::task::yield_now().await;
        assert_eq!(gateway.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let (gateway, _broker) = test_gateway();
        let (conn, mut rx) = connect(&gateway, alice());

        gateway.handle_frame(conn, "not json at all");
        expect_error(&mut rx);
        gateway.handle_frame(conn, r#"{"type":"self_destruct"}"#);
        expect_error(&mut rx);

        // Connection still serves frames afterwards
        gateway.handle_frame(conn, r#"{"type":"ping"}"#);
        assert!(matches!(rx.try_recv(), Ok(ServerFrame::Pong)));
    }

    #[tokio::test]
    async fn test_binary_payloads_share_the_text_path() {
        let (gateway, _broker) = test_gateway();
        let (conn, mut rx) = connect(&gateway, alice());

        // A frame arriving as bytes decodes and dispatches like text
        let bytes: &[u8] = br#"{"type":"ping"}"#;
        gateway.handle_frame(conn, &String::from_utf8_lossy(bytes));
        assert!(matches!(rx.try_recv(), Ok(ServerFrame::Pong)));

        // Non-UTF-8 bytes decode lossily and are answered with an error
        // frame instead of being dropped
        let garbage = [0xff, 0xfe, 0x00, 0x42];
        gateway.handle_frame(conn, &String::from_utf8_lossy(&garbage));
        expect_error(&mut rx);

        // The connection stays open afterwards
        gateway.handle_frame(conn, r#"{"type":"ping"}"#);
        assert!(matches!(rx.try_recv(), Ok(ServerFrame::Pong)));
    }

    #[tokio::test]
    async fn test_malformed_topic_dropped() {
        let (gateway, _broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (conn, mut rx) = connect(&gateway, alice());
        subscribe(&gateway, conn, "d1", "w1");

        deliver(&gateway, "wrong/shape", b"ignored");
        deliver(&gateway, "iot/device//data", b"ignored");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broker_transitions_broadcast_status() {
        let (gateway, _broker) = test_gateway();
        let (_c1, mut rx1) = connect(&gateway, alice());
        let (_c2, mut rx2) = connect(&gateway, bob());

        gateway.handle_broker_event(BrokerEvent::Up);
        gateway.handle_broker_event(BrokerEvent::Down);

        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(
                rx.try_recv(),
                Ok(ServerFrame::ConnectionStatus { connected: true })
            ));
            assert!(matches!(
                rx.try_recv(),
                Ok(ServerFrame::ConnectionStatus { connected: false })
            ));
        }
        assert!(!gateway.broker_connected());
    }

    #[tokio::test]
    async fn test_repeated_broker_state_reports_once() {
        let (gateway, _broker) = test_gateway();
        let (_conn, mut rx) = connect(&gateway, alice());

        // Down while already down (startup retries): nothing to report
        gateway.handle_broker_event(BrokerEvent::Down);
        assert!(rx.try_recv().is_err());

        gateway.handle_broker_event(BrokerEvent::Up);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerFrame::ConnectionStatus { connected: true })
        ));

        // The adapter retries every interval and reports Down each time;
        // clients hear a single status change
        gateway.handle_broker_event(BrokerEvent::Down);
        gateway.handle_broker_event(BrokerEvent::Down);
        gateway.handle_broker_event(BrokerEvent::Down);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerFrame::ConnectionStatus { connected: false })
        ));
        assert!(rx.try_recv().is_err());

        gateway.handle_broker_event(BrokerEvent::Up);
        gateway.handle_broker_event(BrokerEvent::Up);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerFrame::ConnectionStatus { connected: true })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_drain_and_subscribe_keep_broker_attached() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (c1, _rx1) = connect(&gateway, alice());
        let (c2, _rx2) = connect(&gateway, bob());

        for _ in 0..500 {
            subscribe(&gateway, c1, "d1", "w1");
            while broker.try_recv().is_ok() {}

            // c1 drops its last widget on d1 while c2 races in with first
            // interest of its own
            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    unsubscribe(&gateway, c1, "d1", "w1");
                });
                s.spawn(|| {
                    barrier.wait();
                    subscribe(&gateway, c2, "d1", "w2");
                });
            });

            // c2 holds live interest, so whatever the interleaving the
            // broker must end up subscribed: either no requests at all
            // (the add landed first) or an unsubscribe followed by a
            // resubscribe. A subscribe-then-unsubscribe tail would leave
            // d1 silent until the next reconnect.
            let mut requests = Vec::new();
            while let Ok(request) = broker.try_recv() {
                requests.push(request);
            }
            match requests.as_slice() {
                [] => {}
                [BrokerRequest::Unsubscribe { .. }, BrokerRequest::Subscribe { .. }] => {}
                other => panic!("broker left detached from watched device: {:?}", other),
            }
            assert_eq!(gateway.watched_device_count(), 1);

            unsubscribe(&gateway, c2, "d1", "w2");
            while broker.try_recv().is_ok() {}
        }
    }

    #[tokio::test]
    async fn test_reconnect_replays_active_subscriptions() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (conn, _rx) = connect(&gateway, alice());

        subscribe(&gateway, conn, "d1", "w1");
        subscribe(&gateway, conn, "d2", "w2");
        assert!(matches!(broker.try_recv(), Ok(BrokerRequest::Subscribe { .. })));
        assert!(matches!(broker.try_recv(), Ok(BrokerRequest::Subscribe { .. })));

        gateway.handle_broker_event(BrokerEvent::Down);
        gateway.handle_broker_event(BrokerEvent::Up);

        let mut replayed = Vec::new();
        while let Ok(BrokerRequest::Subscribe { pattern }) = broker.try_recv() {
            replayed.push(pattern);
        }
        replayed.sort();
        assert_eq!(replayed, vec!["iot/device/d1/+", "iot/device/d2/+"]);
    }

    #[tokio::test]
    async fn test_authorizer_gates_subscription() {
        struct DenyAll;
        impl DeviceAuthorizer for DenyAll {
            fn allow(&self, _principal: &Principal, _device_id: &str) -> bool {
                false
            }
        }

        let (gateway, mut broker) = test_gateway_with(Box::new(DenyAll));
        gateway.handle_broker_event(BrokerEvent::Up);
        let (conn, mut rx) = connect(&gateway, alice());

        subscribe(&gateway, conn, "d1", "w1");
        let message = expect_error(&mut rx);
        assert!(message.contains("d1"));
        assert!(broker.try_recv().is_err());
        assert_eq!(gateway.watched_device_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_processed_while_broker_down() {
        let (gateway, mut broker) = test_gateway();
        gateway.handle_broker_event(BrokerEvent::Up);
        let (conn, mut rx) = connect(&gateway, alice());

        subscribe(&gateway, conn, "d1", "w1");
        assert!(matches!(broker.try_recv(), Ok(BrokerRequest::Subscribe { .. })));

        gateway.handle_broker_event(BrokerEvent::Down);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerFrame::ConnectionStatus { connected: false })
        ));

        unsubscribe(&gateway, conn, "d1", "w1");
        // Index updated; unsubscribe request still attempted
        assert_eq!(gateway.watched_device_count(), 0);
        assert!(matches!(
            broker.try_recv(),
            Ok(BrokerRequest::Unsubscribe { .. })
        ));

        // Reconnect replay has nothing left to subscribe
        gateway.handle_broker_event(BrokerEvent::Up);
        assert!(broker.try_recv().is_err());
    }
}
