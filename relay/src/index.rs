//! Subscription index: connection → (device, widget) interest plus the
//! derived per-device reference count.
//!
//! The broker holds exactly one subscription per device with at least one
//! interested connection. Every decision that depends on the reference
//! count (first interest, last interest gone) happens under one mutex so
//! two handlers racing on the same device cannot double-subscribe or
//! double-unsubscribe. The `on_*` callbacks run while that mutex is still
//! held: the caller enqueues its broker request inside them, so requests
//! land on the broker channel in the same order as the decisions they
//! belong to. The callbacks must stay non-blocking (an unbounded channel
//! send) and must not call back into the index.

use iotbridge_shared::Principal;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Unique identifier for one client connection.
pub type ConnectionId = Uuid;

#[derive(Debug)]
struct ConnectionEntry {
    principal: Principal,
    /// device id → widget ids watching it on this connection.
    widgets: HashMap<String, HashSet<String>>,
}

#[derive(Debug, Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// device id → number of connections with at least one widget on it.
    device_refs: HashMap<String, usize>,
}

impl Inner {
    /// Drops one connection's interest, reporting each device whose
    /// reference count reached zero.
    fn release(&mut self, entry: ConnectionEntry, on_drained: &mut impl FnMut(&str)) {
        for device_id in entry.widgets.into_keys() {
            match self.device_refs.get_mut(&device_id) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.device_refs.remove(&device_id);
                    on_drained(&device_id);
                }
                None => warn!(%device_id, "device missing from reference counts"),
            }
        }
    }
}

/// Shared index of live widget subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    inner: Mutex<Inner>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with an empty interest set.
    ///
    /// A duplicate id means the transport violated its lifecycle contract;
    /// the stale entry is logged, overwritten, and `on_drained` is invoked
    /// (under the lock) for each of its devices with no remaining watchers
    /// so the caller can unsubscribe them.
    pub fn add_connection(
        &self,
        conn: ConnectionId,
        principal: Principal,
        mut on_drained: impl FnMut(&str),
    ) {
        let mut inner = self.inner.lock().unwrap();
        let displaced = inner.connections.insert(
            conn,
            ConnectionEntry {
                principal,
                widgets: HashMap::new(),
            },
        );
        if let Some(entry) = displaced {
            warn!(%conn, "duplicate connection id, overwriting stale entry");
            inner.release(entry, &mut on_drained);
        }
    }

    /// Remove a connection and all its widget subscriptions. `on_drained`
    /// is invoked (under the lock) for each device whose reference count
    /// dropped to zero; the caller must issue those broker unsubscribes.
    pub fn remove_connection(&self, conn: ConnectionId, mut on_drained: impl FnMut(&str)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.connections.remove(&conn) {
            inner.release(entry, &mut on_drained);
        }
    }

    /// Record one widget's interest in one device. Idempotent.
    ///
    /// Returns `true` iff this made the device go from zero to one
    /// interested connection; only then is `on_first_interest` invoked
    /// (under the lock) so the caller can subscribe on the broker.
    pub fn add_widget(
        &self,
        conn: ConnectionId,
        device_id: &str,
        widget_id: &str,
        on_first_interest: impl FnOnce(&str),
    ) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(entry) = inner.connections.get_mut(&conn) else {
            // Connection already closed; frames racing the close are dropped.
            return false;
        };

        let device_widgets = entry.widgets.entry(device_id.to_string()).or_default();
        let first_on_connection = device_widgets.is_empty();
        device_widgets.insert(widget_id.to_string());

        if !first_on_connection {
            return false;
        }

        let count = inner.device_refs.entry(device_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            on_first_interest(device_id);
            true
        } else {
            false
        }
    }

    /// Remove one widget's interest in one device. Idempotent no-op when
    /// absent.
    ///
    /// Returns `true` iff the device's reference count reached zero; only
    /// then is `on_drained` invoked (under the lock) so the caller can
    /// unsubscribe on the broker.
    pub fn remove_widget(
        &self,
        conn: ConnectionId,
        device_id: &str,
        widget_id: &str,
        on_drained: impl FnOnce(&str),
    ) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(entry) = inner.connections.get_mut(&conn) else {
            return false;
        };

        let Some(device_widgets) = entry.widgets.get_mut(device_id) else {
            return false;
        };
        if !device_widgets.remove(widget_id) {
            return false;
        }
        if !device_widgets.is_empty() {
            return false;
        }

        // Last widget on this connection for the device
        entry.widgets.remove(device_id);
        match inner.device_refs.get_mut(device_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                inner.device_refs.remove(device_id);
                on_drained(device_id);
                true
            }
            None => {
                warn!(%device_id, "device missing from reference counts");
                false
            }
        }
    }

    /// Every connection interested in a device, each with its own widget
    /// ids so fan-out frames can be tagged. Widget ids are sorted for
    /// stable output.
    pub fn connections_for_device(&self, device_id: &str) -> Vec<(ConnectionId, Vec<String>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .connections
            .iter()
            .filter_map(|(conn, entry)| {
                entry.widgets.get(device_id).map(|widgets| {
                    let mut ids: Vec<String> = widgets.iter().cloned().collect();
                    ids.sort();
                    (*conn, ids)
                })
            })
            .collect()
    }

    /// Devices with a non-zero reference count, for replaying broker
    /// subscriptions after a reconnect.
    pub fn active_devices(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.device_refs.keys().cloned().collect()
    }

    pub fn principal(&self, conn: ConnectionId) -> Option<Principal> {
        let inner = self.inner.lock().unwrap();
        inner.connections.get(&conn).map(|e| e.principal.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    pub fn device_count(&self) -> usize {
        self.inner.lock().unwrap().device_refs.len()
    }
}
