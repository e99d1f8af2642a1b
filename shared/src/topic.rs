//! MQTT topic conventions for the device topic tree.
//!
//! Every device lives under `{root}/device/{device_id}/{suffix}` where the
//! suffix is one of `data`, `status` or `command`. Subscriptions cover all
//! suffixes of one device with the single-level wildcard `+`.

/// Builds and parses topics under one configured root segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    root: String,
}

impl TopicScheme {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Subscription pattern covering data, status and command of one device.
    pub fn device_pattern(&self, device_id: &str) -> String {
        format!("{}/device/{}/+", self.root, device_id)
    }

    pub fn device_data_topic(&self, device_id: &str) -> String {
        format!("{}/device/{}/data", self.root, device_id)
    }

    pub fn device_status_topic(&self, device_id: &str) -> String {
        format!("{}/device/{}/status", self.root, device_id)
    }

    pub fn device_command_topic(&self, device_id: &str) -> String {
        format!("{}/device/{}/command", self.root, device_id)
    }

    /// Extract the device id from an inbound topic.
    ///
    /// Returns `None` unless the topic is `{root}/device/{id}/...` with a
    /// non-empty id segment. Callers drop such messages; they are never
    /// forwarded to clients.
    pub fn extract_device_id<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let mut parts = topic.split('/');
        if parts.next() != Some(self.root.as_str()) {
            return None;
        }
        if parts.next() != Some("device") {
            return None;
        }
        match parts.next() {
            Some(id) if !id.is_empty() => Some(id),
            _ => None,
        }
    }
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("iot")
    }
}
