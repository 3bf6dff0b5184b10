use serde::{Deserialize, Serialize};
use transport::payload::now_millis;
use transport::InboundMessage;

/// Registry entry for a field device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: i64,
    pub uid: String,
    pub name: String,
    pub device_type: String,
    pub status: String,
}

impl Device {
    /// A record not stored yet; the registry assigns `id`.
    pub fn new(
        uid: impl Into<String>,
        name: impl Into<String>,
        device_type: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            uid: uid.into(),
            name: name.into(),
            device_type: device_type.into(),
            status: status.into(),
        }
    }
}

/// Partial edit of a stored device. Absent fields keep their value; the uid
/// is never editable.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
    #[serde(alias = "deviceName")]
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub status: Option<String>,
}

impl DeviceUpdate {
    pub fn apply(&self, device: &mut Device) {
        if let Some(name) = &self.name {
            device.name = name.clone();
        }
        if let Some(device_type) = &self.device_type {
            device.device_type = device_type.clone();
        }
        if let Some(status) = &self.status {
            device.status = status.clone();
        }
    }
}

/// One inbound broker message as pushed to live clients
#[derive(Debug, Clone, Serialize)]
pub struct MessageEnvelope {
    topic: String,
    payload: String,
    #[serde(rename = "timestamp")]
    received_at: i64,
}

impl MessageEnvelope {
    pub fn from_inbound(message: &InboundMessage) -> Self {
        Self {
            topic: message.topic.clone(),
            payload: message.payload_str(),
            received_at: now_millis(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}
