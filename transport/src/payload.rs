use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// Retained status / registration record published by devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    pub status: String,
    pub timestamp: i64,
}

impl StatusPayload {
    pub fn new(device_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: None,
            status: status.into(),
            timestamp: now_millis(),
        }
    }

    pub fn offline(device_id: impl Into<String>) -> Self {
        Self::new(device_id, STATUS_OFFLINE)
    }

    pub fn with_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_payload_wire_shape() {
        let payload = StatusPayload::offline("sensor-th-001");
        let value: serde_json::Value =
            serde_json::from_slice(&payload.to_bytes().unwrap()).unwrap();

        assert_eq!(value["deviceId"], "sensor-th-001");
        assert_eq!(value["status"], "offline");
        assert!(value["timestamp"].is_i64());
        assert!(value.get("deviceType").is_none());
    }

    #[test]
    fn test_registration_includes_type() {
        let payload = StatusPayload::new("switch-001", STATUS_ONLINE).with_type("SmartSwitch");
        let value: serde_json::Value =
            serde_json::from_slice(&payload.to_bytes().unwrap()).unwrap();

        assert_eq!(value["deviceType"], "SmartSwitch");
    }
}
