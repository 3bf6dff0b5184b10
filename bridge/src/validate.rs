use crate::errors::{Error, Result};
use serde::Deserialize;
use transport::payload::STATUS_ONLINE;

/// Fields the bridge reads from a lifecycle registration payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub device_id: String,
    pub device_type: String,
    pub status: String,
    pub timestamp: Option<i64>,
}

/// Fields the bridge reads from a status payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: Option<String>,
    /// Millisecond send time stamped by the device, when present.
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRegistration {
    device_id: Option<String>,
    device_type: Option<String>,
    status: Option<String>,
    timestamp: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    status: Option<String>,
    timestamp: Option<serde_json::Value>,
}

/// Trims and upper-cases a command, accepting only ON and OFF.
pub fn normalize_command(command: &str) -> Result<&'static str> {
    match command.trim().to_uppercase().as_str() {
        "ON" => Ok("ON"),
        "OFF" => Ok("OFF"),
        _ => Err(Error::InvalidCommand(command.to_string())),
    }
}

/// A non-string `status` is malformed; a non-integer `timestamp` is ignored.
pub fn parse_status(payload: &[u8]) -> Result<StatusUpdate> {
    let raw: RawStatus = serde_json::from_slice(payload)
        .map_err(|e| Error::MalformedPayload(format!("status payload: {}", e)))?;
    Ok(StatusUpdate {
        status: raw.status,
        timestamp: raw.timestamp.and_then(|t| t.as_i64()),
    })
}

pub fn parse_registration(payload: &[u8]) -> Result<Registration> {
    let raw: RawRegistration = serde_json::from_slice(payload)
        .map_err(|e| Error::MalformedPayload(format!("registration payload: {}", e)))?;

    let device_id = non_blank(raw.device_id)
        .ok_or_else(|| Error::Validation("registration without deviceId".to_string()))?;
    let device_type = non_blank(raw.device_type).ok_or_else(|| {
        Error::Validation(format!("registration of {} without deviceType", device_id))
    })?;

    Ok(Registration {
        device_id,
        device_type,
        status: raw.status.unwrap_or_else(|| STATUS_ONLINE.to_string()),
        timestamp: raw.timestamp.and_then(|t| t.as_i64()),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_command() {
        assert_eq!(normalize_command("on ").unwrap(), "ON");
        assert_eq!(normalize_command(" Off").unwrap(), "OFF");
        assert!(matches!(normalize_command("toggle"), Err(Error::InvalidCommand(_))));
        assert!(normalize_command("").is_err());
    }

    #[test]
    fn test_parse_status() {
        let update =
            parse_status(br#"{"deviceId":"d1","status":"offline","timestamp":1700}"#).unwrap();
        assert_eq!(update.status.as_deref(), Some("offline"));
        assert_eq!(update.timestamp, Some(1700));

        let update = parse_status(br#"{"deviceId":"d1","timestamp":"soon"}"#).unwrap();
        assert_eq!(update.status, None);
        assert_eq!(update.timestamp, None);
    }

    #[test]
    fn test_parse_status_rejects_garbage() {
        assert!(matches!(parse_status(b"not json"), Err(Error::MalformedPayload(_))));
        assert!(matches!(parse_status(br#"{"status":1}"#), Err(Error::MalformedPayload(_))));
    }

    #[test]
    fn test_registration_defaults_status() {
        let registration =
            parse_registration(br#"{"deviceId":"sensor-th-001","deviceType":"TempHumSensor"}"#)
                .unwrap();

        assert_eq!(registration.device_id, "sensor-th-001");
        assert_eq!(registration.device_type, "TempHumSensor");
        assert_eq!(registration.status, "online");
        assert_eq!(registration.timestamp, None);
    }

    #[test]
    fn test_registration_requires_id_and_type() {
        assert!(matches!(
            parse_registration(br#"{"deviceId":"  ","deviceType":"SmartSwitch"}"#),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            parse_registration(br#"{"deviceId":"switch-001"}"#),
            Err(Error::Validation(_))
        ));
        assert!(matches!(parse_registration(b"{"), Err(Error::MalformedPayload(_))));
    }
}
