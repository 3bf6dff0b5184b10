//! Broker topic scheme shared by devices and the bridge.

pub const REGISTER_TOPIC: &str = "device/lifecycle/register";
pub const TEST_TOPIC: &str = "test/topic";
pub const REPORT_WILDCARD: &str = "device/report/#";
pub const STATUS_WILDCARD: &str = "device/status/#";

/// Segment index of the device uid in `device/{family}/{uid}` topics.
pub const DEVICE_ID_SEGMENT: usize = 2;

/// Returned by [`extract_device_id`] when the topic carries no id.
pub const UNKNOWN_DEVICE: &str = "unknown";

pub fn report_topic(device_id: &str) -> String {
    format!("device/report/{}", device_id)
}

pub fn status_topic(device_id: &str) -> String {
    format!("device/status/{}", device_id)
}

pub fn command_topic(device_id: &str) -> String {
    format!("device/command/{}", device_id)
}

/// Picks the segment at `index`, falling back to [`UNKNOWN_DEVICE`].
pub fn extract_device_id(topic: &str, index: usize) -> String {
    match topic.split('/').nth(index) {
        Some(segment) if !segment.is_empty() => segment.to_string(),
        _ => UNKNOWN_DEVICE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_device_id() {
        assert_eq!(extract_device_id("device/status/d1", 2), "d1");
        assert_eq!(extract_device_id("device/report/sensor-th-001", 2), "sensor-th-001");
        assert_eq!(extract_device_id("test/topic", 2), UNKNOWN_DEVICE);
        assert_eq!(extract_device_id("device/status/", 2), UNKNOWN_DEVICE);
        assert_eq!(extract_device_id("", 2), UNKNOWN_DEVICE);
    }

    #[test]
    fn test_topic_builders() {
        assert_eq!(report_topic("d1"), "device/report/d1");
        assert_eq!(status_topic("d1"), "device/status/d1");
        assert_eq!(command_topic("d1"), "device/command/d1");
    }
}
