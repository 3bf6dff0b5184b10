use crate::behavior::DeviceKind;
use crate::device::DeviceConfig;
use std::str::FromStr;

/// Devices simulated when none are given on the command line.
pub fn default_fleet() -> Vec<DeviceConfig> {
    vec![
        device("sensor-th-001", DeviceKind::TempHumSensor, 10, true),
        device("switch-001", DeviceKind::SmartSwitch, 60, false),
        device("sensor-th-002", DeviceKind::TempHumSensor, 15, true),
    ]
}

fn device(id: &str, kind: DeviceKind, interval: u64, on: bool) -> DeviceConfig {
    DeviceConfig {
        device_id: id.to_string(),
        kind,
        report_interval_secs: interval,
        initially_on: on,
    }
}

/// Parses `ID:TYPE:INTERVAL:ON|OFF`, e.g. `sensor-th-003:TempHumSensor:5:on`.
impl FromStr for DeviceConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        let [id, kind, interval, power] = parts.as_slice() else {
            return Err(format!("expected ID:TYPE:INTERVAL:ON|OFF, got '{}'", s));
        };

        if id.is_empty() || id.contains('/') || id.contains('+') || id.contains('#') {
            return Err(format!("invalid device id '{}'", id));
        }

        let interval = interval
            .parse::<u64>()
            .map_err(|e| format!("invalid report interval '{}': {}", interval, e))?;

        let initially_on = if power.eq_ignore_ascii_case("on") {
            true
        } else if power.eq_ignore_ascii_case("off") {
            false
        } else {
            return Err(format!("initial power must be ON or OFF, got '{}'", power));
        };

        Ok(device(id, kind.parse()?, interval, initially_on))
    }
}
