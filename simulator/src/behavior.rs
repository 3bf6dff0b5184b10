use crate::telemetry::SensorReport;
use chrono::Utc;
use rand::Rng;
use std::fmt;
use std::str::FromStr;

const TEMP_MIN: f64 = 15.0;
const TEMP_MAX: f64 = 30.0;
const HUMIDITY_MIN: f64 = 40.0;
const HUMIDITY_MAX: f64 = 70.0;

/// Behaviour of a simulated device, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    TempHumSensor,
    /// Conveys its state only through retained status messages.
    SmartSwitch,
}

impl DeviceKind {
    pub fn type_name(self) -> &'static str {
        match self {
            DeviceKind::TempHumSensor => "TempHumSensor",
            DeviceKind::SmartSwitch => "SmartSwitch",
        }
    }

    pub fn reports_periodically(self) -> bool {
        matches!(self, DeviceKind::TempHumSensor)
    }

    pub fn generate_report(self, rng: &mut impl Rng, device_id: &str) -> Option<SensorReport> {
        match self {
            DeviceKind::TempHumSensor => Some(generate_telemetry(rng, device_id.to_string())),
            DeviceKind::SmartSwitch => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if name.eq_ignore_ascii_case("TempHumSensor") {
            Ok(DeviceKind::TempHumSensor)
        } else if name.eq_ignore_ascii_case("SmartSwitch") {
            Ok(DeviceKind::SmartSwitch)
        } else {
            Err(format!(
                "unknown device type '{}' (expected TempHumSensor or SmartSwitch)",
                name
            ))
        }
    }
}

fn generate_telemetry(rng: &mut impl Rng, device_id: String) -> SensorReport {
    let temperature = rng.gen_range(TEMP_MIN..TEMP_MAX);
    let humidity = rng.gen_range(HUMIDITY_MIN..HUMIDITY_MAX);

    SensorReport {
        device_id,
        timestamp: Utc::now(),
        temperature: format!("{:.1}", temperature),
        humidity: format!("{:.1}", humidity),
    }
}
