use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Periodic reading published by a temperature/humidity sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReport {
    pub device_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub temperature: String,
    pub humidity: String,
}
