use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Telemetry record as queued by the tracking server.
///
/// Field names follow the upstream JSON (camelCase). Only `deviceId` and
/// `fixTime` are mandatory; everything else falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    /// Position id assigned upstream
    #[serde(default)]
    pub id: i64,
    /// Device id, selects the target timeseries device
    pub device_id: i64,
    /// Tracker protocol name
    #[serde(default)]
    pub protocol: Option<String>,
    /// Time the server received the position (epoch millis)
    #[serde(default)]
    pub server_time: i64,
    /// Time reported by the device (epoch millis)
    #[serde(default)]
    pub device_time: i64,
    /// GPS fix time (epoch millis), the sink's time axis
    pub fix_time: i64,
    #[serde(default)]
    pub outdated: bool,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub course: f64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub accuracy: f64,
    /// Network descriptor (cell towers / wifi), carried as text
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub packet_type: Option<String>,
    /// Device unique identifier (IMEI or similar)
    #[serde(default)]
    pub unique_id: Option<String>,
    /// Free-form attributes, carried but not written to the sink
    #[serde(default, deserialize_with = "null_as_empty")]
    pub attributes: HashMap<String, serde_json::Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

impl TelemetryRecord {
    /// Fix time as a UTC timestamp
    pub fn fix_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.fix_time)
    }
}

/// Decodes raw queue payloads into telemetry records
pub trait RecordCodec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<TelemetryRecord, DecodeError>;
}

/// JSON codec matching the upstream producer's serialization
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordCodec;

impl RecordCodec for JsonRecordCodec {
    fn decode(&self, payload: &[u8]) -> Result<TelemetryRecord, DecodeError> {
        let record: TelemetryRecord = serde_json::from_slice(payload)?;

        if record.fix_timestamp().is_none() {
            return Err(DecodeError::InvalidField {
                field: "fixTime",
                reason: format!("{} is not a representable timestamp", record.fix_time),
            });
        }

        Ok(record)
    }
}
