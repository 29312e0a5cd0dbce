use crate::error::StoreError;
use crate::frame::Packet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

const SESSION_DATE_FORMAT: &str = "%d/%m/%y_%H:%M:%S";

pub fn format_session_date(ts: DateTime<Utc>) -> String {
    ts.format(SESSION_DATE_FORMAT).to_string()
}

/// One accepted telemetry sample as persisted in a session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub device_timestamp: f64,
    pub ingest_time: f64,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
}

impl From<&Packet> for SampleRecord {
    fn from(packet: &Packet) -> Self {
        Self {
            device_timestamp: packet.device_timestamp,
            ingest_time: packet.ingest_time,
            temperature: packet.temperature,
            humidity: packet.humidity,
            latitude: packet.geo.map(|fix| fix.latitude),
            longitude: packet.geo.map(|fix| fix.longitude),
            altitude: packet.geo.map(|fix| fix.altitude),
        }
    }
}

/// Durable session document. `variables` keeps arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: i64,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub variables: Vec<SampleRecord>,
}

impl SessionRecord {
    pub fn new(session_id: i64) -> Self {
        Self {
            session_id,
            start_date: None,
            end_date: None,
            variables: Vec::new(),
        }
    }
}

/// Durable home of session documents. `upsert` fully replaces whatever is
/// stored under the record's session id.
pub trait SessionStore {
    fn upsert(&self, record: &SessionRecord) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(
        &self,
        session_id: i64,
    ) -> impl Future<Output = Result<Option<SessionRecord>, StoreError>> + Send;
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn session_dates_use_day_first_layout() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap();
        assert_eq!(format_session_date(ts), "07/03/24_14:05:09");
    }

    #[test]
    fn record_serializes_null_end_date() {
        let mut record = SessionRecord::new(3);
        record.start_date = Some("07/03/24_14:05:09".to_string());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["end_date"], serde_json::Value::Null);
        assert_eq!(json["variables"], serde_json::json!([]));
    }
}
