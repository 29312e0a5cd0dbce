//! Relay bus message schema and the bus seams.
//!
//! Messages are published as compact JSON. Older ingest revisions printed a
//! language-native mapping (`{'launch_id': 9, 'x': None}`) or forwarded the
//! raw flat frame; both are accepted on decode and never produced.

use crate::error::BusError;
use crate::frame::{Action, Frame, FrameLayout, GeoFix, Packet};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

const LOCAL_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub admin_key: String,
    pub session_id: i64,
    pub action: Action,
    pub device_timestamp: f64,
    pub ingest_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LegacyMessage {
    admin_key: String,
    #[serde(alias = "launch_id")]
    session_id: i64,
    #[serde(default)]
    action: Option<Action>,
    #[serde(alias = "timestamp")]
    device_timestamp: f64,
    #[serde(default, alias = "received_at")]
    ingest_time: Option<f64>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    humidity: Option<f64>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    altitude: Option<f64>,
}

impl RelayMessage {
    /// Frames without an action tag are relayed as `launch`; the session
    /// tracker derives lifecycle from arrival order anyway.
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            admin_key: packet.admin_key.clone(),
            session_id: packet.session_id,
            action: packet.action.unwrap_or(Action::Launch),
            device_timestamp: packet.device_timestamp,
            ingest_time: packet.ingest_time,
            temperature: packet.temperature,
            humidity: packet.humidity,
            latitude: packet.geo.map(|fix| fix.latitude),
            longitude: packet.geo.map(|fix| fix.longitude),
            altitude: packet.geo.map(|fix| fix.altitude),
        }
    }

    pub fn into_packet(self) -> Packet {
        let geo = match (self.latitude, self.longitude, self.altitude) {
            (Some(latitude), Some(longitude), Some(altitude)) => Some(GeoFix {
                latitude,
                longitude,
                altitude,
            }),
            _ => None,
        };
        Packet {
            admin_key: self.admin_key,
            session_id: self.session_id,
            action: Some(self.action),
            device_timestamp: self.device_timestamp,
            ingest_time: self.ingest_time,
            temperature: self.temperature,
            humidity: self.humidity,
            geo,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// `received_at` stands in for `ingest_time` when a legacy payload
    /// does not carry one.
    pub fn decode(payload: &[u8], received_at: f64) -> Result<Self, BusError> {
        let first = payload.iter().copied().find(|byte| !byte.is_ascii_whitespace());
        match first {
            None => Err(BusError::Decode("empty payload".to_string())),
            Some(b'{') => {
                let mut scratch = payload.to_vec();
                if let Ok(message) = simd_json::serde::from_slice::<RelayMessage>(&mut scratch) {
                    return Ok(message);
                }
                decode_printed_mapping(payload, received_at)
            }
            Some(_) => decode_flat_text(payload, received_at),
        }
    }
}

fn decode_printed_mapping(payload: &[u8], received_at: f64) -> Result<RelayMessage, BusError> {
    let text = std::str::from_utf8(payload).map_err(|err| BusError::Decode(err.to_string()))?;
    let normalized = text
        .replace('\'', "\"")
        .replace(": None", ": null")
        .replace(": True", ": true")
        .replace(": False", ": false");
    let legacy: LegacyMessage =
        serde_json::from_str(&normalized).map_err(|err| BusError::Decode(err.to_string()))?;
    tracing::debug!(session_id = legacy.session_id, "decoded legacy mapping payload");
    Ok(RelayMessage {
        admin_key: legacy.admin_key,
        session_id: legacy.session_id,
        action: legacy.action.unwrap_or(Action::Launch),
        device_timestamp: legacy.device_timestamp,
        ingest_time: legacy.ingest_time.unwrap_or(received_at),
        temperature: legacy.temperature,
        humidity: legacy.humidity,
        latitude: legacy.latitude,
        longitude: legacy.longitude,
        altitude: legacy.altitude,
    })
}

fn decode_flat_text(payload: &[u8], received_at: f64) -> Result<RelayMessage, BusError> {
    let text = std::str::from_utf8(payload).map_err(|err| BusError::Decode(err.to_string()))?;
    match FrameLayout::Dash.parse(text, received_at) {
        Ok(Frame::Telemetry(packet)) => {
            tracing::debug!(session_id = packet.session_id, "decoded legacy flat payload");
            Ok(RelayMessage::from_packet(&packet))
        }
        Ok(Frame::IdRequest { .. }) => Err(BusError::Decode(
            "id request frames are not relayed".to_string(),
        )),
        Err(err) => Err(BusError::Decode(err.to_string())),
    }
}

pub fn unix_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

pub fn from_unix_seconds(secs: f64) -> DateTime<Utc> {
    if !secs.is_finite() {
        return Utc::now();
    }
    Utc.timestamp_micros((secs * 1_000_000.0).round() as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Publishing half of the relay bus. Delivery is at-most-once: a successful
/// return only means the message left this process.
pub trait RelayPublisher {
    fn publish(
        &self,
        channel: &str,
        message: &RelayMessage,
    ) -> impl Future<Output = Result<(), BusError>> + Send;
}

/// Unbounded, unordered stream of raw payloads from one channel. Once it
/// returns `None` it is finished for good.
pub enum Subscription {
    Remote(mpsc::UnboundedReceiver<Bytes>),
    Local(broadcast::Receiver<Bytes>),
}

impl Subscription {
    pub async fn next(&mut self) -> Option<Bytes> {
        match self {
            Subscription::Remote(rx) => rx.recv().await,
            Subscription::Local(rx) => loop {
                match rx.recv().await {
                    Ok(payload) => return Some(payload),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "slow relay subscriber missed messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

/// In-process fan-out bus with the same delivery guarantees as the broker:
/// messages published while nobody listens are gone.
#[derive(Clone, Default)]
pub struct LocalRelay {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Bytes>>>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, channel: &str) -> Subscription {
        Subscription::Local(self.sender(channel).subscribe())
    }

    pub fn publish_raw(&self, channel: &str, payload: Bytes) {
        // No receivers is not an error on a fire-and-forget bus.
        let _ = self.sender(channel).send(payload);
    }
}

impl RelayPublisher for LocalRelay {
    async fn publish(&self, channel: &str, message: &RelayMessage) -> Result<(), BusError> {
        let payload = message.encode()?;
        self.publish_raw(channel, Bytes::from(payload));
        Ok(())
    }
}
