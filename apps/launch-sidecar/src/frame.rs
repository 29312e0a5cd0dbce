use crate::error::FrameError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Control tag the payload sends when it wants a session id.
pub const ID_REQUEST_TAG: &str = "CANSAT_REQ_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    #[serde(alias = "falling")]
    Launch,
    End,
    IdRequest,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Launch => "launch",
            Action::End => "end",
            Action::IdRequest => "id_request",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = FrameError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Action::Start),
            "launch" | "falling" => Ok(Action::Launch),
            "end" => Ok(Action::End),
            "id_request" | "cansat_req_id" => Ok(Action::IdRequest),
            _ => Err(FrameError::UnknownAction(raw.to_string())),
        }
    }
}

/// A full GPS fix. Either all three coordinates arrived or none did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub admin_key: String,
    pub session_id: i64,
    pub action: Option<Action>,
    pub device_timestamp: f64,
    /// Unix seconds at which the ground station received the line.
    pub ingest_time: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub geo: Option<GeoFix>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Telemetry(Packet),
    IdRequest { admin_key: String },
}

/// Field grammars seen across firmware revisions. The layout is configured,
/// never sniffed: a `-` line can also look bracketed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// `[key-session-action][timestamp][temp][hum]`
    Bracketed,
    /// `key-session-action-timestamp[-temp-hum[-lat-lon-alt]]`
    Dash,
    /// `key*session*timestamp[*temp*hum[*lat*lon*alt]]`
    Star,
}

impl FromStr for FrameLayout {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bracketed" | "v1" => Ok(FrameLayout::Bracketed),
            "dash" | "v2" => Ok(FrameLayout::Dash),
            "star" | "v3" => Ok(FrameLayout::Star),
            other => Err(format!(
                "unknown frame layout {other:?} (expected bracketed, dash or star)"
            )),
        }
    }
}

impl FrameLayout {
    pub fn parse(&self, line: &str, received_at: f64) -> Result<Frame, FrameError> {
        let line = line.trim();
        if line.is_empty() || line == "None" {
            return Err(FrameError::Empty);
        }
        if let Some(admin_key) = id_request_key(line) {
            return Ok(Frame::IdRequest {
                admin_key: admin_key.to_string(),
            });
        }

        let packet = match self {
            FrameLayout::Bracketed => parse_bracketed(line, received_at)?,
            FrameLayout::Dash => parse_flat(line, '-', true, received_at)?,
            FrameLayout::Star => parse_flat(line, '*', false, received_at)?,
        };
        if packet.action == Some(Action::IdRequest) {
            return Ok(Frame::IdRequest {
                admin_key: packet.admin_key,
            });
        }
        Ok(Frame::Telemetry(packet))
    }
}

fn id_request_key(line: &str) -> Option<&str> {
    let head = line.strip_suffix(ID_REQUEST_TAG)?;
    let key = head.strip_suffix('-').or_else(|| head.strip_suffix('*'))?;
    if key.is_empty() || key.contains(['-', '*', '[', ']']) {
        return None;
    }
    Some(key)
}

fn parse_bracketed(line: &str, received_at: f64) -> Result<Packet, FrameError> {
    let inner = line.strip_prefix('[').unwrap_or(line);
    let inner = inner.strip_suffix(']').unwrap_or(inner);
    let parts: Vec<&str> = inner.split("][").collect();
    if parts.len() < 4 {
        return Err(FrameError::MissingFields {
            expected: 4,
            found: parts.len(),
        });
    }

    let header: Vec<&str> = parts[0].split('-').collect();
    if header.len() < 3 || header[0].trim().is_empty() {
        return Err(FrameError::MalformedHeader(parts[0].to_string()));
    }

    Ok(Packet {
        admin_key: header[0].trim().to_string(),
        session_id: required_int("session_id", header[1])?,
        action: optional_action(header[2])?,
        device_timestamp: required_float("timestamp", parts[1])?,
        ingest_time: received_at,
        temperature: optional_float(parts[2]),
        humidity: optional_float(parts[3]),
        geo: None,
    })
}

fn parse_flat(
    line: &str,
    delimiter: char,
    with_action: bool,
    received_at: f64,
) -> Result<Packet, FrameError> {
    let mandatory = if with_action { 4 } else { 3 };
    let fields = split_fields(line, delimiter, mandatory);
    if fields.len() < mandatory {
        return Err(FrameError::MissingFields {
            expected: mandatory,
            found: fields.len(),
        });
    }

    let admin_key = fields[0].trim();
    if admin_key.is_empty() {
        return Err(FrameError::MalformedHeader(line.to_string()));
    }
    let session_id = required_int("session_id", fields[1])?;
    let action = if with_action {
        optional_action(fields[2])?
    } else {
        None
    };
    let device_timestamp = required_float("timestamp", fields[mandatory - 1])?;

    let optional = &fields[mandatory..];
    let temperature = optional.get(0).and_then(|raw| optional_float(raw));
    let humidity = optional.get(1).and_then(|raw| optional_float(raw));
    let geo = match optional.get(2..5) {
        Some([lat, lon, alt]) => {
            match (optional_float(lat), optional_float(lon), optional_float(alt)) {
                (Some(latitude), Some(longitude), Some(altitude)) => Some(GeoFix {
                    latitude,
                    longitude,
                    altitude,
                }),
                _ => None,
            }
        }
        _ => None,
    };

    Ok(Packet {
        admin_key: admin_key.to_string(),
        session_id,
        action,
        device_timestamp,
        ingest_time: received_at,
        temperature,
        humidity,
        geo,
    })
}

/// Splits a flat record. With `-` as the delimiter a minus sign is ambiguous,
/// so a `-` opening one of the optional numeric fields and followed by a digit
/// or `.` is kept as a sign. An empty field directly before a negative value
/// therefore cannot be expressed in the dash layout.
fn split_fields(line: &str, delimiter: char, signed_from: usize) -> Vec<&str> {
    if delimiter != '-' {
        return line.split(delimiter).collect();
    }

    let mut fields = Vec::new();
    let mut start = 0usize;
    let mut chars = line.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if ch != '-' {
            continue;
        }
        let opens_field = idx == start;
        let numeric_next = chars
            .peek()
            .map(|(_, next)| next.is_ascii_digit() || *next == '.')
            .unwrap_or(false);
        if opens_field && fields.len() >= signed_from && numeric_next {
            continue;
        }
        fields.push(&line[start..idx]);
        start = idx + ch.len_utf8();
    }
    fields.push(&line[start..]);
    fields
}

fn required_int(field: &'static str, raw: &str) -> Result<i64, FrameError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| FrameError::NotNumeric {
            field,
            value: raw.to_string(),
        })
}

fn required_float(field: &'static str, raw: &str) -> Result<f64, FrameError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| FrameError::NotNumeric {
            field,
            value: raw.to_string(),
        })
}

fn optional_float(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value),
        _ => {
            tracing::debug!(value = %trimmed, "treating non-numeric optional field as null");
            None
        }
    }
}

fn optional_action(raw: &str) -> Result<Option<Action>, FrameError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(frame: Frame) -> Packet {
        match frame {
            Frame::Telemetry(packet) => packet,
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn dash_layout_parses_sensor_fields_without_geo() {
        let packet = telemetry(
            FrameLayout::Dash
                .parse("K-7-launch-12.5-22.1-55.0", 100.0)
                .unwrap(),
        );
        assert_eq!(packet.admin_key, "K");
        assert_eq!(packet.session_id, 7);
        assert_eq!(packet.action, Some(Action::Launch));
        assert_eq!(packet.device_timestamp, 12.5);
        assert_eq!(packet.temperature, Some(22.1));
        assert_eq!(packet.humidity, Some(55.0));
        assert_eq!(packet.geo, None);
        assert_eq!(packet.ingest_time, 100.0);
    }

    #[test]
    fn too_few_fields_is_rejected() {
        assert_eq!(
            FrameLayout::Dash.parse("K-7", 0.0),
            Err(FrameError::MissingFields {
                expected: 4,
                found: 2
            })
        );
        assert!(FrameLayout::Star.parse("K*7", 0.0).is_err());
        assert!(FrameLayout::Bracketed.parse("[K-7-start][1.0]", 0.0).is_err());
    }

    #[test]
    fn non_numeric_mandatory_fields_are_rejected() {
        assert!(matches!(
            FrameLayout::Star.parse("K*seven*1.0", 0.0),
            Err(FrameError::NotNumeric {
                field: "session_id",
                ..
            })
        ));
        assert!(matches!(
            FrameLayout::Star.parse("K*7*soon", 0.0),
            Err(FrameError::NotNumeric {
                field: "timestamp",
                ..
            })
        ));
        assert!(matches!(
            FrameLayout::Dash.parse("K-7-hover-1.0", 0.0),
            Err(FrameError::UnknownAction(_))
        ));
    }

    #[test]
    fn star_layout_reads_full_geo_triple() {
        let packet = telemetry(
            FrameLayout::Star
                .parse("K*12*1712.5*22.1*55.0*6.2*-75.5*1200", 0.0)
                .unwrap(),
        );
        assert_eq!(packet.action, None);
        assert_eq!(
            packet.geo,
            Some(GeoFix {
                latitude: 6.2,
                longitude: -75.5,
                altitude: 1200.0
            })
        );
    }

    #[test]
    fn partial_geo_triple_is_dropped_as_a_group() {
        let packet = telemetry(
            FrameLayout::Star
                .parse("K*12*1.0*22.1*55.0*6.2*-75.5", 0.0)
                .unwrap(),
        );
        assert_eq!(packet.geo, None);

        let packet = telemetry(
            FrameLayout::Star
                .parse("K*12*1.0*22.1*55.0*6.2**1200", 0.0)
                .unwrap(),
        );
        assert_eq!(packet.geo, None);
        assert_eq!(packet.temperature, Some(22.1));
    }

    #[test]
    fn empty_optional_fields_become_null() {
        let packet = telemetry(FrameLayout::Star.parse("K*3*4.0**55.0", 0.0).unwrap());
        assert_eq!(packet.temperature, None);
        assert_eq!(packet.humidity, Some(55.0));
    }

    #[test]
    fn dash_layout_keeps_negative_coordinates() {
        let packet = telemetry(
            FrameLayout::Dash
                .parse("K-7-launch-12.5-22.1-55.0-6.2--75.5-1200", 0.0)
                .unwrap(),
        );
        assert_eq!(
            packet.geo,
            Some(GeoFix {
                latitude: 6.2,
                longitude: -75.5,
                altitude: 1200.0
            })
        );
    }

    #[test]
    fn bracketed_layout_parses_header() {
        let packet = telemetry(
            FrameLayout::Bracketed
                .parse("[ADMIN-3-start][0.0][21.5][]", 0.0)
                .unwrap(),
        );
        assert_eq!(packet.admin_key, "ADMIN");
        assert_eq!(packet.session_id, 3);
        assert_eq!(packet.action, Some(Action::Start));
        assert_eq!(packet.temperature, Some(21.5));
        assert_eq!(packet.humidity, None);
    }

    #[test]
    fn legacy_falling_action_maps_to_launch() {
        let packet = telemetry(FrameLayout::Dash.parse("K-7-falling-2.0", 0.0).unwrap());
        assert_eq!(packet.action, Some(Action::Launch));
    }

    #[test]
    fn id_request_is_a_control_frame() {
        for layout in [FrameLayout::Bracketed, FrameLayout::Dash, FrameLayout::Star] {
            assert_eq!(
                layout.parse("ADMIN-CANSAT_REQ_ID\r", 0.0),
                Ok(Frame::IdRequest {
                    admin_key: "ADMIN".to_string()
                })
            );
        }
        assert_eq!(
            FrameLayout::Dash.parse("ADMIN-0-id_request-0", 0.0),
            Ok(Frame::IdRequest {
                admin_key: "ADMIN".to_string()
            })
        );
    }

    #[test]
    fn blank_lines_are_empty_frames() {
        assert_eq!(FrameLayout::Star.parse("  ", 0.0), Err(FrameError::Empty));
        assert_eq!(FrameLayout::Star.parse("None", 0.0), Err(FrameError::Empty));
    }
}
