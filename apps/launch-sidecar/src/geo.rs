use crate::frame::{GeoFix, Packet};
use std::fmt;
use std::str::FromStr;

/// Below this magnitude a coordinate is the receiver's "no fix" sentinel.
const NEAR_ZERO_DEGREES: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub max_alt: f64,
}

impl Default for GeoBounds {
    fn default() -> Self {
        // Launch range over Colombia.
        Self {
            min_lat: 4.0,
            max_lat: 12.0,
            min_lon: -79.0,
            max_lon: -67.0,
            max_alt: 5000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptReason {
    ZeroCoordinate,
    NearZero,
    OutOfBounds,
}

impl fmt::Display for CorruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CorruptReason::ZeroCoordinate => "zero coordinate",
            CorruptReason::NearZero => "near-zero coordinate",
            CorruptReason::OutOfBounds => "outside bounding box",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoVerdict {
    Valid,
    Corrupt(CorruptReason),
}

impl GeoBounds {
    /// A missing coordinate means no fix, which is not corruption.
    pub fn validate(&self, lat: Option<f64>, lon: Option<f64>, alt: Option<f64>) -> GeoVerdict {
        let (Some(lat), Some(lon), Some(alt)) = (lat, lon, alt) else {
            return GeoVerdict::Valid;
        };

        if lat == 0.0 || lon == 0.0 || alt == 0.0 {
            return GeoVerdict::Corrupt(CorruptReason::ZeroCoordinate);
        }
        if lat.abs() < NEAR_ZERO_DEGREES || lon.abs() < NEAR_ZERO_DEGREES {
            return GeoVerdict::Corrupt(CorruptReason::NearZero);
        }
        let inside = (self.min_lat..=self.max_lat).contains(&lat)
            && (self.min_lon..=self.max_lon).contains(&lon)
            && (0.0..=self.max_alt).contains(&alt);
        if !inside {
            return GeoVerdict::Corrupt(CorruptReason::OutOfBounds);
        }
        GeoVerdict::Valid
    }

    pub fn validate_fix(&self, fix: Option<&GeoFix>) -> GeoVerdict {
        match fix {
            Some(fix) => self.validate(Some(fix.latitude), Some(fix.longitude), Some(fix.altitude)),
            None => GeoVerdict::Valid,
        }
    }
}

/// What to do with a packet whose fix is corrupt. Firmware revisions
/// disagreed, so this is an operator choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoPolicy {
    NullFields,
    DropPacket,
}

impl FromStr for GeoPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "null_fields" | "null" => Ok(GeoPolicy::NullFields),
            "drop_packet" | "drop" => Ok(GeoPolicy::DropPacket),
            other => Err(format!(
                "unknown geo policy {other:?} (expected null_fields or drop_packet)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GeoFilter {
    pub bounds: GeoBounds,
    pub policy: GeoPolicy,
}

impl GeoFilter {
    pub fn new(bounds: GeoBounds, policy: GeoPolicy) -> Self {
        Self { bounds, policy }
    }

    /// Applies the policy. Returns `None` when the packet must be discarded.
    pub fn screen(&self, mut packet: Packet) -> Option<Packet> {
        let GeoVerdict::Corrupt(reason) = self.bounds.validate_fix(packet.geo.as_ref()) else {
            return Some(packet);
        };
        let fix = packet.geo.take();
        match self.policy {
            GeoPolicy::NullFields => {
                tracing::info!(
                    session_id = packet.session_id,
                    %reason,
                    ?fix,
                    "corrupt geolocation; keeping sample without fix"
                );
                Some(packet)
            }
            GeoPolicy::DropPacket => {
                tracing::warn!(
                    session_id = packet.session_id,
                    %reason,
                    ?fix,
                    "corrupt geolocation; dropping packet"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_with(geo: Option<GeoFix>) -> Packet {
        Packet {
            admin_key: "K".to_string(),
            session_id: 4,
            action: None,
            device_timestamp: 1.0,
            ingest_time: 1.0,
            temperature: Some(20.0),
            humidity: Some(40.0),
            geo,
        }
    }

    #[test]
    fn zero_latitude_is_corrupt() {
        let bounds = GeoBounds::default();
        assert_eq!(
            bounds.validate(Some(0.0), Some(-72.0), Some(100.0)),
            GeoVerdict::Corrupt(CorruptReason::ZeroCoordinate)
        );
    }

    #[test]
    fn plausible_fix_is_valid() {
        let bounds = GeoBounds::default();
        assert_eq!(
            bounds.validate(Some(6.2), Some(-75.5), Some(1200.0)),
            GeoVerdict::Valid
        );
    }

    #[test]
    fn absent_fix_is_valid() {
        let bounds = GeoBounds::default();
        assert_eq!(bounds.validate(None, None, None), GeoVerdict::Valid);
        assert_eq!(bounds.validate_fix(None), GeoVerdict::Valid);
    }

    #[test]
    fn near_zero_and_out_of_box_are_corrupt() {
        let bounds = GeoBounds::default();
        assert_eq!(
            bounds.validate(Some(0.016667), Some(-75.5), Some(10.0)),
            GeoVerdict::Corrupt(CorruptReason::NearZero)
        );
        assert_eq!(
            bounds.validate(Some(40.4), Some(-3.7), Some(650.0)),
            GeoVerdict::Corrupt(CorruptReason::OutOfBounds)
        );
        assert_eq!(
            bounds.validate(Some(6.2), Some(-75.5), Some(9000.0)),
            GeoVerdict::Corrupt(CorruptReason::OutOfBounds)
        );
        assert_eq!(
            bounds.validate(Some(6.2), Some(-75.5), Some(f64::NAN)),
            GeoVerdict::Corrupt(CorruptReason::OutOfBounds)
        );
    }

    #[test]
    fn null_fields_policy_strips_only_the_fix() {
        let filter = GeoFilter::new(GeoBounds::default(), GeoPolicy::NullFields);
        let corrupt = GeoFix {
            latitude: 0.0,
            longitude: -75.0,
            altitude: 10.0,
        };
        let kept = filter.screen(packet_with(Some(corrupt))).expect("kept");
        assert_eq!(kept.geo, None);
        assert_eq!(kept.temperature, Some(20.0));
    }

    #[test]
    fn drop_policy_discards_corrupt_packets_only() {
        let filter = GeoFilter::new(GeoBounds::default(), GeoPolicy::DropPacket);
        let corrupt = GeoFix {
            latitude: 6.2,
            longitude: 0.05,
            altitude: 10.0,
        };
        assert!(filter.screen(packet_with(Some(corrupt))).is_none());

        let good = GeoFix {
            latitude: 6.2,
            longitude: -75.5,
            altitude: 1200.0,
        };
        assert_eq!(
            filter.screen(packet_with(Some(good))).and_then(|p| p.geo),
            Some(good)
        );
        assert!(filter.screen(packet_with(None)).is_some());
    }

    #[test]
    fn policy_parses_from_config() {
        assert_eq!("drop_packet".parse::<GeoPolicy>(), Ok(GeoPolicy::DropPacket));
        assert_eq!("NULL_FIELDS".parse::<GeoPolicy>(), Ok(GeoPolicy::NullFields));
        assert!("ignore".parse::<GeoPolicy>().is_err());
    }
}
