//! Shared types for location history tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Radius used when a zone carries no usable radius
pub const DEFAULT_ZONE_RADIUS_M: f64 = 100.0;

/// Zone label recorded for samples outside every zone
pub const UNKNOWN_ZONE: &str = "unknown";

/// Entity id prefix of tracker entities in the state source
pub const TRACKER_PREFIX: &str = "device_tracker.";

/// Entity id prefix of zone entities in the state source
pub const ZONE_PREFIX: &str = "zone.";

/// True for `domain.object_id` ids made of ASCII letters, digits and underscores
pub fn is_valid_entity_id(entity_id: &str) -> bool {
    let valid_part = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    match entity_id.split_once('.') {
        Some((domain, object_id)) => valid_part(domain) && valid_part(object_id),
        None => false,
    }
}

/// A device whose location is polled on its own cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedDevice {
    pub entity_id: String,
    /// Minimum minutes between polls (always >= 1)
    pub interval_minutes: u32,
    pub enabled: bool,
}

impl TrackedDevice {
    /// Poll interval in seconds
    pub fn interval_secs(&self) -> i64 {
        i64::from(self.interval_minutes.max(1)) * 60
    }
}

/// A named circular geofence
///
/// Coordinates are optional because the state source may publish a zone
/// without them; such zones never match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_meters: f64,
}

impl Zone {
    pub fn new(name: &str, latitude: f64, longitude: f64, radius_meters: f64) -> Self {
        Self {
            name: name.to_string(),
            latitude: Some(latitude),
            longitude: Some(longitude),
            radius_meters,
        }
    }

    /// Center coordinate, if both halves are present
    pub fn center(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }

    /// Build a zone from a `zone.*` entity. Returns None for any other entity.
    pub fn from_entity(entity: &EntityState) -> Option<Self> {
        let object_id = entity.entity_id.strip_prefix(ZONE_PREFIX)?;
        let name = entity.attr_str("friendly_name").unwrap_or(object_id).to_string();

        Some(Self {
            name,
            latitude: entity.attr_f64("latitude"),
            longitude: entity.attr_f64("longitude"),
            radius_meters: normalize_radius(entity.attributes.get("radius")),
        })
    }
}

/// Resolve a raw radius attribute to meters
///
/// Accepts a number or a string with an optional `m`/`km` suffix
/// (`"100m"`, `"0.5 km"`). Missing, unparsable, non-positive or non-finite
/// values fall back to [`DEFAULT_ZONE_RADIUS_M`].
pub fn normalize_radius(raw: Option<&Value>) -> f64 {
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => parse_radius_str(s),
        _ => None,
    };

    match parsed {
        Some(r) if r.is_finite() && r > 0.0 => r,
        _ => DEFAULT_ZONE_RADIUS_M,
    }
}

fn parse_radius_str(raw: &str) -> Option<f64> {
    let s = raw.trim().to_ascii_lowercase();
    if let Some(km) = s.strip_suffix("km") {
        return km.trim().parse::<f64>().ok().map(|v| v * 1000.0);
    }
    s.strip_suffix('m').unwrap_or(&s).trim().parse().ok()
}

/// Entity state as returned by the state source's REST API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Coordinates and telemetry extracted from a tracker entity
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub battery_level: Option<f64>,
    pub battery_state: Option<String>,
}

impl EntityState {
    /// Display name, falling back to the entity id
    pub fn friendly_name(&self) -> &str {
        self.attr_str("friendly_name").unwrap_or(&self.entity_id)
    }

    /// String state, if the state is a string
    pub fn state_str(&self) -> Option<&str> {
        self.state.as_str()
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Numeric attribute; numeric strings are accepted
    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(value_f64)
    }

    /// Extract a location from the entity
    ///
    /// Dedicated `latitude`/`longitude` attributes win; when either is absent
    /// the state is parsed as a `"lat, lon"` string. Anything malformed or out
    /// of range yields None.
    pub fn location(&self) -> Option<Location> {
        let lat_attr = self.attributes.get("latitude").filter(|v| !v.is_null());
        let lon_attr = self.attributes.get("longitude").filter(|v| !v.is_null());

        let (latitude, longitude) = match (lat_attr, lon_attr) {
            (Some(lat), Some(lon)) => (value_f64(lat)?, value_f64(lon)?),
            _ => parse_coordinate_pair(self.state_str()?)?,
        };

        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }

        Some(Location {
            latitude,
            longitude,
            accuracy: self.attr_f64("gps_accuracy"),
            altitude: self.attr_f64("altitude"),
            battery_level: self.attr_f64("battery_level"),
            battery_state: self.attr_str("battery_state").map(str::to_string),
        })
    }
}

fn value_f64(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// Parse a `"lat, lon"` pair
fn parse_coordinate_pair(raw: &str) -> Option<(f64, f64)> {
    let mut parts = raw.split(',');
    let lat = parts.next()?.trim().parse::<f64>().ok()?;
    let lon = parts.next()?.trim().parse::<f64>().ok()?;
    (lat.is_finite() && lon.is_finite()).then_some((lat, lon))
}

/// One classified location observation, handed to the sink once
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationSample {
    pub device_id: String,
    pub device_name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_state: Option<String>,
    pub in_zone: bool,
    /// Matched zone name or [`UNKNOWN_ZONE`]
    pub zone_name: String,
    /// Poll time, not the state source's last-updated time
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    pub fn new(
        entity: &EntityState,
        location: Location,
        zone: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: entity.entity_id.clone(),
            device_name: entity.friendly_name().to_string(),
            latitude: location.latitude,
            longitude: location.longitude,
            accuracy: location.accuracy,
            altitude: location.altitude,
            battery_level: location.battery_level,
            battery_state: location.battery_state,
            in_zone: zone.is_some(),
            zone_name: zone.unwrap_or_else(|| UNKNOWN_ZONE.to_string()),
            timestamp,
        }
    }
}

/// A sample read back from the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub time: DateTime<Utc>,
    pub device_id: String,
    pub device_name: String,
    pub in_zone: bool,
    pub zone_name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
}
