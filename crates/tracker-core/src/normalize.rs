//! # Normalization Table
//!
//! The one place where backend field-name variants, value encodings and
//! policy defaults are resolved. Everything downstream sees typed values.
//!
//! | canonical     | accepted keys                                        |
//! |---------------|------------------------------------------------------|
//! | device id     | `id`, `device_id`, `deviceId`                        |
//! | battery       | `battery`, `batteryPercentage`, `battery_percentage` |
//! | latitude      | `lat`, `latitude`                                    |
//! | longitude     | `lon`, `lng`, `longitude`                            |
//! | tamper        | `tamper`, `tamperStatus`, `tamper_status`            |
//! | jamming       | `jamming`, `jammingStatus`, `jamming_status`         |
//! | connectivity  | `status` string, else `online` boolean               |
//! | event time    | `timestamp`, `lastSeen`, `last_seen`, `updated_at`   |

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use tracker_domain::{
    Boundary, Connectivity, DeviceType, GeoPoint, Geofence, GeofenceAction, LocationSample,
};
use tracker_feed::{RawDeviceEvent, RawGeofenceEvent, RawLocationEvent};

const DEVICE_ID: &[&str] = &["id", "device_id", "deviceId"];
const SAMPLE_DEVICE_ID: &[&str] = &["device_id", "deviceId"];
const OWNER: &[&str] = &["owner_id", "ownerId"];
const BATTERY: &[&str] = &["battery", "batteryPercentage", "battery_percentage"];
const LATITUDE: &[&str] = &["lat", "latitude"];
const LONGITUDE: &[&str] = &["lon", "lng", "longitude"];
const TAMPER: &[&str] = &["tamper", "tamperStatus", "tamper_status"];
const JAMMING: &[&str] = &["jamming", "jammingStatus", "jamming_status"];
const EVENT_TIME: &[&str] = &["timestamp", "lastSeen", "last_seen", "updated_at"];
const SAMPLE_TIME: &[&str] = &["timestamp", "recorded_at", "created_at"];
const ANOMALY: &[&str] = &["anomalyScore", "anomaly_score"];
const ON_ENTER: &[&str] = &["on_enter", "onEnter"];
const ON_EXIT: &[&str] = &["on_exit", "onExit"];

/// Epoch values above this are milliseconds, below are seconds
const EPOCH_MILLIS_CUTOFF: f64 = 1e11;

/// Why a raw event could not be used at all
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("event has no device id")]
    MissingDeviceId,

    #[error("location event has no usable coordinates")]
    MissingCoordinates,

    #[error("location for unknown device {id}")]
    UnknownDevice { id: String },

    #[error("geofence event has no id")]
    MissingGeofenceId,

    #[error("geofence {id} has no usable boundary")]
    MissingBoundary { id: String },
}

// =============================================================================
// DEVICE EVENTS
// =============================================================================

/// Typed view of a device event. `None` means "not mentioned".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevicePatch {
    pub id: String,
    pub event_time: Option<DateTime<Utc>>,

    pub imei: Option<String>,
    pub name: Option<String>,
    pub owner_id: Option<String>,
    pub device_type: Option<DeviceType>,

    /// Both coordinates, or neither
    pub coordinates: Option<GeoPoint>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,

    pub battery: Option<u8>,
    pub tamper: Option<bool>,
    pub jamming: Option<bool>,
    pub connectivity: Option<Connectivity>,
    pub anomaly_score: Option<f64>,
}

/// Resolve a raw device event into a patch
///
/// # Errors
///
/// Returns [`RejectReason::MissingDeviceId`] when no id key is present.
pub fn device_patch(raw: &RawDeviceEvent) -> Result<DevicePatch, RejectReason> {
    let id = raw
        .first(DEVICE_ID)
        .and_then(as_string)
        .ok_or(RejectReason::MissingDeviceId)?;

    let coordinates = coordinates(
        raw.first(LATITUDE).and_then(as_f64),
        raw.first(LONGITUDE).and_then(as_f64),
        &id,
    );

    let connectivity = raw
        .get("status")
        .and_then(Value::as_str)
        .and_then(Connectivity::parse)
        .or_else(|| {
            raw.get("online").and_then(as_bool).map(|online| {
                if online {
                    Connectivity::Online
                } else {
                    Connectivity::Offline
                }
            })
        });

    Ok(DevicePatch {
        event_time: raw.first(EVENT_TIME).and_then(parse_time),
        imei: raw.get("imei").and_then(as_string),
        name: raw.get("name").and_then(as_string),
        owner_id: raw.first(OWNER).and_then(as_string),
        device_type: raw
            .first(&["type", "device_type", "deviceType"])
            .and_then(Value::as_str)
            .and_then(parse_device_type),
        coordinates,
        speed: raw.get("speed").and_then(as_f64),
        heading: raw.get("heading").and_then(as_f64),
        battery: raw.first(BATTERY).and_then(as_f64).map(battery_percent),
        tamper: raw.first(TAMPER).and_then(as_bool),
        jamming: raw.first(JAMMING).and_then(as_bool),
        connectivity,
        anomaly_score: raw.first(ANOMALY).and_then(as_f64),
        id,
    })
}

// =============================================================================
// LOCATION EVENTS
// =============================================================================

/// Resolve a raw location fix; a missing timestamp becomes `now`
///
/// # Errors
///
/// Rejects events without a device id or without a valid coordinate pair.
pub fn location_sample(
    raw: &RawLocationEvent,
    now: DateTime<Utc>,
) -> Result<LocationSample, RejectReason> {
    let device_id = raw
        .first(SAMPLE_DEVICE_ID)
        .and_then(as_string)
        .ok_or(RejectReason::MissingDeviceId)?;

    let point = coordinates(
        raw.first(LATITUDE).and_then(as_f64),
        raw.first(LONGITUDE).and_then(as_f64),
        &device_id,
    )
    .ok_or(RejectReason::MissingCoordinates)?;

    Ok(LocationSample {
        id: raw.get("id").and_then(as_string),
        latitude: point.latitude,
        longitude: point.longitude,
        speed: raw.get("speed").and_then(as_f64).unwrap_or(0.0),
        timestamp: raw.first(SAMPLE_TIME).and_then(parse_time).unwrap_or(now),
        accuracy: raw.get("accuracy").and_then(as_f64),
        heading: raw.get("heading").and_then(as_f64),
        altitude: raw.get("altitude").and_then(as_f64),
        device_id,
    })
}

// =============================================================================
// GEOFENCE EVENTS
// =============================================================================

/// Resolve a raw geofence record into its canonical form
///
/// # Errors
///
/// Rejects records without an id or without any recognizable boundary.
pub fn geofence(raw: &RawGeofenceEvent) -> Result<Geofence, RejectReason> {
    let id = raw
        .get("id")
        .and_then(as_string)
        .ok_or(RejectReason::MissingGeofenceId)?;

    let boundary = boundary(raw.fields())
        .ok_or_else(|| RejectReason::MissingBoundary { id: id.clone() })?;

    Ok(Geofence {
        owner_id: raw.first(OWNER).and_then(as_string),
        device_id: raw.first(SAMPLE_DEVICE_ID).and_then(as_string),
        name: raw
            .get("name")
            .and_then(as_string)
            .unwrap_or_else(|| "Unnamed".to_string()),
        boundary,
        active: raw
            .first(&["active", "enabled"])
            .and_then(as_bool)
            .unwrap_or(false),
        on_enter: raw
            .first(ON_ENTER)
            .and_then(Value::as_str)
            .and_then(GeofenceAction::parse),
        on_exit: raw
            .first(ON_EXIT)
            .and_then(Value::as_str)
            .and_then(GeofenceAction::parse),
        id,
    })
}

/// Canonical `boundary`, then the `polygon` column, then flat center/radius
fn boundary(fields: &Map<String, Value>) -> Option<Boundary> {
    if let Some(canonical) = fields.get("boundary").filter(|v| !v.is_null()) {
        if let Ok(boundary) = serde_json::from_value::<Boundary>(canonical.clone()) {
            return Some(boundary);
        }
    }

    if let Some(shape) = fields.get("polygon").filter(|v| !v.is_null()) {
        // Some stores hand JSON columns back as text
        let parsed;
        let shape = match shape {
            Value::String(text) => {
                parsed = serde_json::from_str::<Value>(text).ok()?;
                &parsed
            }
            other => other,
        };
        if let Some(boundary) = shape.as_object().and_then(boundary_shape) {
            return Some(boundary);
        }
    }

    flat_circle(fields)
}

fn boundary_shape(shape: &Map<String, Value>) -> Option<Boundary> {
    let kind = shape.get("type").and_then(Value::as_str).unwrap_or("circle");

    if kind.eq_ignore_ascii_case("polygon") {
        let vertices = shape
            .get("coordinates")
            .or_else(|| shape.get("vertices"))?
            .as_array()?
            .iter()
            .filter_map(point)
            .collect();
        return Some(Boundary::Polygon { vertices });
    }

    let center = shape.get("center").and_then(point)?;
    let radius_m = shape
        .get("radius")
        .or_else(|| shape.get("radius_m"))
        .and_then(as_f64)?;
    Some(Boundary::Circle { center, radius_m })
}

fn flat_circle(fields: &Map<String, Value>) -> Option<Boundary> {
    let lat = LATITUDE.iter().find_map(|k| fields.get(*k)).and_then(as_f64)?;
    let lon = LONGITUDE.iter().find_map(|k| fields.get(*k)).and_then(as_f64)?;
    let radius_m = fields
        .get("radius")
        .or_else(|| fields.get("radius_m"))
        .and_then(as_f64)?;
    Some(Boundary::Circle {
        center: GeoPoint::new(lat, lon),
        radius_m,
    })
}

/// `[lat, lon]` pair or `{lat, lng}` object
fn point(value: &Value) -> Option<GeoPoint> {
    match value {
        Value::Array(pair) if pair.len() >= 2 => {
            Some(GeoPoint::new(as_f64(&pair[0])?, as_f64(&pair[1])?))
        }
        Value::Object(obj) => {
            let lat = LATITUDE.iter().find_map(|k| obj.get(*k)).and_then(as_f64)?;
            let lon = LONGITUDE.iter().find_map(|k| obj.get(*k)).and_then(as_f64)?;
            Some(GeoPoint::new(lat, lon))
        }
        _ => None,
    }
}

// =============================================================================
// SCALAR DECODING
// =============================================================================

fn coordinates(lat: Option<f64>, lon: Option<f64>, device_id: &str) -> Option<GeoPoint> {
    let point = GeoPoint::new(lat?, lon?);
    match point.validate() {
        Ok(()) => Some(point),
        Err(e) => {
            tracing::warn!(device_id, error = %e, "ignoring off-globe coordinates");
            None
        }
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "detected" | "active" => Some(true),
            "false" | "0" | "no" | "clear" | "none" | "inactive" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn battery_percent(raw: f64) -> u8 {
    raw.round().clamp(0.0, 100.0) as u8
}

fn parse_device_type(value: &str) -> Option<DeviceType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "vehicle" => Some(DeviceType::Vehicle),
        "personal" => Some(DeviceType::Personal),
        "asset" => Some(DeviceType::Asset),
        _ => None,
    }
}

/// RFC 3339 text, naive `YYYY-MM-DD HH:MM:SS` (assumed UTC), or epoch s/ms
pub fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            DateTime::parse_from_rfc3339(text)
                .map(|t| t.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                        .ok()
                        .map(|n| n.and_utc())
                })
                .or_else(|| text.parse::<f64>().ok().and_then(from_epoch))
        }
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let millis = if raw > EPOCH_MILLIS_CUTOFF {
        raw
    } else {
        raw * 1000.0
    };
    DateTime::from_timestamp_millis(millis as i64)
}
