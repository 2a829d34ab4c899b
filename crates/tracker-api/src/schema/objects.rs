//! # GraphQL Output Types
//!
//! Object type definitions for GraphQL responses.

use async_graphql::{ID, SimpleObject};
use chrono::{DateTime, Utc};

use super::enums::{
    AlertChangeKind, AlertSeverity, AlertType, BoundaryShape, Connectivity, Crossing, DeviceType,
    GeofenceAction,
};
use tracker_core::GeofenceCrossing;
use tracker_domain as domain;

/// Saturating conversion for counters
fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

// =============================================================================
// VALUE OBJECTS
// =============================================================================

/// Geographic coordinates
#[derive(Debug, Clone, SimpleObject)]
pub struct Coordinates {
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
}

impl From<domain::GeoPoint> for Coordinates {
    fn from(p: domain::GeoPoint) -> Self {
        Self {
            latitude: p.latitude,
            longitude: p.longitude,
        }
    }
}

/// Last known fix of a device
#[derive(Debug, Clone, SimpleObject)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed as reported by the device
    pub speed: f64,
    /// Degrees clockwise from north
    pub heading: Option<f64>,
}

impl From<domain::Position> for Position {
    fn from(p: domain::Position) -> Self {
        Self {
            latitude: p.latitude,
            longitude: p.longitude,
            speed: p.speed,
            heading: p.heading,
        }
    }
}

// =============================================================================
// DEVICES
// =============================================================================

/// Current state of one tracker
#[derive(Debug, Clone, SimpleObject)]
pub struct Device {
    pub id: ID,
    pub imei: Option<String>,
    pub name: String,
    pub owner_id: Option<String>,
    pub device_type: Option<DeviceType>,
    /// Absent until the device has reported a location
    pub position: Option<Position>,
    /// Battery percentage, 0-100
    pub battery: i32,
    pub tamper: bool,
    pub jamming: bool,
    pub connectivity: Connectivity,
    pub anomaly_score: Option<f64>,
    pub last_seen: DateTime<Utc>,
}

impl From<domain::DeviceSnapshot> for Device {
    fn from(d: domain::DeviceSnapshot) -> Self {
        Self {
            id: ID(d.id),
            imei: d.imei,
            name: d.name,
            owner_id: d.owner_id,
            device_type: d.device_type.map(DeviceType::from),
            position: d.position.map(Position::from),
            battery: i32::from(d.battery),
            tamper: d.tamper,
            jamming: d.jamming,
            connectivity: d.connectivity.into(),
            anomaly_score: d.anomaly_score,
            last_seen: d.last_seen,
        }
    }
}

/// One recorded location fix
#[derive(Debug, Clone, SimpleObject)]
pub struct Location {
    pub id: Option<ID>,
    pub device_id: ID,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    /// Horizontal accuracy in meters
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl From<domain::LocationSample> for Location {
    fn from(s: domain::LocationSample) -> Self {
        Self {
            id: s.id.map(ID),
            device_id: ID(s.device_id),
            latitude: s.latitude,
            longitude: s.longitude,
            speed: s.speed,
            heading: s.heading,
            altitude: s.altitude,
            accuracy: s.accuracy,
            timestamp: s.timestamp,
        }
    }
}

/// Fleet-wide counters for the dashboard header
#[derive(Debug, Clone, SimpleObject)]
pub struct DeviceSummary {
    pub total: i32,
    pub online: i32,
    pub offline: i32,
    pub maintenance: i32,
    pub tampered: i32,
    pub jammed: i32,
    pub low_battery: i32,
}

impl From<domain::DeviceSummary> for DeviceSummary {
    fn from(s: domain::DeviceSummary) -> Self {
        Self {
            total: count(s.total),
            online: count(s.online),
            offline: count(s.offline),
            maintenance: count(s.maintenance),
            tampered: count(s.tampered),
            jammed: count(s.jammed),
            low_battery: count(s.low_battery),
        }
    }
}

// =============================================================================
// ALERTS
// =============================================================================

/// A derived alert and its lifecycle
#[derive(Debug, Clone, SimpleObject)]
pub struct Alert {
    pub id: ID,
    pub device_id: ID,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<domain::Alert> for Alert {
    fn from(a: domain::Alert) -> Self {
        Self {
            id: ID(a.id.to_string()),
            device_id: ID(a.device_id),
            alert_type: a.alert_type.into(),
            severity: a.severity.into(),
            message: a.message,
            acknowledged: a.acknowledged,
            acknowledged_by: a.acknowledged_by,
            acknowledged_at: a.acknowledged_at,
            resolved: a.resolved,
            resolved_by: a.resolved_by,
            resolved_at: a.resolved_at,
            created_at: a.created_at,
        }
    }
}

/// Unresolved alert counters
#[derive(Debug, Clone, SimpleObject)]
pub struct AlertSummary {
    pub unresolved: i32,
    pub critical: i32,
    pub high: i32,
    pub medium: i32,
    pub low: i32,
}

impl From<domain::AlertSummary> for AlertSummary {
    fn from(s: domain::AlertSummary) -> Self {
        Self {
            unresolved: count(s.unresolved),
            critical: count(s.critical),
            high: count(s.high),
            medium: count(s.medium),
            low: count(s.low),
        }
    }
}

/// Alert change pushed to subscribers
#[derive(Debug, Clone, SimpleObject)]
pub struct AlertEvent {
    pub kind: AlertChangeKind,
    pub alert: Alert,
}

// =============================================================================
// GEOFENCES
// =============================================================================

/// Named boundary watched for crossings
#[derive(Debug, Clone, SimpleObject)]
pub struct Geofence {
    pub id: ID,
    pub name: String,
    pub owner_id: Option<String>,
    /// Set when the fence only applies to one device
    pub device_id: Option<ID>,
    pub active: bool,
    pub shape: BoundaryShape,
    /// Circle center
    pub center: Option<Coordinates>,
    /// Circle radius in meters
    pub radius_m: Option<f64>,
    /// Polygon ring, empty for circles
    pub vertices: Vec<Coordinates>,
    pub on_enter: Option<GeofenceAction>,
    pub on_exit: Option<GeofenceAction>,
}

impl From<domain::Geofence> for Geofence {
    fn from(g: domain::Geofence) -> Self {
        let (shape, center, radius_m, vertices) = match g.boundary {
            domain::Boundary::Circle { center, radius_m } => {
                (BoundaryShape::Circle, Some(center.into()), Some(radius_m), Vec::new())
            }
            domain::Boundary::Polygon { vertices } => (
                BoundaryShape::Polygon,
                None,
                None,
                vertices.into_iter().map(Coordinates::from).collect(),
            ),
        };

        Self {
            id: ID(g.id),
            name: g.name,
            owner_id: g.owner_id,
            device_id: g.device_id.map(ID),
            active: g.active,
            shape,
            center,
            radius_m,
            vertices,
            on_enter: g.on_enter.map(GeofenceAction::from),
            on_exit: g.on_exit.map(GeofenceAction::from),
        }
    }
}

/// A device entered or left a geofence
#[derive(Debug, Clone, SimpleObject)]
pub struct GeofenceCrossingEvent {
    pub device_id: ID,
    pub geofence_id: ID,
    pub geofence_name: String,
    pub crossing: Crossing,
    pub action: Option<GeofenceAction>,
    pub at: DateTime<Utc>,
}

impl From<GeofenceCrossing> for GeofenceCrossingEvent {
    fn from(c: GeofenceCrossing) -> Self {
        Self {
            device_id: ID(c.device_id),
            geofence_id: ID(c.geofence_id),
            geofence_name: c.geofence_name,
            crossing: c.crossing.into(),
            action: c.action.map(GeofenceAction::from),
            at: c.at,
        }
    }
}
