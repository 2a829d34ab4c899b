//! # Fleet Tracker - Domain Model
//!
//! Core entities, value objects, and enums for GPS asset tracking:
//! device snapshots, location history, geofences, and derived alerts.
//! These types are the single source of truth across all layers:
//! change feeds, reconciliation, and the API surface.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// VALUE OBJECTS
// =============================================================================

/// A bare geographic point in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Validate the point lies on the globe
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidCoordinates`] when either component is
    /// out of range or not finite.
    pub fn validate(&self) -> Result<(), DomainError> {
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(DomainError::InvalidCoordinates {
                lat: self.latitude,
                lon: self.longitude,
            })
        }
    }

    /// Great-circle distance to another point in meters (Haversine formula)
    #[must_use]
    pub fn distance_to_m(&self, other: &Self) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;

        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        EARTH_RADIUS_M * c
    }
}

/// Last known position of a device with its movement vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed as reported by the tracker (km/h)
    pub speed: f64,
    pub heading: Option<f64>,
}

impl Position {
    #[must_use]
    pub const fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

// =============================================================================
// ENUMS
// =============================================================================

/// Device connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    #[default]
    Online,
    Offline,
    Maintenance,
}

impl Connectivity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
        }
    }

    /// Parse a backend status string, case-insensitively
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

/// Kind of tracked asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Vehicle,
    Personal,
    Asset,
}

impl DeviceType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vehicle => "vehicle",
            Self::Personal => "personal",
            Self::Asset => "asset",
        }
    }
}

/// Alert categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Tamper,
    Jamming,
    Geofence,
    #[serde(rename = "battery_low", alias = "battery")]
    Battery,
    Anomaly,
}

impl AlertType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tamper => "tamper",
            Self::Jamming => "jamming",
            Self::Geofence => "geofence",
            Self::Battery => "battery",
            Self::Anomaly => "anomaly",
        }
    }

    /// Level-triggered types fire while a condition holds and carry a
    /// deterministic id; the rest are edge-triggered.
    pub const fn is_level_triggered(&self) -> bool {
        !matches!(self, Self::Geofence)
    }
}

/// Alert severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// What happens when a device crosses a geofence boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeofenceAction {
    Alert,
    Notify,
    Log,
}

impl GeofenceAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Notify => "notify",
            Self::Log => "log",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "alert" => Some(Self::Alert),
            "notify" => Some(Self::Notify),
            "log" => Some(Self::Log),
            _ => None,
        }
    }
}

/// Boundary crossing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crossing {
    Enter,
    Exit,
}

/// Alert list filters offered to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertFilter {
    #[default]
    All,
    Unresolved,
    Critical,
    Resolved,
}

impl AlertFilter {
    #[must_use]
    pub fn matches(&self, alert: &Alert) -> bool {
        match self {
            Self::All => true,
            Self::Unresolved => !alert.resolved,
            Self::Critical => alert.severity == AlertSeverity::Critical,
            Self::Resolved => alert.resolved,
        }
    }
}

// =============================================================================
// OWNERSHIP
// =============================================================================

/// Partition of devices, geofences and alerts visible to one actor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerScope(String);

impl OwnerScope {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self(owner_id.into())
    }

    pub fn owner_id(&self) -> &str {
        &self.0
    }

    /// Records without an owner are visible to every scope
    #[must_use]
    pub fn matches(&self, owner_id: Option<&str>) -> bool {
        owner_id.is_none_or(|id| id == self.0)
    }
}

impl std::fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// ENTITY TYPES
// =============================================================================

/// Latest merged state of one tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub imei: Option<String>,
    pub name: String,
    pub owner_id: Option<String>,
    pub device_type: Option<DeviceType>,

    /// Absent until a location has ever been received
    pub position: Option<Position>,
    /// Percentage, 0-100. Defaults to 100 when never reported.
    pub battery: u8,
    pub tamper: bool,
    pub jamming: bool,
    /// Connectivity as reported; see [`Self::effective_connectivity`]
    pub connectivity: Connectivity,
    pub anomaly_score: Option<f64>,

    pub last_seen: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub const DEFAULT_BATTERY: u8 = 100;

    /// A blank snapshot with policy defaults
    pub fn new(id: impl Into<String>, seen_at: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            imei: None,
            owner_id: None,
            device_type: None,
            position: None,
            battery: Self::DEFAULT_BATTERY,
            tamper: false,
            jamming: false,
            connectivity: Connectivity::Online,
            anomaly_score: None,
            last_seen: seen_at,
        }
    }

    /// Connectivity with staleness applied.
    ///
    /// Maintenance is sticky; otherwise a device silent for longer than
    /// `threshold` is offline regardless of what it last reported.
    #[must_use]
    pub fn effective_connectivity(&self, now: DateTime<Utc>, threshold: Duration) -> Connectivity {
        match self.connectivity {
            Connectivity::Maintenance => Connectivity::Maintenance,
            _ if now - self.last_seen > threshold => Connectivity::Offline,
            reported => reported,
        }
    }

    /// Copy of this snapshot with the derived connectivity filled in
    #[must_use]
    pub fn projected(&self, now: DateTime<Utc>, threshold: Duration) -> Self {
        let mut view = self.clone();
        view.connectivity = self.effective_connectivity(now, threshold);
        view
    }
}

/// Append-only location history point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub id: Option<String>,
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub timestamp: DateTime<Utc>,
    pub accuracy: Option<f64>,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
}

impl LocationSample {
    #[must_use]
    pub const fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Whether two samples describe the same fix. Prefers the backend id.
    #[must_use]
    pub fn same_fix(&self, other: &Self) -> bool {
        match (&self.id, &other.id) {
            (Some(a), Some(b)) => a == b,
            _ => {
                self.timestamp == other.timestamp
                    && self.latitude == other.latitude
                    && self.longitude == other.longitude
            }
        }
    }
}

/// Geofence boundary in its canonical form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Boundary {
    Circle { center: GeoPoint, radius_m: f64 },
    Polygon { vertices: Vec<GeoPoint> },
}

impl Boundary {
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidBoundary`] for a non-positive radius or
    /// a polygon with fewer than three vertices, and
    /// [`DomainError::InvalidCoordinates`] for off-globe points.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            Self::Circle { center, radius_m } => {
                center.validate()?;
                if radius_m.is_finite() && *radius_m > 0.0 {
                    Ok(())
                } else {
                    Err(DomainError::InvalidBoundary(format!(
                        "radius must be positive, got {radius_m}"
                    )))
                }
            }
            Self::Polygon { vertices } => {
                if vertices.len() < 3 {
                    return Err(DomainError::InvalidBoundary(format!(
                        "polygon needs at least 3 vertices, got {}",
                        vertices.len()
                    )));
                }
                vertices.iter().try_for_each(GeoPoint::validate)
            }
        }
    }
}

/// User-defined area evaluated against every position update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub owner_id: Option<String>,
    /// Restricts the fence to a single device when set
    pub device_id: Option<String>,
    pub name: String,
    pub boundary: Boundary,
    pub active: bool,
    pub on_enter: Option<GeofenceAction>,
    pub on_exit: Option<GeofenceAction>,
}

impl Geofence {
    /// Whether this fence is evaluated for the given device
    #[must_use]
    pub fn applies_to(&self, device: &DeviceSnapshot) -> bool {
        if !self.active {
            return false;
        }
        if let Some(ref only) = self.device_id {
            return *only == device.id;
        }
        match (&self.owner_id, &device.owner_id) {
            (Some(fence_owner), Some(device_owner)) => fence_owner == device_owner,
            _ => true,
        }
    }

    #[must_use]
    pub const fn action_for(&self, crossing: Crossing) -> Option<GeofenceAction> {
        match crossing {
            Crossing::Enter => self.on_enter,
            Crossing::Exit => self.on_exit,
        }
    }
}

/// Derived alert with a human-driven acknowledge/resolve lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub device_id: String,
    #[serde(rename = "type")]
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

/// Namespace for deterministic level-triggered alert ids
const ALERT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_9b4d_4e21_a3c8_5d0f_7e12_b9a4);

impl Alert {
    pub fn new(
        id: Uuid,
        device_id: impl Into<String>,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            device_id: device_id.into(),
            alert_type,
            severity,
            message: message.into(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            created_at,
        }
    }

    /// Stable id for a level-triggered condition on a device
    #[must_use]
    pub fn level_id(device_id: &str, alert_type: AlertType) -> Uuid {
        let name = format!("{device_id}/{}", alert_type.as_str());
        Uuid::new_v5(&ALERT_NAMESPACE, name.as_bytes())
    }

    /// Mark acknowledged. Returns `false` if it already was.
    pub fn acknowledge(&mut self, actor: &str, at: DateTime<Utc>) -> bool {
        if self.acknowledged {
            return false;
        }
        self.acknowledged = true;
        self.acknowledged_by = Some(actor.to_string());
        self.acknowledged_at = Some(at);
        true
    }

    /// Mark resolved. Returns `false` if it already was.
    pub fn resolve(&mut self, actor: &str, at: DateTime<Utc>) -> bool {
        if self.resolved {
            return false;
        }
        self.resolved = true;
        self.resolved_by = Some(actor.to_string());
        self.resolved_at = Some(at);
        true
    }

    /// Reset the lifecycle for a freshly re-triggered condition
    pub fn reopen(&mut self, severity: AlertSeverity, message: String, at: DateTime<Utc>) {
        self.severity = severity;
        self.message = message;
        self.acknowledged = false;
        self.acknowledged_by = None;
        self.acknowledged_at = None;
        self.resolved = false;
        self.resolved_by = None;
        self.resolved_at = None;
        self.created_at = at;
    }
}

// =============================================================================
// WRITE INTENTS
// =============================================================================

/// Device provisioning request as submitted by the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub imei: String,
    pub name: String,
    #[serde(default)]
    pub owner_email: Option<String>,
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
}

/// Geofence creation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGeofence {
    pub name: String,
    pub boundary: Boundary,
    pub device_id: Option<String>,
    pub on_enter: Option<GeofenceAction>,
    pub on_exit: Option<GeofenceAction>,
    pub active: bool,
}

// =============================================================================
// AGGREGATES
// =============================================================================

/// Fleet-wide counters for the dashboard header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub maintenance: usize,
    pub tampered: usize,
    pub jammed: usize,
    pub low_battery: usize,
}

/// Unresolved alert counters by severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub unresolved: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl AlertSummary {
    #[must_use]
    pub fn from_alerts<'a>(alerts: impl IntoIterator<Item = &'a Alert>) -> Self {
        alerts
            .into_iter()
            .filter(|a| !a.resolved)
            .fold(Self::default(), |mut acc, a| {
                acc.unresolved += 1;
                match a.severity {
                    AlertSeverity::Critical => acc.critical += 1,
                    AlertSeverity::High => acc.high += 1,
                    AlertSeverity::Medium => acc.medium += 1,
                    AlertSeverity::Low => acc.low += 1,
                }
                acc
            })
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Domain-level errors
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Invalid coordinates: lat={lat}, lon={lon}")]
    InvalidCoordinates { lat: f64, lon: f64 },

    #[error("Invalid geofence boundary: {0}")]
    InvalidBoundary(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ids_are_stable_per_device_and_type() {
        let a = Alert::level_id("D1", AlertType::Battery);
        assert_eq!(a, Alert::level_id("D1", AlertType::Battery));
        assert_ne!(a, Alert::level_id("D1", AlertType::Tamper));
        assert_ne!(a, Alert::level_id("D2", AlertType::Battery));
    }

    #[test]
    fn stale_device_reads_offline_but_maintenance_sticks() {
        let seen = Utc::now() - Duration::minutes(10);
        let mut device = DeviceSnapshot::new("D1", seen);
        let threshold = Duration::minutes(2);

        assert_eq!(
            device.effective_connectivity(Utc::now(), threshold),
            Connectivity::Offline
        );
        assert_eq!(
            device.effective_connectivity(seen + Duration::seconds(30), threshold),
            Connectivity::Online
        );

        device.connectivity = Connectivity::Maintenance;
        assert_eq!(
            device.effective_connectivity(Utc::now(), threshold),
            Connectivity::Maintenance
        );
    }

    #[test]
    fn acknowledge_and_resolve_are_independent_and_idempotent() {
        let now = Utc::now();
        let mut alert = Alert::new(
            Uuid::new_v4(),
            "D1",
            AlertType::Tamper,
            AlertSeverity::Critical,
            "tamper",
            now,
        );

        assert!(alert.resolve("ops", now));
        assert!(!alert.acknowledged);
        assert!(alert.acknowledge("lead", now));
        assert!(!alert.acknowledge("someone-else", now));
        assert_eq!(alert.acknowledged_by.as_deref(), Some("lead"));
    }

    #[test]
    fn alert_type_uses_backend_wire_name_for_battery() {
        let json = serde_json::to_string(&AlertType::Battery).unwrap();
        assert_eq!(json, "\"battery_low\"");
        let parsed: AlertType = serde_json::from_str("\"battery\"").unwrap();
        assert_eq!(parsed, AlertType::Battery);
    }

    #[test]
    fn distance_between_nearby_points() {
        let a = GeoPoint::new(40.0, -74.0);
        let b = GeoPoint::new(40.001, -74.0);
        let d = a.distance_to_m(&b);
        assert!((d - 111.2).abs() < 1.0, "got {d}");
    }

    #[test]
    fn boundary_validation() {
        let circle = Boundary::Circle {
            center: GeoPoint::new(40.0, -74.0),
            radius_m: 100.0,
        };
        assert!(circle.validate().is_ok());

        let sliver = Boundary::Polygon {
            vertices: vec![GeoPoint::new(0.0, 0.0)],
        };
        assert!(sliver.validate().is_err());
    }

    #[test]
    fn summary_counts_only_unresolved() {
        let now = Utc::now();
        let mut resolved = Alert::new(
            Uuid::new_v4(),
            "D1",
            AlertType::Jamming,
            AlertSeverity::High,
            "jam",
            now,
        );
        resolved.resolve("ops", now);
        let open = Alert::new(
            Uuid::new_v4(),
            "D1",
            AlertType::Battery,
            AlertSeverity::Critical,
            "low",
            now,
        );

        let summary = AlertSummary::from_alerts([&resolved, &open]);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.critical, 1);
        assert_eq!(summary.high, 0);
    }
}
