//! # GraphQL Enum Types
//!
//! Enum definitions for the GraphQL schema.

use async_graphql::Enum;
use tracker_domain as domain;

/// Device reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
#[graphql(rename_items = "SCREAMING_SNAKE_CASE")]
pub enum Connectivity {
    /// Reporting within the staleness window
    Online,
    /// Silent for longer than the staleness window, or reported offline
    Offline,
    /// Taken out of service by an operator
    Maintenance,
}

impl From<domain::Connectivity> for Connectivity {
    fn from(c: domain::Connectivity) -> Self {
        match c {
            domain::Connectivity::Online => Self::Online,
            domain::Connectivity::Offline => Self::Offline,
            domain::Connectivity::Maintenance => Self::Maintenance,
        }
    }
}

/// Kind of tracked asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Default)]
#[graphql(rename_items = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    #[default]
    Vehicle,
    Personal,
    Asset,
}

impl From<domain::DeviceType> for DeviceType {
    fn from(t: domain::DeviceType) -> Self {
        match t {
            domain::DeviceType::Vehicle => Self::Vehicle,
            domain::DeviceType::Personal => Self::Personal,
            domain::DeviceType::Asset => Self::Asset,
        }
    }
}

impl From<DeviceType> for domain::DeviceType {
    fn from(t: DeviceType) -> Self {
        match t {
            DeviceType::Vehicle => Self::Vehicle,
            DeviceType::Personal => Self::Personal,
            DeviceType::Asset => Self::Asset,
        }
    }
}

/// Alert category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
#[graphql(rename_items = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    /// Casing opened or device removed
    Tamper,
    /// GPS signal jamming
    Jamming,
    /// Geofence boundary crossed
    Geofence,
    /// Battery below threshold
    BatteryLow,
    /// Device silent or behaving unusually
    Anomaly,
}

impl From<domain::AlertType> for AlertType {
    fn from(t: domain::AlertType) -> Self {
        match t {
            domain::AlertType::Tamper => Self::Tamper,
            domain::AlertType::Jamming => Self::Jamming,
            domain::AlertType::Geofence => Self::Geofence,
            domain::AlertType::Battery => Self::BatteryLow,
            domain::AlertType::Anomaly => Self::Anomaly,
        }
    }
}

/// Alert severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
#[graphql(rename_items = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<domain::AlertSeverity> for AlertSeverity {
    fn from(s: domain::AlertSeverity) -> Self {
        match s {
            domain::AlertSeverity::Low => Self::Low,
            domain::AlertSeverity::Medium => Self::Medium,
            domain::AlertSeverity::High => Self::High,
            domain::AlertSeverity::Critical => Self::Critical,
        }
    }
}

/// What happens when a device crosses a geofence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
#[graphql(rename_items = "SCREAMING_SNAKE_CASE")]
pub enum GeofenceAction {
    /// Raise an alert
    Alert,
    /// Notify subscribers without an alert
    Notify,
    /// Record in the service log only
    Log,
}

impl From<domain::GeofenceAction> for GeofenceAction {
    fn from(a: domain::GeofenceAction) -> Self {
        match a {
            domain::GeofenceAction::Alert => Self::Alert,
            domain::GeofenceAction::Notify => Self::Notify,
            domain::GeofenceAction::Log => Self::Log,
        }
    }
}

impl From<GeofenceAction> for domain::GeofenceAction {
    fn from(a: GeofenceAction) -> Self {
        match a {
            GeofenceAction::Alert => Self::Alert,
            GeofenceAction::Notify => Self::Notify,
            GeofenceAction::Log => Self::Log,
        }
    }
}

/// Direction of a boundary transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
#[graphql(rename_items = "SCREAMING_SNAKE_CASE")]
pub enum Crossing {
    Enter,
    Exit,
}

impl From<domain::Crossing> for Crossing {
    fn from(c: domain::Crossing) -> Self {
        match c {
            domain::Crossing::Enter => Self::Enter,
            domain::Crossing::Exit => Self::Exit,
        }
    }
}

/// Geofence boundary shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
#[graphql(rename_items = "SCREAMING_SNAKE_CASE")]
pub enum BoundaryShape {
    Circle,
    Polygon,
}

/// Alert list filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Default)]
#[graphql(rename_items = "SCREAMING_SNAKE_CASE")]
pub enum AlertFilter {
    #[default]
    All,
    Unresolved,
    Critical,
    Resolved,
}

impl From<AlertFilter> for domain::AlertFilter {
    fn from(f: AlertFilter) -> Self {
        match f {
            AlertFilter::All => Self::All,
            AlertFilter::Unresolved => Self::Unresolved,
            AlertFilter::Critical => Self::Critical,
            AlertFilter::Resolved => Self::Resolved,
        }
    }
}

/// How an alert changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
#[graphql(rename_items = "SCREAMING_SNAKE_CASE")]
pub enum AlertChangeKind {
    /// First time this alert exists
    Raised,
    /// Severity, message or lifecycle changed
    Updated,
    /// Condition returned after the alert was resolved
    Reopened,
}
