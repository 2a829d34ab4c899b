//! # Alert Deriver
//!
//! Rules over a reconciled snapshot, plus the alert store they feed.
//!
//! Level-triggered alerts (battery, tamper, jamming, offline) carry an id
//! derived from `(device, type)`, so re-evaluation updates instead of
//! duplicating. Conditions that clear never auto-resolve. A resolved alert
//! stays resolved while its condition keeps holding and is reopened, same
//! id, only when the condition fires again after having cleared.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::TrackerConfig;
use tracker_domain::{
    Alert, AlertFilter, AlertSeverity, AlertSummary, AlertType, Connectivity, Crossing,
    DeviceSnapshot, Geofence,
};

/// Rule thresholds
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub battery_low: u8,
    pub battery_critical: u8,
    pub staleness: chrono::Duration,
}

impl From<&TrackerConfig> for Thresholds {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            battery_low: config.battery_low,
            battery_critical: config.battery_critical,
            staleness: config.staleness(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&TrackerConfig::default())
    }
}

/// One level rule evaluated against one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub alert_type: AlertType,
    pub holds: bool,
    pub severity: AlertSeverity,
    pub message: String,
}

/// Evaluate every level rule. Pure: reads only the snapshot and clock.
pub fn level_conditions(
    device: &DeviceSnapshot,
    now: DateTime<Utc>,
    thresholds: &Thresholds,
) -> [Condition; 4] {
    let battery_severity = if device.battery < thresholds.battery_critical {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Medium
    };
    let battery_message = if battery_severity == AlertSeverity::Critical {
        format!("Battery critical: {}%", device.battery)
    } else {
        format!("Battery low: {}%", device.battery)
    };

    [
        Condition {
            alert_type: AlertType::Battery,
            holds: device.battery < thresholds.battery_low,
            severity: battery_severity,
            message: battery_message,
        },
        Condition {
            alert_type: AlertType::Tamper,
            holds: device.tamper,
            severity: AlertSeverity::Critical,
            message: format!("Tamper detected on {}", device.name),
        },
        Condition {
            alert_type: AlertType::Jamming,
            holds: device.jamming,
            severity: AlertSeverity::High,
            message: format!("GPS jamming detected on {}", device.name),
        },
        Condition {
            alert_type: AlertType::Anomaly,
            holds: device.effective_connectivity(now, thresholds.staleness)
                == Connectivity::Offline,
            severity: AlertSeverity::Medium,
            message: "device offline".to_string(),
        },
    ]
}

/// What an evaluation did to the alert store
#[derive(Debug, Clone, PartialEq)]
pub enum AlertChange {
    Raised(Alert),
    Updated(Alert),
    Reopened(Alert),
}

impl AlertChange {
    pub const fn alert(&self) -> &Alert {
        match self {
            Self::Raised(a) | Self::Updated(a) | Self::Reopened(a) => a,
        }
    }

    pub fn into_alert(self) -> Alert {
        match self {
            Self::Raised(a) | Self::Updated(a) | Self::Reopened(a) => a,
        }
    }
}

/// Resolved geofence alerts kept in memory; older ones are evicted
pub const RESOLVED_GEOFENCE_RETENTION: usize = 500;

/// Alert store plus per-condition memory
#[derive(Debug)]
pub struct AlertDeriver {
    thresholds: Thresholds,
    alerts: HashMap<Uuid, Alert>,
    /// `(device, type)` pairs whose condition held at the last evaluation
    holding: HashSet<(String, AlertType)>,
    resolved_geofence_retention: usize,
}

impl Default for AlertDeriver {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

impl AlertDeriver {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            alerts: HashMap::new(),
            holding: HashSet::new(),
            resolved_geofence_retention: RESOLVED_GEOFENCE_RETENTION,
        }
    }

    #[must_use]
    pub const fn with_resolved_geofence_retention(mut self, retention: usize) -> Self {
        self.resolved_geofence_retention = retention;
        self
    }

    pub const fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Re-run the level rules for one device
    pub fn evaluate(&mut self, device: &DeviceSnapshot, now: DateTime<Utc>) -> Vec<AlertChange> {
        let mut changes = Vec::new();

        for condition in level_conditions(device, now, &self.thresholds) {
            let key = (device.id.clone(), condition.alert_type);
            if !condition.holds {
                self.holding.remove(&key);
                continue;
            }
            let was_holding = !self.holding.insert(key);

            let id = Alert::level_id(&device.id, condition.alert_type);
            match self.alerts.get_mut(&id) {
                None => {
                    let alert = Alert::new(
                        id,
                        device.id.clone(),
                        condition.alert_type,
                        condition.severity,
                        condition.message,
                        now,
                    );
                    self.alerts.insert(id, alert.clone());
                    changes.push(AlertChange::Raised(alert));
                }
                Some(alert) if !alert.resolved => {
                    if alert.severity != condition.severity || alert.message != condition.message {
                        alert.severity = condition.severity;
                        alert.message = condition.message;
                        changes.push(AlertChange::Updated(alert.clone()));
                    }
                }
                Some(_) if was_holding => {
                    tracing::trace!(alert_id = %id, "condition persists on resolved alert");
                }
                Some(alert) => {
                    alert.reopen(condition.severity, condition.message, now);
                    changes.push(AlertChange::Reopened(alert.clone()));
                }
            }
        }

        changes
    }

    /// Edge-triggered alert for a boundary crossing
    pub fn geofence_alert(
        &mut self,
        device: &DeviceSnapshot,
        fence: &Geofence,
        crossing: Crossing,
        now: DateTime<Utc>,
    ) -> AlertChange {
        let verb = match crossing {
            Crossing::Enter => "entered",
            Crossing::Exit => "left",
        };
        let alert = Alert::new(
            Uuid::new_v4(),
            device.id.clone(),
            AlertType::Geofence,
            AlertSeverity::High,
            format!("{} {verb} geofence {}", device.name, fence.name),
            now,
        );
        self.alerts.insert(alert.id, alert.clone());
        self.evict_resolved_geofence_alerts();
        AlertChange::Raised(alert)
    }

    /// Geofence alerts get a fresh id per crossing, so resolved ones are
    /// trimmed oldest first once past the retention limit
    fn evict_resolved_geofence_alerts(&mut self) {
        let mut resolved: Vec<(DateTime<Utc>, Uuid)> = self
            .alerts
            .values()
            .filter(|a| a.alert_type == AlertType::Geofence && a.resolved)
            .map(|a| (a.resolved_at.unwrap_or(a.created_at), a.id))
            .collect();
        let excess = resolved.len().saturating_sub(self.resolved_geofence_retention);
        if excess == 0 {
            return;
        }

        resolved.sort_unstable();
        for (_, id) in resolved.into_iter().take(excess) {
            self.alerts.remove(&id);
        }
        tracing::debug!(evicted = excess, "trimmed resolved geofence alerts");
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    pub fn get(&self, id: Uuid) -> Option<&Alert> {
        self.alerts.get(&id)
    }

    /// Take the acknowledge/resolve fields of a confirmed write. Severity and
    /// message stay whatever the rules last set.
    pub fn commit_lifecycle(&mut self, confirmed: &Alert) -> Option<Alert> {
        let alert = self.alerts.get_mut(&confirmed.id)?;
        alert.acknowledged = confirmed.acknowledged;
        alert.acknowledged_by.clone_from(&confirmed.acknowledged_by);
        alert.acknowledged_at = confirmed.acknowledged_at;
        alert.resolved = confirmed.resolved;
        alert.resolved_by.clone_from(&confirmed.resolved_by);
        alert.resolved_at = confirmed.resolved_at;
        Some(alert.clone())
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Newest first
    pub fn list(&self, filter: AlertFilter) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .alerts
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        alerts
    }

    pub fn count(&self, predicate: impl Fn(&Alert) -> bool) -> usize {
        self.alerts.values().filter(|a| predicate(a)).count()
    }

    pub fn summary(&self) -> AlertSummary {
        AlertSummary::from_alerts(self.alerts.values())
    }

    /// Drop condition memory for a device; its alerts stay on record
    pub fn forget_device(&mut self, device_id: &str) {
        self.holding.retain(|(id, _)| id != device_id);
    }

    pub fn clear(&mut self) {
        self.alerts.clear();
        self.holding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fake::Fake;
    use fake::faker::name::en::Name;
    use tracker_domain::{Boundary, GeoPoint, GeofenceAction};

    fn device(battery: u8) -> DeviceSnapshot {
        let mut d = DeviceSnapshot::new("D1", Utc::now());
        d.name = Name().fake();
        d.battery = battery;
        d
    }

    fn open(deriver: &AlertDeriver) -> Vec<Alert> {
        deriver.list(AlertFilter::Unresolved)
    }

    #[test]
    fn critical_battery_raises_one_alert() {
        let mut deriver = AlertDeriver::default();
        let changes = deriver.evaluate(&device(8), Utc::now());

        assert_eq!(changes.len(), 1);
        let alert = changes[0].alert();
        assert_eq!(alert.device_id, "D1");
        assert_eq!(alert.alert_type, AlertType::Battery);
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert!(alert.message.contains("8%"));
    }

    #[test]
    fn repeated_drops_deduplicate() {
        let mut deriver = AlertDeriver::default();
        let now = Utc::now();
        deriver.evaluate(&device(15), now);
        let changes = deriver.evaluate(&device(15), now);
        assert!(changes.is_empty());

        let changes = deriver.evaluate(&device(12), now);
        assert!(matches!(changes[..], [AlertChange::Updated(_)]));
        assert_eq!(open(&deriver).len(), 1);
        assert_eq!(open(&deriver)[0].id, Alert::level_id("D1", AlertType::Battery));
    }

    #[test]
    fn recovery_does_not_auto_resolve() {
        let mut deriver = AlertDeriver::default();
        let now = Utc::now();
        deriver.evaluate(&device(8), now);
        let before = open(&deriver);

        let changes = deriver.evaluate(&device(25), now);
        assert!(changes.is_empty());
        assert_eq!(open(&deriver), before);
    }

    #[test]
    fn resolved_alert_is_suppressed_while_condition_persists() {
        let mut deriver = AlertDeriver::default();
        let now = Utc::now();
        deriver.evaluate(&device(8), now);

        let mut resolved = open(&deriver)[0].clone();
        resolved.resolve("ops", now);
        deriver.commit_lifecycle(&resolved);

        assert!(deriver.evaluate(&device(8), now).is_empty());
        assert!(open(&deriver).is_empty());
    }

    #[test]
    fn fresh_transition_reopens_with_same_id() {
        let mut deriver = AlertDeriver::default();
        let now = Utc::now();
        deriver.evaluate(&device(8), now);
        let id = open(&deriver)[0].id;

        let mut resolved = deriver.get(id).unwrap().clone();
        resolved.acknowledge("lead", now);
        resolved.resolve("ops", now);
        deriver.commit_lifecycle(&resolved);

        deriver.evaluate(&device(60), now);
        let later = now + Duration::minutes(5);
        let mut low = device(9);
        low.last_seen = later;
        let changes = deriver.evaluate(&low, later);

        match &changes[..] {
            [AlertChange::Reopened(alert)] => {
                assert_eq!(alert.id, id);
                assert!(!alert.resolved && !alert.acknowledged);
                assert_eq!(alert.created_at, later);
            }
            other => panic!("expected a reopen, got {other:?}"),
        }
    }

    #[test]
    fn rules_fire_independently() {
        let mut deriver = AlertDeriver::default();
        let mut d = device(50);
        d.tamper = true;
        d.jamming = true;

        let changes = deriver.evaluate(&d, Utc::now());
        let mut kinds: Vec<_> = changes
            .iter()
            .map(|c| (c.alert().alert_type, c.alert().severity))
            .collect();
        kinds.sort_by_key(|(t, _)| t.as_str());
        assert_eq!(
            kinds,
            [
                (AlertType::Jamming, AlertSeverity::High),
                (AlertType::Tamper, AlertSeverity::Critical),
            ]
        );
    }

    #[test]
    fn stale_device_raises_offline_anomaly() {
        let mut deriver = AlertDeriver::default();
        let mut d = device(80);
        d.last_seen = Utc::now() - Duration::minutes(10);

        let changes = deriver.evaluate(&d, Utc::now());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].alert().alert_type, AlertType::Anomaly);
        assert_eq!(changes[0].alert().message, "device offline");

        d.connectivity = Connectivity::Maintenance;
        let mut fresh = AlertDeriver::default();
        assert!(fresh.evaluate(&d, Utc::now()).is_empty());
    }

    #[test]
    fn geofence_alerts_are_unique_per_crossing() {
        let mut deriver = AlertDeriver::default();
        let fence = Geofence {
            id: "G1".into(),
            owner_id: None,
            device_id: None,
            name: "Depot".into(),
            boundary: Boundary::Circle {
                center: GeoPoint::new(0.0, 0.0),
                radius_m: 10.0,
            },
            active: true,
            on_enter: Some(GeofenceAction::Alert),
            on_exit: None,
        };
        let d = device(90);
        let a = deriver.geofence_alert(&d, &fence, Crossing::Enter, Utc::now());
        let b = deriver.geofence_alert(&d, &fence, Crossing::Enter, Utc::now());

        assert_ne!(a.alert().id, b.alert().id);
        assert_eq!(a.alert().severity, AlertSeverity::High);
        assert_eq!(deriver.count(|x| x.alert_type == AlertType::Geofence), 2);
    }

    #[test]
    fn resolved_geofence_alerts_are_trimmed_oldest_first() {
        let mut deriver = AlertDeriver::default().with_resolved_geofence_retention(2);
        let fence = Geofence {
            id: "G1".into(),
            owner_id: None,
            device_id: None,
            name: "Depot".into(),
            boundary: Boundary::Circle {
                center: GeoPoint::new(0.0, 0.0),
                radius_m: 10.0,
            },
            active: true,
            on_enter: Some(GeofenceAction::Alert),
            on_exit: None,
        };
        let d = device(90);
        let start = Utc::now();

        let mut ids = Vec::new();
        for i in 0..4 {
            let at = start + Duration::seconds(i);
            let id = deriver.geofence_alert(&d, &fence, Crossing::Enter, at).alert().id;
            let mut resolved = deriver.get(id).unwrap().clone();
            resolved.resolve("ops", at);
            deriver.commit_lifecycle(&resolved);
            ids.push(id);
        }
        let open_id = deriver
            .geofence_alert(&d, &fence, Crossing::Exit, start + Duration::seconds(10))
            .alert()
            .id;

        assert_eq!(deriver.count(|x| x.alert_type == AlertType::Geofence), 3);
        assert!(deriver.get(ids[0]).is_none());
        assert!(deriver.get(ids[1]).is_none());
        assert!(deriver.get(ids[2]).is_some());
        assert!(deriver.get(ids[3]).is_some());
        assert!(deriver.get(open_id).is_some());
    }
}
