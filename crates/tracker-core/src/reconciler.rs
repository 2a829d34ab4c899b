//! # State Reconciler
//!
//! Owns the canonical device snapshots and per-device location history.
//! Merges are last-writer-wins per field, keyed on event time rather than
//! arrival order, so delayed or duplicated events are harmless.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::normalize::{self, DevicePatch, RejectReason};
use tracker_domain::{DeviceSnapshot, GeoPoint, LocationSample, Position};
use tracker_feed::{RawDeviceEvent, RawLocationEvent};

/// Result of merging one device event
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// At least one field (or a brand-new device) was taken
    Accepted {
        snapshot: DeviceSnapshot,
        movement: Option<Movement>,
    },
    /// Every field the event mentioned was already newer
    Stale { snapshot: DeviceSnapshot },
}

impl MergeOutcome {
    pub const fn snapshot(&self) -> &DeviceSnapshot {
        match self {
            Self::Accepted { snapshot, .. } | Self::Stale { snapshot } => snapshot,
        }
    }

    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Position change produced by a merge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Movement {
    /// `None` for the first position ever recorded
    pub from: Option<GeoPoint>,
    pub to: GeoPoint,
}

/// Result of applying one location fix
#[derive(Debug, Clone, PartialEq)]
pub struct LocationApplied {
    pub sample: LocationSample,
    /// Already present in history; nothing changed
    pub duplicate: bool,
    /// Merge into the device snapshot; `None` for a duplicate
    pub device: Option<MergeOutcome>,
}

/// Event time that last set each field
#[derive(Debug, Clone, Default)]
struct FieldStamps {
    name: Option<DateTime<Utc>>,
    owner: Option<DateTime<Utc>>,
    device_type: Option<DateTime<Utc>>,
    position: Option<DateTime<Utc>>,
    speed: Option<DateTime<Utc>>,
    heading: Option<DateTime<Utc>>,
    battery: Option<DateTime<Utc>>,
    tamper: Option<DateTime<Utc>>,
    jamming: Option<DateTime<Utc>>,
    connectivity: Option<DateTime<Utc>>,
    anomaly: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Tracked {
    snapshot: DeviceSnapshot,
    stamps: FieldStamps,
}

/// Tally of one merge pass
#[derive(Default)]
struct Tally {
    mentioned: usize,
    applied: usize,
}

impl Tally {
    /// Last-writer-wins on a single field
    fn merge<T>(
        &mut self,
        slot: &mut T,
        stamp: &mut Option<DateTime<Utc>>,
        value: Option<T>,
        at: DateTime<Utc>,
    ) {
        let Some(value) = value else { return };
        self.mentioned += 1;
        if stamp.is_none_or(|held| at >= held) {
            *slot = value;
            *stamp = Some(at);
            self.applied += 1;
        }
    }
}

/// Canonical per-device state store
#[derive(Debug, Default)]
pub struct Reconciler {
    devices: HashMap<String, Tracked>,
    history: HashMap<String, Vec<LocationSample>>,
    history_window: usize,
}

impl Reconciler {
    pub fn new(history_window: usize) -> Self {
        Self {
            devices: HashMap::new(),
            history: HashMap::new(),
            history_window,
        }
    }

    // =========================================================================
    // DEVICE EVENTS
    // =========================================================================

    /// Merge a raw device event; `now` stands in for a missing event time
    ///
    /// # Errors
    ///
    /// Returns a [`RejectReason`] for events with no device id.
    pub fn apply_device_event(
        &mut self,
        raw: &RawDeviceEvent,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, RejectReason> {
        let patch = normalize::device_patch(raw)?;
        Ok(self.apply_patch(patch, now))
    }

    /// Merge an already normalized patch
    pub fn apply_patch(&mut self, patch: DevicePatch, now: DateTime<Utc>) -> MergeOutcome {
        let at = patch.event_time.unwrap_or(now);
        let mut created = false;
        let tracked = self.devices.entry(patch.id.clone()).or_insert_with(|| {
            created = true;
            Tracked {
                snapshot: DeviceSnapshot::new(patch.id.clone(), at),
                stamps: FieldStamps::default(),
            }
        });

        let before = tracked.snapshot.position.map(|p| p.point());
        let tally = merge_fields(tracked, patch, at);
        let snapshot = &mut tracked.snapshot;

        if !created && tally.mentioned > 0 && tally.applied == 0 {
            debug!(
                device_id = %snapshot.id,
                event_time = %at,
                "dropping stale device event"
            );
            return MergeOutcome::Stale {
                snapshot: snapshot.clone(),
            };
        }

        if at > snapshot.last_seen {
            snapshot.last_seen = at;
        }

        let after = snapshot.position.map(|p| p.point());
        let movement = match after {
            Some(to) if before != Some(to) => Some(Movement { from: before, to }),
            _ => None,
        };

        MergeOutcome::Accepted {
            snapshot: snapshot.clone(),
            movement,
        }
    }

    // =========================================================================
    // LOCATION EVENTS
    // =========================================================================

    /// Record a location fix in history and fold it into the device position.
    /// History is only kept for devices this store holds a snapshot of.
    ///
    /// # Errors
    ///
    /// Returns a [`RejectReason`] for fixes with no device id or coordinates,
    /// or for a device with no snapshot.
    pub fn apply_location_event(
        &mut self,
        raw: &RawLocationEvent,
        now: DateTime<Utc>,
    ) -> Result<LocationApplied, RejectReason> {
        let sample = normalize::location_sample(raw, now)?;
        if !self.devices.contains_key(&sample.device_id) {
            return Err(RejectReason::UnknownDevice {
                id: sample.device_id,
            });
        }

        let history = self.history.entry(sample.device_id.clone()).or_default();
        if history.iter().any(|s| s.same_fix(&sample)) {
            return Ok(LocationApplied {
                sample,
                duplicate: true,
                device: None,
            });
        }

        // Descending by timestamp; a later arrival goes ahead of equal stamps
        let at = history.partition_point(|s| s.timestamp > sample.timestamp);
        history.insert(at, sample.clone());
        history.truncate(self.history_window);

        let patch = DevicePatch {
            id: sample.device_id.clone(),
            event_time: Some(sample.timestamp),
            coordinates: Some(sample.point()),
            speed: Some(sample.speed),
            heading: sample.heading,
            ..DevicePatch::default()
        };
        let device = self.apply_patch(patch, now);

        Ok(LocationApplied {
            sample,
            duplicate: false,
            device: Some(device),
        })
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub fn snapshot(&self, id: &str) -> Option<&DeviceSnapshot> {
        self.devices.get(id).map(|t| &t.snapshot)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &DeviceSnapshot> {
        self.devices.values().map(|t| &t.snapshot)
    }

    /// Most recent samples first
    pub fn history(&self, device_id: &str, limit: usize) -> Vec<LocationSample> {
        self.history
            .get(device_id)
            .map(|h| h.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Forget a device deleted upstream, history included
    pub fn remove_device(&mut self, id: &str) -> Option<DeviceSnapshot> {
        self.history.remove(id);
        self.devices.remove(id).map(|t| t.snapshot)
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.history.clear();
    }
}

fn merge_fields(tracked: &mut Tracked, patch: DevicePatch, at: DateTime<Utc>) -> Tally {
    let Tracked { snapshot, stamps } = tracked;
    let mut tally = Tally::default();

    // Identity
    if let Some(imei) = patch.imei {
        match snapshot.imei {
            None => snapshot.imei = Some(imei),
            Some(ref held) if *held != imei => {
                warn!(device_id = %snapshot.id, held = %held, incoming = %imei, "ignoring IMEI change");
            }
            Some(_) => {}
        }
    }
    tally.merge(&mut snapshot.name, &mut stamps.name, patch.name, at);
    if stamps.name.is_none() {
        snapshot.name = snapshot.imei.clone().unwrap_or_else(|| snapshot.id.clone());
    }
    tally.merge(
        &mut snapshot.owner_id,
        &mut stamps.owner,
        patch.owner_id.map(Some),
        at,
    );
    tally.merge(
        &mut snapshot.device_type,
        &mut stamps.device_type,
        patch.device_type.map(Some),
        at,
    );

    // Position: coordinates first so a brand-new position can take speed/heading
    let mut position = snapshot.position;
    let mut fix_is_stale = false;
    if let Some(point) = patch.coordinates {
        let mut coords = position.map(|p| p.point());
        let taken = tally.applied;
        tally.merge(&mut coords, &mut stamps.position, Some(Some(point)), at);
        fix_is_stale = tally.applied == taken;
        if let Some(point) = coords {
            let held = position.unwrap_or(Position {
                latitude: point.latitude,
                longitude: point.longitude,
                speed: 0.0,
                heading: None,
            });
            position = Some(Position {
                latitude: point.latitude,
                longitude: point.longitude,
                ..held
            });
        }
    }
    // Speed and heading travel with the fix that carried them
    if let Some(p) = position.as_mut().filter(|_| !fix_is_stale) {
        tally.merge(&mut p.speed, &mut stamps.speed, patch.speed, at);
        tally.merge(&mut p.heading, &mut stamps.heading, patch.heading.map(Some), at);
    }
    snapshot.position = position;

    // Telemetry
    tally.merge(&mut snapshot.battery, &mut stamps.battery, patch.battery, at);
    tally.merge(&mut snapshot.tamper, &mut stamps.tamper, patch.tamper, at);
    tally.merge(&mut snapshot.jamming, &mut stamps.jamming, patch.jamming, at);
    tally.merge(
        &mut snapshot.connectivity,
        &mut stamps.connectivity,
        patch.connectivity,
        at,
    );
    tally.merge(
        &mut snapshot.anomaly_score,
        &mut stamps.anomaly,
        patch.anomaly_score.map(Some),
        at,
    );

    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::{Value, json};

    fn device(value: Value) -> RawDeviceEvent {
        RawDeviceEvent::try_from(value).unwrap()
    }

    fn location(value: Value) -> RawLocationEvent {
        RawLocationEvent::try_from(value).unwrap()
    }

    fn accepted(outcome: MergeOutcome) -> DeviceSnapshot {
        match outcome {
            MergeOutcome::Accepted { snapshot, .. } => snapshot,
            MergeOutcome::Stale { .. } => panic!("expected an accepted merge"),
        }
    }

    #[test]
    fn applying_same_event_twice_is_idempotent() {
        let mut reconciler = Reconciler::new(200);
        let now = Utc::now();
        let event = device(json!({
            "id": "D1", "lat": 40.0, "lon": -74.0, "battery": 64,
            "timestamp": "2024-05-01T12:00:00Z",
        }));

        let once = accepted(reconciler.apply_device_event(&event, now).unwrap());
        let twice = reconciler.apply_device_event(&event, now).unwrap();
        assert_eq!(&once, twice.snapshot());
    }

    #[test]
    fn partial_event_preserves_position() {
        let mut reconciler = Reconciler::new(200);
        let now = Utc::now();
        reconciler
            .apply_device_event(&device(json!({"id": "D1", "lat": 40.0, "lon": -74.0})), now)
            .unwrap();
        let snapshot = accepted(
            reconciler
                .apply_device_event(&device(json!({"id": "D1", "battery": 50})), now)
                .unwrap(),
        );

        assert_eq!(snapshot.battery, 50);
        let position = snapshot.position.unwrap();
        assert_eq!(position.point(), GeoPoint::new(40.0, -74.0));
    }

    #[test]
    fn alias_spellings_store_identical_position() {
        let now = Utc::now();
        let mut a = Reconciler::new(200);
        let mut b = Reconciler::new(200);

        let left = accepted(
            a.apply_device_event(&device(json!({"id": "D1", "lat": 40.5, "lon": -73.9})), now)
                .unwrap(),
        );
        let right = accepted(
            b.apply_device_event(
                &device(json!({"id": "D1", "latitude": 40.5, "longitude": -73.9})),
                now,
            )
            .unwrap(),
        );
        assert_eq!(left.position, right.position);
    }

    #[test]
    fn reordered_events_keep_latest_per_field() {
        let mut reconciler = Reconciler::new(200);
        let now = Utc::now();
        let t1 = now - Duration::seconds(60);
        let t2 = now - Duration::seconds(30);

        reconciler
            .apply_device_event(
                &device(json!({"id": "D1", "battery": 40, "timestamp": t2.to_rfc3339()})),
                now,
            )
            .unwrap();
        let snapshot = accepted(
            reconciler
                .apply_device_event(
                    &device(json!({
                        "id": "D1", "battery": 90, "tamper": true,
                        "timestamp": t1.to_rfc3339(),
                    })),
                    now,
                )
                .unwrap(),
        );

        assert_eq!(snapshot.last_seen, t2);
        assert_eq!(snapshot.battery, 40, "older battery must not win");
        assert!(snapshot.tamper, "field only the older event carried is merged");
    }

    #[test]
    fn fully_stale_event_is_dropped() {
        let mut reconciler = Reconciler::new(200);
        let now = Utc::now();
        let t1 = now - Duration::seconds(60);

        reconciler
            .apply_device_event(&device(json!({"id": "D1", "battery": 40})), now)
            .unwrap();
        let outcome = reconciler
            .apply_device_event(
                &device(json!({"id": "D1", "battery": 90, "timestamp": t1.to_rfc3339()})),
                now,
            )
            .unwrap();

        assert!(!outcome.is_accepted());
        assert_eq!(outcome.snapshot().battery, 40);
    }

    #[test]
    fn defaults_and_name_fallback() {
        let mut reconciler = Reconciler::new(200);
        let snapshot = accepted(
            reconciler
                .apply_device_event(&device(json!({"id": "D1", "imei": "356938035643809"})), Utc::now())
                .unwrap(),
        );
        assert_eq!(snapshot.battery, 100);
        assert!(!snapshot.tamper && !snapshot.jamming);
        assert_eq!(snapshot.name, "356938035643809");
        assert!(snapshot.position.is_none());
    }

    #[test]
    fn imei_is_immutable_once_set() {
        let mut reconciler = Reconciler::new(200);
        let now = Utc::now();
        reconciler
            .apply_device_event(&device(json!({"id": "D1", "imei": "111"})), now)
            .unwrap();
        reconciler
            .apply_device_event(&device(json!({"id": "D1", "imei": "222"})), now)
            .unwrap();
        assert_eq!(reconciler.snapshot("D1").unwrap().imei.as_deref(), Some("111"));
    }

    #[test]
    fn first_position_reports_movement_without_origin() {
        let mut reconciler = Reconciler::new(200);
        let outcome = reconciler
            .apply_device_event(&device(json!({"id": "D1", "lat": 1.0, "lon": 2.0})), Utc::now())
            .unwrap();
        match outcome {
            MergeOutcome::Accepted { movement, .. } => {
                let movement = movement.unwrap();
                assert!(movement.from.is_none());
                assert_eq!(movement.to, GeoPoint::new(1.0, 2.0));
            }
            MergeOutcome::Stale { .. } => panic!("expected accepted"),
        }
    }

    #[test]
    fn history_is_newest_first_across_aliases() {
        let mut reconciler = Reconciler::new(200);
        let now = Utc::now();
        let t = now - Duration::seconds(10);
        reconciler.apply_device_event(&device(json!({"id": "D2"})), t).unwrap();

        reconciler
            .apply_location_event(
                &location(json!({
                    "device_id": "D2", "lat": 40.0, "lon": -74.0, "timestamp": t.to_rfc3339(),
                })),
                now,
            )
            .unwrap();
        reconciler
            .apply_location_event(
                &location(json!({
                    "device_id": "D2", "latitude": 40.001, "longitude": -74.001,
                    "timestamp": (t + Duration::seconds(1)).to_rfc3339(),
                })),
                now,
            )
            .unwrap();

        let history = reconciler.history("D2", 10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].latitude, 40.001);
        assert_eq!(history[1].latitude, 40.0);
    }

    #[test]
    fn history_dedups_and_truncates() {
        let mut reconciler = Reconciler::new(3);
        let now = Utc::now();
        reconciler.apply_device_event(&device(json!({"id": "D1"})), now).unwrap();

        for i in 0..5 {
            let raw = location(json!({
                "id": format!("L{i}"), "device_id": "D1", "lat": 1.0, "lon": 1.0,
                "timestamp": (now + Duration::seconds(i)).to_rfc3339(),
            }));
            reconciler.apply_location_event(&raw, now).unwrap();
        }
        let replay = location(json!({
            "id": "L4", "device_id": "D1", "lat": 1.0, "lon": 1.0,
            "timestamp": (now + Duration::seconds(4)).to_rfc3339(),
        }));
        assert!(reconciler.apply_location_event(&replay, now).unwrap().duplicate);

        let history = reconciler.history("D1", 10);
        let ids: Vec<_> = history.iter().filter_map(|s| s.id.as_deref()).collect();
        assert_eq!(ids, ["L4", "L3", "L2"]);
    }

    #[test]
    fn location_moves_known_device_unless_older() {
        let mut reconciler = Reconciler::new(200);
        let now = Utc::now();
        reconciler
            .apply_device_event(
                &device(json!({"id": "D1", "lat": 5.0, "lon": 5.0, "timestamp": now.to_rfc3339()})),
                now,
            )
            .unwrap();

        let older = location(json!({
            "device_id": "D1", "lat": 6.0, "lon": 6.0,
            "timestamp": (now - Duration::seconds(5)).to_rfc3339(),
        }));
        let applied = reconciler.apply_location_event(&older, now).unwrap();
        assert!(!applied.device.unwrap().is_accepted());
        assert_eq!(
            reconciler.snapshot("D1").unwrap().position.unwrap().point(),
            GeoPoint::new(5.0, 5.0)
        );

        let newer = location(json!({
            "device_id": "D1", "lat": 7.0, "lon": 7.0, "speed": 42.0,
            "timestamp": (now + Duration::seconds(5)).to_rfc3339(),
        }));
        reconciler.apply_location_event(&newer, now).unwrap();
        let position = reconciler.snapshot("D1").unwrap().position.unwrap();
        assert_eq!(position.point(), GeoPoint::new(7.0, 7.0));
        assert_eq!(position.speed, 42.0);
    }

    #[test]
    fn unknown_device_location_is_not_kept() {
        let mut reconciler = Reconciler::new(200);
        let err = reconciler
            .apply_location_event(
                &location(json!({"device_id": "ghost", "lat": 1.0, "lon": 1.0})),
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err, RejectReason::UnknownDevice { id: "ghost".into() });
        assert!(reconciler.snapshot("ghost").is_none());
        assert!(reconciler.history("ghost", 5).is_empty());
    }

    #[test]
    fn removing_a_device_drops_its_history() {
        let mut reconciler = Reconciler::new(200);
        let now = Utc::now();
        reconciler.apply_device_event(&device(json!({"id": "D1"})), now).unwrap();
        reconciler
            .apply_location_event(&location(json!({"device_id": "D1", "lat": 1.0, "lon": 1.0})), now)
            .unwrap();

        assert!(reconciler.remove_device("D1").is_some());
        assert!(reconciler.history("D1", 5).is_empty());
    }
}
