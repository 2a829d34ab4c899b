//! # Query Facade
//!
//! [`Tracker`] is the single handle presentation code talks to. It owns the
//! reconciled state behind one lock, so every merge, derivation and read
//! sees a consistent picture, and forwards write intents to the backend.
//!
//! Writes are confirmed before they touch local state: a failed or timed-out
//! backend call leaves everything exactly as it was.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertChange, AlertDeriver, Thresholds};
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError, ValidationErrors};
use crate::geofence;
use crate::normalize::{self, RejectReason};
use crate::provisioning;
use crate::reconciler::{MergeOutcome, Movement, Reconciler};
use crate::session::Session;
use tracker_domain::{
    Alert, AlertFilter, AlertSummary, Connectivity, Crossing, DeviceSnapshot, DeviceSummary,
    Geofence, GeofenceAction, LocationSample, NewGeofence, OwnerScope, ProvisionRequest,
};
use tracker_feed::{Backend, FeedEvent, RawDeviceEvent, RawGeofenceEvent, RawLocationEvent};

/// Broadcast channel capacity for tracker events
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// EVENTS
// =============================================================================

/// Change notifications published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TrackerEvent {
    DeviceUpdated(DeviceSnapshot),
    DeviceRemoved { id: String },
    LocationRecorded(LocationSample),
    AlertRaised(Alert),
    AlertUpdated(Alert),
    AlertReopened(Alert),
    GeofenceCrossed(GeofenceCrossing),
    GeofenceChanged(Geofence),
    GeofenceRemoved { id: String },
}

impl TrackerEvent {
    /// The alert carried by alert events
    pub const fn alert(&self) -> Option<&Alert> {
        match self {
            Self::AlertRaised(a) | Self::AlertUpdated(a) | Self::AlertReopened(a) => Some(a),
            _ => None,
        }
    }
}

impl From<AlertChange> for TrackerEvent {
    fn from(change: AlertChange) -> Self {
        match change {
            AlertChange::Raised(a) => Self::AlertRaised(a),
            AlertChange::Updated(a) => Self::AlertUpdated(a),
            AlertChange::Reopened(a) => Self::AlertReopened(a),
        }
    }
}

/// A device crossed a geofence boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeofenceCrossing {
    pub device_id: String,
    pub geofence_id: String,
    pub geofence_name: String,
    pub crossing: Crossing,
    pub action: Option<GeofenceAction>,
    pub at: DateTime<Utc>,
}

// =============================================================================
// STATE
// =============================================================================

/// Everything mutated by feed events, guarded by one lock
#[derive(Debug)]
struct TrackerState {
    reconciler: Reconciler,
    deriver: AlertDeriver,
    geofences: HashMap<String, Geofence>,
}

impl TrackerState {
    fn new(config: &TrackerConfig) -> Self {
        Self {
            reconciler: Reconciler::new(config.history_window),
            deriver: AlertDeriver::new(Thresholds::from(config)),
            geofences: HashMap::new(),
        }
    }

    /// Alerts and geofence transitions that follow an accepted merge
    fn derive(
        &mut self,
        snapshot: &DeviceSnapshot,
        movement: Option<&Movement>,
        now: DateTime<Utc>,
    ) -> Vec<TrackerEvent> {
        let mut events: Vec<TrackerEvent> = self
            .deriver
            .evaluate(snapshot, now)
            .into_iter()
            .map(TrackerEvent::from)
            .collect();

        let Some(movement) = movement else {
            return events;
        };

        for (fence, crossing) in geofence::crossings(self.geofences.values(), snapshot, movement) {
            let action = fence.action_for(crossing);
            info!(
                device_id = %snapshot.id,
                geofence_id = %fence.id,
                ?crossing,
                action = action.map_or("none", |a| a.as_str()),
                "geofence crossed"
            );

            if action == Some(GeofenceAction::Alert) {
                let change = self.deriver.geofence_alert(snapshot, fence, crossing, now);
                events.push(change.into());
            }
            events.push(TrackerEvent::GeofenceCrossed(GeofenceCrossing {
                device_id: snapshot.id.clone(),
                geofence_id: fence.id.clone(),
                geofence_name: fence.name.clone(),
                crossing,
                action,
                at: now,
            }));
        }

        events
    }

    /// Drop a device with its history and condition memory
    fn evict(&mut self, device_id: &str) -> bool {
        self.deriver.forget_device(device_id);
        self.reconciler.remove_device(device_id).is_some()
    }

    fn clear(&mut self) {
        self.reconciler.clear();
        self.deriver.clear();
        self.geofences.clear();
    }
}

// =============================================================================
// TRACKER
// =============================================================================

/// Query facade and owner of the reconciled state, cheaply cloneable
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    config: TrackerConfig,
    scope: OwnerScope,
    backend: Arc<dyn Backend>,
    state: RwLock<TrackerState>,
    events: broadcast::Sender<TrackerEvent>,
    /// Present while a sync session runs; ids of derived alerts to persist
    alert_sink: StdMutex<Option<mpsc::Sender<Uuid>>>,
    /// Serializes every alert upsert so an older copy never lands last
    alert_writes: Mutex<()>,
    session: Mutex<Option<Session>>,
}

impl Tracker {
    pub fn new(backend: Arc<dyn Backend>, scope: OwnerScope, config: TrackerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TrackerInner {
                state: RwLock::new(TrackerState::new(&config)),
                config,
                scope,
                backend,
                events,
                alert_sink: StdMutex::new(None),
                alert_writes: Mutex::new(()),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn scope(&self) -> &OwnerScope {
        &self.inner.scope
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Receive every change published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    // =========================================================================
    // SESSION LIFECYCLE
    // =========================================================================

    /// Seed from the backend and start following its feeds. Calling this on
    /// a running tracker is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        if session.is_some() {
            debug!(scope = %self.inner.scope, "sync session already running");
            return Ok(());
        }

        *session = Some(Session::start(self.clone()).await);
        info!(scope = %self.inner.scope, "sync session started");
        Ok(())
    }

    /// Cancel all feeds and background tasks together, then drop every piece
    /// of state held for this owner.
    pub async fn shutdown(&self) {
        let session = self.inner.session.lock().await.take();
        self.install_alert_sink(None);

        if let Some(session) = session {
            session.stop().await;
        }
        self.inner.state.write().await.clear();
        info!(scope = %self.inner.scope, "sync session stopped");
    }

    pub(crate) fn install_alert_sink(&self, sink: Option<mpsc::Sender<Uuid>>) {
        *self
            .inner
            .alert_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = sink;
    }

    pub async fn is_running(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }

    // =========================================================================
    // FEED INGESTION
    // =========================================================================

    /// Merge one device feed item, then derive alerts from the result.
    /// Devices owned outside this tracker's scope are never kept.
    pub async fn apply_device_event(&self, event: FeedEvent<RawDeviceEvent>) {
        let now = Utc::now();
        let events = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;

            match event {
                FeedEvent::Upsert(raw) => match normalize::device_patch(&raw) {
                    Ok(patch) => {
                        let known = state.reconciler.snapshot(&patch.id).is_some();
                        let outcome = state.reconciler.apply_patch(patch, now);
                        let owner = outcome.snapshot().owner_id.as_deref();
                        let in_scope = self.inner.scope.matches(owner);

                        match outcome {
                            outcome if !in_scope => {
                                let id = outcome.snapshot().id.clone();
                                debug!(device_id = %id, "dropping device outside owner scope");
                                state.evict(&id);
                                if known {
                                    vec![TrackerEvent::DeviceRemoved { id }]
                                } else {
                                    Vec::new()
                                }
                            }
                            MergeOutcome::Accepted { snapshot, movement } => {
                                let mut events = vec![TrackerEvent::DeviceUpdated(
                                    snapshot.projected(now, self.staleness()),
                                )];
                                events.extend(state.derive(&snapshot, movement.as_ref(), now));
                                events
                            }
                            MergeOutcome::Stale { .. } => Vec::new(),
                        }
                    }
                    Err(reason) => {
                        warn!(%reason, "rejecting device event");
                        Vec::new()
                    }
                },
                FeedEvent::Removed { id } => {
                    if state.evict(&id) {
                        vec![TrackerEvent::DeviceRemoved { id }]
                    } else {
                        Vec::new()
                    }
                }
            }
        };
        self.publish(events);
    }

    /// Record one location fix and move its device
    pub async fn apply_location_event(&self, raw: RawLocationEvent) {
        let now = Utc::now();
        let events = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;

            match state.reconciler.apply_location_event(&raw, now) {
                Ok(applied) if applied.duplicate => Vec::new(),
                Ok(applied) => {
                    let mut events = vec![TrackerEvent::LocationRecorded(applied.sample)];
                    if let Some(MergeOutcome::Accepted { snapshot, movement }) = applied.device {
                        events.push(TrackerEvent::DeviceUpdated(
                            snapshot.projected(now, self.staleness()),
                        ));
                        events.extend(state.derive(&snapshot, movement.as_ref(), now));
                    }
                    events
                }
                Err(reason @ RejectReason::UnknownDevice { .. }) => {
                    debug!(%reason, "skipping location event");
                    Vec::new()
                }
                Err(reason) => {
                    warn!(%reason, "rejecting location event");
                    Vec::new()
                }
            }
        };
        self.publish(events);
    }

    /// Replace or remove one geofence definition
    pub async fn apply_geofence_event(&self, event: FeedEvent<RawGeofenceEvent>) {
        let events = {
            let mut state = self.inner.state.write().await;
            match event {
                FeedEvent::Upsert(raw) => match normalize::geofence(&raw) {
                    Ok(fence) => {
                        if state.geofences.get(&fence.id) == Some(&fence) {
                            Vec::new()
                        } else {
                            state.geofences.insert(fence.id.clone(), fence.clone());
                            vec![TrackerEvent::GeofenceChanged(fence)]
                        }
                    }
                    Err(reason) => {
                        warn!(%reason, "rejecting geofence event");
                        Vec::new()
                    }
                },
                FeedEvent::Removed { id } => {
                    if state.geofences.remove(&id).is_some() {
                        vec![TrackerEvent::GeofenceRemoved { id }]
                    } else {
                        Vec::new()
                    }
                }
            }
        };
        self.publish(events);
    }

    /// Re-run level rules for every device so silence alone can raise the
    /// offline alert
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let events = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let snapshots: Vec<DeviceSnapshot> = state.reconciler.snapshots().cloned().collect();
            snapshots
                .iter()
                .flat_map(|s| state.deriver.evaluate(s, now))
                .map(TrackerEvent::from)
                .collect::<Vec<_>>()
        };
        if !events.is_empty() {
            debug!(changes = events.len(), "staleness sweep changed alerts");
        }
        self.publish(events);
    }

    fn publish(&self, events: Vec<TrackerEvent>) {
        let sink = self
            .inner
            .alert_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for event in events {
            if let (Some(sink), Some(alert)) = (sink.as_ref(), event.alert()) {
                if let Err(e) = sink.try_send(alert.id) {
                    warn!(alert_id = %alert.id, error = %e, "alert not queued for persistence");
                }
            }
            let _ = self.inner.events.send(event);
        }
    }

    fn staleness(&self) -> chrono::Duration {
        self.inner.config.staleness()
    }

    // =========================================================================
    // READ PROJECTIONS
    // =========================================================================

    /// Devices visible to `scope`, connectivity adjusted for staleness
    pub async fn list_devices(&self, scope: &OwnerScope) -> Vec<DeviceSnapshot> {
        let now = Utc::now();
        let state = self.inner.state.read().await;
        let mut devices: Vec<DeviceSnapshot> = state
            .reconciler
            .snapshots()
            .filter(|d| scope.matches(d.owner_id.as_deref()))
            .map(|d| d.projected(now, self.staleness()))
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    /// # Errors
    ///
    /// Returns [`TrackerError::NotFound`] for an unknown id.
    pub async fn get_device(&self, id: &str) -> Result<DeviceSnapshot> {
        let state = self.inner.state.read().await;
        state
            .reconciler
            .snapshot(id)
            .map(|d| d.projected(Utc::now(), self.staleness()))
            .ok_or_else(|| TrackerError::not_found("device", id))
    }

    /// Newest first, at most `limit` samples. Empty for a device outside
    /// this tracker's scope.
    pub async fn list_locations(&self, device_id: &str, limit: usize) -> Vec<LocationSample> {
        let state = self.inner.state.read().await;
        match state.reconciler.snapshot(device_id) {
            Some(d) if self.inner.scope.matches(d.owner_id.as_deref()) => {
                state.reconciler.history(device_id, limit)
            }
            _ => Vec::new(),
        }
    }

    pub async fn list_geofences(&self, scope: &OwnerScope) -> Vec<Geofence> {
        let state = self.inner.state.read().await;
        let mut fences: Vec<Geofence> = state
            .geofences
            .values()
            .filter(|g| scope.matches(g.owner_id.as_deref()))
            .cloned()
            .collect();
        fences.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        fences
    }

    /// Newest first
    pub async fn list_alerts(&self, filter: AlertFilter) -> Vec<Alert> {
        self.inner.state.read().await.deriver.list(filter)
    }

    /// # Errors
    ///
    /// Returns [`TrackerError::NotFound`] for an unknown id.
    pub async fn get_alert(&self, id: Uuid) -> Result<Alert> {
        self.inner
            .state
            .read()
            .await
            .deriver
            .get(id)
            .cloned()
            .ok_or_else(|| TrackerError::not_found("alert", id.to_string()))
    }

    pub async fn count_alerts(&self, predicate: impl Fn(&Alert) -> bool) -> usize {
        self.inner.state.read().await.deriver.count(predicate)
    }

    pub async fn alert_summary(&self) -> AlertSummary {
        self.inner.state.read().await.deriver.summary()
    }

    /// Dashboard header counters
    pub async fn device_summary(&self, scope: &OwnerScope) -> DeviceSummary {
        let low = self.inner.config.battery_low;
        self.list_devices(scope)
            .await
            .iter()
            .fold(DeviceSummary::default(), |mut acc, d| {
                acc.total += 1;
                match d.connectivity {
                    Connectivity::Online => acc.online += 1,
                    Connectivity::Offline => acc.offline += 1,
                    Connectivity::Maintenance => acc.maintenance += 1,
                }
                acc.tampered += usize::from(d.tamper);
                acc.jammed += usize::from(d.jamming);
                acc.low_battery += usize::from(d.battery < low);
                acc
            })
    }

    // =========================================================================
    // WRITE INTENTS
    // =========================================================================

    async fn confirm<T>(
        &self,
        write: impl Future<Output = tracker_feed::Result<T>> + Send,
    ) -> Result<T> {
        let limit = self.inner.config.request_timeout;
        match tokio::time::timeout(limit, write).await {
            Ok(result) => result.map_err(TrackerError::from),
            Err(_) => Err(TrackerError::Timeout {
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Validate, create the device upstream, and fold the stored row in
    ///
    /// # Errors
    ///
    /// [`TrackerError::Validation`] without contacting the backend, or the
    /// backend's failure with its message intact.
    pub async fn provision_device(&self, request: ProvisionRequest) -> Result<DeviceSnapshot> {
        let request = provisioning::validate(request)?;
        let row = self
            .confirm(self.inner.backend.insert_device(&self.inner.scope, &request))
            .await?;
        info!(imei = %request.imei, "device provisioned");

        let now = Utc::now();
        let mut state = self.inner.state.write().await;
        let outcome = state
            .reconciler
            .apply_device_event(&row, now)
            .map_err(|reason| TrackerError::Transport(format!("backend returned {reason}")))?;
        let snapshot = outcome.snapshot().projected(now, self.staleness());
        drop(state);

        self.publish(vec![TrackerEvent::DeviceUpdated(snapshot.clone())]);
        Ok(snapshot)
    }

    /// # Errors
    ///
    /// [`TrackerError::NotFound`] for an unknown alert, or the backend failure.
    pub async fn acknowledge_alert(&self, id: Uuid, actor: &str) -> Result<Alert> {
        self.transition_alert(id, |alert, now| alert.acknowledge(actor, now))
            .await
    }

    /// # Errors
    ///
    /// [`TrackerError::NotFound`] for an unknown alert, or the backend failure.
    pub async fn resolve_alert(&self, id: Uuid, actor: &str) -> Result<Alert> {
        self.transition_alert(id, |alert, now| alert.resolve(actor, now))
            .await
    }

    async fn transition_alert(
        &self,
        id: Uuid,
        transition: impl FnOnce(&mut Alert, DateTime<Utc>) -> bool,
    ) -> Result<Alert> {
        let _writes = self.inner.alert_writes.lock().await;
        let mut alert = self.get_alert(id).await?;
        if !transition(&mut alert, Utc::now()) {
            return Ok(alert);
        }

        self.confirm(self.inner.backend.upsert_alert(&alert)).await?;

        let committed = self
            .inner
            .state
            .write()
            .await
            .deriver
            .commit_lifecycle(&alert)
            .ok_or_else(|| TrackerError::not_found("alert", id.to_string()))?;
        let _ = self
            .inner
            .events
            .send(TrackerEvent::AlertUpdated(committed.clone()));
        Ok(committed)
    }

    /// Upsert the current copy of an alert. Shares the write lock with
    /// acknowledge and resolve, so a derived write queued before a lifecycle
    /// change cannot overwrite it.
    ///
    /// # Errors
    ///
    /// [`TrackerError::NotFound`] when the alert is gone, or the backend failure.
    pub(crate) async fn persist_alert(&self, id: Uuid) -> Result<()> {
        let _writes = self.inner.alert_writes.lock().await;
        let alert = self.get_alert(id).await?;
        self.confirm(self.inner.backend.upsert_alert(&alert)).await
    }

    /// Flip a geofence between active and inactive
    ///
    /// # Errors
    ///
    /// [`TrackerError::NotFound`] for an unknown geofence, or the backend failure.
    pub async fn toggle_geofence(&self, id: &str) -> Result<Geofence> {
        let mut fence = self.find_geofence(id).await?;
        fence.active = !fence.active;

        self.confirm(self.inner.backend.set_geofence_active(id, fence.active))
            .await?;

        self.inner
            .state
            .write()
            .await
            .geofences
            .insert(fence.id.clone(), fence.clone());
        self.publish(vec![TrackerEvent::GeofenceChanged(fence.clone())]);
        Ok(fence)
    }

    /// # Errors
    ///
    /// [`TrackerError::Validation`] for a blank name or a bad boundary, or the
    /// backend failure.
    pub async fn create_geofence(&self, mut draft: NewGeofence) -> Result<Geofence> {
        let mut errors = ValidationErrors::default();
        draft.name = draft.name.trim().to_string();
        if draft.name.is_empty() {
            errors.push("name", "Geofence name is required");
        }
        if let Err(e) = draft.boundary.validate() {
            errors.push("boundary", e.to_string());
        }
        let draft = errors.into_result(draft)?;

        let row = self
            .confirm(self.inner.backend.insert_geofence(&self.inner.scope, &draft))
            .await?;
        let fence = normalize::geofence(&row)
            .map_err(|reason| TrackerError::Transport(format!("backend returned {reason}")))?;

        self.inner
            .state
            .write()
            .await
            .geofences
            .insert(fence.id.clone(), fence.clone());
        self.publish(vec![TrackerEvent::GeofenceChanged(fence.clone())]);
        Ok(fence)
    }

    /// # Errors
    ///
    /// [`TrackerError::NotFound`] for an unknown geofence, or the backend failure.
    pub async fn delete_geofence(&self, id: &str) -> Result<()> {
        self.find_geofence(id).await?;
        self.confirm(self.inner.backend.delete_geofence(id)).await?;

        if self.inner.state.write().await.geofences.remove(id).is_some() {
            self.publish(vec![TrackerEvent::GeofenceRemoved { id: id.to_string() }]);
        }
        Ok(())
    }

    async fn find_geofence(&self, id: &str) -> Result<Geofence> {
        self.inner
            .state
            .read()
            .await
            .geofences
            .get(id)
            .cloned()
            .ok_or_else(|| TrackerError::not_found("geofence", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio_test::{assert_err, assert_ok};
    use tracker_domain::{AlertSeverity, AlertType, Boundary, DeviceType, GeoPoint};
    use tracker_feed::{ChangeFeed, MemoryBackend};

    fn tracker() -> (Tracker, MemoryBackend) {
        let backend = MemoryBackend::new();
        let tracker = Tracker::new(
            Arc::new(backend.clone()),
            OwnerScope::new("u1"),
            TrackerConfig::default(),
        );
        (tracker, backend)
    }

    fn device(value: Value) -> FeedEvent<RawDeviceEvent> {
        FeedEvent::Upsert(RawDeviceEvent::try_from(value).unwrap())
    }

    fn location(value: Value) -> RawLocationEvent {
        RawLocationEvent::try_from(value).unwrap()
    }

    fn fence(value: Value) -> FeedEvent<RawGeofenceEvent> {
        FeedEvent::Upsert(RawGeofenceEvent::try_from(value).unwrap())
    }

    #[tokio::test]
    async fn battery_scenario_keeps_alert_after_recovery() {
        let (tracker, _) = tracker();

        tracker.apply_device_event(device(json!({"id": "D1", "battery": 8}))).await;
        let alerts = tracker.list_alerts(AlertFilter::All).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].device_id, "D1");
        assert_eq!(alerts[0].alert_type, AlertType::Battery);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);

        tracker.apply_device_event(device(json!({"id": "D1", "battery": 25}))).await;
        assert_eq!(tracker.list_alerts(AlertFilter::All).await, alerts);
    }

    #[tokio::test]
    async fn two_drops_leave_one_open_alert() {
        let (tracker, _) = tracker();
        tracker.apply_device_event(device(json!({"id": "D1", "battery": 15}))).await;
        tracker.apply_device_event(device(json!({"id": "D1", "battery": 12}))).await;

        let open = tracker.list_alerts(AlertFilter::Unresolved).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, Alert::level_id("D1", AlertType::Battery));
    }

    #[tokio::test]
    async fn resolving_leaves_snapshot_alone_and_stays_resolved() {
        let (tracker, _) = tracker();
        tracker.apply_device_event(device(json!({"id": "D1", "tamper": true}))).await;
        let before = tracker.get_device("D1").await.unwrap();
        let id = Alert::level_id("D1", AlertType::Tamper);

        let resolved = assert_ok!(tracker.resolve_alert(id, "ops").await);
        assert!(resolved.resolved);
        assert!(!resolved.acknowledged);
        assert_eq!(tracker.get_device("D1").await.unwrap().tamper, before.tamper);

        tracker.apply_device_event(device(json!({"id": "D1", "tamper": true}))).await;
        assert!(tracker.get_alert(id).await.unwrap().resolved);
    }

    #[tokio::test]
    async fn lifecycle_writes_reach_backend_and_repeat_is_noop() {
        let (tracker, backend) = tracker();
        tracker.apply_device_event(device(json!({"id": "D1", "jamming": true}))).await;
        let id = Alert::level_id("D1", AlertType::Jamming);

        let acked = tracker.acknowledge_alert(id, "lead").await.unwrap();
        let again = tracker.acknowledge_alert(id, "someone-else").await.unwrap();
        assert_eq!(again.acknowledged_by.as_deref(), Some("lead"));
        assert_eq!(again.acknowledged_at, acked.acknowledged_at);
        assert!(backend.alerts().iter().any(|a| a.id == id && a.acknowledged));
    }

    #[tokio::test]
    async fn failed_write_leaves_state_unchanged() {
        let (tracker, backend) = tracker();
        tracker.apply_device_event(device(json!({"id": "D1", "tamper": true}))).await;
        let id = Alert::level_id("D1", AlertType::Tamper);

        backend.reject_writes(Some("permission denied for table alerts"));
        let err = assert_err!(tracker.acknowledge_alert(id, "lead").await);
        assert_eq!(err.to_string(), "permission denied for table alerts");
        assert!(!tracker.get_alert(id).await.unwrap().acknowledged);
    }

    #[tokio::test]
    async fn unknown_alert_is_not_found() {
        let (tracker, _) = tracker();
        let err = assert_err!(tracker.resolve_alert(Uuid::new_v4(), "ops").await);
        assert!(matches!(err, TrackerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn location_history_scenario() {
        let (tracker, _) = tracker();
        tracker.apply_device_event(device(json!({"id": "D2"}))).await;
        tracker
            .apply_location_event(location(json!({
                "device_id": "D2", "lat": 40.0, "lon": -74.0,
                "timestamp": "2024-05-01T12:00:00Z",
            })))
            .await;
        tracker
            .apply_location_event(location(json!({
                "device_id": "D2", "latitude": 40.001, "longitude": -74.001,
                "timestamp": "2024-05-01T12:00:01Z",
            })))
            .await;

        let history = tracker.list_locations("D2", 10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].latitude, 40.001);
        assert_eq!(history[0].longitude, -74.001);
    }

    #[tokio::test]
    async fn devices_and_fixes_of_other_owners_are_not_kept() {
        let (tracker, _) = tracker();
        let mut events = tracker.subscribe();

        tracker
            .apply_device_event(device(json!({"id": "D9", "owner_id": "u2", "tamper": true})))
            .await;
        tracker
            .apply_location_event(location(json!({"device_id": "D9", "lat": 1.0, "lon": 1.0})))
            .await;

        assert!(tracker.get_device("D9").await.is_err());
        assert!(tracker.list_locations("D9", 10).await.is_empty());
        assert!(tracker.list_alerts(AlertFilter::All).await.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn device_reassigned_to_another_owner_is_removed() {
        let (tracker, _) = tracker();
        tracker
            .apply_device_event(device(json!({
                "id": "D1", "owner_id": "u1", "timestamp": "2024-05-01T12:00:00Z",
            })))
            .await;
        tracker
            .apply_location_event(location(json!({
                "device_id": "D1", "lat": 1.0, "lon": 1.0,
                "timestamp": "2024-05-01T12:00:01Z",
            })))
            .await;
        assert_eq!(tracker.list_locations("D1", 10).await.len(), 1);

        let mut events = tracker.subscribe();
        tracker
            .apply_device_event(device(json!({
                "id": "D1", "owner_id": "u2", "timestamp": "2024-05-01T12:00:02Z",
            })))
            .await;

        assert!(matches!(
            events.try_recv(),
            Ok(TrackerEvent::DeviceRemoved { id }) if id == "D1"
        ));
        assert!(tracker.list_devices(tracker.scope()).await.is_empty());
        assert!(tracker.list_locations("D1", 10).await.is_empty());
    }

    #[tokio::test]
    async fn queued_alert_write_cannot_undo_acknowledge() {
        let (tracker, backend) = tracker();
        let (tx, mut rx) = mpsc::channel(8);
        tracker.install_alert_sink(Some(tx));

        tracker.apply_device_event(device(json!({"id": "D1", "tamper": true}))).await;
        let id = Alert::level_id("D1", AlertType::Tamper);
        assert_ok!(tracker.acknowledge_alert(id, "lead").await);

        // The raise was queued before the acknowledge; write it afterwards
        while let Ok(queued) = rx.try_recv() {
            assert_ok!(tracker.persist_alert(queued).await);
        }

        let stored = backend.alerts().into_iter().find(|a| a.id == id).unwrap();
        assert!(stored.acknowledged);
        assert_eq!(stored.acknowledged_by.as_deref(), Some("lead"));
        assert!(tracker.get_alert(id).await.unwrap().acknowledged);
    }

    #[tokio::test]
    async fn geofence_scenario_alerts_once_on_entry() {
        let (tracker, _) = tracker();
        tracker
            .apply_geofence_event(fence(json!({
                "id": "G1", "name": "Depot", "active": true, "on_enter": "alert",
                "polygon": {"type": "circle", "center": {"lat": 40.0, "lng": -74.0}, "radius": 100},
            })))
            .await;

        tracker
            .apply_device_event(device(json!({"id": "D1", "lat": 41.0, "lon": -75.0})))
            .await;
        tracker
            .apply_device_event(device(json!({"id": "D1", "lat": 40.0, "lon": -74.0})))
            .await;
        tracker
            .apply_device_event(device(json!({"id": "D1", "lat": 40.0002, "lon": -74.0})))
            .await;

        let geofence_alerts = tracker
            .count_alerts(|a| a.alert_type == AlertType::Geofence)
            .await;
        assert_eq!(geofence_alerts, 1);
    }

    #[tokio::test]
    async fn notify_crossings_publish_without_alerting() {
        let (tracker, _) = tracker();
        let mut events = tracker.subscribe();
        tracker
            .apply_geofence_event(fence(json!({
                "id": "G1", "name": "Yard", "enabled": true, "on_exit": "notify",
                "lat": 0.0, "lon": 0.0, "radius": 50,
            })))
            .await;
        tracker.apply_device_event(device(json!({"id": "D1", "lat": 0.0, "lon": 0.0}))).await;
        tracker.apply_device_event(device(json!({"id": "D1", "lat": 1.0, "lon": 1.0}))).await;

        let mut crossed = None;
        while let Ok(event) = events.try_recv() {
            if let TrackerEvent::GeofenceCrossed(c) = event {
                crossed = Some(c);
            }
        }
        let crossed = crossed.unwrap();
        assert_eq!(crossed.crossing, Crossing::Exit);
        assert_eq!(crossed.action, Some(GeofenceAction::Notify));
        assert_eq!(tracker.count_alerts(|_| true).await, 0);
    }

    #[tokio::test]
    async fn provisioning_validates_before_backend() {
        let (tracker, backend) = tracker();
        let request = ProvisionRequest {
            imei: String::new(),
            name: "Van".into(),
            owner_email: Some("nope".into()),
            device_type: DeviceType::Vehicle,
        };

        let err = assert_err!(tracker.provision_device(request).await);
        assert!(matches!(err, TrackerError::Validation(ref v) if v.fields().len() == 2));
        let rows = backend.fetch_devices(&OwnerScope::new("u1")).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn provisioning_returns_stored_device() {
        let (tracker, _) = tracker();
        let request = ProvisionRequest {
            imei: "356938035643809".into(),
            name: "Van 7".into(),
            owner_email: Some("ops@fleet.io".into()),
            device_type: DeviceType::Vehicle,
        };

        let device = tracker.provision_device(request).await.unwrap();
        assert_eq!(device.name, "Van 7");
        assert_eq!(device.owner_id.as_deref(), Some("u1"));
        assert_eq!(device.battery, 100);
        assert_eq!(tracker.list_devices(&OwnerScope::new("u1")).await.len(), 1);
    }

    #[tokio::test]
    async fn geofence_create_toggle_delete() {
        let (tracker, backend) = tracker();
        let created = tracker
            .create_geofence(NewGeofence {
                name: "Port".into(),
                boundary: Boundary::Circle {
                    center: GeoPoint::new(51.9, 4.4),
                    radius_m: 500.0,
                },
                device_id: None,
                on_enter: Some(GeofenceAction::Log),
                on_exit: None,
                active: true,
            })
            .await
            .unwrap();

        let toggled = tracker.toggle_geofence(&created.id).await.unwrap();
        assert!(!toggled.active);
        assert_eq!(backend.geofence_rows().len(), 1);

        tracker.delete_geofence(&created.id).await.unwrap();
        assert!(tracker.list_geofences(&OwnerScope::new("u1")).await.is_empty());
        assert!(matches!(
            tracker.delete_geofence(&created.id).await,
            Err(TrackerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_geofence_is_rejected_locally() {
        let (tracker, backend) = tracker();
        let err = assert_err!(
            tracker
                .create_geofence(NewGeofence {
                    name: " ".into(),
                    boundary: Boundary::Polygon { vertices: vec![] },
                    device_id: None,
                    on_enter: None,
                    on_exit: None,
                    active: true,
                })
                .await
        );
        assert!(matches!(err, TrackerError::Validation(_)));
        assert!(backend.geofence_rows().is_empty());
    }

    #[tokio::test]
    async fn summaries_and_scoping() {
        let (tracker, _) = tracker();
        tracker
            .apply_device_event(device(json!({"id": "D1", "owner_id": "u1", "battery": 5, "tamper": true})))
            .await;
        tracker
            .apply_device_event(device(json!({"id": "D2", "owner_id": "u1", "status": "maintenance"})))
            .await;
        tracker
            .apply_device_event(device(json!({"id": "D3", "owner_id": "u2"})))
            .await;

        let scope = OwnerScope::new("u1");
        let summary = tracker.device_summary(&scope).await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.maintenance, 1);
        assert_eq!(summary.tampered, 1);
        assert_eq!(summary.low_battery, 1);

        let alerts = tracker.alert_summary().await;
        assert_eq!(alerts.critical, 2);
    }

    #[tokio::test]
    async fn sweep_raises_offline_for_silent_devices() {
        let (tracker, _) = tracker();
        tracker
            .apply_device_event(device(json!({"id": "D1", "timestamp": Utc::now().to_rfc3339()})))
            .await;
        assert_eq!(tracker.count_alerts(|_| true).await, 0);

        tracker.sweep(Utc::now() + chrono::Duration::minutes(5)).await;
        let open = tracker.list_alerts(AlertFilter::Unresolved).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].message, "device offline");
        assert_eq!(
            tracker.get_device("D1").await.unwrap().connectivity,
            Connectivity::Online
        );
    }

    #[tokio::test]
    async fn removed_device_disappears() {
        let (tracker, _) = tracker();
        tracker.apply_device_event(device(json!({"id": "D1"}))).await;
        tracker
            .apply_device_event(FeedEvent::Removed { id: "D1".into() })
            .await;
        assert!(matches!(
            tracker.get_device("D1").await,
            Err(TrackerError::NotFound { .. })
        ));
    }
}
