//! # In-Memory Backend
//!
//! Broadcast-channel backed change feed and store. Used by tests and for
//! running the API without a hosted backend. Writes are echoed through the
//! feeds the way a real-time store would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::error::{FeedError, Result};
use crate::raw::{FeedEvent, RawDeviceEvent, RawGeofenceEvent, RawLocationEvent};
use crate::traits::{BackendStore, ChangeFeed, FeedStream};
use tracker_domain::{Alert, NewGeofence, OwnerScope, ProvisionRequest};

/// Broadcast channel capacity
const CHANNEL_CAPACITY: usize = 1024;

/// Items on the internal channels; `Err` simulates a transport failure.
type Item<T> = std::result::Result<T, String>;

/// In-memory backend, cheaply cloneable
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    devices_tx: broadcast::Sender<Item<FeedEvent<RawDeviceEvent>>>,
    locations_tx: broadcast::Sender<Item<RawLocationEvent>>,
    geofences_tx: broadcast::Sender<Item<FeedEvent<RawGeofenceEvent>>>,
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    devices: Vec<RawDeviceEvent>,
    locations: Vec<RawLocationEvent>,
    geofences: Vec<RawGeofenceEvent>,
    alerts: HashMap<Uuid, Alert>,
    reject_writes: Option<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (devices_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (locations_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (geofences_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(MemoryInner {
                devices_tx,
                locations_tx,
                geofences_tx,
                tables: Mutex::new(Tables::default()),
            }),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // SEEDING (visible to fetch_* only)
    // =========================================================================

    pub fn seed_device(&self, raw: RawDeviceEvent) {
        self.tables().devices.push(raw);
    }

    pub fn seed_location(&self, raw: RawLocationEvent) {
        self.tables().locations.push(raw);
    }

    pub fn seed_geofence(&self, raw: RawGeofenceEvent) {
        self.tables().geofences.push(raw);
    }

    // =========================================================================
    // LIVE EVENTS (visible to subscribers only)
    // =========================================================================

    pub fn emit_device(&self, raw: RawDeviceEvent) {
        let _ = self.inner.devices_tx.send(Ok(FeedEvent::Upsert(raw)));
    }

    pub fn emit_device_removed(&self, id: impl Into<String>) {
        let _ = self
            .inner
            .devices_tx
            .send(Ok(FeedEvent::Removed { id: id.into() }));
    }

    pub fn emit_location(&self, raw: RawLocationEvent) {
        let _ = self.inner.locations_tx.send(Ok(raw));
    }

    pub fn emit_geofence(&self, raw: RawGeofenceEvent) {
        let _ = self.inner.geofences_tx.send(Ok(FeedEvent::Upsert(raw)));
    }

    /// Break the device feed; subscribers see a transport error
    pub fn fail_device_feed(&self, reason: impl Into<String>) {
        let _ = self.inner.devices_tx.send(Err(reason.into()));
    }

    /// Number of live device feed subscribers
    pub fn device_subscribers(&self) -> usize {
        self.inner.devices_tx.receiver_count()
    }

    /// Total live subscribers across all three feeds
    pub fn subscriber_count(&self) -> usize {
        self.inner.devices_tx.receiver_count()
            + self.inner.locations_tx.receiver_count()
            + self.inner.geofences_tx.receiver_count()
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Make every write fail with the given backend message
    pub fn reject_writes(&self, message: Option<&str>) {
        self.tables().reject_writes = message.map(str::to_string);
    }

    /// Alerts persisted so far
    pub fn alerts(&self) -> Vec<Alert> {
        self.tables().alerts.values().cloned().collect()
    }

    pub fn geofence_rows(&self) -> Vec<RawGeofenceEvent> {
        self.tables().geofences.clone()
    }

    fn check_writable(tables: &Tables) -> Result<()> {
        match tables.reject_writes {
            Some(ref message) => Err(FeedError::Rejected {
                status: Some(400),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn a broadcast receiver into a feed stream, keeping only in-scope items
fn scoped_stream<T>(
    mut rx: broadcast::Receiver<Item<T>>,
    keep: impl Fn(&T) -> bool + Send + 'static,
) -> FeedStream<T>
where
    T: Clone + Send + 'static,
{
    Box::pin(async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(Ok(item)) => {
                    if keep(&item) {
                        yield Ok(item);
                    }
                }
                Ok(Err(reason)) => {
                    yield Err(FeedError::Transport(reason));
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "memory feed lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn device_in_scope(event: &FeedEvent<RawDeviceEvent>, scope: &OwnerScope) -> bool {
    match event {
        FeedEvent::Upsert(raw) => scope.matches(raw.owner_id()),
        FeedEvent::Removed { .. } => true,
    }
}

fn geofence_in_scope(event: &FeedEvent<RawGeofenceEvent>, scope: &OwnerScope) -> bool {
    match event {
        FeedEvent::Upsert(raw) => scope.matches(raw.owner_id()),
        FeedEvent::Removed { .. } => true,
    }
}

fn row_id(fields: &serde_json::Map<String, Value>) -> Option<&str> {
    fields.get("id").and_then(Value::as_str)
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    fn subscribe_devices(&self, scope: &OwnerScope) -> FeedStream<FeedEvent<RawDeviceEvent>> {
        let scope = scope.clone();
        scoped_stream(self.inner.devices_tx.subscribe(), move |e| {
            device_in_scope(e, &scope)
        })
    }

    fn subscribe_locations(&self, _scope: &OwnerScope) -> FeedStream<RawLocationEvent> {
        scoped_stream(self.inner.locations_tx.subscribe(), |_| true)
    }

    fn subscribe_geofences(
        &self,
        scope: &OwnerScope,
    ) -> FeedStream<FeedEvent<RawGeofenceEvent>> {
        let scope = scope.clone();
        scoped_stream(self.inner.geofences_tx.subscribe(), move |e| {
            geofence_in_scope(e, &scope)
        })
    }

    async fn fetch_devices(&self, scope: &OwnerScope) -> Result<Vec<RawDeviceEvent>> {
        Ok(self
            .tables()
            .devices
            .iter()
            .filter(|raw| scope.matches(raw.owner_id()))
            .cloned()
            .collect())
    }

    async fn fetch_locations(
        &self,
        _scope: &OwnerScope,
        limit: usize,
    ) -> Result<Vec<RawLocationEvent>> {
        let tables = self.tables();
        Ok(tables.locations.iter().rev().take(limit).cloned().collect())
    }

    async fn fetch_geofences(&self, scope: &OwnerScope) -> Result<Vec<RawGeofenceEvent>> {
        Ok(self
            .tables()
            .geofences
            .iter()
            .filter(|raw| scope.matches(raw.owner_id()))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BackendStore for MemoryBackend {
    async fn insert_device(
        &self,
        scope: &OwnerScope,
        request: &ProvisionRequest,
    ) -> Result<RawDeviceEvent> {
        let row = {
            let mut tables = self.tables();
            Self::check_writable(&tables)?;

            let row = RawDeviceEvent::try_from(json!({
                "id": Uuid::new_v4().to_string(),
                "imei": request.imei,
                "name": request.name,
                "owner_id": scope.owner_id(),
                "owner_email": request.owner_email,
                "type": request.device_type.as_str(),
                "last_seen": chrono::Utc::now().to_rfc3339(),
            }))?;
            tables.devices.push(row.clone());
            row
        };

        self.emit_device(row.clone());
        Ok(row)
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<()> {
        let mut tables = self.tables();
        Self::check_writable(&tables)?;
        tables.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn insert_geofence(
        &self,
        scope: &OwnerScope,
        geofence: &NewGeofence,
    ) -> Result<RawGeofenceEvent> {
        let row = {
            let mut tables = self.tables();
            Self::check_writable(&tables)?;

            let row = RawGeofenceEvent::try_from(json!({
                "id": Uuid::new_v4().to_string(),
                "owner_id": scope.owner_id(),
                "device_id": geofence.device_id,
                "name": geofence.name,
                "boundary": geofence.boundary,
                "active": geofence.active,
                "on_enter": geofence.on_enter,
                "on_exit": geofence.on_exit,
            }))?;
            tables.geofences.push(row.clone());
            row
        };

        self.emit_geofence(row.clone());
        Ok(row)
    }

    async fn set_geofence_active(&self, id: &str, active: bool) -> Result<()> {
        let row = {
            let mut tables = self.tables();
            Self::check_writable(&tables)?;

            let row = tables
                .geofences
                .iter_mut()
                .find(|raw| row_id(raw.fields()) == Some(id))
                .ok_or_else(|| FeedError::NotFound {
                    entity_type: "geofence".to_string(),
                    key: id.to_string(),
                })?;

            let mut fields = row.fields().clone();
            fields.insert("active".to_string(), Value::Bool(active));
            *row = RawGeofenceEvent::new(fields);
            row.clone()
        };

        self.emit_geofence(row);
        Ok(())
    }

    async fn delete_geofence(&self, id: &str) -> Result<()> {
        {
            let mut tables = self.tables();
            Self::check_writable(&tables)?;

            let before = tables.geofences.len();
            tables.geofences.retain(|raw| row_id(raw.fields()) != Some(id));
            if tables.geofences.len() == before {
                return Err(FeedError::NotFound {
                    entity_type: "geofence".to_string(),
                    key: id.to_string(),
                });
            }
        }

        let _ = self
            .inner
            .geofences_tx
            .send(Ok(FeedEvent::Removed { id: id.to_string() }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_test::assert_err;

    fn device(value: Value) -> RawDeviceEvent {
        RawDeviceEvent::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn device_feed_filters_by_owner() {
        let backend = MemoryBackend::new();
        let mut feed = backend.subscribe_devices(&OwnerScope::new("u1"));

        backend.emit_device(device(json!({"id": "D9", "owner_id": "u2"})));
        backend.emit_device(device(json!({"id": "D1", "owner_id": "u1"})));

        let first = feed.next().await.unwrap().unwrap();
        match first {
            FeedEvent::Upsert(raw) => assert_eq!(raw.get("id"), Some(&json!("D1"))),
            FeedEvent::Removed { .. } => panic!("unexpected removal"),
        }
    }

    #[tokio::test]
    async fn failed_feed_yields_error_then_ends() {
        let backend = MemoryBackend::new();
        let mut feed = backend.subscribe_devices(&OwnerScope::new("u1"));

        backend.fail_device_feed("socket reset");

        let item = feed.next().await.unwrap();
        assert!(matches!(item, Err(FeedError::Transport(ref r)) if r == "socket reset"));
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn rejected_writes_carry_backend_message() {
        let backend = MemoryBackend::new();
        backend.reject_writes(Some("duplicate key value violates unique constraint"));

        let request = ProvisionRequest {
            imei: "356938035643809".to_string(),
            name: "Van 7".to_string(),
            owner_email: None,
            device_type: tracker_domain::DeviceType::Vehicle,
        };
        let err = assert_err!(
            backend
                .insert_device(&OwnerScope::new("u1"), &request)
                .await
        );
        assert_eq!(
            err.to_string(),
            "duplicate key value violates unique constraint"
        );
    }

    #[tokio::test]
    async fn toggling_unknown_geofence_is_not_found() {
        let backend = MemoryBackend::new();
        let err = assert_err!(backend.set_geofence_active("nope", false).await);
        assert!(matches!(err, FeedError::NotFound { .. }));
    }
}
