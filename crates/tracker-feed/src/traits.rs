//! # Adapter Traits
//!
//! Abstract change-feed and store interfaces. Implementations can be
//! swapped for different backends (hosted REST, real-time store, memory).

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::Result;
use crate::raw::{FeedEvent, RawDeviceEvent, RawGeofenceEvent, RawLocationEvent};
use tracker_domain::{Alert, NewGeofence, OwnerScope, ProvisionRequest};

/// Long-lived stream of feed items. An `Err` item reports a transport
/// failure; callers resubscribe rather than treat it as fatal.
pub type FeedStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

// =============================================================================
// CHANGE FEED
// =============================================================================

/// Read side of the hosted backend
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to device changes within an owner scope
    fn subscribe_devices(&self, scope: &OwnerScope) -> FeedStream<FeedEvent<RawDeviceEvent>>;

    /// Subscribe to new location fixes within an owner scope
    fn subscribe_locations(&self, scope: &OwnerScope) -> FeedStream<RawLocationEvent>;

    /// Subscribe to geofence changes within an owner scope
    fn subscribe_geofences(&self, scope: &OwnerScope)
    -> FeedStream<FeedEvent<RawGeofenceEvent>>;

    /// One-shot read of all devices
    async fn fetch_devices(&self, scope: &OwnerScope) -> Result<Vec<RawDeviceEvent>>;

    /// One-shot read of the most recent location fixes
    async fn fetch_locations(
        &self,
        scope: &OwnerScope,
        limit: usize,
    ) -> Result<Vec<RawLocationEvent>>;

    /// One-shot read of all geofences
    async fn fetch_geofences(&self, scope: &OwnerScope) -> Result<Vec<RawGeofenceEvent>>;
}

// =============================================================================
// BACKEND STORE
// =============================================================================

/// Write side of the hosted backend
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Create a device record, returning the row as stored
    async fn insert_device(
        &self,
        scope: &OwnerScope,
        request: &ProvisionRequest,
    ) -> Result<RawDeviceEvent>;

    /// Insert or replace an alert by id
    async fn upsert_alert(&self, alert: &Alert) -> Result<()>;

    /// Create a geofence, returning the row as stored
    async fn insert_geofence(
        &self,
        scope: &OwnerScope,
        geofence: &NewGeofence,
    ) -> Result<RawGeofenceEvent>;

    /// Flip a geofence's active flag
    async fn set_geofence_active(&self, id: &str, active: bool) -> Result<()>;

    /// Delete a geofence
    async fn delete_geofence(&self, id: &str) -> Result<()>;
}

/// A complete backend: change feed plus store
pub trait Backend: ChangeFeed + BackendStore {}

impl<T: ChangeFeed + BackendStore> Backend for T {}
