//! # GraphQL Query Resolver
//!
//! Read operations over the tracker's in-memory state. Nothing here touches
//! the backend.

use async_graphql::{Context, ID, Object, Result, ResultExt};

use crate::context::ApiContext;
use crate::error::ApiError;
use crate::schema::{
    Alert, AlertFilter, AlertSummary, Device, DeviceSummary, Geofence, Location,
};
use tracker_domain as domain;

/// GraphQL Query root
pub struct QueryRoot;

#[Object]
impl QueryRoot {
    // =========================================================================
    // DEVICE QUERIES
    // =========================================================================

    /// Every device visible to this owner, sorted by name
    async fn devices(&self, ctx: &Context<'_>) -> Result<Vec<Device>> {
        let api_ctx = ctx.data::<ApiContext>()?;
        Ok(api_ctx
            .tracker
            .list_devices(api_ctx.scope())
            .await
            .into_iter()
            .map(Device::from)
            .collect())
    }

    /// Get a device by ID
    async fn device(&self, ctx: &Context<'_>, id: ID) -> Result<Device> {
        let api_ctx = ctx.data::<ApiContext>()?;
        let device = api_ctx
            .tracker
            .get_device(&id)
            .await
            .map_err(ApiError::from)
            .extend()?;
        Ok(device.into())
    }

    /// Recent location history for a device, newest first
    async fn locations(
        &self,
        ctx: &Context<'_>,
        device_id: ID,
        #[graphql(
            default = 50,
            desc = "Maximum samples to return (default: 50, max: 200)",
            validator(minimum = 1, maximum = 200)
        )]
        limit: i32,
    ) -> Result<Vec<Location>> {
        let api_ctx = ctx.data::<ApiContext>()?;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(api_ctx
            .tracker
            .list_locations(&device_id, limit)
            .await
            .into_iter()
            .map(Location::from)
            .collect())
    }

    /// Dashboard header counters
    #[graphql(name = "deviceSummary")]
    async fn device_summary(&self, ctx: &Context<'_>) -> Result<DeviceSummary> {
        let api_ctx = ctx.data::<ApiContext>()?;
        Ok(api_ctx.tracker.device_summary(api_ctx.scope()).await.into())
    }

    // =========================================================================
    // ALERT QUERIES
    // =========================================================================

    /// Alerts matching a filter, newest first
    async fn alerts(
        &self,
        ctx: &Context<'_>,
        #[graphql(default)] filter: AlertFilter,
    ) -> Result<Vec<Alert>> {
        let api_ctx = ctx.data::<ApiContext>()?;
        Ok(api_ctx
            .tracker
            .list_alerts(filter.into())
            .await
            .into_iter()
            .map(Alert::from)
            .collect())
    }

    /// Get an alert by ID
    async fn alert(&self, ctx: &Context<'_>, id: ID) -> Result<Alert> {
        let api_ctx = ctx.data::<ApiContext>()?;
        let id = super::parse_uuid(&id)?;
        let alert = api_ctx
            .tracker
            .get_alert(id)
            .await
            .map_err(ApiError::from)
            .extend()?;
        Ok(alert.into())
    }

    /// Number of alerts matching a filter
    #[graphql(name = "alertCount")]
    async fn alert_count(
        &self,
        ctx: &Context<'_>,
        #[graphql(default)] filter: AlertFilter,
    ) -> Result<i32> {
        let api_ctx = ctx.data::<ApiContext>()?;
        let filter = domain::AlertFilter::from(filter);
        let n = api_ctx.tracker.count_alerts(|a| filter.matches(a)).await;
        Ok(i32::try_from(n).unwrap_or(i32::MAX))
    }

    /// Unresolved alerts by severity
    #[graphql(name = "alertSummary")]
    async fn alert_summary(&self, ctx: &Context<'_>) -> Result<AlertSummary> {
        let api_ctx = ctx.data::<ApiContext>()?;
        Ok(api_ctx.tracker.alert_summary().await.into())
    }

    // =========================================================================
    // GEOFENCE QUERIES
    // =========================================================================

    /// Geofences visible to this owner, sorted by name
    async fn geofences(&self, ctx: &Context<'_>) -> Result<Vec<Geofence>> {
        let api_ctx = ctx.data::<ApiContext>()?;
        Ok(api_ctx
            .tracker
            .list_geofences(api_ctx.scope())
            .await
            .into_iter()
            .map(Geofence::from)
            .collect())
    }

    /// API version string
    async fn version(&self) -> &'static str {
        crate::VERSION
    }
}
