//! # GraphQL Mutation Resolver
//!
//! Write intents. Each one is confirmed by the backend before the tracker's
//! state changes; failures come back with the backend's message.

use async_graphql::{Context, ID, Object, Result, ResultExt};

use crate::context::ApiContext;
use crate::error::ApiError;
use crate::schema::{Alert, CreateGeofenceInput, Device, Geofence, ProvisionDeviceInput};

/// Actor recorded on alert transitions when the caller gives none
const DEFAULT_ACTOR: &str = "operator";

/// GraphQL Mutation root
pub struct MutationRoot;

#[Object]
impl MutationRoot {
    // =========================================================================
    // DEVICE MUTATIONS
    // =========================================================================

    /// Register a new device for this owner
    #[graphql(name = "provisionDevice")]
    async fn provision_device(
        &self,
        ctx: &Context<'_>,
        input: ProvisionDeviceInput,
    ) -> Result<Device> {
        let api_ctx = ctx.data::<ApiContext>()?;
        tracing::info!(imei = %input.imei, "Provisioning device");

        let device = api_ctx
            .tracker
            .provision_device(input.into())
            .await
            .map_err(ApiError::from)
            .extend()?;
        Ok(device.into())
    }

    // =========================================================================
    // ALERT MUTATIONS
    // =========================================================================

    /// Mark an alert as seen. Repeating it keeps the first acknowledgement.
    #[graphql(name = "acknowledgeAlert")]
    async fn acknowledge_alert(
        &self,
        ctx: &Context<'_>,
        id: ID,
        actor: Option<String>,
    ) -> Result<Alert> {
        let api_ctx = ctx.data::<ApiContext>()?;
        let id = super::parse_uuid(&id)?;
        let actor = actor.as_deref().unwrap_or(DEFAULT_ACTOR);

        let alert = api_ctx
            .tracker
            .acknowledge_alert(id, actor)
            .await
            .map_err(ApiError::from)
            .extend()?;
        Ok(alert.into())
    }

    /// Close an alert. Independent of acknowledgement.
    #[graphql(name = "resolveAlert")]
    async fn resolve_alert(
        &self,
        ctx: &Context<'_>,
        id: ID,
        actor: Option<String>,
    ) -> Result<Alert> {
        let api_ctx = ctx.data::<ApiContext>()?;
        let id = super::parse_uuid(&id)?;
        let actor = actor.as_deref().unwrap_or(DEFAULT_ACTOR);

        let alert = api_ctx
            .tracker
            .resolve_alert(id, actor)
            .await
            .map_err(ApiError::from)
            .extend()?;
        Ok(alert.into())
    }

    // =========================================================================
    // GEOFENCE MUTATIONS
    // =========================================================================

    #[graphql(name = "createGeofence")]
    async fn create_geofence(
        &self,
        ctx: &Context<'_>,
        input: CreateGeofenceInput,
    ) -> Result<Geofence> {
        let api_ctx = ctx.data::<ApiContext>()?;
        let draft = input.into_new_geofence().extend()?;

        let fence = api_ctx
            .tracker
            .create_geofence(draft)
            .await
            .map_err(ApiError::from)
            .extend()?;
        Ok(fence.into())
    }

    /// Flip a geofence between active and inactive
    #[graphql(name = "toggleGeofence")]
    async fn toggle_geofence(&self, ctx: &Context<'_>, id: ID) -> Result<Geofence> {
        let api_ctx = ctx.data::<ApiContext>()?;
        let fence = api_ctx
            .tracker
            .toggle_geofence(&id)
            .await
            .map_err(ApiError::from)
            .extend()?;
        Ok(fence.into())
    }

    #[graphql(name = "deleteGeofence")]
    async fn delete_geofence(&self, ctx: &Context<'_>, id: ID) -> Result<bool> {
        let api_ctx = ctx.data::<ApiContext>()?;
        api_ctx
            .tracker
            .delete_geofence(&id)
            .await
            .map_err(ApiError::from)
            .extend()?;
        Ok(true)
    }
}
