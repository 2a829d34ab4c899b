//! # GraphQL Subscription Resolver
//!
//! Real-time updates fed from the tracker's event broadcast.

use async_graphql::{Context, ID, Result, Subscription};
use futures_util::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracker_core::TrackerEvent;

use crate::context::ApiContext;
use crate::schema::{
    Alert, AlertChangeKind, AlertEvent, AlertSeverity, Device, GeofenceCrossingEvent, Location,
};

/// Forward tracker events through `select`, skipping over lag
fn events<T: Send + 'static>(
    mut rx: broadcast::Receiver<TrackerEvent>,
    select: impl Fn(TrackerEvent) -> Option<T> + Send + 'static,
) -> impl Stream<Item = T> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(item) = select(event) {
                        yield item;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

/// GraphQL Subscription root
pub struct SubscriptionRoot;

#[Subscription]
impl SubscriptionRoot {
    /// Device state after every accepted change
    #[graphql(name = "deviceUpdates")]
    async fn device_updates(
        &self,
        ctx: &Context<'_>,
        #[graphql(desc = "Only this device (default: all)")] device_id: Option<ID>,
    ) -> Result<impl Stream<Item = Device>> {
        let api_ctx = ctx.data::<ApiContext>()?;
        let filter_id = device_id.map(|id| id.0);

        Ok(events(api_ctx.tracker.subscribe(), move |event| match event {
            TrackerEvent::DeviceUpdated(d) if filter_id.as_ref().is_none_or(|id| *id == d.id) => {
                Some(Device::from(d))
            }
            _ => None,
        }))
    }

    /// Location fixes for one device as they arrive
    #[graphql(name = "locationUpdates")]
    async fn location_updates(
        &self,
        ctx: &Context<'_>,
        device_id: ID,
    ) -> Result<impl Stream<Item = Location>> {
        let api_ctx = ctx.data::<ApiContext>()?;
        let filter_id = device_id.0;

        Ok(events(api_ctx.tracker.subscribe(), move |event| match event {
            TrackerEvent::LocationRecorded(s) if s.device_id == filter_id => {
                Some(Location::from(s))
            }
            _ => None,
        }))
    }

    /// Raised, updated and reopened alerts
    #[graphql(name = "alertEvents")]
    async fn alert_events(
        &self,
        ctx: &Context<'_>,
        #[graphql(desc = "Minimum severity to receive (default: all)")]
        min_severity: Option<AlertSeverity>,
    ) -> Result<impl Stream<Item = AlertEvent>> {
        let api_ctx = ctx.data::<ApiContext>()?;

        Ok(events(api_ctx.tracker.subscribe(), move |event| {
            let (kind, alert) = match event {
                TrackerEvent::AlertRaised(a) => (AlertChangeKind::Raised, a),
                TrackerEvent::AlertUpdated(a) => (AlertChangeKind::Updated, a),
                TrackerEvent::AlertReopened(a) => (AlertChangeKind::Reopened, a),
                _ => return None,
            };
            let alert = Alert::from(alert);
            let passes = min_severity.is_none_or(|min| rank(alert.severity) >= rank(min));
            passes.then_some(AlertEvent { kind, alert })
        }))
    }

    /// Devices entering or leaving geofences
    #[graphql(name = "geofenceCrossings")]
    async fn geofence_crossings(
        &self,
        ctx: &Context<'_>,
    ) -> Result<impl Stream<Item = GeofenceCrossingEvent>> {
        let api_ctx = ctx.data::<ApiContext>()?;

        Ok(events(api_ctx.tracker.subscribe(), |event| match event {
            TrackerEvent::GeofenceCrossed(c) => Some(GeofenceCrossingEvent::from(c)),
            _ => None,
        }))
    }
}

const fn rank(severity: AlertSeverity) -> u8 {
    match severity {
        AlertSeverity::Low => 0,
        AlertSeverity::Medium => 1,
        AlertSeverity::High => 2,
        AlertSeverity::Critical => 3,
    }
}
