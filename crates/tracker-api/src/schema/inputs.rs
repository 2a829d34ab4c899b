//! # GraphQL Input Types
//!
//! Input object definitions for mutations.

use async_graphql::{ID, InputObject};

use super::enums::{DeviceType, GeofenceAction};
use crate::error::{ApiError, ApiResult};
use tracker_domain as domain;

/// Geographic coordinates input
#[derive(Debug, Clone, Copy, InputObject)]
pub struct CoordinatesInput {
    /// Latitude in decimal degrees (-90 to 90)
    pub latitude: f64,
    /// Longitude in decimal degrees (-180 to 180)
    pub longitude: f64,
}

impl From<CoordinatesInput> for domain::GeoPoint {
    fn from(c: CoordinatesInput) -> Self {
        Self::new(c.latitude, c.longitude)
    }
}

/// Input for provisioning a new device
#[derive(Debug, Clone, InputObject)]
pub struct ProvisionDeviceInput {
    /// 15-digit hardware identifier
    pub imei: String,
    /// Display name
    pub name: String,
    /// Contact address of the device owner
    pub owner_email: Option<String>,
    #[graphql(default)]
    pub device_type: DeviceType,
}

impl From<ProvisionDeviceInput> for domain::ProvisionRequest {
    fn from(input: ProvisionDeviceInput) -> Self {
        Self {
            imei: input.imei,
            name: input.name,
            owner_email: input.owner_email,
            device_type: input.device_type.into(),
        }
    }
}

/// Input for creating a geofence. Give either `vertices` for a polygon, or
/// `center` and `radiusM` for a circle.
#[derive(Debug, Clone, InputObject)]
pub struct CreateGeofenceInput {
    pub name: String,
    pub center: Option<CoordinatesInput>,
    /// Circle radius in meters
    pub radius_m: Option<f64>,
    pub vertices: Option<Vec<CoordinatesInput>>,
    /// Restrict the fence to one device
    pub device_id: Option<ID>,
    pub on_enter: Option<GeofenceAction>,
    pub on_exit: Option<GeofenceAction>,
    #[graphql(default = true)]
    pub active: bool,
}

impl CreateGeofenceInput {
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidInput`] when neither shape is fully given,
    /// or both are.
    pub fn into_new_geofence(self) -> ApiResult<domain::NewGeofence> {
        let boundary = match (self.vertices, self.center, self.radius_m) {
            (Some(vertices), None, None) => domain::Boundary::Polygon {
                vertices: vertices.into_iter().map(domain::GeoPoint::from).collect(),
            },
            (None, Some(center), Some(radius_m)) => domain::Boundary::Circle {
                center: center.into(),
                radius_m,
            },
            _ => {
                return Err(ApiError::InvalidInput(
                    "geofence needs either vertices, or center and radiusM".into(),
                ));
            }
        };

        Ok(domain::NewGeofence {
            name: self.name,
            boundary,
            device_id: self.device_id.map(|id| id.0),
            on_enter: self.on_enter.map(Into::into),
            on_exit: self.on_exit.map(Into::into),
            active: self.active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> CreateGeofenceInput {
        CreateGeofenceInput {
            name: "Depot".into(),
            center: None,
            radius_m: None,
            vertices: None,
            device_id: None,
            on_enter: Some(GeofenceAction::Alert),
            on_exit: None,
            active: true,
        }
    }

    #[test]
    fn circle_needs_center_and_radius() {
        let mut circle = input();
        circle.center = Some(CoordinatesInput { latitude: 40.0, longitude: -74.0 });
        assert!(circle.clone().into_new_geofence().is_err());

        circle.radius_m = Some(250.0);
        let draft = circle.into_new_geofence().unwrap();
        assert!(matches!(draft.boundary, domain::Boundary::Circle { radius_m, .. } if radius_m == 250.0));
        assert_eq!(draft.on_enter, Some(domain::GeofenceAction::Alert));
    }

    #[test]
    fn polygon_and_circle_together_are_ambiguous() {
        let mut both = input();
        both.vertices = Some(vec![CoordinatesInput { latitude: 0.0, longitude: 0.0 }]);
        both.center = Some(CoordinatesInput { latitude: 0.0, longitude: 0.0 });
        both.radius_m = Some(1.0);
        assert!(matches!(both.into_new_geofence(), Err(ApiError::InvalidInput(_))));
    }
}
