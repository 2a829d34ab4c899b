//! # Geofence Evaluation
//!
//! Point-in-boundary tests and enter/exit transition detection.

use geo::{Contains, LineString, Point, Polygon};

use crate::reconciler::Movement;
use tracker_domain::{Boundary, Crossing, DeviceSnapshot, GeoPoint, Geofence};

/// Whether `point` lies inside the boundary.
///
/// Circles include their rim. Polygons are tested planar on lon/lat and a
/// polygon with fewer than three vertices contains nothing.
pub fn contains(boundary: &Boundary, point: GeoPoint) -> bool {
    match boundary {
        Boundary::Circle { center, radius_m } => center.distance_to_m(&point) <= *radius_m,
        Boundary::Polygon { vertices } => {
            if vertices.len() < 3 {
                return false;
            }
            let ring: LineString<f64> = vertices
                .iter()
                .map(|v| (v.longitude, v.latitude))
                .collect::<Vec<_>>()
                .into();
            Polygon::new(ring, vec![]).contains(&Point::new(point.longitude, point.latitude))
        }
    }
}

/// Boundary transitions caused by one movement, over fences that apply to
/// the device. A first-ever position has no origin and crosses nothing.
pub fn crossings<'a>(
    fences: impl IntoIterator<Item = &'a Geofence>,
    device: &DeviceSnapshot,
    movement: &Movement,
) -> Vec<(&'a Geofence, Crossing)> {
    let Some(from) = movement.from else {
        return Vec::new();
    };

    fences
        .into_iter()
        .filter(|fence| fence.applies_to(device))
        .filter_map(|fence| {
            let was_inside = contains(&fence.boundary, from);
            let is_inside = contains(&fence.boundary, movement.to);
            match (was_inside, is_inside) {
                (false, true) => Some((fence, Crossing::Enter)),
                (true, false) => Some((fence, Crossing::Exit)),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tracker_domain::GeofenceAction;

    fn depot(active: bool) -> Geofence {
        Geofence {
            id: "G1".into(),
            owner_id: None,
            device_id: None,
            name: "Depot".into(),
            boundary: Boundary::Circle {
                center: GeoPoint::new(40.0, -74.0),
                radius_m: 100.0,
            },
            active,
            on_enter: Some(GeofenceAction::Alert),
            on_exit: None,
        }
    }

    fn square() -> Boundary {
        Boundary::Polygon {
            vertices: vec![
                GeoPoint::new(0.0, 0.0),
                GeoPoint::new(0.0, 1.0),
                GeoPoint::new(1.0, 1.0),
                GeoPoint::new(1.0, 0.0),
            ],
        }
    }

    #[test]
    fn circle_containment_uses_ground_distance() {
        let fence = depot(true);
        assert!(contains(&fence.boundary, GeoPoint::new(40.0005, -74.0)));
        assert!(!contains(&fence.boundary, GeoPoint::new(40.002, -74.0)));
    }

    #[test]
    fn polygon_containment() {
        assert!(contains(&square(), GeoPoint::new(0.5, 0.5)));
        assert!(!contains(&square(), GeoPoint::new(1.5, 0.5)));
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        let sliver = Boundary::Polygon {
            vertices: vec![GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 1.0)],
        };
        assert!(!contains(&sliver, GeoPoint::new(0.5, 0.5)));
    }

    #[test]
    fn entering_and_leaving_are_detected() {
        let fences = [depot(true)];
        let device = DeviceSnapshot::new("D1", Utc::now());
        let outside = GeoPoint::new(41.0, -75.0);
        let inside = GeoPoint::new(40.0, -74.0);

        let enter = crossings(&fences, &device, &Movement { from: Some(outside), to: inside });
        assert_eq!(enter.len(), 1);
        assert_eq!(enter[0].1, Crossing::Enter);

        let stay = crossings(
            &fences,
            &device,
            &Movement { from: Some(inside), to: GeoPoint::new(40.0001, -74.0) },
        );
        assert!(stay.is_empty());

        let exit = crossings(&fences, &device, &Movement { from: Some(inside), to: outside });
        assert_eq!(exit[0].1, Crossing::Exit);
    }

    #[test]
    fn first_fix_and_inactive_fences_cross_nothing() {
        let device = DeviceSnapshot::new("D1", Utc::now());
        let inside = GeoPoint::new(40.0, -74.0);

        let active = [depot(true)];
        let first = crossings(&active, &device, &Movement { from: None, to: inside });
        assert!(first.is_empty());

        let dormant = [depot(false)];
        let inactive = crossings(
            &dormant,
            &device,
            &Movement { from: Some(GeoPoint::new(41.0, -75.0)), to: inside },
        );
        assert!(inactive.is_empty());
    }

    #[test]
    fn device_scoped_fence_ignores_other_devices() {
        let mut fence = depot(true);
        fence.device_id = Some("D9".into());
        let device = DeviceSnapshot::new("D1", Utc::now());

        let hits = crossings(
            [&fence],
            &device,
            &Movement { from: Some(GeoPoint::new(41.0, -75.0)), to: GeoPoint::new(40.0, -74.0) },
        );
        assert!(hits.is_empty());
    }
}
