//! Geographic utilities on a spherical Earth.
//!
//! Distances and destination points come from `geo`'s haversine measure,
//! which uses the mean Earth radius (6,371,008.8 m). Bounding boxes add the
//! antimeridian split and pole clamping on top.

use geo::{Destination, Distance, Haversine, Point};

use crate::{BoundingBox, GeoPoint};

/// Mean Earth radius in meters, as used by [`Haversine`].
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

fn to_point(p: &GeoPoint) -> Point<f64> {
    Point::new(p.longitude, p.latitude)
}

/// Great-circle distance between two points in meters (haversine formula).
///
/// # Example
/// ```
/// use geofence_sync::GeoPoint;
/// use geofence_sync::geo_utils::haversine_distance;
///
/// let london = GeoPoint::new(51.5074, -0.1278);
/// let paris = GeoPoint::new(48.8566, 2.3522);
/// let km = haversine_distance(&london, &paris) / 1000.0;
/// assert!((km - 343.5).abs() < 2.0);
/// ```
pub fn haversine_distance(p1: &GeoPoint, p2: &GeoPoint) -> f64 {
    Haversine::distance(to_point(p1), to_point(p2))
}

/// Point reached by travelling `distance` meters from `origin` along the
/// great circle with initial bearing `bearing_degrees` (0 = north, 90 = east).
///
/// The returned longitude is normalized to [-180, 180].
pub fn destination_point(origin: &GeoPoint, bearing_degrees: f64, distance: f64) -> GeoPoint {
    let dest = Haversine::destination(to_point(origin), bearing_degrees, distance);
    GeoPoint::new(dest.y(), normalize_longitude(dest.x()))
}

/// Wrap a longitude into [-180, 180].
pub fn normalize_longitude(longitude: f64) -> f64 {
    let wrapped = (longitude + 180.0).rem_euclid(360.0) - 180.0;
    // rem_euclid maps +180 to -180; keep the eastern edge as written
    if wrapped == -180.0 && longitude > 0.0 {
        180.0
    } else {
        wrapped
    }
}

/// Boxes covering `half_width` meters north, south, east and west of `center`.
///
/// The cardinal extents come from [`destination_point`]. One box is returned
/// in the common case; two when the box crosses the antimeridian. When the
/// northern or southern extent reaches a pole the box spans every longitude.
pub fn bounding_boxes(center: &GeoPoint, half_width: f64) -> Vec<BoundingBox> {
    let angular = (half_width / EARTH_RADIUS_METERS).to_degrees();
    let north = center.latitude + angular;
    let south = center.latitude - angular;

    if north >= 90.0 || south <= -90.0 {
        return vec![BoundingBox::new(
            south.max(-90.0),
            north.min(90.0),
            -180.0,
            180.0,
        )];
    }

    let east = destination_point(center, 90.0, half_width).longitude;
    let west = destination_point(center, 270.0, half_width).longitude;

    if west <= east {
        vec![BoundingBox::new(south, north, west, east)]
    } else {
        // Crossed the antimeridian
        vec![
            BoundingBox::new(south, north, west, 180.0),
            BoundingBox::new(south, north, -180.0, east),
        ]
    }
}
