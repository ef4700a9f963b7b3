//! Geographic utilities: distances, polyline lengths and the local metric
//! projection used while consolidating intersections.

use geo::{Distance, Haversine, Point};

use crate::LatLng;

/// Approximate metres per degree of latitude. Good enough for the
/// tolerance-sized distances (tens of metres) this crate projects.
pub const METRES_PER_DEGREE: f64 = 111_000.0;

/// Great-circle distance between two points in metres.
pub fn haversine_distance(a: &LatLng, b: &LatLng) -> f64 {
    Haversine::distance(
        Point::new(a.longitude, a.latitude),
        Point::new(b.longitude, b.latitude),
    )
}

/// Total length of a polyline in metres.
///
/// Returns 0.0 for polylines with fewer than two points.
pub fn polyline_length(points: &[LatLng]) -> f64 {
    points
        .windows(2)
        .map(|pair| haversine_distance(&pair[0], &pair[1]))
        .sum()
}

/// Equirectangular projection centred on an origin point.
///
/// Maps lat/lng to a local (x, y) plane in metres so that metre-valued
/// tolerances make sense, then maps merged positions back to lat/lng.
/// Accurate to well under a percent over the few-kilometre extents of a
/// run area, which is all the intersection merge needs.
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    origin: LatLng,
    metres_per_degree_lng: f64,
}

impl LocalProjection {
    /// Create a projection centred on `origin`.
    pub fn new(origin: LatLng) -> Self {
        Self {
            origin,
            metres_per_degree_lng: METRES_PER_DEGREE * origin.latitude.to_radians().cos(),
        }
    }

    /// Create a projection centred on the centroid of `points`.
    ///
    /// Returns `None` if `points` is empty.
    pub fn for_points(points: &[LatLng]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f64;
        let lat = points.iter().map(|p| p.latitude).sum::<f64>() / n;
        let lng = points.iter().map(|p| p.longitude).sum::<f64>() / n;
        Some(Self::new(LatLng::new(lat, lng)))
    }

    /// Project a geographic point to local metric coordinates.
    pub fn to_metric(&self, point: &LatLng) -> [f64; 2] {
        [
            (point.longitude - self.origin.longitude) * self.metres_per_degree_lng,
            (point.latitude - self.origin.latitude) * METRES_PER_DEGREE,
        ]
    }

    /// Map local metric coordinates back to a geographic point.
    pub fn to_geographic(&self, xy: [f64; 2]) -> LatLng {
        LatLng::new(
            self.origin.latitude + xy[1] / METRES_PER_DEGREE,
            self.origin.longitude + xy[0] / self.metres_per_degree_lng,
        )
    }
}
