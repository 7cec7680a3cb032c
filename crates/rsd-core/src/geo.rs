//! Great-circle distance helpers.

use serde::{Deserialize, Serialize};

use crate::ValidationError;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Rejects non-finite and out-of-range coordinates. `field` names the
    /// offending input in the returned reason.
    pub fn validate(&self, field: &'static str) -> Result<(), ValidationError> {
        let lat_ok = self.lat.is_finite() && (-90.0..=90.0).contains(&self.lat);
        let lng_ok = self.lng.is_finite() && (-180.0..=180.0).contains(&self.lng);
        if lat_ok && lng_ok {
            Ok(())
        } else {
            Err(ValidationError::InvalidCoordinates { field })
        }
    }
}

/// Haversine distance in kilometers between two points given in degrees.
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

pub fn within_radius(point: GeoPoint, center: GeoPoint, radius_km: f64) -> bool {
    distance_km(point, center) <= radius_km
}

/// Lat/lng envelope that contains every point within `radius_km` of a center.
///
/// Used as a cheap SQL prefilter; callers still apply [`distance_km`] to the
/// rows it returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn around(center: GeoPoint, radius_km: f64) -> Self {
        let radius_km = radius_km.max(0.0);
        let d_lat = (radius_km / EARTH_RADIUS_KM).to_degrees();
        let min_lat = (center.lat - d_lat).max(-90.0);
        let max_lat = (center.lat + d_lat).min(90.0);

        // Near the poles the longitude span degenerates; take the whole band.
        let cos_lat = center.lat.to_radians().cos();
        if cos_lat.abs() < 1e-9 || max_lat >= 90.0 || min_lat <= -90.0 {
            return Self {
                min_lat,
                max_lat,
                min_lng: -180.0,
                max_lng: 180.0,
            };
        }

        let d_lng = (radius_km / (EARTH_RADIUS_KM * cos_lat)).to_degrees();
        if d_lng >= 180.0 {
            return Self {
                min_lat,
                max_lat,
                min_lng: -180.0,
                max_lng: 180.0,
            };
        }

        Self {
            min_lat,
            max_lat,
            min_lng: center.lng - d_lng,
            max_lng: center.lng + d_lng,
        }
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        let lng_ok = if self.min_lng < -180.0 {
            point.lng >= self.min_lng + 360.0 || point.lng <= self.max_lng
        } else if self.max_lng > 180.0 {
            point.lng >= self.min_lng || point.lng <= self.max_lng - 360.0
        } else {
            (self.min_lng..=self.max_lng).contains(&point.lng)
        };
        (self.min_lat..=self.max_lat).contains(&point.lat) && lng_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAO_PAULO: GeoPoint = GeoPoint::new(-23.55, -46.63);

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let points = [
            SAO_PAULO,
            GeoPoint::new(-22.9068, -43.1729),
            GeoPoint::new(51.5074, -0.1278),
            GeoPoint::new(35.6762, 139.6503),
            GeoPoint::new(0.0, 179.9),
            GeoPoint::new(0.0, -179.9),
        ];
        for a in points {
            assert_eq!(distance_km(a, a), 0.0);
            for b in points {
                assert!((distance_km(a, b) - distance_km(b, a)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn known_city_pair_distance() {
        let rio = GeoPoint::new(-22.9068, -43.1729);
        let km = distance_km(SAO_PAULO, rio);
        assert!((km - 360.0).abs() < 10.0, "got {km}");
    }

    #[test]
    fn within_radius_is_inclusive() {
        let north = GeoPoint::new(SAO_PAULO.lat + 0.01, SAO_PAULO.lng);
        let d = distance_km(north, SAO_PAULO);
        assert!(within_radius(north, SAO_PAULO, d));
        assert!(!within_radius(north, SAO_PAULO, d - 0.001));
    }

    #[test]
    fn bounding_box_contains_points_inside_radius() {
        let bbox = BoundingBox::around(SAO_PAULO, 5.0);
        let inside = GeoPoint::new(SAO_PAULO.lat + 0.03, SAO_PAULO.lng - 0.03);
        let outside = GeoPoint::new(SAO_PAULO.lat + 0.2, SAO_PAULO.lng);
        assert!(within_radius(inside, SAO_PAULO, 5.0));
        assert!(bbox.contains(inside));
        assert!(!bbox.contains(outside));
    }

    #[test]
    fn bounding_box_wraps_the_antimeridian() {
        let center = GeoPoint::new(0.0, 179.99);
        let bbox = BoundingBox::around(center, 10.0);
        assert!(bbox.contains(GeoPoint::new(0.0, -179.99)));
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(GeoPoint::new(91.0, 0.0).validate("origin").is_err());
        assert!(GeoPoint::new(0.0, f64::NAN).validate("origin").is_err());
        assert!(SAO_PAULO.validate("origin").is_ok());
    }
}
