//! Geofence classification
//!
//! Zones are checked in list order and the first zone containing the point
//! wins, even when a later overlapping zone is closer. The detector itself is
//! not synchronized; share it through [`SharedZones`].

use crate::domain::types::Zone;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Zone detector shared by the scheduler and the control API
pub type SharedZones = Arc<RwLock<ZoneDetector>>;

/// Great-circle distance in meters (haversine)
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Classifies coordinates against the current zone snapshot
#[derive(Debug, Default)]
pub struct ZoneDetector {
    zones: Vec<Zone>,
}

impl ZoneDetector {
    pub fn new(zones: Vec<Zone>) -> Self {
        info!(zones = %zones.len(), "zone_detector_initialized");
        Self { zones }
    }

    pub fn shared(zones: Vec<Zone>) -> SharedZones {
        Arc::new(RwLock::new(Self::new(zones)))
    }

    /// Replace the snapshot wholesale
    pub fn update_zones(&mut self, zones: Vec<Zone>) {
        info!(zones = %zones.len(), "zones_updated");
        self.zones = zones;
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Return the name of the first zone containing the point, if any
    pub fn check_zone(&self, latitude: f64, longitude: f64) -> Option<&str> {
        // Closest zone is tracked for the debug log only
        let mut closest: Option<(&str, f64)> = None;

        for zone in &self.zones {
            let Some((zone_lat, zone_lon)) = zone.center() else {
                continue;
            };

            let distance = haversine_m(latitude, longitude, zone_lat, zone_lon);
            if closest.map_or(true, |(_, d)| distance < d) {
                closest = Some((&zone.name, distance));
            }

            if distance <= zone.radius_meters {
                debug!(
                    zone = %zone.name,
                    distance_m = %format!("{distance:.1}"),
                    radius_m = %zone.radius_meters,
                    "zone_matched"
                );
                return Some(&zone.name);
            }
        }

        if let Some((name, distance)) = closest {
            debug!(closest_zone = %name, distance_m = %format!("{distance:.1}"), "zone_not_matched");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::normalize_radius;
    use serde_json::json;

    fn sample_zones() -> Vec<Zone> {
        vec![
            Zone::new("home", 54.8985, 23.9036, 100.0),
            Zone::new("work", 54.6872, 25.2797, 200.0),
            Zone::new("gym", 54.9000, 23.9200, 50.0),
        ]
    }

    #[test]
    fn test_empty_zone_list() {
        let detector = ZoneDetector::new(vec![]);
        assert_eq!(detector.check_zone(54.8985, 23.9036), None);
        assert_eq!(detector.check_zone(0.0, 0.0), None);
        assert_eq!(detector.check_zone(-89.9, 179.9), None);
    }

    #[test]
    fn test_each_zone_center_is_in_zone() {
        let detector = ZoneDetector::new(sample_zones());
        for zone in sample_zones() {
            let (lat, lon) = zone.center().unwrap();
            assert_eq!(detector.check_zone(lat, lon), Some(zone.name.as_str()));
        }
    }

    #[test]
    fn test_outside_all_zones() {
        let detector = ZoneDetector::new(sample_zones());
        assert_eq!(detector.check_zone(55.0, 24.0), None);
    }

    #[test]
    fn test_same_point_distance_is_zero() {
        let d = haversine_m(54.8985, 23.9036, 54.8985, 23.9036);
        assert!(d.abs() < 1.0, "distance was {d}");
    }

    #[test]
    fn test_distance_accuracy() {
        // One degree of latitude is ~111.2 km
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 100.0, "distance was {d}");

        // Kaunas to Vilnius is ~92 km
        let d = haversine_m(54.8985, 23.9036, 54.6872, 25.2797);
        assert!((d - 92_000.0).abs() < 2_000.0, "distance was {d}");
    }

    #[test]
    fn test_first_zone_wins_on_overlap() {
        let detector = ZoneDetector::new(vec![
            Zone::new("A", 10.0, 10.0, 200.0),
            Zone::new("B", 10.0, 10.0, 150.0),
        ]);
        assert_eq!(detector.check_zone(10.0, 10.0), Some("A"));
    }

    #[test]
    fn test_first_zone_wins_even_when_later_is_closer() {
        // Point sits 100m north of A's center and exactly on B's center
        let detector = ZoneDetector::new(vec![
            Zone::new("A", 10.0, 10.0, 500.0),
            Zone::new("B", 10.0009, 10.0, 50.0),
        ]);
        assert_eq!(detector.check_zone(10.0009, 10.0), Some("A"));
    }

    #[test]
    fn test_boundary() {
        let detector = ZoneDetector::new(vec![Zone::new("home", 0.0, 0.0, 100.0)]);
        // ~89m north
        assert_eq!(detector.check_zone(0.0008, 0.0), Some("home"));
        // ~111m north
        assert_eq!(detector.check_zone(0.001, 0.0), None);
    }

    #[test]
    fn test_string_radius_matches_numeric_radius() {
        let numeric = Zone::new("home", 0.0, 0.0, normalize_radius(Some(&json!(100))));
        let suffixed = Zone::new("home", 0.0, 0.0, normalize_radius(Some(&json!("100m"))));
        let a = ZoneDetector::new(vec![numeric]);
        let b = ZoneDetector::new(vec![suffixed]);

        for (lat, lon) in [(0.0, 0.0), (0.0008, 0.0), (0.00095, 0.0), (0.001, 0.0), (0.0, 0.0009)] {
            assert_eq!(a.check_zone(lat, lon), b.check_zone(lat, lon));
        }
    }

    #[test]
    fn test_zone_missing_coordinates_is_skipped() {
        let detector = ZoneDetector::new(vec![
            Zone { name: "broken".into(), latitude: None, longitude: Some(0.0), radius_meters: 1e9 },
            Zone::new("home", 0.0, 0.0, 100.0),
        ]);
        assert_eq!(detector.check_zone(0.0, 0.0), Some("home"));
        assert_eq!(detector.check_zone(45.0, 45.0), None);
    }

    #[test]
    fn test_update_zones() {
        let mut detector = ZoneDetector::new(vec![]);
        assert_eq!(detector.check_zone(54.8985, 23.9036), None);

        detector.update_zones(sample_zones());
        assert_eq!(detector.len(), 3);
        assert_eq!(detector.check_zone(54.8985, 23.9036), Some("home"));

        detector.update_zones(vec![]);
        assert!(detector.is_empty());
        assert_eq!(detector.check_zone(54.8985, 23.9036), None);
    }
}
