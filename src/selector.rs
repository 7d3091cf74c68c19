//! Candidate selection around the current location.
//!
//! The store is pre-filtered with a bounding box of half-width
//! `max_distance / 2`, then candidates are ranked by great-circle distance
//! to the location (ties broken by code) and truncated to the monitoring
//! capacity.

use log::debug;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::geo_utils;
use crate::store::GeofenceStore;
use crate::{GeoPoint, Geofence, GeofenceError, Result, ServiceConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBoxSelector {
    max_distance: f64,
    capacity: usize,
}

impl BoundingBoxSelector {
    pub fn new(max_distance: f64, capacity: usize) -> Self {
        Self {
            max_distance,
            capacity,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.max_distance, config.capacity())
    }

    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Up to `capacity` geofences nearest to `location`, nearest first.
    pub fn select(&self, store: &dyn GeofenceStore, location: &GeoPoint) -> Result<Vec<Geofence>> {
        if !location.is_valid() {
            return Err(GeofenceError::Internal {
                message: format!(
                    "invalid location ({}, {})",
                    location.latitude, location.longitude
                ),
            });
        }

        let boxes = geo_utils::bounding_boxes(location, self.max_distance / 2.0);
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for bbox in &boxes {
            for geofence in store.find_in_bounding_box(bbox)? {
                // Split boxes share their edge at the antimeridian
                if seen.insert(geofence.code.clone()) {
                    candidates.push(geofence);
                }
            }
        }

        let found = candidates.len();
        let selected = rank_by_distance(location, candidates, self.capacity);
        debug!(
            "[BoundingBoxSelector] {} candidates in {} box(es), selected {}",
            found,
            boxes.len(),
            selected.len()
        );
        Ok(selected)
    }
}

/// Sort by distance to `location` (then code) and keep the first `capacity`.
pub fn rank_by_distance(
    location: &GeoPoint,
    candidates: Vec<Geofence>,
    capacity: usize,
) -> Vec<Geofence> {
    let mut ranked: Vec<(f64, Geofence)> = candidates
        .into_iter()
        .map(|geofence| (geofence.distance_to(location), geofence))
        .collect();

    ranked.sort_by(|(da, a), (db, b)| {
        da.partial_cmp(db)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.code.cmp(&b.code))
    });
    ranked.truncate(capacity);
    ranked.into_iter().map(|(_, geofence)| geofence).collect()
}
