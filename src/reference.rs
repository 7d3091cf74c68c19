//! Significant-location-change gate.

use log::debug;

use crate::geo_utils::haversine_distance;
use crate::{GeoPoint, Result, Settings};

/// Tracks the persisted point at which selection was last computed.
///
/// The tracker only reads the reference when deciding; callers `commit` a new
/// reference once reconciliation has finished.
#[derive(Clone)]
pub struct ReferenceLocationTracker {
    settings: Settings,
}

impl ReferenceLocationTracker {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn reference(&self) -> Result<Option<GeoPoint>> {
        self.settings.reference_location()
    }

    /// Whether the monitored set should be recomputed for `location`.
    pub fn should_reevaluate(&self, location: &GeoPoint, max_distance: f64, force: bool) -> Result<bool> {
        if force {
            debug!("[ReferenceLocationTracker] Forced re-evaluation");
            return Ok(true);
        }
        let reference = self.reference()?;
        Ok(exceeds_threshold(reference.as_ref(), location, max_distance))
    }

    pub fn commit(&self, location: &GeoPoint) -> Result<()> {
        self.settings.set_reference_location(location)
    }

    pub fn clear(&self) -> Result<()> {
        self.settings.clear_reference_location()
    }
}

/// True when there is no reference or `location` is strictly farther than
/// `max_distance` meters from it.
pub fn exceeds_threshold(reference: Option<&GeoPoint>, location: &GeoPoint, max_distance: f64) -> bool {
    match reference {
        None => true,
        Some(reference) => {
            let moved = haversine_distance(reference, location);
            debug!(
                "[ReferenceLocationTracker] Moved {:.0}m from reference (threshold {:.0}m)",
                moved, max_distance
            );
            moved > max_distance
        }
    }
}
