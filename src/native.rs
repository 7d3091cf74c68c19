//! Platform collaborators: the native region monitor and the location provider.

use serde::{Deserialize, Serialize};

use crate::{Geofence, Location, Result};

/// Direction of a boundary crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Enter,
    Exit,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Enter => "enter",
            TransitionKind::Exit => "exit",
        }
    }
}

/// One region handed to the native monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RegionRequest {
    pub code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f64,
    /// Fire ENTER immediately when the device is already inside at registration.
    pub initial_trigger: bool,
}

impl RegionRequest {
    pub fn from_geofence(geofence: &Geofence, initial_trigger: bool) -> Self {
        Self {
            code: geofence.code.clone(),
            latitude: geofence.latitude,
            longitude: geofence.longitude,
            radius_meters: geofence.radius,
            initial_trigger,
        }
    }
}

/// The platform's circular-region monitoring primitive.
///
/// Transitions flow back through
/// [`GeofenceEngine::on_native_transition`](crate::GeofenceEngine::on_native_transition).
/// A rejected call returns [`GeofenceError::NativeApi`](crate::GeofenceError::NativeApi).
pub trait NativeRegionMonitor: Send + Sync {
    fn register_regions(&self, regions: &[RegionRequest]) -> Result<()>;
    fn unregister_regions(&self, codes: &[String]) -> Result<()>;
}

/// Source of the device's last known position.
pub trait LocationProvider: Send + Sync {
    fn last_known_location(&self) -> Option<Location>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_kind_serde() {
        assert_eq!(
            serde_json::to_string(&TransitionKind::Enter).unwrap(),
            "\"enter\""
        );
        let kind: TransitionKind = serde_json::from_str("\"exit\"").unwrap();
        assert_eq!(kind, TransitionKind::Exit);
        assert_eq!(kind.as_str(), "exit");
    }

    #[test]
    fn test_region_request_from_geofence() {
        let gf = Geofence::new("gf-1", "Office", 51.5, -0.12, 120.0);
        let region = RegionRequest::from_geofence(&gf, false);
        assert_eq!(region.code, "gf-1");
        assert_eq!(region.radius_meters, 120.0);
        assert!(!region.initial_trigger);
    }
}
