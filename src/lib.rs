//! # Geofence Sync
//!
//! Geofence synchronization and monitoring core for mobile SDKs.
//!
//! This library provides:
//! - A code-keyed geofence store with bounding-box queries
//! - Nearest-first selection of the geofences worth monitoring
//! - Significant-location-change gating
//! - Reconciliation of the monitored set against the platform's region monitor
//! - Incremental server sync (created/updated/deleted geofences)
//! - Enter/exit transition fan-out to registered callbacks
//!
//! ## Features
//!
//! - **`persistence`** - SQLite-backed geofence and settings stores
//! - **`http`** - reqwest-backed REST transport
//! - **`ffi`** - FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use geofence_sync::{BoundingBoxSelector, GeoPoint, Geofence, GeofenceStore, MemoryGeofenceStore};
//!
//! let store = MemoryGeofenceStore::new();
//! store.upsert(&Geofence::new("office", "Office", 51.5074, -0.1278, 150.0)).unwrap();
//! store.upsert(&Geofence::new("paris", "Paris", 48.8566, 2.3522, 150.0)).unwrap();
//!
//! let selector = BoundingBoxSelector::new(5_000.0, 100);
//! let selected = selector.select(&store, &GeoPoint::new(51.5080, -0.1280)).unwrap();
//! assert_eq!(selected.len(), 1);
//! assert_eq!(selected[0].code, "office");
//! ```

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

// Unified error handling
pub mod error;
pub use error::{GeofenceError, OptionExt, Result};

// Geographic utilities (distance, destination point, bounding boxes)
pub mod geo_utils;

// Service configuration and defaults
pub mod config;
pub use config::{
    ServiceConfig, DEFAULT_MAX_DISTANCE_METERS, DEFAULT_MIN_HOURS_BETWEEN_SYNCS,
    DEFAULT_SYNC_PAGE_SIZE, MAX_MONITORED_REGIONS, SDK_VERSION,
};

// Persisted key/value settings (monitored set, reference location, sync cursor)
pub mod settings;
pub use settings::{MemorySettingsStore, Settings, SettingsStore};

// Geofence repository
pub mod store;
pub use store::{ChangeSet, GeofenceStore, MemoryGeofenceStore, UpsertOutcome};

// SQLite implementations of the stores
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::{SqliteGeofenceStore, SqliteSettingsStore};

// Platform collaborators (region monitor, location provider)
pub mod native;
pub use native::{LocationProvider, NativeRegionMonitor, RegionRequest, TransitionKind};

// Generic REST transport
pub mod transport;
pub use transport::{BasicAuth, HttpMethod, RestRequest, RestTransport};

// reqwest-backed transport
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::ReqwestTransport;

// Server wire formats
pub mod wire;

// Candidate selection around the current location
pub mod selector;
pub use selector::BoundingBoxSelector;

// Significant-location-change gate
pub mod reference;
pub use reference::ReferenceLocationTracker;

// Monitored set reconciliation
pub mod reconciler;
pub use reconciler::{MonitoringReconciler, ReconcileOutcome, ReconcilePlan};

// Incremental server sync
pub mod sync;
pub use sync::{SyncCursor, SyncEngine, SyncResult};

// Transition fan-out
pub mod dispatcher;
pub use dispatcher::{
    CallbackId, CallbackRegistry, GeofenceCallback, PresenceState, TransitionDispatcher,
    TransitionEvent,
};

// Per-activation orchestration
pub mod engine;
pub use engine::{Collaborators, GeofenceEngine, MonitoringOutcome};

// Message passing between activation contexts
pub mod activation;
pub use activation::{activation_channel, spawn_sync_timer, Activation, ActivationSender, ActivationWorker};

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize platform logging (Android logcat / iOS unified logging).
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("GeofenceSyncRust"),
    );
}

#[cfg(target_os = "ios")]
pub fn init_logging() {
    use log::LevelFilter;

    // Fails harmlessly when a logger is already installed
    let _ = oslog::OsLogger::new("geofence_sync")
        .level_filter(LevelFilter::Debug)
        .init();
}

#[cfg(not(any(target_os = "android", target_os = "ios")))]
pub fn init_logging() {
    // No-op on desktop; the host installs its own logger
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Core Types
// ============================================================================

/// A WGS84 coordinate.
///
/// # Example
/// ```
/// use geofence_sync::GeoPoint;
/// let point = GeoPoint::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A location fix delivered by the platform location provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Fix time in epoch milliseconds
    pub timestamp: i64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Inclusive latitude/longitude rectangle.
///
/// Never wraps: a region crossing the antimeridian is represented by two boxes
/// (see [`geo_utils::bounding_boxes`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }
    }

    /// Check whether a point lies inside the box (edges included).
    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }
}

/// A server-defined circular region.
///
/// Identity is the `code`: two geofences with the same code are equal and hash
/// the same regardless of their other fields. Sync updates go through
/// [`Geofence::apply_update`], which mutates the record in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    /// Stable unique identifier, shared with the server and the native monitor
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius in meters
    pub radius: f64,
    /// Server creation time (epoch millis)
    pub created_timestamp: Option<i64>,
    /// Server last-update time (epoch millis)
    pub updated_timestamp: Option<i64>,
}

impl Geofence {
    /// Create a geofence without description or server timestamps.
    pub fn new(code: &str, name: &str, latitude: f64, longitude: f64, radius: f64) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            description: None,
            latitude,
            longitude,
            radius,
            created_timestamp: None,
            updated_timestamp: None,
        }
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Great-circle distance in meters from the center to `point`.
    pub fn distance_to(&self, point: &GeoPoint) -> f64 {
        geo_utils::haversine_distance(&self.center(), point)
    }

    /// Check whether `point` lies within the radius.
    pub fn contains(&self, point: &GeoPoint) -> bool {
        self.distance_to(point) <= self.radius
    }

    /// Validate code, coordinates and radius.
    pub fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(GeofenceError::InvalidGeofence {
                code: self.code.clone(),
                message: "code is empty".to_string(),
            });
        }
        if !self.center().is_valid() {
            return Err(GeofenceError::InvalidGeofence {
                code: self.code.clone(),
                message: format!(
                    "coordinates out of range ({}, {})",
                    self.latitude, self.longitude
                ),
            });
        }
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(GeofenceError::InvalidGeofence {
                code: self.code.clone(),
                message: format!("radius must be positive, got {}", self.radius),
            });
        }
        Ok(())
    }

    /// Check whether every field matches, not just the code.
    pub fn same_content(&self, other: &Geofence) -> bool {
        self.code == other.code
            && self.name == other.name
            && self.description == other.description
            && self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.radius == other.radius
            && self.created_timestamp == other.created_timestamp
            && self.updated_timestamp == other.updated_timestamp
    }

    /// Copy the mutable fields of `other` into this record.
    ///
    /// Returns `true` if anything changed. The code is never touched.
    pub fn apply_update(&mut self, other: &Geofence) -> bool {
        if self.same_content(other) {
            return false;
        }
        self.name.clone_from(&other.name);
        self.description.clone_from(&other.description);
        self.latitude = other.latitude;
        self.longitude = other.longitude;
        self.radius = other.radius;
        self.created_timestamp = other.created_timestamp;
        self.updated_timestamp = other.updated_timestamp;
        true
    }
}

impl PartialEq for Geofence {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Geofence {}

impl Hash for Geofence {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.code.hash(state);
    }
}

// ============================================================================
// Tests
// ============================================================================
