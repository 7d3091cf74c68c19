//! FFI bindings for mobile platforms (iOS/Android).
//!
//! Exposes a [`GeofenceSdk`] object to Kotlin and Swift. The platform side
//! implements three callback interfaces (region monitor, location provider,
//! listener) and forwards its system events to the blocking entry points.
//! Geofences and settings live in one SQLite database.

use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::{
    activation_channel, init_logging, spawn_sync_timer, CallbackId, Collaborators, Geofence,
    GeofenceCallback, GeofenceEngine, GeofenceError, Location, LocationProvider,
    MonitoringOutcome, NativeRegionMonitor, PresenceState, RegionRequest, ReqwestTransport,
    RestTransport, ServiceConfig, SqliteGeofenceStore, SqliteSettingsStore, SyncResult,
    TransitionKind,
};
use crate::dispatcher::CallbackRegistry;

/// Shortest period accepted by `start_sync_timer`.
const MIN_TIMER_PERIOD_SECS: u64 = 60;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum FfiError {
    #[error("network: {0}")]
    Network(String),
    #[error("config: {0}")]
    Config(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("native: {0}")]
    Native(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<GeofenceError> for FfiError {
    fn from(e: GeofenceError) -> Self {
        let message = e.to_string();
        match e {
            GeofenceError::Network { .. } | GeofenceError::Parse { .. } => FfiError::Network(message),
            GeofenceError::Config { .. } | GeofenceError::InvalidGeofence { .. } => {
                FfiError::Config(message)
            }
            GeofenceError::Persistence { .. } => FfiError::Storage(message),
            GeofenceError::NativeApi { .. } => FfiError::Native(message),
            GeofenceError::Internal { .. } => FfiError::Internal(message),
        }
    }
}

// ============================================================================
// Callback Interfaces
// ============================================================================

/// Platform region monitoring (CLLocationManager / GeofencingClient).
/// Return false when the platform rejects the request.
#[uniffi::export(callback_interface)]
pub trait ForeignRegionMonitor: Send + Sync {
    fn register_regions(&self, regions: Vec<RegionRequest>) -> bool;
    fn unregister_regions(&self, codes: Vec<String>) -> bool;
}

#[uniffi::export(callback_interface)]
pub trait ForeignLocationProvider: Send + Sync {
    fn last_known_location(&self) -> Option<Location>;
}

/// Receives transitions and sync results.
#[uniffi::export(callback_interface)]
pub trait ForeignGeofenceListener: Send + Sync {
    fn on_enter(&self, geofences: Vec<Geofence>);
    fn on_exit(&self, geofences: Vec<Geofence>);
    fn on_sync(&self, changed: Vec<Geofence>, deleted: Vec<String>);
}

struct MonitorAdapter(Box<dyn ForeignRegionMonitor>);

impl NativeRegionMonitor for MonitorAdapter {
    fn register_regions(&self, regions: &[RegionRequest]) -> crate::Result<()> {
        if self.0.register_regions(regions.to_vec()) {
            Ok(())
        } else {
            Err(GeofenceError::NativeApi {
                operation: "register_regions".to_string(),
                message: format!("platform rejected {} regions", regions.len()),
            })
        }
    }

    fn unregister_regions(&self, codes: &[String]) -> crate::Result<()> {
        if self.0.unregister_regions(codes.to_vec()) {
            Ok(())
        } else {
            Err(GeofenceError::NativeApi {
                operation: "unregister_regions".to_string(),
                message: format!("platform rejected {} codes", codes.len()),
            })
        }
    }
}

struct LocationAdapter(Box<dyn ForeignLocationProvider>);

impl LocationProvider for LocationAdapter {
    fn last_known_location(&self) -> Option<Location> {
        self.0.last_known_location()
    }
}

struct ListenerAdapter(Box<dyn ForeignGeofenceListener>);

impl GeofenceCallback for ListenerAdapter {
    fn on_geofences_enter(&self, geofences: &[Geofence]) {
        self.0.on_enter(geofences.to_vec());
    }

    fn on_geofences_exit(&self, geofences: &[Geofence]) {
        self.0.on_exit(geofences.to_vec());
    }

    fn on_geofences_sync(&self, changed: &[Geofence], deleted: &[String]) {
        self.0.on_sync(changed.to_vec(), deleted.to_vec());
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncResult {
    pub changed: Vec<Geofence>,
    pub deleted: Vec<String>,
    pub pages: u32,
}

impl From<SyncResult> for FfiSyncResult {
    fn from(result: SyncResult) -> Self {
        Self {
            changed: result.changed,
            deleted: result.deleted,
            pages: result.pages as u32,
        }
    }
}

/// Number of regions now monitored, or `None` when the pass was skipped.
fn monitored_count(outcome: MonitoringOutcome) -> Option<u32> {
    outcome.reconciled().map(|o| o.monitored.len() as u32)
}

// ============================================================================
// SDK Object
// ============================================================================

#[derive(uniffi::Object)]
pub struct GeofenceSdk {
    config: ServiceConfig,
    collaborators: Collaborators,
    runtime: Runtime,
    listener_id: CallbackId,
    timer: Mutex<Option<JoinHandle<()>>>,
}

#[uniffi::export]
impl GeofenceSdk {
    /// Open (or create) the database at `db_path` and wire the platform
    /// callbacks. Nothing is registered until `start_monitoring`.
    #[uniffi::constructor]
    pub fn new(
        db_path: String,
        config_json: String,
        monitor: Box<dyn ForeignRegionMonitor>,
        location: Box<dyn ForeignLocationProvider>,
        listener: Box<dyn ForeignGeofenceListener>,
    ) -> Result<Arc<Self>, FfiError> {
        init_logging();
        info!("[GeofenceSdk] Initializing with db: {}", db_path);

        let config = ServiceConfig::from_json(&config_json)?;
        config.validate()?;

        let transport: Option<Arc<dyn RestTransport>> = match config.validate_for_network() {
            Ok(()) => Some(Arc::new(ReqwestTransport::new(&config.server_url)?)),
            Err(e) => {
                warn!("[GeofenceSdk] Running offline: {}", e);
                None
            }
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| FfiError::Internal(format!("failed to start runtime: {}", e)))?;

        let callbacks = Arc::new(CallbackRegistry::new());
        let listener_id = callbacks.register(Arc::new(ListenerAdapter(listener)));

        let collaborators = Collaborators {
            store: Arc::new(SqliteGeofenceStore::open(&db_path)?),
            settings: Arc::new(SqliteSettingsStore::open(&db_path)?),
            monitor: Arc::new(MonitorAdapter(monitor)),
            location: Arc::new(LocationAdapter(location)),
            transport,
            callbacks,
        };

        Ok(Arc::new(Self {
            config,
            collaborators,
            runtime,
            listener_id,
            timer: Mutex::new(None),
        }))
    }

    /// Persist the config and register the nearest geofences.
    pub fn start_monitoring(&self) -> Result<Option<u32>, FfiError> {
        Ok(monitored_count(self.engine()?.start_monitoring()?))
    }

    /// Unregister everything. Returns the number of regions released.
    pub fn stop_monitoring(&self) -> Result<u32, FfiError> {
        self.stop_sync_timer();
        Ok(self.engine()?.stop_monitoring()? as u32)
    }

    /// Force a sync regardless of the configured interval.
    pub fn sync_now(&self) -> Result<Option<FfiSyncResult>, FfiError> {
        let engine = self.engine()?;
        let result = self.runtime.block_on(engine.sync(true))?;
        Ok(result.map(FfiSyncResult::from))
    }

    pub fn on_location_update(&self, location: Location) -> Result<Option<u32>, FfiError> {
        Ok(monitored_count(self.engine()?.on_location_update(&location)?))
    }

    /// Returns the codes of the geofences the transition resolved to.
    pub fn on_native_transition(
        &self,
        kind: TransitionKind,
        region_ids: Vec<String>,
    ) -> Result<Vec<String>, FfiError> {
        let engine = self.engine()?;
        // The event POST is spawned on this runtime
        let _enter = self.runtime.enter();
        let event = engine.on_native_transition(kind, &region_ids)?;
        Ok(event.map(|e| e.codes()).unwrap_or_default())
    }

    pub fn on_boot_completed(&self) -> Result<Option<u32>, FfiError> {
        Ok(monitored_count(self.engine()?.on_boot_completed()?))
    }

    pub fn remove_geofences(&self, codes: Vec<String>) -> Result<u32, FfiError> {
        Ok(self.engine()?.remove_geofences(&codes)? as u32)
    }

    pub fn reset_sync(&self) -> Result<(), FfiError> {
        Ok(self.engine()?.reset_sync()?)
    }

    pub fn geofences(&self) -> Result<Vec<Geofence>, FfiError> {
        Ok(self.engine()?.geofences()?)
    }

    pub fn geofence_count(&self) -> Result<u32, FfiError> {
        Ok(self.engine()?.geofence_count()? as u32)
    }

    pub fn monitored_codes(&self) -> Result<Vec<String>, FfiError> {
        Ok(self.engine()?.monitored_codes()?)
    }

    pub fn presence(&self, code: String) -> Result<PresenceState, FfiError> {
        Ok(self.engine()?.presence(&code)?)
    }

    /// Sync periodically in the background, honoring the minimum interval
    /// between syncs. Replaces any running timer.
    pub fn start_sync_timer(&self, period_seconds: u64) {
        let period = Duration::from_secs(period_seconds.max(MIN_TIMER_PERIOD_SECS));
        let (sender, worker) = activation_channel(self.collaborators.clone());
        self.runtime.spawn(worker.run());

        let handle = {
            let _enter = self.runtime.enter();
            spawn_sync_timer(sender, self.config.clone(), period)
        };

        if let Ok(mut timer) = self.timer.lock() {
            if let Some(previous) = timer.replace(handle) {
                previous.abort();
            }
        }
        info!("[GeofenceSdk] Sync timer started ({:?})", period);
    }

    /// Dropping the timer's sender also stops its worker.
    pub fn stop_sync_timer(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
                info!("[GeofenceSdk] Sync timer stopped");
            }
        }
    }
}

impl GeofenceSdk {
    fn engine(&self) -> crate::Result<GeofenceEngine> {
        GeofenceEngine::new(self.config.clone(), self.collaborators.clone())
    }
}

impl Drop for GeofenceSdk {
    fn drop(&mut self) {
        self.stop_sync_timer();
        self.collaborators.callbacks.unregister(self.listener_id);
    }
}
