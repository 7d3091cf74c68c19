//! # Geofence Engine
//!
//! Per-activation orchestration of the monitoring pipeline.
//!
//! ## Architecture
//!
//! A `GeofenceEngine` is cheap to build and holds no state of its own: every
//! activation (location fix, native transition, boot completed, sync) builds
//! one from a [`ServiceConfig`] and the shared [`Collaborators`], runs to
//! completion and drops it. Everything that must outlive the activation lives
//! in the geofence store and the settings store.
//!
//! The monitoring pipeline is:
//!
//! 1. Significant-change gate ([`ReferenceLocationTracker`])
//! 2. Nearest-first selection ([`BoundingBoxSelector`])
//! 3. Diff against the monitored set and apply ([`MonitoringReconciler`])
//! 4. Commit the new reference location
//!
//! Steps 1-4 run under the settings activation lock.

use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::dispatcher::{
    CallbackId, CallbackRegistry, EventNotifier, GeofenceCallback, PresenceState,
    TransitionDispatcher, TransitionEvent,
};
use crate::native::{LocationProvider, NativeRegionMonitor, TransitionKind};
use crate::reconciler::{MonitoringReconciler, ReconcileOutcome};
use crate::reference::ReferenceLocationTracker;
use crate::selector::BoundingBoxSelector;
use crate::settings::{Settings, SettingsStore};
use crate::store::GeofenceStore;
use crate::sync::{SyncEngine, SyncResult};
use crate::transport::RestTransport;
use crate::{now_millis, GeoPoint, Geofence, Location, OptionExt, Result, ServiceConfig};

// ============================================================================
// Core Types
// ============================================================================

/// Long-lived collaborators shared by every activation.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn GeofenceStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub monitor: Arc<dyn NativeRegionMonitor>,
    pub location: Arc<dyn LocationProvider>,
    /// Absent when the host runs offline; sync and event posting are skipped
    pub transport: Option<Arc<dyn RestTransport>>,
    pub callbacks: Arc<CallbackRegistry>,
}

/// Result of one pass of the monitoring pipeline.
#[derive(Debug, Clone)]
pub enum MonitoringOutcome {
    /// Within the significant-change threshold of the reference
    Skipped,
    /// The location provider had no fix
    NoLocation,
    Reconciled(ReconcileOutcome),
}

impl MonitoringOutcome {
    pub fn reconciled(&self) -> Option<&ReconcileOutcome> {
        match self {
            MonitoringOutcome::Reconciled(outcome) => Some(outcome),
            _ => None,
        }
    }
}

// ============================================================================
// Geofence Engine
// ============================================================================

pub struct GeofenceEngine {
    config: ServiceConfig,
    collaborators: Collaborators,
    settings: Settings,
    selector: BoundingBoxSelector,
    tracker: ReferenceLocationTracker,
    reconciler: MonitoringReconciler,
    dispatcher: TransitionDispatcher,
    sync: Option<SyncEngine>,
}

/// Log a failed entry point and hand the error back.
fn logged<T>(operation: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        error!("[GeofenceEngine] {} failed: {}", operation, e);
    }
    result
}

impl GeofenceEngine {
    pub fn new(config: ServiceConfig, collaborators: Collaborators) -> Result<Self> {
        logged("new", config.validate())?;

        let settings = Settings::new(Arc::clone(&collaborators.settings));
        let selector = BoundingBoxSelector::from_config(&config);
        let tracker = ReferenceLocationTracker::new(settings.clone());
        let reconciler = MonitoringReconciler::new(
            Arc::clone(&collaborators.monitor),
            settings.clone(),
            config.capacity(),
        );

        let notifier = match (&collaborators.transport, config.notify_server) {
            (Some(transport), true) => Some(EventNotifier::new(Arc::clone(transport), config.clone())),
            _ => None,
        };
        let dispatcher = TransitionDispatcher::new(
            Arc::clone(&collaborators.store),
            settings.clone(),
            Arc::clone(&collaborators.callbacks),
            notifier,
        );

        let sync = collaborators.transport.as_ref().map(|transport| {
            SyncEngine::new(
                Arc::clone(&collaborators.store),
                settings.clone(),
                Arc::clone(transport),
                Arc::clone(&collaborators.callbacks),
                config.clone(),
            )
        });

        Ok(Self {
            config,
            collaborators,
            settings,
            selector,
            tracker,
            reconciler,
            dispatcher,
            sync,
        })
    }

    /// Rebuild an engine from the config persisted by `start_monitoring`.
    pub fn from_settings(collaborators: Collaborators) -> Result<Self> {
        let settings = Settings::new(Arc::clone(&collaborators.settings));
        let config = logged(
            "from_settings",
            ServiceConfig::load(&settings)
                .and_then(|c| c.ok_or_config("no persisted service config; start monitoring first")),
        )?;
        Self::new(config, collaborators)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.collaborators.callbacks
    }

    pub fn register_callback(&self, callback: Arc<dyn GeofenceCallback>) -> CallbackId {
        self.collaborators.callbacks.register(callback)
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        self.collaborators.callbacks.unregister(id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn geofences(&self) -> Result<Vec<Geofence>> {
        self.collaborators.store.all()
    }

    pub fn geofence_count(&self) -> Result<usize> {
        self.collaborators.store.count()
    }

    pub fn monitored_codes(&self) -> Result<Vec<String>> {
        self.settings.monitored_codes()
    }

    pub fn presence(&self, code: &str) -> Result<PresenceState> {
        self.dispatcher.presence(code)
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Persist the config so later activations can rebuild the engine, then
    /// force a pass of the pipeline from the last known location.
    pub fn start_monitoring(&self) -> Result<MonitoringOutcome> {
        logged("start_monitoring", self.config.save(&self.settings))?;
        info!("[GeofenceEngine] Monitoring started");
        self.refresh_monitoring(true)
    }

    /// Location fix delivered by the platform.
    pub fn on_location_update(&self, location: &Location) -> Result<MonitoringOutcome> {
        logged(
            "on_location_update",
            self.run_pipeline(&location.point(), false, false),
        )
    }

    /// Run the pipeline from the provider's last known location, or from the
    /// stored reference location when the provider has no fix.
    pub fn refresh_monitoring(&self, force: bool) -> Result<MonitoringOutcome> {
        let point = match self.collaborators.location.last_known_location() {
            Some(location) => Some(location.point()),
            None => {
                let reference = logged("refresh_monitoring", self.settings.reference_location())?;
                if reference.is_some() {
                    debug!("[GeofenceEngine] No last known location, using reference location");
                }
                reference
            }
        };

        match point {
            Some(point) => logged("refresh_monitoring", self.run_pipeline(&point, force, false)),
            None => {
                info!("[GeofenceEngine] No location to evaluate, monitoring unchanged");
                Ok(MonitoringOutcome::NoLocation)
            }
        }
    }

    /// Native registrations do not survive a reboot: re-register the persisted
    /// monitored set, then re-run selection from the last known location.
    pub fn on_boot_completed(&self) -> Result<MonitoringOutcome> {
        logged("on_boot_completed", self.reprime_after_boot())
    }

    fn reprime_after_boot(&self) -> Result<MonitoringOutcome> {
        let last_known = self
            .collaborators
            .location
            .last_known_location()
            .map(|l| l.point());

        let reprimed = {
            let _guard = self.settings.lock();
            let previous = self.settings.monitored_codes()?;
            // Invalidate first: nothing is registered natively any more
            self.settings.set_monitored_codes(&[])?;
            let geofences = self.collaborators.store.find_by_codes(&previous)?;
            info!(
                "[GeofenceEngine] Re-registering {} of {} geofences after reboot",
                geofences.len(),
                previous.len()
            );
            self.reconciler
                .reconcile(&geofences, &[], true, last_known.as_ref())?
        };

        match last_known {
            Some(point) => match self.run_pipeline(&point, true, true)? {
                MonitoringOutcome::Reconciled(outcome) if !outcome.plan.is_empty() => {
                    Ok(MonitoringOutcome::Reconciled(outcome))
                }
                _ => Ok(MonitoringOutcome::Reconciled(reprimed)),
            },
            None => Ok(MonitoringOutcome::Reconciled(reprimed)),
        }
    }

    fn run_pipeline(&self, point: &GeoPoint, force: bool, is_post_reboot: bool) -> Result<MonitoringOutcome> {
        let _guard = self.settings.lock();

        if !self
            .tracker
            .should_reevaluate(point, self.config.max_distance, force)?
        {
            debug!("[GeofenceEngine] No significant location change");
            return Ok(MonitoringOutcome::Skipped);
        }

        let selected = self.selector.select(self.collaborators.store.as_ref(), point)?;
        let monitored = self.settings.monitored_codes()?;
        let outcome = self
            .reconciler
            .reconcile(&selected, &monitored, is_post_reboot, Some(point))?;
        self.tracker.commit(point)?;

        Ok(MonitoringOutcome::Reconciled(outcome))
    }

    /// Unregister everything and forget the monitored set, reference location
    /// and presence. Geofences and the sync cursor are kept.
    pub fn stop_monitoring(&self) -> Result<usize> {
        logged("stop_monitoring", self.unmonitor_all())
    }

    fn unmonitor_all(&self) -> Result<usize> {
        let _guard = self.settings.lock();
        let monitored = self.settings.monitored_codes()?;
        if !monitored.is_empty() {
            if let Err(e) = self.collaborators.monitor.unregister_regions(&monitored) {
                warn!(
                    "[GeofenceEngine] Failed to unregister {} regions: {}",
                    monitored.len(),
                    e
                );
            }
        }
        self.settings.set_monitored_codes(&[])?;
        self.settings.clear_presence(&monitored)?;
        self.tracker.clear()?;
        info!("[GeofenceEngine] Monitoring stopped ({} regions)", monitored.len());
        Ok(monitored.len())
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    pub fn on_native_transition(
        &self,
        kind: TransitionKind,
        region_ids: &[String],
    ) -> Result<Option<TransitionEvent>> {
        logged(
            "on_native_transition",
            self.dispatcher.on_native_transition(kind, region_ids),
        )
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Sync with the server if due (or `force`), then re-run monitoring when
    /// the store changed. `None` when the sync was skipped.
    pub async fn sync(&self, force: bool) -> Result<Option<SyncResult>> {
        self.sync_at(force, now_millis()).await
    }

    pub async fn sync_at(&self, force: bool, now_ms: i64) -> Result<Option<SyncResult>> {
        let Some(sync) = &self.sync else {
            warn!("[GeofenceEngine] Sync skipped: no transport configured");
            return Ok(None);
        };
        if let Err(e) = self.config.validate_for_network() {
            warn!("[GeofenceEngine] Sync skipped: {}", e);
            return Ok(None);
        }
        if !force && !logged("sync", sync.should_sync(now_ms))? {
            debug!("[GeofenceEngine] Sync not due");
            return Ok(None);
        }

        let result = logged("sync", sync.sync_now(now_ms).await)?;
        if result.has_changes() {
            // The store changed under the current selection
            if let Err(e) = self.refresh_monitoring(true) {
                warn!("[GeofenceEngine] Monitoring refresh after sync failed: {}", e);
            }
        }
        Ok(Some(result))
    }

    /// Clear the sync cursor so the next sync fetches everything.
    pub fn reset_sync(&self) -> Result<()> {
        match &self.sync {
            Some(sync) => logged("reset_sync", sync.reset()),
            None => Ok(()),
        }
    }

    // ========================================================================
    // User removal
    // ========================================================================

    /// Delete geofences locally, broadcast the deletion and re-evaluate.
    /// Returns the number of geofences that existed.
    pub fn remove_geofences(&self, codes: &[String]) -> Result<usize> {
        let changes = {
            let _guard = self.settings.lock();
            logged(
                "remove_geofences",
                self.collaborators.store.apply_changes(&[], codes),
            )?
        };
        if changes.deleted.is_empty() {
            return Ok(0);
        }

        self.collaborators.callbacks.notify_sync(&[], &changes.deleted);
        if let Err(e) = self.refresh_monitoring(true) {
            warn!("[GeofenceEngine] Monitoring refresh after removal failed: {}", e);
        }
        Ok(changes.deleted.len())
    }
}

// ============================================================================
// Tests
// ============================================================================
