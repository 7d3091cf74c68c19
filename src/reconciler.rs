//! Monitored set reconciliation.
//!
//! Diffs the desired selection against the codes currently registered with
//! the native monitor, unregisters what is no longer wanted, registers what is
//! new, and persists the selection as the new monitored set. Redundant runs
//! produce an empty plan and make no native calls.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;

use crate::dispatcher::PresenceState;
use crate::native::{NativeRegionMonitor, RegionRequest};
use crate::{GeoPoint, Geofence, GeofenceError, Result, Settings};

/// Codes to register and unregister, by code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// In selection order
    pub to_add: Vec<Geofence>,
    pub to_remove: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub plan: ReconcilePlan,
    /// Requests handed to `register_regions`
    pub registered: Vec<RegionRequest>,
    /// Persisted monitored set, in selection order
    pub monitored: Vec<String>,
    pub remove_error: Option<GeofenceError>,
    pub add_error: Option<GeofenceError>,
}

impl ReconcileOutcome {
    /// Whether every native call succeeded.
    pub fn is_clean(&self) -> bool {
        self.remove_error.is_none() && self.add_error.is_none()
    }
}

pub struct MonitoringReconciler {
    monitor: Arc<dyn NativeRegionMonitor>,
    settings: Settings,
    capacity: usize,
}

impl MonitoringReconciler {
    pub fn new(monitor: Arc<dyn NativeRegionMonitor>, settings: Settings, capacity: usize) -> Self {
        Self {
            monitor,
            settings,
            capacity,
        }
    }

    pub fn plan(&self, selected: &[Geofence], currently_monitored: &[String]) -> ReconcilePlan {
        let monitored: HashSet<&str> = currently_monitored.iter().map(String::as_str).collect();
        let wanted: HashSet<&str> = selected.iter().map(|g| g.code.as_str()).collect();

        let mut added = HashSet::new();
        let to_add = selected
            .iter()
            .filter(|g| !monitored.contains(g.code.as_str()))
            .filter(|g| added.insert(g.code.as_str()))
            .cloned()
            .collect();

        let mut removed = HashSet::new();
        let to_remove = currently_monitored
            .iter()
            .filter(|code| !wanted.contains(code.as_str()))
            .filter(|code| removed.insert(code.as_str()))
            .cloned()
            .collect();

        ReconcilePlan { to_add, to_remove }
    }

    /// Registration without initial trigger only after a reboot when the
    /// device is already inside; an ENTER was delivered before the reboot.
    pub fn initial_trigger(
        &self,
        geofence: &Geofence,
        is_post_reboot: bool,
        last_known: Option<&GeoPoint>,
    ) -> bool {
        let inside = last_known.map_or(false, |point| geofence.contains(point));
        !(is_post_reboot && inside)
    }

    /// Bring the native monitor in line with `selected`.
    ///
    /// Native failures are logged and reported in the outcome; the selection
    /// is persisted regardless. The caller holds the settings activation lock.
    pub fn reconcile(
        &self,
        selected: &[Geofence],
        currently_monitored: &[String],
        is_post_reboot: bool,
        last_known: Option<&GeoPoint>,
    ) -> Result<ReconcileOutcome> {
        let selected = if selected.len() > self.capacity {
            warn!(
                "[MonitoringReconciler] {} geofences selected, monitoring only the first {}",
                selected.len(),
                self.capacity
            );
            &selected[..self.capacity]
        } else {
            selected
        };

        let plan = self.plan(selected, currently_monitored);
        let mut outcome = ReconcileOutcome::default();

        if plan.is_empty() {
            debug!("[MonitoringReconciler] Monitored set already up to date");
        }

        if !plan.to_remove.is_empty() {
            if let Err(e) = self.monitor.unregister_regions(&plan.to_remove) {
                warn!(
                    "[MonitoringReconciler] Failed to unregister {} regions: {}",
                    plan.to_remove.len(),
                    e
                );
                outcome.remove_error = Some(e);
            }
        }

        let requests: Vec<RegionRequest> = plan
            .to_add
            .iter()
            .map(|g| RegionRequest::from_geofence(g, self.initial_trigger(g, is_post_reboot, last_known)))
            .collect();

        if !requests.is_empty() {
            if let Err(e) = self.monitor.register_regions(&requests) {
                warn!(
                    "[MonitoringReconciler] Failed to register {} regions: {}",
                    requests.len(),
                    e
                );
                outcome.add_error = Some(e);
            }
        }

        let monitored: Vec<String> = selected.iter().map(|g| g.code.clone()).collect();
        self.settings.set_monitored_codes(&monitored)?;
        self.update_presence(&plan, &requests, outcome.add_error.is_none())?;

        info!(
            "[MonitoringReconciler] Monitoring {} geofences (+{} -{})",
            monitored.len(),
            plan.to_add.len(),
            plan.to_remove.len()
        );

        outcome.plan = plan;
        outcome.registered = requests;
        outcome.monitored = monitored;
        Ok(outcome)
    }

    /// Codes the native monitor rejected are left unmonitored.
    fn update_presence(
        &self,
        plan: &ReconcilePlan,
        requests: &[RegionRequest],
        registered: bool,
    ) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        let mut presence = self.settings.presence()?;
        for code in &plan.to_remove {
            presence.remove(code);
        }
        for request in requests {
            if !registered {
                presence.remove(&request.code);
                continue;
            }
            let state = if request.initial_trigger {
                PresenceState::Outside
            } else {
                PresenceState::Inside
            };
            presence.insert(request.code.clone(), state);
        }
        self.settings.set_presence(&presence)
    }
}
