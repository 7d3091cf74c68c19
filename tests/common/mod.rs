//! Shared in-memory collaborators for the integration tests.

#![allow(dead_code)]

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use geofence_sync::geo_utils::destination_point;
use geofence_sync::{
    CallbackRegistry, Collaborators, GeoPoint, Geofence, GeofenceCallback, GeofenceEngine,
    HttpMethod, Location, LocationProvider, MemoryGeofenceStore, MemorySettingsStore,
    NativeRegionMonitor, RegionRequest, RestRequest, RestTransport, Result, ServiceConfig, Settings,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Geofence centered `meters` north of `origin`.
pub fn geofence_north_of(code: &str, origin: &GeoPoint, meters: f64, radius: f64) -> Geofence {
    let center = destination_point(origin, 0.0, meters);
    Geofence::new(code, code, center.latitude, center.longitude, radius)
}

pub fn codes(geofences: &[Geofence]) -> Vec<String> {
    geofences.iter().map(|g| g.code.clone()).collect()
}

pub fn strings(codes: &[&str]) -> Vec<String> {
    codes.iter().map(|c| c.to_string()).collect()
}

/// Network-capable config with server notification off.
pub fn network_config(max_distance: f64) -> ServiceConfig {
    ServiceConfig {
        max_distance,
        notify_server: false,
        ..ServiceConfig::new("https://geo.example.com/api", "tenant", "org")
    }
}

// ============================================================================
// Region monitor
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorCall {
    Register(Vec<RegionRequest>),
    Unregister(Vec<String>),
}

#[derive(Default)]
pub struct RecordingMonitor {
    calls: Mutex<Vec<MonitorCall>>,
}

impl RecordingMonitor {
    pub fn calls(&self) -> Vec<MonitorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn registered(&self) -> Vec<RegionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MonitorCall::Register(regions) => Some(regions),
                MonitorCall::Unregister(_) => None,
            })
            .flatten()
            .collect()
    }

    pub fn unregistered(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MonitorCall::Unregister(codes) => Some(codes),
                MonitorCall::Register(_) => None,
            })
            .flatten()
            .collect()
    }
}

impl NativeRegionMonitor for RecordingMonitor {
    fn register_regions(&self, regions: &[RegionRequest]) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(MonitorCall::Register(regions.to_vec()));
        Ok(())
    }

    fn unregister_regions(&self, codes: &[String]) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(MonitorCall::Unregister(codes.to_vec()));
        Ok(())
    }
}

// ============================================================================
// Location provider
// ============================================================================

#[derive(Default)]
pub struct FixedLocation(Mutex<Option<Location>>);

impl FixedLocation {
    pub fn set(&self, point: &GeoPoint) {
        *self.0.lock().unwrap() = Some(Location::new(point.latitude, point.longitude, 0));
    }
}

impl LocationProvider for FixedLocation {
    fn last_known_location(&self) -> Option<Location> {
        *self.0.lock().unwrap()
    }
}

// ============================================================================
// Callback
// ============================================================================

#[derive(Default)]
pub struct RecordingCallback {
    pub enters: Mutex<Vec<Vec<String>>>,
    pub exits: Mutex<Vec<Vec<String>>>,
    pub syncs: Mutex<Vec<(Vec<String>, Vec<String>)>>,
}

impl GeofenceCallback for RecordingCallback {
    fn on_geofences_enter(&self, geofences: &[Geofence]) {
        self.enters.lock().unwrap().push(codes(geofences));
    }

    fn on_geofences_exit(&self, geofences: &[Geofence]) {
        self.exits.lock().unwrap().push(codes(geofences));
    }

    fn on_geofences_sync(&self, changed: &[Geofence], deleted: &[String]) {
        self.syncs
            .lock()
            .unwrap()
            .push((codes(changed), deleted.to_vec()));
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Answers GETs from a queue; POSTs are recorded and answered with null.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<Value>>>,
    requests: Mutex<Vec<RestRequest>>,
}

impl ScriptedTransport {
    pub fn push(&self, response: Result<Value>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<RestRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl RestTransport for ScriptedTransport {
    fn execute(&self, request: RestRequest) -> BoxFuture<'_, Result<Value>> {
        let response = match request.method {
            HttpMethod::Get => self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Value::Null)),
            _ => Ok(Value::Null),
        };
        self.requests.lock().unwrap().push(request);
        async move { response }.boxed()
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryGeofenceStore>,
    pub settings: Arc<MemorySettingsStore>,
    pub monitor: Arc<RecordingMonitor>,
    pub location: Arc<FixedLocation>,
    pub transport: Arc<ScriptedTransport>,
    pub callback: Arc<RecordingCallback>,
    pub collaborators: Collaborators,
}

impl Harness {
    pub fn new(geofences: &[Geofence]) -> Self {
        init_logger();
        let store = Arc::new(MemoryGeofenceStore::with_geofences(geofences));
        let settings = Arc::new(MemorySettingsStore::new());
        let monitor = Arc::new(RecordingMonitor::default());
        let location = Arc::new(FixedLocation::default());
        let transport = Arc::new(ScriptedTransport::default());
        let callback = Arc::new(RecordingCallback::default());

        let callbacks = Arc::new(CallbackRegistry::new());
        callbacks.register(callback.clone());

        let collaborators = Collaborators {
            store: store.clone(),
            settings: settings.clone(),
            monitor: monitor.clone(),
            location: location.clone(),
            transport: Some(transport.clone() as Arc<dyn RestTransport>),
            callbacks,
        };

        Self {
            store,
            settings,
            monitor,
            location,
            transport,
            callback,
            collaborators,
        }
    }

    pub fn settings_view(&self) -> Settings {
        Settings::new(self.settings.clone())
    }

    pub fn engine(&self, config: &ServiceConfig) -> GeofenceEngine {
        GeofenceEngine::new(config.clone(), self.collaborators.clone()).unwrap()
    }
}
