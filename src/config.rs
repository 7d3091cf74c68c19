//! Service configuration.
//!
//! [`ServiceConfig`] is everything an activation needs to rebuild the engine:
//! it is persisted in the settings store by `start_monitoring` and carried in
//! every [`Activation`](crate::Activation) message.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::settings::Settings;
use crate::transport::BasicAuth;
use crate::{GeofenceError, Result};

/// Platform cap on simultaneously monitored regions.
pub const MAX_MONITORED_REGIONS: usize = 100;

/// Default significant-change threshold and selection diameter (meters).
pub const DEFAULT_MAX_DISTANCE_METERS: f64 = 5_000.0;

/// Default minimum spacing between automatic syncs.
pub const DEFAULT_MIN_HOURS_BETWEEN_SYNCS: u32 = 24;

/// Default number of features requested per sync page.
pub const DEFAULT_SYNC_PAGE_SIZE: u32 = 500;

/// Version reported in outbound event payloads.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Connection and monitoring parameters.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Base URL of the geofence server, e.g. `https://geo.example.com/api`
    pub server_url: String,
    pub tenant_id: String,
    pub organization_id: String,
    /// Basic-auth user (optional)
    pub username: Option<String>,
    /// Basic-auth password (optional)
    pub password: Option<String>,
    /// Device identifier reported with transition events
    pub device_descriptor: String,
    /// Significant-change threshold; the selection box spans this diameter (meters)
    pub max_distance: f64,
    /// Minimum hours between automatic syncs (values below 1 are treated as 1)
    pub min_hours_between_syncs: u32,
    /// Maximum number of regions registered with the native monitor
    pub monitoring_capacity: usize,
    /// Features requested per sync page
    pub sync_page_size: u32,
    /// POST transition events to the server
    pub notify_server: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            tenant_id: String::new(),
            organization_id: String::new(),
            username: None,
            password: None,
            device_descriptor: String::new(),
            max_distance: DEFAULT_MAX_DISTANCE_METERS,
            min_hours_between_syncs: DEFAULT_MIN_HOURS_BETWEEN_SYNCS,
            monitoring_capacity: MAX_MONITORED_REGIONS,
            sync_page_size: DEFAULT_SYNC_PAGE_SIZE,
            notify_server: true,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("server_url", &self.server_url)
            .field("tenant_id", &self.tenant_id)
            .field("organization_id", &self.organization_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("device_descriptor", &self.device_descriptor)
            .field("max_distance", &self.max_distance)
            .field("min_hours_between_syncs", &self.min_hours_between_syncs)
            .field("monitoring_capacity", &self.monitoring_capacity)
            .field("sync_page_size", &self.sync_page_size)
            .field("notify_server", &self.notify_server)
            .finish()
    }
}

impl ServiceConfig {
    /// Config for the given server and tenant/organization, defaults elsewhere.
    pub fn new(server_url: &str, tenant_id: &str, organization_id: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            tenant_id: tenant_id.to_string(),
            organization_id: organization_id.to_string(),
            ..Self::default()
        }
    }

    /// Parse a config from JSON (camelCase keys, missing keys take defaults).
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| GeofenceError::config(format!("invalid service config: {}", e)))
    }

    /// Config persisted by the last `start_monitoring`, if any.
    pub fn load(settings: &Settings) -> Result<Option<Self>> {
        settings.service_config()
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        settings.set_service_config(self)
    }

    /// Validate the monitoring parameters.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_distance.is_finite() && self.max_distance > 0.0) {
            return Err(GeofenceError::config(format!(
                "max distance must be positive, got {}",
                self.max_distance
            )));
        }
        if self.monitoring_capacity == 0 || self.monitoring_capacity > MAX_MONITORED_REGIONS {
            return Err(GeofenceError::config(format!(
                "monitoring capacity must be in 1..={}, got {}",
                MAX_MONITORED_REGIONS, self.monitoring_capacity
            )));
        }
        if self.sync_page_size == 0 {
            return Err(GeofenceError::config("sync page size must be positive"));
        }
        Ok(())
    }

    /// Validate the fields needed to talk to the server.
    pub fn validate_for_network(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(GeofenceError::config("server url is not set"));
        }
        if self.tenant_id.trim().is_empty() {
            return Err(GeofenceError::config("tenant id is not set"));
        }
        if self.organization_id.trim().is_empty() {
            return Err(GeofenceError::config("organization id is not set"));
        }
        Ok(())
    }

    /// Monitoring capacity clamped to the platform cap.
    pub fn capacity(&self) -> usize {
        self.monitoring_capacity.clamp(1, MAX_MONITORED_REGIONS)
    }

    /// Minimum interval between automatic syncs in milliseconds.
    pub fn min_sync_interval_millis(&self) -> i64 {
        i64::from(self.min_hours_between_syncs.max(1)) * MILLIS_PER_HOUR
    }

    /// Basic-auth credentials, when a username is configured.
    pub fn basic_auth(&self) -> Option<BasicAuth> {
        self.username.as_ref().map(|username| BasicAuth {
            username: username.clone(),
            password: self.password.clone().unwrap_or_default(),
        })
    }

    /// Path of the incremental geofence sync endpoint.
    pub fn sync_path(&self) -> String {
        format!(
            "tenants/{}/organizations/{}/geofences",
            self.tenant_id, self.organization_id
        )
    }

    /// Path of the transition event endpoint.
    pub fn events_path(&self) -> String {
        format!(
            "tenants/{}/organizations/{}/geofence-events",
            self.tenant_id, self.organization_id
        )
    }
}
