//! Unified error handling for the geofence-sync library.
//!
//! Every public entry point converts lower-level failures (SQLite, JSON,
//! transport, platform monitor) into a [`GeofenceError`] so that nothing
//! crosses the activation boundary as a panic.

use thiserror::Error;

/// Unified error type for geofence-sync operations.
#[derive(Debug, Clone, Error)]
pub enum GeofenceError {
    /// Transport failure or timeout. Retried on the next scheduled sync.
    #[error("Network error{}: {message}", status_suffix(.status_code))]
    Network {
        message: String,
        status_code: Option<u16>,
    },
    /// Malformed server payload. The sync attempt fails without touching the store.
    #[error("Parse error: {message}")]
    Parse { message: String },
    /// The platform region monitor rejected a call.
    #[error("Native monitor rejected {operation}: {message}")]
    NativeApi { operation: String, message: String },
    /// Missing or invalid service configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },
    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },
    /// A geofence record failed validation
    #[error("Invalid geofence '{code}': {message}")]
    InvalidGeofence { code: String, message: String },
    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code
        .map(|code| format!(" ({})", code))
        .unwrap_or_default()
}

impl GeofenceError {
    pub fn network(message: impl Into<String>) -> Self {
        GeofenceError::Network {
            message: message.into(),
            status_code: None,
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        GeofenceError::Parse {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        GeofenceError::Config {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        GeofenceError::Persistence {
            message: message.into(),
        }
    }

    /// Whether the failure came from missing/invalid configuration.
    pub fn is_config(&self) -> bool {
        matches!(self, GeofenceError::Config { .. })
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for GeofenceError {
    fn from(err: rusqlite::Error) -> Self {
        GeofenceError::persistence(err.to_string())
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite_migration::Error> for GeofenceError {
    fn from(err: rusqlite_migration::Error) -> Self {
        GeofenceError::persistence(format!("migration failed: {}", err))
    }
}

impl From<serde_json::Error> for GeofenceError {
    fn from(err: serde_json::Error) -> Self {
        GeofenceError::parse(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for GeofenceError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        GeofenceError::persistence(format!("encode failed: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for GeofenceError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        GeofenceError::persistence(format!("decode failed: {}", err))
    }
}

/// Result type alias for geofence-sync operations.
pub type Result<T> = std::result::Result<T, GeofenceError>;

/// Extension trait for converting Option to GeofenceError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a configuration error.
    fn ok_or_config(self, message: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_config(self, message: &str) -> Result<T> {
        self.ok_or_else(|| GeofenceError::config(message))
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| GeofenceError::Internal {
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GeofenceError::Network {
            message: "connection reset".to_string(),
            status_code: Some(503),
        };
        assert_eq!(err.to_string(), "Network error (503): connection reset");

        let err = GeofenceError::network("timed out");
        assert_eq!(err.to_string(), "Network error: timed out");

        let err = GeofenceError::InvalidGeofence {
            code: "gf-1".to_string(),
            message: "radius must be positive".to_string(),
        };
        assert!(err.to_string().contains("gf-1"));
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_config("server url missing");
        assert!(matches!(result, Err(GeofenceError::Config { .. })));
        assert!(result.unwrap_err().is_config());

        assert_eq!(Some(3).ok_or_internal("unused").unwrap(), 3);
    }

    #[test]
    fn test_json_error_converts_to_parse() {
        let err: GeofenceError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, GeofenceError::Parse { .. }));
    }
}
