//! Persisted key/value settings.
//!
//! Cross-activation state (monitored set, reference location, sync cursor,
//! presence per geofence, service config) lives here rather than in memory,
//! because every activation builds a fresh engine. Values are encoded with
//! MessagePack.
//!
//! Read-modify-write sequences must hold [`Settings::lock`], which serializes
//! activations sharing the same backing store.

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dispatcher::PresenceState;
use crate::sync::SyncCursor;
use crate::{GeoPoint, Result, ServiceConfig};

pub const KEY_SERVICE_CONFIG: &str = "geofence.service_config";
pub const KEY_MONITORED_CODES: &str = "geofence.monitored_codes";
pub const KEY_REFERENCE_LOCATION: &str = "geofence.reference_location";
pub const KEY_SYNC_CURSOR: &str = "geofence.sync_cursor";
pub const KEY_PRESENCE: &str = "geofence.presence";

/// Raw persisted key/value store.
///
/// `put_raw`/`remove` stage writes; `commit` makes them durable. Staged
/// writes are visible to `get_raw` on the same store immediately.
pub trait SettingsStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn commit(&self) -> Result<()>;

    /// Mutex serializing activations that share this store.
    fn activation_lock(&self) -> &Mutex<()>;
}

/// Typed view over a [`SettingsStore`].
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn SettingsStore>,
}

/// Guard returned by [`Settings::lock`].
pub type ActivationGuard<'a> = MutexGuard<'a, ()>;

impl Settings {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.store
    }

    /// Take the activation lock of the backing store.
    pub fn lock(&self) -> ActivationGuard<'_> {
        self.store
            .activation_lock()
            .lock()
            .unwrap_or_else(|poisoned| {
                warn!("[Settings] Activation lock was poisoned, recovering");
                poisoned.into_inner()
            })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get_raw(key)? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stage and commit a value.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = rmp_serde::to_vec(value)?;
        self.store.put_raw(key, bytes)?;
        self.store.commit()
    }

    /// Stage and commit a removal.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.store.remove(key)?;
        self.store.commit()
    }

    // ========================================================================
    // Typed accessors
    // ========================================================================

    pub fn service_config(&self) -> Result<Option<ServiceConfig>> {
        self.get(KEY_SERVICE_CONFIG)
    }

    pub fn set_service_config(&self, config: &ServiceConfig) -> Result<()> {
        self.put(KEY_SERVICE_CONFIG, config)
    }

    /// Codes the engine last registered with the native monitor, in selection order.
    pub fn monitored_codes(&self) -> Result<Vec<String>> {
        Ok(self.get(KEY_MONITORED_CODES)?.unwrap_or_default())
    }

    pub fn set_monitored_codes(&self, codes: &[String]) -> Result<()> {
        self.put(KEY_MONITORED_CODES, &codes)
    }

    pub fn reference_location(&self) -> Result<Option<GeoPoint>> {
        self.get(KEY_REFERENCE_LOCATION)
    }

    pub fn set_reference_location(&self, point: &GeoPoint) -> Result<()> {
        self.put(KEY_REFERENCE_LOCATION, point)
    }

    pub fn clear_reference_location(&self) -> Result<()> {
        self.remove(KEY_REFERENCE_LOCATION)
    }

    pub fn sync_cursor(&self) -> Result<SyncCursor> {
        Ok(self.get(KEY_SYNC_CURSOR)?.unwrap_or_default())
    }

    pub fn set_sync_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.put(KEY_SYNC_CURSOR, cursor)
    }

    pub fn presence(&self) -> Result<HashMap<String, PresenceState>> {
        Ok(self.get(KEY_PRESENCE)?.unwrap_or_default())
    }

    pub fn set_presence(&self, presence: &HashMap<String, PresenceState>) -> Result<()> {
        self.put(KEY_PRESENCE, presence)
    }

    /// Drop presence entries for `codes` (they become unmonitored).
    pub fn clear_presence(&self, codes: &[String]) -> Result<()> {
        if codes.is_empty() {
            return Ok(());
        }
        let mut presence = self.presence()?;
        let before = presence.len();
        for code in codes {
            presence.remove(code);
        }
        if presence.len() != before {
            self.set_presence(&presence)?;
        }
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Settings store kept in process memory. Used in tests and by hosts that
/// persist settings themselves.
#[derive(Default)]
pub struct MemorySettingsStore {
    committed: Mutex<HashMap<String, Vec<u8>>>,
    /// Staged writes; `None` marks a removal
    pending: Mutex<HashMap<String, Option<Vec<u8>>>>,
    lock: Mutex<()>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed keys.
    pub fn len(&self) -> usize {
        lock_map(&self.committed).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_map<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SettingsStore for MemorySettingsStore {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = lock_map(&self.pending).get(key) {
            return Ok(staged.clone());
        }
        Ok(lock_map(&self.committed).get(key).cloned())
    }

    fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
        lock_map(&self.pending).insert(key.to_string(), Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock_map(&self.pending).insert(key.to_string(), None);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let staged: Vec<(String, Option<Vec<u8>>)> = lock_map(&self.pending).drain().collect();
        let mut committed = lock_map(&self.committed);
        for (key, value) in staged {
            match value {
                Some(bytes) => {
                    committed.insert(key, bytes);
                }
                None => {
                    committed.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn activation_lock(&self) -> &Mutex<()> {
        &self.lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> (Arc<MemorySettingsStore>, Settings) {
        let store = Arc::new(MemorySettingsStore::new());
        (store.clone(), Settings::new(store))
    }

    #[test]
    fn test_staged_writes_visible_before_commit() {
        let store = MemorySettingsStore::new();
        store.put_raw("k", vec![1, 2, 3]).unwrap();
        assert_eq!(store.get_raw("k").unwrap(), Some(vec![1, 2, 3]));
        assert!(store.is_empty());

        store.commit().unwrap();
        assert_eq!(store.len(), 1);

        store.remove("k").unwrap();
        assert_eq!(store.get_raw("k").unwrap(), None);
        store.commit().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_typed_round_trips() {
        let (_store, settings) = settings();

        assert!(settings.monitored_codes().unwrap().is_empty());
        settings
            .set_monitored_codes(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(settings.monitored_codes().unwrap(), vec!["a", "b"]);

        assert_eq!(settings.reference_location().unwrap(), None);
        settings
            .set_reference_location(&GeoPoint::new(1.5, 2.5))
            .unwrap();
        assert_eq!(
            settings.reference_location().unwrap(),
            Some(GeoPoint::new(1.5, 2.5))
        );
        settings.clear_reference_location().unwrap();
        assert_eq!(settings.reference_location().unwrap(), None);

        let cursor = SyncCursor {
            last_sync_date: Some("2024-05-01T00:00:00Z".to_string()),
            last_sync_local_timestamp: Some(42),
        };
        settings.set_sync_cursor(&cursor).unwrap();
        assert_eq!(settings.sync_cursor().unwrap(), cursor);

        let config = ServiceConfig::new("https://geo.example.com", "t", "o");
        settings.set_service_config(&config).unwrap();
        assert_eq!(settings.service_config().unwrap(), Some(config));
    }

    #[test]
    fn test_clear_presence() {
        let (_store, settings) = settings();
        let mut presence = HashMap::new();
        presence.insert("a".to_string(), PresenceState::Inside);
        presence.insert("b".to_string(), PresenceState::Outside);
        settings.set_presence(&presence).unwrap();

        settings.clear_presence(&["a".to_string()]).unwrap();
        let presence = settings.presence().unwrap();
        assert_eq!(presence.len(), 1);
        assert_eq!(presence.get("b"), Some(&PresenceState::Outside));
    }

    #[test]
    fn test_lock_is_shared_through_store() {
        let (store, settings) = settings();
        let other = Settings::new(store);
        let _guard = settings.lock();
        assert!(other.store().activation_lock().try_lock().is_err());
    }
}
