//! # SQLite persistence
//!
//! Durable implementations of [`GeofenceStore`] and [`SettingsStore`] backed
//! by a single SQLite database file. Both stores may point at the same file;
//! each holds its own connection and the schema is brought up to date with
//! `rusqlite_migration` on open.
//!
//! ## Tables
//!
//! - `geofences`: one row per code. Updates rewrite the row in place so the
//!   row id stays stable for the lifetime of the geofence.
//! - `settings`: opaque key/value blobs (MessagePack, see [`crate::Settings`]).

use log::{debug, info};
use once_cell::sync::Lazy;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::settings::SettingsStore;
use crate::store::{ChangeSet, GeofenceStore, UpsertOutcome};
use crate::{BoundingBox, Geofence, Result};

/// SQLite caps bound parameters per statement; IN-lists are chunked below it.
const IN_LIST_CHUNK: usize = 500;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const GEOFENCE_COLUMNS: &str =
    "code, name, description, latitude, longitude, radius, created_timestamp, updated_timestamp";

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        -- Geofences synced from the server
        CREATE TABLE geofences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            description TEXT,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            radius REAL NOT NULL,
            created_timestamp INTEGER,
            updated_timestamp INTEGER
        );

        CREATE INDEX idx_geofences_position ON geofences(latitude, longitude);

        -- Cross-activation settings
        CREATE TABLE settings (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL
        );
        "#,
    )])
}

fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    migrations().to_latest(&mut conn)?;
    Ok(conn)
}

fn open_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    migrations().to_latest(&mut conn)?;
    Ok(conn)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

// ============================================================================
// Geofence Store
// ============================================================================

/// [`GeofenceStore`] backed by the `geofences` table.
pub struct SqliteGeofenceStore {
    conn: Mutex<Connection>,
}

impl SqliteGeofenceStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = open_connection(path)?;
        info!("[SqliteGeofenceStore] Opened {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_in_memory()?),
        })
    }

    /// Row id of `code`, if stored.
    pub fn row_id(&self, code: &str) -> Result<Option<i64>> {
        let conn = lock(&self.conn);
        Ok(conn
            .query_row("SELECT id FROM geofences WHERE code = ?1", [code], |row| {
                row.get(0)
            })
            .optional()?)
    }
}

fn row_to_geofence(row: &Row<'_>) -> rusqlite::Result<Geofence> {
    Ok(Geofence {
        code: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        radius: row.get(5)?,
        created_timestamp: row.get(6)?,
        updated_timestamp: row.get(7)?,
    })
}

fn select_by_code(conn: &Connection, code: &str) -> Result<Option<Geofence>> {
    let sql = format!("SELECT {} FROM geofences WHERE code = ?1", GEOFENCE_COLUMNS);
    Ok(conn.query_row(&sql, [code], row_to_geofence).optional()?)
}

fn upsert_row(conn: &Connection, geofence: &Geofence) -> Result<UpsertOutcome> {
    match select_by_code(conn, &geofence.code)? {
        Some(mut current) => {
            if !current.apply_update(geofence) {
                return Ok(UpsertOutcome::Unchanged);
            }
            conn.execute(
                "UPDATE geofences
                 SET name = ?2, description = ?3, latitude = ?4, longitude = ?5,
                     radius = ?6, created_timestamp = ?7, updated_timestamp = ?8
                 WHERE code = ?1",
                params![
                    &current.code,
                    &current.name,
                    &current.description,
                    current.latitude,
                    current.longitude,
                    current.radius,
                    current.created_timestamp,
                    current.updated_timestamp,
                ],
            )?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            conn.execute(
                "INSERT INTO geofences
                 (code, name, description, latitude, longitude, radius,
                  created_timestamp, updated_timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    &geofence.code,
                    &geofence.name,
                    &geofence.description,
                    geofence.latitude,
                    geofence.longitude,
                    geofence.radius,
                    geofence.created_timestamp,
                    geofence.updated_timestamp,
                ],
            )?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}

impl GeofenceStore for SqliteGeofenceStore {
    fn upsert(&self, geofence: &Geofence) -> Result<UpsertOutcome> {
        geofence.validate()?;
        let conn = lock(&self.conn);
        upsert_row(&conn, geofence)
    }

    fn get(&self, code: &str) -> Result<Option<Geofence>> {
        let conn = lock(&self.conn);
        select_by_code(&conn, code)
    }

    fn find_in_bounding_box(&self, bbox: &BoundingBox) -> Result<Vec<Geofence>> {
        let conn = lock(&self.conn);
        let sql = format!(
            "SELECT {} FROM geofences
             WHERE latitude BETWEEN ?1 AND ?2 AND longitude BETWEEN ?3 AND ?4
             ORDER BY code",
            GEOFENCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![bbox.min_lat, bbox.max_lat, bbox.min_lng, bbox.max_lng],
            row_to_geofence,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn find_by_codes(&self, codes: &[String]) -> Result<Vec<Geofence>> {
        let conn = lock(&self.conn);
        let mut found: HashMap<String, Geofence> = HashMap::new();

        for chunk in codes.chunks(IN_LIST_CHUNK) {
            let sql = format!(
                "SELECT {} FROM geofences WHERE code IN ({})",
                GEOFENCE_COLUMNS,
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), row_to_geofence)?;
            for geofence in rows {
                let geofence = geofence?;
                found.insert(geofence.code.clone(), geofence);
            }
        }

        // Caller order, each code once
        let mut seen = HashSet::new();
        Ok(codes
            .iter()
            .filter(|code| seen.insert(code.as_str()))
            .filter_map(|code| found.get(code).cloned())
            .collect())
    }

    fn delete_by_codes(&self, codes: &[String]) -> Result<usize> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for chunk in codes.chunks(IN_LIST_CHUNK) {
            let sql = format!(
                "DELETE FROM geofences WHERE code IN ({})",
                placeholders(chunk.len())
            );
            deleted += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn all(&self) -> Result<Vec<Geofence>> {
        let conn = lock(&self.conn);
        let sql = format!("SELECT {} FROM geofences ORDER BY code", GEOFENCE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_geofence)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn count(&self) -> Result<usize> {
        let conn = lock(&self.conn);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM geofences", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn apply_changes(&self, upserts: &[Geofence], deleted: &[String]) -> Result<ChangeSet> {
        for geofence in upserts {
            geofence.validate()?;
        }

        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let mut changes = ChangeSet::default();

        for geofence in upserts {
            match upsert_row(&tx, geofence)? {
                UpsertOutcome::Inserted => changes.inserted.push(geofence.clone()),
                UpsertOutcome::Updated => changes.updated.push(geofence.clone()),
                UpsertOutcome::Unchanged => {}
            }
        }
        for code in deleted {
            if tx.execute("DELETE FROM geofences WHERE code = ?1", [code])? > 0 {
                changes.deleted.push(code.clone());
            }
        }

        tx.commit()?;

        if !changes.deleted.is_empty() {
            let gone: HashSet<&str> = changes.deleted.iter().map(String::as_str).collect();
            changes.inserted.retain(|g| !gone.contains(g.code.as_str()));
            changes.updated.retain(|g| !gone.contains(g.code.as_str()));
        }

        debug!(
            "[SqliteGeofenceStore] Applied batch: {} inserted, {} updated, {} deleted",
            changes.inserted.len(),
            changes.updated.len(),
            changes.deleted.len()
        );
        Ok(changes)
    }

    fn clear(&self) -> Result<()> {
        let conn = lock(&self.conn);
        conn.execute("DELETE FROM geofences", [])?;
        info!("[SqliteGeofenceStore] Cleared all geofences");
        Ok(())
    }
}

// ============================================================================
// Settings Store
// ============================================================================

/// Activation locks of every open settings store, keyed by canonical path.
static ACTIVATION_LOCKS: Lazy<Mutex<HashMap<PathBuf, Weak<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The activation lock shared by all handles on the database at `path`.
///
/// Must be called after the file exists so the path canonicalizes.
fn shared_activation_lock(path: &Path) -> Arc<Mutex<()>> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut locks = lock(&*ACTIVATION_LOCKS);
    locks.retain(|_, existing| existing.strong_count() > 0);

    if let Some(existing) = locks.get(&key).and_then(Weak::upgrade) {
        return existing;
    }
    let created = Arc::new(Mutex::new(()));
    locks.insert(key, Arc::downgrade(&created));
    created
}

/// [`SettingsStore`] backed by the `settings` table.
///
/// Writes are staged in memory and flushed in one transaction on `commit`.
/// Stores opened on the same file share one activation lock.
pub struct SqliteSettingsStore {
    conn: Mutex<Connection>,
    pending: Mutex<HashMap<String, Option<Vec<u8>>>>,
    activation: Arc<Mutex<()>>,
}

impl SqliteSettingsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = open_connection(path)?;
        info!("[SqliteSettingsStore] Opened {}", path.display());
        Ok(Self::with_connection(conn, shared_activation_lock(path)))
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::with_connection(
            open_in_memory()?,
            Arc::new(Mutex::new(())),
        ))
    }

    fn with_connection(conn: Connection, activation: Arc<Mutex<()>>) -> Self {
        Self {
            conn: Mutex::new(conn),
            pending: Mutex::new(HashMap::new()),
            activation,
        }
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = lock(&self.pending).get(key) {
            return Ok(staged.clone());
        }
        let conn = lock(&self.conn);
        Ok(conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
        lock(&self.pending).insert(key.to_string(), Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.pending).insert(key.to_string(), None);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut pending = lock(&self.pending);
        if pending.is_empty() {
            return Ok(());
        }

        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        for (key, value) in pending.iter() {
            match value {
                Some(bytes) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                        params![key, bytes],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM settings WHERE key = ?1", [key])?;
                }
            }
        }
        tx.commit()?;

        // Only dropped once durable; a failed commit keeps them staged
        pending.clear();
        Ok(())
    }

    fn activation_lock(&self) -> &Mutex<()> {
        &self.activation
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Settings;
    use std::sync::Arc;

    fn sample(code: &str, lat: f64, lng: f64) -> Geofence {
        Geofence::new(code, &format!("Geofence {}", code), lat, lng, 100.0)
    }

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn test_update_keeps_row_id() {
        let store = SqliteGeofenceStore::in_memory().unwrap();
        store.upsert(&sample("a", 10.0, 10.0)).unwrap();
        let id = store.row_id("a").unwrap();
        assert!(id.is_some());

        let mut moved = sample("a", 11.0, 11.0);
        moved.description = Some("moved".to_string());
        assert_eq!(store.upsert(&moved).unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.row_id("a").unwrap(), id);
        assert_eq!(
            store.get("a").unwrap().unwrap().description.as_deref(),
            Some("moved")
        );
        assert_eq!(store.upsert(&moved).unwrap(), UpsertOutcome::Unchanged);
    }

    #[test]
    fn test_find_by_codes_chunks_large_lists() {
        let store = SqliteGeofenceStore::in_memory().unwrap();
        let geofences: Vec<Geofence> = (0..1200)
            .map(|i| sample(&format!("gf-{:04}", i), 0.001 * i as f64, 0.0))
            .collect();
        store.apply_changes(&geofences, &[]).unwrap();

        let wanted: Vec<String> = (0..1200).rev().map(|i| format!("gf-{:04}", i)).collect();
        let found = store.find_by_codes(&wanted).unwrap();
        assert_eq!(found.len(), 1200);
        assert_eq!(found[0].code, "gf-1199");

        assert_eq!(store.delete_by_codes(&wanted).unwrap(), 1200);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_apply_changes_rolls_back_on_invalid() {
        let store = SqliteGeofenceStore::in_memory().unwrap();
        store.upsert(&sample("a", 1.0, 1.0)).unwrap();

        let bad = Geofence::new("bad", "Bad", 200.0, 1.0, 10.0);
        assert!(store
            .apply_changes(&[sample("b", 2.0, 2.0), bad], &["a".to_string()])
            .is_err());
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.get("a").unwrap().is_some());
    }

    #[test]
    fn test_settings_commit_and_remove() {
        let store = Arc::new(SqliteSettingsStore::in_memory().unwrap());
        store.put_raw("k", vec![9]).unwrap();
        assert_eq!(store.get_raw("k").unwrap(), Some(vec![9]));
        store.commit().unwrap();

        store.remove("k").unwrap();
        assert_eq!(store.get_raw("k").unwrap(), None);
        store.commit().unwrap();
        assert_eq!(store.get_raw("k").unwrap(), None);

        let settings = Settings::new(store);
        settings.set_monitored_codes(&["x".to_string()]).unwrap();
        assert_eq!(settings.monitored_codes().unwrap(), vec!["x"]);
    }

    #[test]
    fn test_in_memory_stores_have_separate_locks() {
        let a = SqliteSettingsStore::in_memory().unwrap();
        let b = SqliteSettingsStore::in_memory().unwrap();
        let _held = a.activation_lock().lock().unwrap();
        assert!(b.activation_lock().try_lock().is_ok());
    }
}
