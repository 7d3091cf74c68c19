//! Geofence repository.
//!
//! [`GeofenceStore`] is the only way the rest of the crate touches geofence
//! records. Two implementations exist: [`MemoryGeofenceStore`] here, and the
//! SQLite-backed store in [`crate::persistence`].

use log::debug;
use rstar::{RTree, RTreeObject, AABB};
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{BoundingBox, Geofence, Result};

/// Result of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// What a batch of changes actually did to the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub inserted: Vec<Geofence>,
    pub updated: Vec<Geofence>,
    /// Codes that existed and were removed
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Inserted followed by updated geofences.
    pub fn changed(&self) -> Vec<Geofence> {
        self.inserted
            .iter()
            .chain(self.updated.iter())
            .cloned()
            .collect()
    }
}

/// Code-keyed geofence repository.
///
/// Lookups of codes that are not stored yield `None` or nothing, never an
/// error. Results of multi-record queries are ordered by code unless stated
/// otherwise.
pub trait GeofenceStore: Send + Sync {
    /// Insert a new record or update the existing one with the same code in place.
    fn upsert(&self, geofence: &Geofence) -> Result<UpsertOutcome>;

    fn get(&self, code: &str) -> Result<Option<Geofence>>;

    /// Geofences whose center lies inside `bbox` (edges included).
    fn find_in_bounding_box(&self, bbox: &BoundingBox) -> Result<Vec<Geofence>>;

    /// Geofences for `codes`, in the order the codes are given. Unknown and
    /// repeated codes are skipped.
    fn find_by_codes(&self, codes: &[String]) -> Result<Vec<Geofence>>;

    /// Delete the given codes, returning how many existed.
    fn delete_by_codes(&self, codes: &[String]) -> Result<usize>;

    fn all(&self) -> Result<Vec<Geofence>>;

    fn count(&self) -> Result<usize>;

    /// Upsert then delete as one atomic batch.
    ///
    /// A code present in both lists ends up deleted.
    fn apply_changes(&self, upserts: &[Geofence], deleted: &[String]) -> Result<ChangeSet>;

    /// Remove every geofence.
    fn clear(&self) -> Result<()>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Center point of a geofence in the R-tree, as `[lng, lat]`.
#[derive(Debug, Clone, PartialEq)]
struct CenterEntry {
    code: String,
    position: [f64; 2],
}

impl CenterEntry {
    fn of(geofence: &Geofence) -> Self {
        Self {
            code: geofence.code.clone(),
            position: [geofence.longitude, geofence.latitude],
        }
    }
}

impl RTreeObject for CenterEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, Geofence>,
    index: RTree<CenterEntry>,
}

impl MemoryInner {
    fn upsert(&mut self, geofence: &Geofence) -> UpsertOutcome {
        match self.records.get_mut(&geofence.code) {
            Some(existing) => {
                let old_entry = CenterEntry::of(existing);
                if !existing.apply_update(geofence) {
                    return UpsertOutcome::Unchanged;
                }
                let new_entry = CenterEntry::of(existing);
                if old_entry != new_entry {
                    self.index.remove(&old_entry);
                    self.index.insert(new_entry);
                }
                UpsertOutcome::Updated
            }
            None => {
                self.index.insert(CenterEntry::of(geofence));
                self.records.insert(geofence.code.clone(), geofence.clone());
                UpsertOutcome::Inserted
            }
        }
    }

    fn delete(&mut self, code: &str) -> bool {
        match self.records.remove(code) {
            Some(removed) => {
                self.index.remove(&CenterEntry::of(&removed));
                true
            }
            None => false,
        }
    }
}

/// Geofence store held in memory, indexed by an R-tree over centers.
#[derive(Default)]
pub struct MemoryGeofenceStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryGeofenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-filled with `geofences`.
    pub fn with_geofences(geofences: &[Geofence]) -> Self {
        let store = Self::new();
        {
            let mut inner = store.write();
            for geofence in geofences {
                inner.upsert(geofence);
            }
        }
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryInner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sorted_by_code(mut geofences: Vec<Geofence>) -> Vec<Geofence> {
    geofences.sort_by(|a, b| a.code.cmp(&b.code));
    geofences
}

impl GeofenceStore for MemoryGeofenceStore {
    fn upsert(&self, geofence: &Geofence) -> Result<UpsertOutcome> {
        geofence.validate()?;
        Ok(self.write().upsert(geofence))
    }

    fn get(&self, code: &str) -> Result<Option<Geofence>> {
        Ok(self.read().records.get(code).cloned())
    }

    fn find_in_bounding_box(&self, bbox: &BoundingBox) -> Result<Vec<Geofence>> {
        let inner = self.read();
        let envelope = AABB::from_corners([bbox.min_lng, bbox.min_lat], [bbox.max_lng, bbox.max_lat]);
        let found = inner
            .index
            .locate_in_envelope(&envelope)
            .filter_map(|entry| inner.records.get(&entry.code).cloned())
            .collect();
        Ok(sorted_by_code(found))
    }

    fn find_by_codes(&self, codes: &[String]) -> Result<Vec<Geofence>> {
        let inner = self.read();
        let mut seen = HashSet::new();
        Ok(codes
            .iter()
            .filter(|code| seen.insert(code.as_str()))
            .filter_map(|code| inner.records.get(code).cloned())
            .collect())
    }

    fn delete_by_codes(&self, codes: &[String]) -> Result<usize> {
        let mut inner = self.write();
        Ok(codes.iter().filter(|code| inner.delete(code)).count())
    }

    fn all(&self) -> Result<Vec<Geofence>> {
        Ok(sorted_by_code(self.read().records.values().cloned().collect()))
    }

    fn count(&self) -> Result<usize> {
        Ok(self.read().records.len())
    }

    fn apply_changes(&self, upserts: &[Geofence], deleted: &[String]) -> Result<ChangeSet> {
        // Validate the whole batch first so a bad record leaves the store untouched
        for geofence in upserts {
            geofence.validate()?;
        }

        let mut inner = self.write();
        let mut changes = ChangeSet::default();
        for geofence in upserts {
            match inner.upsert(geofence) {
                UpsertOutcome::Inserted => changes.inserted.push(geofence.clone()),
                UpsertOutcome::Updated => changes.updated.push(geofence.clone()),
                UpsertOutcome::Unchanged => {}
            }
        }
        for code in deleted {
            if inner.delete(code) {
                changes.deleted.push(code.clone());
            }
        }

        // A code that was upserted and then deleted is only reported as deleted
        if !changes.deleted.is_empty() {
            let gone: HashSet<&str> = changes.deleted.iter().map(String::as_str).collect();
            changes.inserted.retain(|g| !gone.contains(g.code.as_str()));
            changes.updated.retain(|g| !gone.contains(g.code.as_str()));
        }

        debug!(
            "[MemoryGeofenceStore] Applied batch: {} inserted, {} updated, {} deleted",
            changes.inserted.len(),
            changes.updated.len(),
            changes.deleted.len()
        );
        Ok(changes)
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.write();
        inner.records.clear();
        inner.index = RTree::new();
        Ok(())
    }
}
