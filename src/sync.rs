//! Incremental server sync.
//!
//! A sync fetches every page of the delta since the stored cursor, parses all
//! of them, and only then applies the whole delta to the store in one batch.
//! A failure anywhere before the apply leaves the store and the cursor as
//! they were, so the next attempt retries the same window.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::dispatcher::CallbackRegistry;
use crate::store::GeofenceStore;
use crate::transport::{RestRequest, RestTransport};
use crate::wire::{parse_sync_page, ParsedPage};
use crate::{Geofence, GeofenceError, Result, ServiceConfig, Settings};

/// Upper bound on pages per sync; a server that keeps reporting more
/// features than it sends would otherwise loop forever.
const MAX_SYNC_PAGES: usize = 1_000;

/// Persisted sync progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Opaque server token echoed back as `lastSyncDate`
    pub last_sync_date: Option<String>,
    /// Local time of the last successful sync (epoch millis)
    pub last_sync_local_timestamp: Option<i64>,
}

/// What one successful sync did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    /// Inserted and updated geofences
    pub changed: Vec<Geofence>,
    /// Codes that existed and were deleted
    pub deleted: Vec<String>,
    pub last_sync_date: Option<String>,
    pub pages: usize,
    /// Features received across all pages
    pub received: usize,
}

impl SyncResult {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty() || !self.deleted.is_empty()
    }
}

pub struct SyncEngine {
    store: Arc<dyn GeofenceStore>,
    settings: Settings,
    transport: Arc<dyn RestTransport>,
    callbacks: Arc<CallbackRegistry>,
    config: ServiceConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn GeofenceStore>,
        settings: Settings,
        transport: Arc<dyn RestTransport>,
        callbacks: Arc<CallbackRegistry>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            settings,
            transport,
            callbacks,
            config,
        }
    }

    pub fn cursor(&self) -> Result<SyncCursor> {
        self.settings.sync_cursor()
    }

    /// Whether an automatic sync is due at `now_ms`.
    pub fn should_sync(&self, now_ms: i64) -> Result<bool> {
        if self.store.count()? == 0 {
            return Ok(true);
        }
        let due = match self.cursor()?.last_sync_local_timestamp {
            None => true,
            Some(last) => now_ms - last >= self.config.min_sync_interval_millis(),
        };
        Ok(due)
    }

    /// Fetch, parse and apply the delta since the stored cursor.
    pub async fn sync_now(&self, now_ms: i64) -> Result<SyncResult> {
        self.config.validate_for_network()?;

        let cursor = self.cursor()?;
        let pages = self.fetch_pages(&cursor).await?;
        let result = self.apply_delta(pages, &cursor, now_ms)?;

        if result.has_changes() {
            self.callbacks.notify_sync(&result.changed, &result.deleted);
        }

        info!(
            "[SyncEngine] Sync complete: {} pages, {} received, {} changed, {} deleted",
            result.pages,
            result.received,
            result.changed.len(),
            result.deleted.len()
        );
        Ok(result)
    }

    /// Forget the cursor; the next sync fetches everything.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.settings.lock();
        self.settings.set_sync_cursor(&SyncCursor::default())?;
        info!("[SyncEngine] Sync cursor reset");
        Ok(())
    }

    fn page_request(&self, cursor: &SyncCursor, start_index: u64) -> RestRequest {
        let mut request = RestRequest::get(self.config.sync_path());
        if let Some(date) = &cursor.last_sync_date {
            request = request.with_param("lastSyncDate", date);
        }
        request
            .with_param("startIndex", start_index)
            .with_param("maxFeatures", self.config.sync_page_size.max(1))
            .with_basic_auth(self.config.basic_auth())
    }

    async fn fetch_pages(&self, cursor: &SyncCursor) -> Result<Vec<ParsedPage>> {
        let mut pages = Vec::new();
        let mut start_index: u64 = 0;

        loop {
            if pages.len() >= MAX_SYNC_PAGES {
                return Err(GeofenceError::parse(format!(
                    "sync did not converge after {} pages",
                    MAX_SYNC_PAGES
                )));
            }

            let body = self
                .transport
                .execute(self.page_request(cursor, start_index))
                .await
                .map_err(|e| {
                    warn!("[SyncEngine] Page at {} failed: {}", start_index, e);
                    e
                })?;
            let page = parse_sync_page(body)?;

            let received = page.geofences.len() as u64;
            let total = page.total_features;
            debug!(
                "[SyncEngine] Page at {}: {} features (total {:?})",
                start_index, received, total
            );
            pages.push(page);

            start_index += received;
            let more = match total {
                Some(total) => received > 0 && start_index < total,
                None => false,
            };
            if !more {
                return Ok(pages);
            }
        }
    }

    /// Apply parsed pages and advance the cursor, under the activation lock.
    fn apply_delta(&self, pages: Vec<ParsedPage>, cursor: &SyncCursor, now_ms: i64) -> Result<SyncResult> {
        let page_count = pages.len();
        let mut upserts = Vec::new();
        let mut deleted = Vec::new();
        let mut seen_deleted = HashSet::new();
        let mut last_sync_date = None;

        for page in pages {
            upserts.extend(page.geofences);
            for code in page.deleted {
                if seen_deleted.insert(code.clone()) {
                    deleted.push(code);
                }
            }
            if page.last_sync_date.is_some() {
                last_sync_date = page.last_sync_date;
            }
        }
        let received = upserts.len();

        let _guard = self.settings.lock();
        let changes = self.store.apply_changes(&upserts, &deleted)?;

        let next = SyncCursor {
            last_sync_date: last_sync_date.or_else(|| cursor.last_sync_date.clone()),
            last_sync_local_timestamp: Some(now_ms),
        };
        self.settings.set_sync_cursor(&next)?;

        Ok(SyncResult {
            changed: changes.changed(),
            deleted: changes.deleted,
            last_sync_date: next.last_sync_date,
            pages: page_count,
            received,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::GeofenceCallback;
    use crate::wire::SyncPage;
    use crate::{MemoryGeofenceStore, MemorySettingsStore};
    use futures::future::BoxFuture;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const HOUR: i64 = 3_600_000;

    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<Result<Value>>>,
        requests: Mutex<Vec<RestRequest>>,
    }

    impl Scripted {
        fn push(&self, response: Result<Value>) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    impl RestTransport for Scripted {
        fn execute(&self, request: RestRequest) -> BoxFuture<'_, Result<Value>> {
            self.requests.lock().unwrap().push(request);
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GeofenceError::network("no scripted response")));
            Box::pin(async move { response })
        }
    }

    #[derive(Default)]
    struct SyncEvents(Mutex<Vec<(Vec<String>, Vec<String>)>>);

    impl GeofenceCallback for SyncEvents {
        fn on_geofences_enter(&self, _geofences: &[Geofence]) {}
        fn on_geofences_exit(&self, _geofences: &[Geofence]) {}
        fn on_geofences_sync(&self, changed: &[Geofence], deleted: &[String]) {
            self.0.lock().unwrap().push((
                changed.iter().map(|g| g.code.clone()).collect(),
                deleted.to_vec(),
            ));
        }
    }

    struct Harness {
        store: Arc<MemoryGeofenceStore>,
        settings: Settings,
        transport: Arc<Scripted>,
        events: Arc<SyncEvents>,
        engine: SyncEngine,
    }

    fn harness(page_size: u32) -> Harness {
        let store = Arc::new(MemoryGeofenceStore::new());
        let settings = Settings::new(Arc::new(MemorySettingsStore::new()));
        let transport = Arc::new(Scripted::default());
        let callbacks = Arc::new(CallbackRegistry::new());
        let events = Arc::new(SyncEvents::default());
        callbacks.register(events.clone());
        let config = ServiceConfig {
            sync_page_size: page_size,
            ..ServiceConfig::new("https://geo.example.com", "t", "o")
        };
        let engine = SyncEngine::new(
            store.clone(),
            settings.clone(),
            transport.clone(),
            callbacks,
            config,
        );
        Harness {
            store,
            settings,
            transport,
            events,
            engine,
        }
    }

    fn gf(code: &str) -> Geofence {
        Geofence::new(code, code, 1.0, 1.0, 100.0)
    }

    #[tokio::test]
    async fn test_paginates_until_total() {
        let h = harness(2);
        h.transport.push(Ok(SyncPage::new(&[gf("a"), gf("b")], &[])
            .with_total_features(3)
            .to_value()));
        h.transport.push(Ok(SyncPage::new(&[gf("c")], &[])
            .with_total_features(3)
            .with_last_sync_date("cursor-1")
            .to_value()));

        let result = h.engine.sync_now(1_000).await.unwrap();
        assert_eq!(result.pages, 2);
        assert_eq!(result.changed.len(), 3);
        assert_eq!(h.store.count().unwrap(), 3);

        let requests = h.transport.requests.lock().unwrap();
        assert_eq!(requests[0].param("startIndex"), Some("0"));
        assert_eq!(requests[0].param("maxFeatures"), Some("2"));
        assert_eq!(requests[0].param("lastSyncDate"), None);
        assert_eq!(requests[1].param("startIndex"), Some("2"));

        let cursor = h.settings.sync_cursor().unwrap();
        assert_eq!(cursor.last_sync_date.as_deref(), Some("cursor-1"));
        assert_eq!(cursor.last_sync_local_timestamp, Some(1_000));
    }

    #[tokio::test]
    async fn test_sends_cursor_and_broadcasts_deletes() {
        let h = harness(500);
        h.store.upsert(&gf("old")).unwrap();
        h.settings
            .set_sync_cursor(&SyncCursor {
                last_sync_date: Some("cursor-0".to_string()),
                last_sync_local_timestamp: Some(0),
            })
            .unwrap();
        h.transport.push(Ok(SyncPage::new(&[gf("new")], &["old".to_string()])
            .with_last_sync_date("cursor-1")
            .to_value()));

        let result = h.engine.sync_now(5 * HOUR).await.unwrap();
        assert!(result.has_changes());
        assert_eq!(
            h.transport.requests.lock().unwrap()[0].param("lastSyncDate"),
            Some("cursor-0")
        );
        assert_eq!(
            *h.events.0.lock().unwrap(),
            vec![(vec!["new".to_string()], vec!["old".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_failed_page_leaves_store_and_cursor() {
        let h = harness(1);
        h.transport.push(Ok(SyncPage::new(&[gf("a")], &[])
            .with_total_features(2)
            .to_value()));
        h.transport.push(Err(GeofenceError::Network {
            message: "connection reset".to_string(),
            status_code: None,
        }));

        let err = h.engine.sync_now(1_000).await.unwrap_err();
        assert!(matches!(err, GeofenceError::Network { .. }));
        assert_eq!(h.store.count().unwrap(), 0);
        assert_eq!(h.settings.sync_cursor().unwrap(), SyncCursor::default());
        assert!(h.events.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_delta_does_not_broadcast() {
        let h = harness(500);
        h.store.upsert(&gf("a")).unwrap();
        h.transport
            .push(Ok(SyncPage::new(&[gf("a")], &["never-seen".to_string()]).to_value()));

        let result = h.engine.sync_now(1_000).await.unwrap();
        assert!(!result.has_changes());
        assert!(h.events.0.lock().unwrap().is_empty());
        // The cursor still advances
        assert_eq!(
            h.settings.sync_cursor().unwrap().last_sync_local_timestamp,
            Some(1_000)
        );
    }

    #[tokio::test]
    async fn test_missing_server_config_is_config_error() {
        let store = Arc::new(MemoryGeofenceStore::new());
        let engine = SyncEngine::new(
            store,
            Settings::new(Arc::new(MemorySettingsStore::new())),
            Arc::new(Scripted::default()),
            Arc::new(CallbackRegistry::new()),
            ServiceConfig::default(),
        );
        assert!(engine.sync_now(0).await.unwrap_err().is_config());
    }

    #[test]
    fn test_should_sync() {
        let h = harness(500);
        // Empty store
        assert!(h.engine.should_sync(0).unwrap());

        h.store.upsert(&gf("a")).unwrap();
        // No local timestamp yet
        assert!(h.engine.should_sync(0).unwrap());

        h.settings
            .set_sync_cursor(&SyncCursor {
                last_sync_date: None,
                last_sync_local_timestamp: Some(10 * HOUR),
            })
            .unwrap();
        assert!(!h.engine.should_sync(33 * HOUR).unwrap());
        assert!(h.engine.should_sync(34 * HOUR).unwrap());

        h.engine.reset().unwrap();
        assert!(h.engine.should_sync(10 * HOUR).unwrap());
    }
}
