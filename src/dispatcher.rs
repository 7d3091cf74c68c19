//! Transition fan-out.
//!
//! Native ENTER/EXIT deliveries are resolved against the store, recorded as
//! per-geofence presence, handed to every registered [`GeofenceCallback`] and
//! optionally reported to the server without waiting for the response.

use chrono::{DateTime, FixedOffset, Local};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::native::TransitionKind;
use crate::store::GeofenceStore;
use crate::transport::{RestRequest, RestTransport};
use crate::wire::EventPayload;
use crate::{Geofence, Result, ServiceConfig, Settings};

// ============================================================================
// Callbacks
// ============================================================================

/// Consumer of geofence events. Implementations must not block for long;
/// they run on the activation that delivered the event.
pub trait GeofenceCallback: Send + Sync {
    fn on_geofences_enter(&self, geofences: &[Geofence]);
    fn on_geofences_exit(&self, geofences: &[Geofence]);
    /// Geofences inserted or updated by a sync, and codes deleted.
    fn on_geofences_sync(&self, changed: &[Geofence], deleted: &[String]);
}

/// Handle returned by [`CallbackRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Registered consumers, notified in registration order.
///
/// A panicking consumer is logged and skipped; the others still run.
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(CallbackId, Arc<dyn GeofenceCallback>)>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: Arc<dyn GeofenceCallback>) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, callback));
        debug!("[CallbackRegistry] Registered callback {}", id.0);
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != id);
        before != callbacks.len()
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_enter(&self, geofences: &[Geofence]) {
        self.each("on_geofences_enter", |cb| cb.on_geofences_enter(geofences));
    }

    pub fn notify_exit(&self, geofences: &[Geofence]) {
        self.each("on_geofences_exit", |cb| cb.on_geofences_exit(geofences));
    }

    pub fn notify_sync(&self, changed: &[Geofence], deleted: &[String]) {
        self.each("on_geofences_sync", |cb| cb.on_geofences_sync(changed, deleted));
    }

    fn each(&self, method: &str, call: impl Fn(&dyn GeofenceCallback)) {
        // Snapshot so callbacks may register/unregister without deadlocking
        let snapshot: Vec<(CallbackId, Arc<dyn GeofenceCallback>)> = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| call(callback.as_ref()))).is_err() {
                warn!("[CallbackRegistry] Callback {} panicked in {}", id.0, method);
            }
        }
    }
}

// ============================================================================
// Presence and events
// ============================================================================

/// Last known relation of the device to a geofence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum PresenceState {
    #[default]
    Unmonitored,
    Outside,
    Inside,
}

impl From<TransitionKind> for PresenceState {
    fn from(kind: TransitionKind) -> Self {
        match kind {
            TransitionKind::Enter => PresenceState::Inside,
            TransitionKind::Exit => PresenceState::Outside,
        }
    }
}

/// One native delivery, resolved to stored geofences.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub kind: TransitionKind,
    pub geofences: Vec<Geofence>,
    pub detected_at: DateTime<FixedOffset>,
}

impl TransitionEvent {
    pub fn codes(&self) -> Vec<String> {
        self.geofences.iter().map(|g| g.code.clone()).collect()
    }
}

// ============================================================================
// Server notification
// ============================================================================

/// Run `future` to completion without waiting for it.
///
/// Spawned onto the current tokio runtime when there is one, otherwise onto a
/// dedicated thread with its own current-thread runtime.
pub fn spawn_detached<F>(name: &str, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
        return;
    }

    let thread_name = name.to_string();
    let spawned = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(future),
                Err(e) => warn!("[{}] Failed to create runtime: {}", thread_name, e),
            }
        });
    if let Err(e) = spawned {
        warn!("[{}] Failed to spawn thread: {}", name, e);
    }
}

/// Posts transition events to the server's event endpoint.
#[derive(Clone)]
pub struct EventNotifier {
    transport: Arc<dyn RestTransport>,
    config: ServiceConfig,
}

impl EventNotifier {
    pub fn new(transport: Arc<dyn RestTransport>, config: ServiceConfig) -> Self {
        Self { transport, config }
    }

    pub fn request(&self, event: &TransitionEvent) -> Result<RestRequest> {
        self.config.validate_for_network()?;
        let payload = EventPayload::new(
            event.kind,
            &event.geofences,
            &self.config.device_descriptor,
            &event.detected_at,
        );
        Ok(RestRequest::post(self.config.events_path(), payload.to_value()?)
            .with_basic_auth(self.config.basic_auth()))
    }

    /// Fire-and-forget POST; failures are only logged.
    pub fn post(&self, event: &TransitionEvent) {
        let request = match self.request(event) {
            Ok(request) => request,
            Err(e) => {
                warn!("[EventNotifier] Not posting {} event: {}", event.kind.as_str(), e);
                return;
            }
        };

        let transport = Arc::clone(&self.transport);
        let kind = event.kind;
        let count = event.geofences.len();
        spawn_detached("geofence-event-post", async move {
            match transport.execute(request).await {
                Ok(_) => debug!(
                    "[EventNotifier] Posted {} event for {} geofences",
                    kind.as_str(),
                    count
                ),
                Err(e) => warn!("[EventNotifier] Failed to post {} event: {}", kind.as_str(), e),
            }
        });
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct TransitionDispatcher {
    store: Arc<dyn GeofenceStore>,
    settings: Settings,
    callbacks: Arc<CallbackRegistry>,
    notifier: Option<EventNotifier>,
}

impl TransitionDispatcher {
    pub fn new(
        store: Arc<dyn GeofenceStore>,
        settings: Settings,
        callbacks: Arc<CallbackRegistry>,
        notifier: Option<EventNotifier>,
    ) -> Self {
        Self {
            store,
            settings,
            callbacks,
            notifier,
        }
    }

    pub fn presence(&self, code: &str) -> Result<PresenceState> {
        Ok(self
            .settings
            .presence()?
            .get(code)
            .copied()
            .unwrap_or_default())
    }

    /// Handle one native delivery.
    ///
    /// Unknown ids are dropped; `None` when nothing known remains. Takes the
    /// settings activation lock to record presence.
    pub fn on_native_transition(
        &self,
        kind: TransitionKind,
        region_ids: &[String],
    ) -> Result<Option<TransitionEvent>> {
        let geofences = self.store.find_by_codes(region_ids)?;
        if geofences.len() < region_ids.len() {
            debug!(
                "[TransitionDispatcher] {} of {} region ids resolved",
                geofences.len(),
                region_ids.len()
            );
        }
        if geofences.is_empty() {
            return Ok(None);
        }

        self.record_presence(kind, &geofences)?;

        let event = TransitionEvent {
            kind,
            geofences,
            detected_at: Local::now().fixed_offset(),
        };
        info!(
            "[TransitionDispatcher] {} for {} geofences",
            kind.as_str(),
            event.geofences.len()
        );

        match kind {
            TransitionKind::Enter => self.callbacks.notify_enter(&event.geofences),
            TransitionKind::Exit => self.callbacks.notify_exit(&event.geofences),
        }

        if let Some(notifier) = &self.notifier {
            notifier.post(&event);
        }

        Ok(Some(event))
    }

    fn record_presence(&self, kind: TransitionKind, geofences: &[Geofence]) -> Result<()> {
        let _guard = self.settings.lock();
        let mut presence = self.settings.presence()?;
        let state = PresenceState::from(kind);
        for geofence in geofences {
            presence.insert(geofence.code.clone(), state);
        }
        self.settings.set_presence(&presence)
    }
}
