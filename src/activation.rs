//! Message passing between activation contexts.
//!
//! An [`Activation`] is a self-contained, serializable unit of work: it
//! carries the [`ServiceConfig`] needed to rebuild a [`GeofenceEngine`], so it
//! can cross a process or thread boundary as JSON and be run by whichever
//! context receives it. In-process, activations travel over a tokio channel
//! to an [`ActivationWorker`] that runs each one on a fresh engine.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dispatcher::TransitionEvent;
use crate::engine::{Collaborators, GeofenceEngine, MonitoringOutcome};
use crate::native::TransitionKind;
use crate::sync::SyncResult;
use crate::{GeofenceError, Location, Result, ServiceConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activation {
    Sync {
        config: ServiceConfig,
        force: bool,
    },
    LocationUpdate {
        config: ServiceConfig,
        location: Location,
    },
    NativeTransition {
        config: ServiceConfig,
        kind: TransitionKind,
        region_ids: Vec<String>,
    },
    BootCompleted {
        config: ServiceConfig,
    },
    RefreshMonitoring {
        config: ServiceConfig,
        force: bool,
    },
}

impl Activation {
    pub fn config(&self) -> &ServiceConfig {
        match self {
            Activation::Sync { config, .. }
            | Activation::LocationUpdate { config, .. }
            | Activation::NativeTransition { config, .. }
            | Activation::BootCompleted { config }
            | Activation::RefreshMonitoring { config, .. } => config,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Sync { .. } => "sync",
            Activation::LocationUpdate { .. } => "location_update",
            Activation::NativeTransition { .. } => "native_transition",
            Activation::BootCompleted { .. } => "boot_completed",
            Activation::RefreshMonitoring { .. } => "refresh_monitoring",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// What running one activation produced.
#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    Monitoring(MonitoringOutcome),
    /// `None` when the sync was skipped
    Sync(Option<SyncResult>),
    Transition(Option<TransitionEvent>),
}

/// Build a fresh engine from the activation's config and run it.
pub async fn run_activation(
    collaborators: &Collaborators,
    activation: Activation,
) -> Result<ActivationOutcome> {
    debug!("[ActivationWorker] Running {}", activation.name());
    let engine = GeofenceEngine::new(activation.config().clone(), collaborators.clone())?;

    match activation {
        Activation::Sync { force, .. } => engine.sync(force).await.map(ActivationOutcome::Sync),
        Activation::LocationUpdate { location, .. } => engine
            .on_location_update(&location)
            .map(ActivationOutcome::Monitoring),
        Activation::NativeTransition {
            kind, region_ids, ..
        } => engine
            .on_native_transition(kind, &region_ids)
            .map(ActivationOutcome::Transition),
        Activation::BootCompleted { .. } => engine
            .on_boot_completed()
            .map(ActivationOutcome::Monitoring),
        Activation::RefreshMonitoring { force, .. } => engine
            .refresh_monitoring(force)
            .map(ActivationOutcome::Monitoring),
    }
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Clone)]
pub struct ActivationSender {
    tx: mpsc::UnboundedSender<Activation>,
}

impl ActivationSender {
    /// Fails once the worker has been dropped.
    pub fn send(&self, activation: Activation) -> Result<()> {
        self.tx.send(activation).map_err(|e| GeofenceError::Internal {
            message: format!("activation worker is gone, dropped {}", e.0.name()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct ActivationWorker {
    rx: mpsc::UnboundedReceiver<Activation>,
    collaborators: Collaborators,
}

pub fn activation_channel(collaborators: Collaborators) -> (ActivationSender, ActivationWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ActivationSender { tx },
        ActivationWorker { rx, collaborators },
    )
}

impl ActivationWorker {
    /// Run every received activation as its own task until all senders are
    /// dropped. Activations do not wait for each other.
    pub async fn run(mut self) {
        info!("[ActivationWorker] Started");
        while let Some(activation) = self.rx.recv().await {
            let collaborators = self.collaborators.clone();
            tokio::spawn(async move {
                let name = activation.name();
                if let Err(e) = run_activation(&collaborators, activation).await {
                    warn!("[ActivationWorker] {} failed: {}", name, e);
                }
            });
        }
        info!("[ActivationWorker] All senders dropped, stopping");
    }

    /// Receive and run the next activation inline. `None` once all senders
    /// are dropped.
    pub async fn process_next(&mut self) -> Option<Result<ActivationOutcome>> {
        let activation = self.rx.recv().await?;
        Some(run_activation(&self.collaborators, activation).await)
    }
}

/// Send a non-forced [`Activation::Sync`] every `period`, starting immediately.
///
/// Must be called from within a tokio runtime. The task ends when the worker
/// is gone; abort the handle to stop it earlier.
pub fn spawn_sync_timer(
    sender: ActivationSender,
    config: ServiceConfig,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let activation = Activation::Sync {
                config: config.clone(),
                force: false,
            };
            if sender.send(activation).is_err() {
                debug!("[SyncTimer] Worker gone, stopping");
                break;
            }
        }
    })
}
