//! Lifecycle controller: install, activate and reclaim cache generations.
//!
//! ### States
//! `Installing -> Installed -> Activating -> Active -> Superseded`
//!
//! - Install populates a new generation and never touches the active one.
//!   Individual resource failures are recorded; failing to open the
//!   generation at all aborts the install with [`Error::StoreOpen`].
//! - Activation moves the store's active flag and the in-process slot. A
//!   request sees either the old generation or the new one, never a mix.
//! - After activation the replaced generation is reclaimed once its leases
//!   drain, then any other inactive generation of the same name left on disk.
//!   A generation stays pinned from the start of its install until it is
//!   activated or abandoned, and the sweep never deletes a pinned one.
//! - A controller whose generation was replaced by a newer one reports
//!   `Superseded`.

mod active;

pub use active::{ActiveGeneration, GenerationLease, GenerationSlot};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use offgrid_core::{CacheDb, Error, EventKind, EventSink, GenerationId, NormalizePolicy, ResourceRef};

use crate::scheduler::{BatchReport, EpochWatch, RefreshScheduler, discover};

/// Where a controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Installing,
    Installed,
    Activating,
    Active,
    Superseded,
}

/// Outcome of [`LifecycleController::install`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallReport {
    pub generation: GenerationId,
    /// The generation was already active on disk and was not repopulated.
    pub resumed: bool,
    /// Distinct resources found on the pages plus the configured extras.
    pub resources: usize,
    pub batch: BatchReport,
    pub activated: bool,
}

/// Manages one generation from install to supersession.
pub struct LifecycleController {
    generation: GenerationId,
    db: CacheDb,
    active: Arc<ActiveGeneration>,
    scheduler: Arc<RefreshScheduler>,
    events: Arc<dyn EventSink>,
    pages: Vec<ResourceRef>,
    resources: Vec<ResourceRef>,
    skip_waiting: bool,
    state: Mutex<LifecycleState>,
    reclaim: Mutex<Option<JoinHandle<Vec<GenerationId>>>>,
}

impl LifecycleController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generation: GenerationId, db: CacheDb, active: Arc<ActiveGeneration>, scheduler: Arc<RefreshScheduler>,
        events: Arc<dyn EventSink>, pages: Vec<ResourceRef>, resources: Vec<ResourceRef>, skip_waiting: bool,
    ) -> Self {
        Self {
            generation,
            db,
            active,
            scheduler,
            events,
            pages,
            resources,
            skip_waiting,
            state: Mutex::new(LifecycleState::Installing),
            reclaim: Mutex::new(None),
        }
    }

    pub fn generation(&self) -> &GenerationId {
        &self.generation
    }

    /// Current state; an active controller whose generation was replaced is `Superseded`.
    pub async fn state(&self) -> LifecycleState {
        let mut state = self.state.lock().await;
        if *state == LifecycleState::Active && self.active.current_id().await.as_ref() != Some(&self.generation) {
            *state = LifecycleState::Superseded;
        }
        *state
    }

    async fn transition(&self, to: LifecycleState) {
        *self.state.lock().await = to;
        self.events
            .on_event(EventKind::Lifecycle, &format!("{}: {:?}", self.generation, to));
    }

    /// Populate this controller's generation, then activate it when allowed.
    pub async fn install(&self) -> Result<InstallReport, Error> {
        {
            let state = self.state.lock().await;
            if *state != LifecycleState::Installing {
                return Err(Error::InvalidState(format!("{}: install from {:?}", self.generation, *state)));
            }
        }

        self.active.pin(self.generation.clone()).await;
        let result = self.install_pinned().await;
        if result.is_err() {
            self.active.unpin(&self.generation).await;
        }
        result
    }

    async fn install_pinned(&self) -> Result<InstallReport, Error> {
        self.active.advance_epoch();
        let watch = EpochWatch::new(self.active.clone());

        self.db
            .open_generation(&self.generation)
            .await
            .map_err(|e| Error::StoreOpen(format!("{}: {e}", self.generation)))?;

        self.scheduler.register_pages(self.pages.iter().cloned()).await;

        let resumed = self.db.active_generation(&self.generation.name).await? == Some(self.generation.clone());
        let mut report = InstallReport {
            generation: self.generation.clone(),
            resumed,
            resources: 0,
            batch: BatchReport::default(),
            activated: false,
        };

        if resumed {
            tracing::info!("{} already active on disk; resuming without repopulating", self.generation);
            let stored = self.db.list_entries(&self.generation).await?;
            let known = stored
                .iter()
                .filter_map(|s| ResourceRef::parse(&s.url, NormalizePolicy { strip_query: false }).ok());
            self.scheduler.remember(known).await;
            self.scheduler.remember(self.resources.iter().cloned()).await;
        } else {
            let discovery = discover(self.scheduler.loader(), self.scheduler.extractor(), &self.pages).await;
            let mut found = discovery.found;
            found.extend(self.resources.iter().cloned());
            report.resources = found.len();

            let resources: Vec<ResourceRef> = found.iter().cloned().collect();
            self.scheduler.remember(found).await;
            report.batch = self
                .scheduler
                .populator()
                .populate(&self.generation, resources, Some(&watch))
                .await;
            report.batch.failed.extend(discovery.failed);
        }

        self.transition(LifecycleState::Installed).await;

        if resumed || self.skip_waiting || self.active.current_id().await.is_none() {
            self.activate().await?;
            report.activated = true;
        }

        Ok(report)
    }

    /// Make this controller's generation the one requests read from.
    pub async fn activate(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().await;
            if *state != LifecycleState::Installed {
                return Err(Error::InvalidState(format!("{}: activate from {:?}", self.generation, *state)));
            }
            *state = LifecycleState::Activating;
        }
        self.events
            .on_event(EventKind::Lifecycle, &format!("{}: Activating", self.generation));

        if let Err(e) = self.db.activate_generation(&self.generation).await {
            *self.state.lock().await = LifecycleState::Installed;
            return Err(e);
        }
        let previous = self.active.switch_to(self.generation.clone()).await;
        self.active.unpin(&self.generation).await;
        self.transition(LifecycleState::Active).await;

        let db = self.db.clone();
        let active = self.active.clone();
        let events = self.events.clone();
        let current = self.generation.clone();
        let handle = tokio::spawn(async move { reclaim(db, active, events, current, previous).await });
        *self.reclaim.lock().await = Some(handle);
        Ok(())
    }

    /// Wait for the reclamation started by [`activate`](Self::activate);
    /// returns the generations it deleted.
    pub async fn reclaimed(&self) -> Vec<GenerationId> {
        let handle = self.reclaim.lock().await.take();
        match handle {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                tracing::error!("reclaim task failed: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        }
    }
}

async fn reclaim(
    db: CacheDb, active: Arc<ActiveGeneration>, events: Arc<dyn EventSink>, current: GenerationId,
    previous: Option<Arc<GenerationSlot>>,
) -> Vec<GenerationId> {
    let mut deleted = Vec::new();

    if let Some(slot) = previous {
        match slot.reclaim(&db).await {
            Ok(true) => deleted.push(slot.id().clone()),
            Ok(false) => {}
            Err(e) => tracing::warn!("reclaiming {} failed: {}", slot.id(), e),
        }
    }

    match db.list_generations().await {
        Ok(generations) => {
            for info in generations {
                if info.active || info.id == current || info.id.name != current.name || deleted.contains(&info.id) {
                    continue;
                }
                if active.is_pinned(&info.id).await {
                    tracing::debug!("skipping {}: install in progress or awaiting activation", info.id);
                    continue;
                }
                match db.delete_generation(&info.id).await {
                    Ok(true) => deleted.push(info.id),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("deleting stale {} failed: {}", info.id, e),
                }
            }
        }
        Err(e) => tracing::warn!("listing generations for reclaim failed: {}", e),
    }

    for id in &deleted {
        events.on_event(EventKind::GenerationReclaimed, &id.to_string());
    }
    deleted
}
