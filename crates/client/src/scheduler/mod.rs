//! Refresh scheduler.
//!
//! ### Cycle
//! 1. Skip when the host reports no connectivity, or the scheduler marked
//!    itself offline after a cycle in which only the network failed.
//! 2. Skip when another cycle is still running (ticks coalesce, never queue).
//! 3. Lease the active generation; skip when nothing is active.
//! 4. Load every registered page, extract, merge into the working set.
//! 5. Fetch and store the working set in a bounded batch.
//! 6. Evict oldest entries beyond `max_entries`.
//!
//! The self-imposed offline mark is cleared only by [`RefreshScheduler::notify_online`].

pub mod batch;

pub use batch::{BatchReport, EpochWatch, FailedResource, Populator};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use offgrid_core::{Error, EventKind, EventSink, ResourceRef};

use crate::connectivity::Connectivity;
use crate::extract::{PageLoader, ResourceExtractor};
use crate::lifecycle::ActiveGeneration;

/// Why a cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
    NoActiveGeneration,
}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    /// Pages loaded for discovery.
    pub pages: usize,
    /// Size of the working set fetched this cycle.
    pub resources: usize,
    pub batch: BatchReport,
    pub evicted: u64,
    /// The cycle left the scheduler marked offline.
    pub marked_offline: bool,
}

impl CycleReport {
    fn skipped(reason: SkipReason) -> Self {
        Self { skipped: Some(reason), ..Default::default() }
    }
}

/// Resources found on a set of pages.
#[derive(Debug, Default)]
pub struct Discovery {
    pub found: BTreeSet<ResourceRef>,
    /// Pages that could not be loaded.
    pub failed: Vec<FailedResource>,
}

/// Load each page and run the extractor over it.
///
/// A loaded page is kept under its configured address as well as the one it
/// redirected to, so navigations to either are served offline.
pub async fn discover(loader: &PageLoader, extractor: &dyn ResourceExtractor, pages: &[ResourceRef]) -> Discovery {
    let mut discovery = Discovery::default();
    for page in pages {
        match loader.load(page).await {
            Ok(context) => {
                discovery.found.insert(page.clone());
                discovery.found.extend(extractor.extract(&context));
            }
            Err(e) => {
                tracing::warn!("discovery on {} failed: {}", page, e);
                discovery.failed.push(FailedResource {
                    url: page.to_string(),
                    network: e.is_network_failure(),
                    error: e.to_string(),
                });
            }
        }
    }
    discovery
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Keeps the active generation current with the registered pages.
pub struct RefreshScheduler {
    populator: Populator,
    loader: PageLoader,
    extractor: Arc<dyn ResourceExtractor>,
    active: Arc<ActiveGeneration>,
    connectivity: Arc<dyn Connectivity>,
    events: Arc<dyn EventSink>,
    max_entries: Option<usize>,
    pages: Mutex<BTreeSet<ResourceRef>>,
    /// Every resource discovered or explicitly requested so far.
    working_set: Mutex<BTreeSet<ResourceRef>>,
    running: AtomicBool,
    marked_offline: AtomicBool,
}

impl RefreshScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        populator: Populator, loader: PageLoader, extractor: Arc<dyn ResourceExtractor>,
        active: Arc<ActiveGeneration>, connectivity: Arc<dyn Connectivity>, events: Arc<dyn EventSink>,
        max_entries: Option<usize>,
    ) -> Self {
        Self {
            populator,
            loader,
            extractor,
            active,
            connectivity,
            events,
            max_entries,
            pages: Mutex::new(BTreeSet::new()),
            working_set: Mutex::new(BTreeSet::new()),
            running: AtomicBool::new(false),
            marked_offline: AtomicBool::new(false),
        }
    }

    pub async fn register_pages(&self, pages: impl IntoIterator<Item = ResourceRef>) {
        self.pages.lock().await.extend(pages);
    }

    pub async fn remember(&self, resources: impl IntoIterator<Item = ResourceRef>) {
        self.working_set.lock().await.extend(resources);
    }

    pub async fn pages(&self) -> Vec<ResourceRef> {
        self.pages.lock().await.iter().cloned().collect()
    }

    pub async fn working_set(&self) -> Vec<ResourceRef> {
        self.working_set.lock().await.iter().cloned().collect()
    }

    /// Forget every discovered and requested resource. Pages stay registered.
    pub async fn forget_resources(&self) {
        self.working_set.lock().await.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_marked_offline(&self) -> bool {
        self.marked_offline.load(Ordering::SeqCst)
    }

    /// Explicit online signal from the host.
    pub fn notify_online(&self) {
        if self.marked_offline.swap(false, Ordering::SeqCst) {
            tracing::info!("scheduler offline mark cleared");
        }
    }

    pub(crate) fn loader(&self) -> &PageLoader {
        &self.loader
    }

    pub(crate) fn extractor(&self) -> &dyn ResourceExtractor {
        self.extractor.as_ref()
    }

    pub(crate) fn populator(&self) -> &Populator {
        &self.populator
    }

    fn skip(&self, reason: SkipReason) -> CycleReport {
        self.events.on_event(EventKind::CycleSkipped, &format!("{reason:?}"));
        CycleReport::skipped(reason)
    }

    /// Run one refresh cycle now.
    pub async fn run_cycle(&self) -> CycleReport {
        if !self.connectivity.is_online() || self.is_marked_offline() {
            return self.skip(SkipReason::Offline);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return self.skip(SkipReason::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let Some(lease) = self.active.lease().await else {
            return self.skip(SkipReason::NoActiveGeneration);
        };
        let watch = EpochWatch::new(self.active.clone());
        self.events.on_event(EventKind::CycleStarted, &lease.id().to_string());

        let pages = self.pages().await;
        let discovery = discover(&self.loader, self.extractor.as_ref(), &pages).await;
        let resources: Vec<ResourceRef> = {
            let mut working_set = self.working_set.lock().await;
            working_set.extend(discovery.found);
            working_set.iter().cloned().collect()
        };

        let mut report = CycleReport { pages: pages.len(), resources: resources.len(), ..Default::default() };
        report.batch = self.populator.populate(lease.id(), resources, Some(&watch)).await;
        report.batch.failed.extend(discovery.failed);

        if let Some(max) = self.max_entries {
            match self.populator.db.evict_oldest(lease.id(), max).await {
                Ok(0) => {}
                Ok(evicted) => {
                    report.evicted = evicted;
                    self.events
                        .on_event(EventKind::Evicted, &format!("{evicted} entries beyond {max}"));
                }
                Err(e) => tracing::warn!("eviction in {} failed: {}", lease.id(), e),
            }
        }

        if report.batch.all_network_failures() {
            self.marked_offline.store(true, Ordering::SeqCst);
            report.marked_offline = true;
            tracing::warn!("every fetch failed on the network; refresh paused until online");
        }

        self.events.on_event(
            EventKind::CycleFinished,
            &format!(
                "{}: {} updated, {} unchanged, {} failed",
                lease.id(),
                report.batch.updated,
                report.batch.unchanged,
                report.batch.failed.len()
            ),
        );
        report
    }

    /// Fetch and store `resources` into the active generation now, and keep
    /// them in the working set for later cycles.
    pub async fn cache_resources(&self, resources: Vec<ResourceRef>) -> Result<BatchReport, Error> {
        self.remember(resources.iter().cloned()).await;
        let lease = self
            .active
            .lease()
            .await
            .ok_or_else(|| Error::InvalidState("no active generation".into()))?;
        Ok(self.populator.populate(lease.id(), resources, None).await)
    }

    /// Register `page`, then discover and store everything it needs.
    pub async fn cache_page(&self, page: ResourceRef) -> Result<BatchReport, Error> {
        self.register_pages([page.clone()]).await;
        let lease = self
            .active
            .lease()
            .await
            .ok_or_else(|| Error::InvalidState("no active generation".into()))?;

        let discovery = discover(&self.loader, self.extractor.as_ref(), std::slice::from_ref(&page)).await;
        let resources: Vec<ResourceRef> = discovery.found.iter().cloned().collect();
        self.remember(discovery.found).await;

        let mut report = self.populator.populate(lease.id(), resources, None).await;
        report.failed.extend(discovery.failed);
        Ok(report)
    }

    /// Run a cycle every `interval` until the handle is aborted.
    ///
    /// The first tick is skipped; install has just populated the store.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.run_cycle().await;
                });
            }
        })
    }
}
