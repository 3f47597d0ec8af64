//! The generation the policy engine reads from, and leases on it.
//!
//! A request or refresh cycle takes a [`GenerationLease`] (a shared read guard
//! on the slot) and keeps it for its whole duration. Reclaiming a superseded
//! slot takes the write side first, so storage is only deleted once every
//! lease taken before the switch has been dropped. A lease taken after the
//! switch always lands on the new slot.
//!
//! A generation that is being installed, or is installed and waiting to be
//! activated, is pinned here. Stale-generation sweeps skip pinned ids.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};

use offgrid_core::{CacheDb, Error, GenerationId};

/// One activated generation.
#[derive(Debug)]
pub struct GenerationSlot {
    id: GenerationId,
    gate: Arc<RwLock<()>>,
    reclaimed: AtomicBool,
}

impl GenerationSlot {
    fn new(id: GenerationId) -> Self {
        Self { id, gate: Arc::new(RwLock::new(())), reclaimed: AtomicBool::new(false) }
    }

    pub fn id(&self) -> &GenerationId {
        &self.id
    }

    /// Wait for every outstanding lease, then delete the generation.
    ///
    /// Returns whether the store removed it; an active generation is never removed.
    pub async fn reclaim(&self, db: &CacheDb) -> Result<bool, Error> {
        let _exclusive = self.gate.write().await;
        self.reclaimed.store(true, Ordering::SeqCst);
        db.delete_generation(&self.id).await
    }
}

/// Shared access to a generation that cannot be reclaimed while held.
#[derive(Debug)]
pub struct GenerationLease {
    id: GenerationId,
    _guard: OwnedRwLockReadGuard<()>,
}

impl GenerationLease {
    pub fn id(&self) -> &GenerationId {
        &self.id
    }
}

/// Pointer to the active slot plus an install epoch.
///
/// The epoch changes whenever a new install starts; a refresh cycle that
/// observes a different epoch than the one it started with stops starting
/// new fetches.
#[derive(Debug, Default)]
pub struct ActiveGeneration {
    current: RwLock<Option<Arc<GenerationSlot>>>,
    epoch: AtomicU64,
    pinned: Mutex<BTreeMap<GenerationId, usize>>,
}

impl ActiveGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease the active generation, or `None` when nothing is active.
    pub async fn lease(&self) -> Option<GenerationLease> {
        loop {
            let slot = self.current.read().await.clone()?;
            let guard = slot.gate.clone().read_owned().await;
            if slot.reclaimed.load(Ordering::SeqCst) {
                // Swapped out and reclaimed while we waited; retry on the new slot.
                drop(guard);
                continue;
            }
            return Some(GenerationLease { id: slot.id.clone(), _guard: guard });
        }
    }

    pub async fn current_id(&self) -> Option<GenerationId> {
        self.current.read().await.as_ref().map(|slot| slot.id.clone())
    }

    /// Point at `id`; returns the slot it replaced.
    ///
    /// Switching to the generation that is already current is a no-op.
    pub async fn switch_to(&self, id: GenerationId) -> Option<Arc<GenerationSlot>> {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|slot| slot.id == id) {
            return None;
        }
        current.replace(Arc::new(GenerationSlot::new(id)))
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Start a new install epoch.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Protect a not-yet-active generation from stale sweeps.
    ///
    /// Pins are counted; each [`pin`](Self::pin) needs one [`unpin`](Self::unpin).
    pub async fn pin(&self, id: GenerationId) {
        *self.pinned.lock().await.entry(id).or_default() += 1;
    }

    pub async fn unpin(&self, id: &GenerationId) {
        let mut pinned = self.pinned.lock().await;
        if let Some(count) = pinned.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(id);
            }
        }
    }

    pub async fn is_pinned(&self, id: &GenerationId) -> bool {
        self.pinned.lock().await.contains_key(id)
    }
}
