//! Observability sink shared by every controller component.
//!
//! Components report what they did through [`EventSink::on_event`] instead of
//! logging directly, so a host can route events wherever it wants.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Kinds of events the controller emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A request was answered from the store.
    CacheHit,
    /// A lookup found no entry.
    CacheMiss,
    /// A network response was written to the store.
    Stored,
    /// A network response was returned but not stored.
    NotStored,
    /// A request bypassed the policy (non-GET, uncacheable URL).
    PassThrough,
    /// A network fetch failed or timed out.
    NetworkFailed,
    /// Persisting an entry failed; the response was still delivered.
    StoreWriteFailed,
    /// An unavailable or offline-page result was synthesized.
    Fallback,
    /// A discovered reference was dropped (unresolvable, excluded, foreign).
    ReferenceDropped,
    /// A refresh cycle began.
    CycleStarted,
    /// A refresh cycle was skipped (offline, already running, no generation).
    CycleSkipped,
    /// A refresh cycle finished.
    CycleFinished,
    /// Lifecycle state changed.
    Lifecycle,
    /// A superseded generation was deleted.
    GenerationReclaimed,
    /// Entries were evicted to respect the entry cap.
    Evicted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CacheHit => "cache_hit",
            EventKind::CacheMiss => "cache_miss",
            EventKind::Stored => "stored",
            EventKind::NotStored => "not_stored",
            EventKind::PassThrough => "pass_through",
            EventKind::NetworkFailed => "network_failed",
            EventKind::StoreWriteFailed => "store_write_failed",
            EventKind::Fallback => "fallback",
            EventKind::ReferenceDropped => "reference_dropped",
            EventKind::CycleStarted => "cycle_started",
            EventKind::CycleSkipped => "cycle_skipped",
            EventKind::CycleFinished => "cycle_finished",
            EventKind::Lifecycle => "lifecycle",
            EventKind::GenerationReclaimed => "generation_reclaimed",
            EventKind::Evicted => "evicted",
        }
    }
}

/// Receives controller events.
pub trait EventSink: Send + Sync {
    fn on_event(&self, kind: EventKind, detail: &str);
}

/// Forwards events to `tracing` with a level chosen per kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, kind: EventKind, detail: &str) {
        let name = kind.as_str();
        match kind {
            EventKind::NetworkFailed | EventKind::StoreWriteFailed | EventKind::ReferenceDropped => {
                tracing::warn!(event = name, "{detail}")
            }
            EventKind::Lifecycle | EventKind::GenerationReclaimed | EventKind::CycleFinished | EventKind::Evicted => {
                tracing::info!(event = name, "{detail}")
            }
            _ => tracing::debug!(event = name, "{detail}"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(EventKind, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first.
    pub fn events(&self) -> Vec<(EventKind, String)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of recorded events of `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|(k, _)| *k == kind).count())
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn on_event(&self, kind: EventKind, detail: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push((kind, detail.to_string()));
        }
    }
}
