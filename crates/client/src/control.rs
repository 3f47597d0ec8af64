//! Control messages a host sends to the controller, and their replies.

use serde::{Deserialize, Serialize};

use offgrid_core::{GenerationId, ResourceSummary, StorageUsage};

use crate::lifecycle::LifecycleState;
use crate::scheduler::{BatchReport, CycleReport};

/// A request from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Fetch and store these resources now and keep them current.
    CacheResources { resources: Vec<String> },
    /// Run a refresh cycle now.
    UpdateResources,
    /// Drop every entry of the active generation.
    ClearCache,
    GetCachedResources,
    GetStorageUsage,
    /// Register a page and store everything it needs.
    CachePage { url: String },
    ConnectivityChanged { online: bool },
    GetStatus,
}

/// Reply to a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ControlReply {
    Batch(BatchReport),
    Cycle(CycleReport),
    Cleared { entries: u64 },
    Resources(Vec<ResourceSummary>),
    Usage(StorageUsage),
    Ack,
    Status(StatusReport),
}

/// Snapshot of the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// State of the controller that owns the current generation.
    pub state: LifecycleState,
    pub generation: GenerationId,
    /// Generation requests read from right now.
    pub active: Option<GenerationId>,
    /// Installed generation waiting to take over.
    pub pending: Option<GenerationId>,
    pub pages: usize,
    /// Size of the working set.
    pub resources: usize,
    /// Host connectivity flag.
    pub online: bool,
    /// The scheduler paused itself after a cycle where only the network failed.
    pub refresh_paused: bool,
    pub refresh_running: bool,
}
