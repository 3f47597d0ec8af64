//! Offline resource cache controller.
//!
//! This crate provides the network seam, resource discovery, the fetch
//! policy engine, the refresh scheduler and the lifecycle controller, plus
//! the [`OfflineCache`] facade a host drives.

pub mod connectivity;
pub mod control;
pub mod controller;
pub mod extract;
pub mod fetch;
pub mod lifecycle;
pub mod policy;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use connectivity::{Connectivity, ConnectivityFlag};
pub use control::{ControlMessage, ControlReply, StatusReport};
pub use controller::OfflineCache;
pub use extract::{ExclusionRules, HtmlResourceExtractor, PageContext, PageLoader, ResourceExtractor};
pub use fetch::{FetchConfig, FetchResponse, HttpNetwork, Network, RequestKind, ResourceRequest};
pub use lifecycle::{ActiveGeneration, InstallReport, LifecycleController, LifecycleState};
pub use policy::{FetchPolicyEngine, PolicyConfig, PolicyResponse, ResponseSource};
pub use scheduler::{BatchReport, CycleReport, FailedResource, RefreshScheduler, SkipReason};
