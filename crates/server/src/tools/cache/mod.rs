//! Cache inspection and cleanup tools.

pub mod get;
pub mod purge;

pub use get::{CachedEntryParams, cached_entry_impl, cached_resources_impl, storage_usage_impl};
pub use purge::{PurgeCacheParams, clear_cache_impl, purge_impl};
