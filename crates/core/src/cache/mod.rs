//! SQLite-backed store for versioned cache generations.
//!
//! This module provides the durable Cache Store using SQLite with async
//! access via tokio-rusqlite. It supports:
//!
//! - Named, versioned generations with exactly one active version per name
//! - Upsert/get/delete of entries keyed by normalized resource ref
//! - Automatic schema migrations
//! - WAL mode for concurrent access
//! - Quota enforcement and oldest-first eviction

pub mod connection;
pub mod entries;
pub mod generations;
pub mod hash;
pub mod migrations;

pub use crate::Error;

pub use connection::CacheDb;
pub use entries::{CacheEntry, ResourceSummary, StorageUsage};
pub use generations::{GenerationId, GenerationInfo};
