//! Core types and shared functionality for offgrid.
//!
//! This crate provides:
//! - The versioned Cache Store with SQLite backend
//! - Normalized resource identifiers
//! - Unified error types
//! - Configuration structures
//! - The observability event sink

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod resource;

pub use cache::{CacheDb, CacheEntry, GenerationId, GenerationInfo, ResourceSummary, StorageUsage};
pub use config::{AppConfig, ConfigError, RouteConfig, Strategy};
pub use error::Error;
pub use events::{EventKind, EventSink, MemorySink, TracingSink};
pub use resource::{NormalizePolicy, ResourceRef, UrlError};
