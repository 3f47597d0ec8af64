//! Bounded-concurrency fetch-and-store over a set of resources.
//!
//! Each resource is fetched in its own task, at most `concurrency` at a
//! time, each bounded by the per-resource timeout. A failure is recorded
//! against that resource and never aborts its siblings.
//!
//! Refreshes are conditional: the stored entry's etag / last-modified are
//! sent as validators. A `304` or a body with the same digest keeps the
//! stored payload but restamps the entry, so age-based purging and eviction
//! count from the last time the origin confirmed it.

use reqwest::StatusCode;
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use offgrid_core::{CacheDb, CacheEntry, Error, EventKind, EventSink, GenerationId, ResourceRef};

use crate::fetch::{Network, ResourceRequest, fetch_with_timeout};
use crate::lifecycle::ActiveGeneration;

/// A resource that could not be refreshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedResource {
    pub url: String,
    pub error: String,
    /// Whether the failure was the network (unreachable or timed out).
    pub network: bool,
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Resources whose fetch was started.
    pub attempted: usize,
    /// Entries written with a new payload.
    pub updated: usize,
    /// Entries confirmed current (304 or identical payload).
    pub unchanged: usize,
    pub failed: Vec<FailedResource>,
    /// Resources never started because a newer install superseded the batch.
    pub skipped: usize,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.updated + self.unchanged
    }

    /// True when something failed, nothing succeeded, and every failure was the network.
    pub fn all_network_failures(&self) -> bool {
        !self.failed.is_empty() && self.succeeded() == 0 && self.failed.iter().all(|f| f.network)
    }

    /// Fold another report into this one.
    pub fn absorb(&mut self, other: BatchReport) {
        self.attempted += other.attempted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Updated,
    Unchanged,
}

/// Install epoch a batch started under; a newer install supersedes it.
pub struct EpochWatch {
    active: Arc<ActiveGeneration>,
    started: u64,
}

impl EpochWatch {
    pub fn new(active: Arc<ActiveGeneration>) -> Self {
        let started = active.epoch();
        Self { active, started }
    }

    fn superseded(&self) -> bool {
        self.active.epoch() != self.started
    }
}

/// Shared handles a batch needs.
#[derive(Clone)]
pub struct Populator {
    pub db: CacheDb,
    pub network: Arc<dyn Network>,
    pub events: Arc<dyn EventSink>,
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Populator {
    /// Fetch and store every resource into `generation`.
    ///
    /// With `watch`, stops starting new fetches once a newer install begins;
    /// fetches already in flight still complete and write.
    pub async fn populate(
        &self, generation: &GenerationId, resources: Vec<ResourceRef>, watch: Option<&EpochWatch>,
    ) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut join_set = JoinSet::new();
        let mut report = BatchReport::default();
        let total = resources.len();

        for (index, key) in resources.into_iter().enumerate() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if watch.is_some_and(EpochWatch::superseded) {
                report.skipped = total - index;
                tracing::info!("batch for {} superseded; {} resources not started", generation, report.skipped);
                break;
            }

            report.attempted += 1;
            let this = self.clone();
            let generation = generation.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let result = this.refresh_one(&generation, &key).await;
                (key, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (key, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("batch task failed: {}", e);
                    continue;
                }
            };
            match result {
                Ok(Outcome::Updated) => {
                    report.updated += 1;
                    self.events.on_event(EventKind::Stored, key.as_str());
                }
                Ok(Outcome::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    let kind = match e {
                        Error::StoreWrite(_) => EventKind::StoreWriteFailed,
                        _ => EventKind::NetworkFailed,
                    };
                    self.events.on_event(kind, &format!("{key}: {e}"));
                    report.failed.push(FailedResource {
                        url: key.to_string(),
                        network: e.is_network_failure(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.failed.sort_by(|a, b| a.url.cmp(&b.url));
        report
    }

    async fn refresh_one(&self, generation: &GenerationId, key: &ResourceRef) -> Result<Outcome, Error> {
        let previous = match self.db.get(generation, key).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!("reading stored {} failed, fetching unconditionally: {}", key, e);
                None
            }
        };

        let mut request = ResourceRequest::get(key.url().clone());
        if let Some(prev) = &previous {
            if let Some(value) = prev.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                request = request.with_header(header::IF_NONE_MATCH, value);
            }
            if let Some(value) = prev.last_modified.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                request = request.with_header(header::IF_MODIFIED_SINCE, value);
            }
        }

        let response = fetch_with_timeout(self.network.as_ref(), &request, self.timeout).await?;

        if response.status == StatusCode::NOT_MODIFIED && previous.is_some() {
            tracing::debug!("{} not modified", key);
            self.db.touch(generation, key, response.etag(), response.last_modified()).await?;
            return Ok(Outcome::Unchanged);
        }
        if !response.status.is_success() {
            return Err(Error::HttpStatus(format!("{key}: HTTP {}", response.status.as_u16())));
        }

        let entry = CacheEntry::new(key.clone(), response.bytes.clone(), response.content_type.clone())
            .with_status(response.status.as_u16())
            .with_validators(response.etag(), response.last_modified());

        if previous.as_ref().is_some_and(|prev| prev.digest == entry.digest) {
            tracing::debug!("{} unchanged (same digest)", key);
            self.db.touch(generation, key, entry.etag, entry.last_modified).await?;
            return Ok(Outcome::Unchanged);
        }

        self.db.put(generation, &entry).await?;
        Ok(Outcome::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedNetwork;
    use bytes::Bytes;
    use offgrid_core::{MemorySink, NormalizePolicy};

    fn key(url: &str) -> ResourceRef {
        ResourceRef::parse(url, NormalizePolicy::default()).unwrap()
    }

    async fn setup(network: Arc<ScriptedNetwork>, concurrency: usize) -> (Populator, GenerationId, Arc<MemorySink>) {
        let db = CacheDb::open_in_memory().await.unwrap();
        let generation = GenerationId::new("offgrid", "v1");
        db.open_generation(&generation).await.unwrap();
        let events = Arc::new(MemorySink::new());
        let populator = Populator {
            db,
            network,
            events: events.clone(),
            timeout: Duration::from_millis(500),
            concurrency,
        };
        (populator, generation, events)
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let network = Arc::new(
            ScriptedNetwork::new()
                .ok("https://example.com/a.js", "a", "text/javascript")
                .fail("https://example.com/b.js")
                .ok("https://example.com/c.js", "c", "text/javascript"),
        );
        let (populator, generation, _) = setup(network, 2).await;
        let resources = vec![
            key("https://example.com/a.js"),
            key("https://example.com/b.js"),
            key("https://example.com/c.js"),
        ];

        let report = populator.populate(&generation, resources, None).await;
        assert_eq!(report.attempted, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].url, "https://example.com/b.js");
        assert!(report.failed[0].network);

        let db = &populator.db;
        assert!(db.get(&generation, &key("https://example.com/a.js")).await.unwrap().is_some());
        assert!(db.get(&generation, &key("https://example.com/b.js")).await.unwrap().is_none());
        assert!(db.get(&generation, &key("https://example.com/c.js")).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_fetch_times_out() {
        let network = Arc::new(
            ScriptedNetwork::new()
                .hang("https://example.com/slow.js")
                .ok("https://example.com/fast.js", "fast", "text/javascript"),
        );
        let (populator, generation, _) = setup(network, 1).await;
        let resources = vec![key("https://example.com/slow.js"), key("https://example.com/fast.js")];

        let report = populator.populate(&generation, resources, None).await;
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("FETCH_TIMEOUT"));
    }

    #[tokio::test]
    async fn test_conditional_refresh_not_modified() {
        let network = Arc::new(ScriptedNetwork::new().ok_with_etag(
            "https://example.com/app.css",
            "body{}",
            "text/css",
            "\"v1\"",
        ));
        let (populator, generation, _) = setup(network.clone(), 4).await;
        let resources = vec![key("https://example.com/app.css")];

        let first = populator.populate(&generation, resources.clone(), None).await;
        assert_eq!(first.updated, 1);

        let second = populator.populate(&generation, resources, None).await;
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.updated, 0);

        let headers = network.last_headers("https://example.com/app.css").unwrap();
        assert_eq!(headers.get(header::IF_NONE_MATCH).unwrap(), "\"v1\"");
    }

    #[tokio::test]
    async fn test_not_modified_restamps_entry() {
        let network = Arc::new(ScriptedNetwork::new().ok_with_etag(
            "https://example.com/app.css",
            "body{}",
            "text/css",
            "\"v1\"",
        ));
        let (populator, generation, _) = setup(network, 4).await;
        let resources = vec![key("https://example.com/app.css")];
        populator.populate(&generation, resources.clone(), None).await;

        let mut aged = populator.db.get(&generation, &resources[0]).await.unwrap().unwrap();
        aged.stored_at = "2000-01-01T00:00:00.000000Z".to_string();
        populator.db.put(&generation, &aged).await.unwrap();

        let report = populator.populate(&generation, resources.clone(), None).await;
        assert_eq!(report.unchanged, 1);

        let after = populator.db.get(&generation, &resources[0]).await.unwrap().unwrap();
        assert!(after.stored_at > aged.stored_at);
        assert_eq!(after.etag.as_deref(), Some("\"v1\""));
        assert_eq!(after.payload, Bytes::from_static(b"body{}"));
        let purged = populator.db.purge_stored_before(&generation, "2024-01-01T00:00:00.000000Z").await.unwrap();
        assert_eq!(purged, 0);
    }

    #[tokio::test]
    async fn test_same_digest_is_unchanged() {
        let network = Arc::new(ScriptedNetwork::new().ok("https://example.com/app.js", "same", "text/javascript"));
        let (populator, generation, _) = setup(network.clone(), 4).await;
        let resources = vec![key("https://example.com/app.js")];

        populator.populate(&generation, resources.clone(), None).await;
        let mut aged = populator.db.get(&generation, &resources[0]).await.unwrap().unwrap();
        aged.stored_at = "2000-01-01T00:00:00.000000Z".to_string();
        populator.db.put(&generation, &aged).await.unwrap();

        let report = populator.populate(&generation, resources.clone(), None).await;
        assert_eq!(report.unchanged, 1);
        let after = populator.db.get(&generation, &resources[0]).await.unwrap().unwrap();
        assert!(after.stored_at > aged.stored_at);
        assert_eq!(after.payload, Bytes::from_static(b"same"));

        network.replace("https://example.com/app.js", "changed", "text/javascript");
        let report = populator.populate(&generation, resources.clone(), None).await;
        assert_eq!(report.updated, 1);
        let after = populator.db.get(&generation, &resources[0]).await.unwrap().unwrap();
        assert_eq!(after.payload, Bytes::from_static(b"changed"));
    }

    #[tokio::test]
    async fn test_error_status_is_not_a_network_failure() {
        let network = Arc::new(ScriptedNetwork::new().respond(
            "https://example.com/gone.js",
            StatusCode::NOT_FOUND,
            "",
            "text/plain",
        ));
        let (populator, generation, _) = setup(network, 4).await;

        let report = populator
            .populate(&generation, vec![key("https://example.com/gone.js")], None)
            .await;
        assert_eq!(report.failed.len(), 1);
        assert!(!report.failed[0].network);
        assert!(!report.all_network_failures());
    }

    #[tokio::test]
    async fn test_superseded_batch_starts_nothing() {
        let network = Arc::new(ScriptedNetwork::new().ok("https://example.com/a.js", "a", "text/javascript"));
        let (populator, generation, _) = setup(network.clone(), 4).await;
        let active = Arc::new(ActiveGeneration::new());
        let watch = EpochWatch::new(active.clone());
        active.advance_epoch();

        let report = populator
            .populate(&generation, vec![key("https://example.com/a.js")], Some(&watch))
            .await;
        assert_eq!(report.attempted, 0);
        assert_eq!(report.skipped, 1);
        assert!(network.calls().is_empty());
    }

    #[test]
    fn test_all_network_failures() {
        let failed = |network| FailedResource { url: "u".into(), error: "e".into(), network };
        let report = BatchReport { failed: vec![failed(true), failed(true)], ..Default::default() };
        assert!(report.all_network_failures());

        let report = BatchReport { updated: 1, failed: vec![failed(true)], ..Default::default() };
        assert!(!report.all_network_failures());

        assert!(!BatchReport::default().all_network_failures());
    }
}
