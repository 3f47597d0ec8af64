//! The offline cache controller as one object a host drives.
//!
//! [`OfflineCache`] wires the extractor, the policy engine, the refresh
//! scheduler and the lifecycle controller to one store and one network,
//! then exposes request interception ([`OfflineCache::fetch`]) and the
//! control-message surface ([`OfflineCache::handle`]).

use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use offgrid_core::{
    AppConfig, CacheDb, CacheEntry, Error, EventKind, EventSink, GenerationId, NormalizePolicy, ResourceRef,
};

use crate::connectivity::{Connectivity, ConnectivityFlag};
use crate::control::{ControlMessage, ControlReply, StatusReport};
use crate::extract::{ExclusionRules, HtmlResourceExtractor, PageLoader};
use crate::fetch::{Network, ResourceRequest};
use crate::lifecycle::{ActiveGeneration, InstallReport, LifecycleController};
use crate::policy::{FetchPolicyEngine, PolicyConfig, PolicyResponse};
use crate::scheduler::{BatchReport, FailedResource, Populator, RefreshScheduler};

fn parse_refs(urls: &[String], policy: NormalizePolicy) -> Result<Vec<ResourceRef>, Error> {
    urls.iter()
        .map(|url| ResourceRef::parse(url, policy).map_err(Error::from))
        .collect()
}

/// Offline resource cache controller.
pub struct OfflineCache {
    config: AppConfig,
    db: CacheDb,
    active: Arc<ActiveGeneration>,
    connectivity: Arc<ConnectivityFlag>,
    policy: FetchPolicyEngine,
    scheduler: Arc<RefreshScheduler>,
    lifecycle: RwLock<Arc<LifecycleController>>,
    pending: Mutex<Option<Arc<LifecycleController>>>,
    events: Arc<dyn EventSink>,
    pages: Vec<ResourceRef>,
    resources: Vec<ResourceRef>,
}

impl OfflineCache {
    /// Build every component from `config`. Nothing is fetched until [`boot`](Self::boot).
    pub fn from_config(
        config: AppConfig, db: CacheDb, network: Arc<dyn Network>, events: Arc<dyn EventSink>,
    ) -> Result<Self, Error> {
        let normalize = config.normalize_policy();
        let pages = parse_refs(&config.pages, normalize)?;
        let resources = parse_refs(&config.resources, normalize)?;

        let active = Arc::new(ActiveGeneration::new());
        let connectivity = Arc::new(ConnectivityFlag::default());

        let rules = ExclusionRules::new(&config.exclude_patterns, config.same_origin_only)?;
        let extractor = Arc::new(HtmlResourceExtractor::new(rules, normalize, events.clone()));
        let loader = PageLoader::new(network.clone(), config.timeout(), normalize, events.clone());
        let populator = Populator {
            db: db.clone(),
            network: network.clone(),
            events: events.clone(),
            timeout: config.timeout(),
            concurrency: config.batch_size,
        };
        let scheduler = Arc::new(RefreshScheduler::new(
            populator,
            loader,
            extractor,
            active.clone(),
            connectivity.clone(),
            events.clone(),
            config.max_entries,
        ));

        let policy = FetchPolicyEngine::new(
            db.clone(),
            network,
            active.clone(),
            connectivity.clone(),
            PolicyConfig::from_app(&config)?,
            events.clone(),
        );

        let lifecycle = Arc::new(LifecycleController::new(
            config.generation(),
            db.clone(),
            active.clone(),
            scheduler.clone(),
            events.clone(),
            pages.clone(),
            resources.clone(),
            config.skip_waiting,
        ));

        Ok(Self {
            config,
            db,
            active,
            connectivity,
            policy,
            scheduler,
            lifecycle: RwLock::new(lifecycle),
            pending: Mutex::new(None),
            events,
            pages,
            resources,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db(&self) -> &CacheDb {
        &self.db
    }

    pub async fn lifecycle(&self) -> Arc<LifecycleController> {
        self.lifecycle.read().await.clone()
    }

    /// Install the configured generation.
    pub async fn boot(&self) -> Result<InstallReport, Error> {
        let lifecycle = self.lifecycle().await;
        let report = lifecycle.install().await?;
        tracing::info!(
            "booted {}: {} resources, {} updated, {} failed, activated: {}",
            report.generation,
            report.resources,
            report.batch.updated,
            report.batch.failed.len(),
            report.activated
        );
        Ok(report)
    }

    /// Answer an intercepted request.
    pub async fn fetch(&self, request: &ResourceRequest) -> PolicyResponse {
        self.policy.handle(request).await
    }

    /// Start the periodic refresh.
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        self.scheduler.clone().spawn(self.config.refresh_interval())
    }

    /// Install `version` alongside the current generation.
    ///
    /// With `skip_waiting` the new generation takes over immediately and the
    /// old one is reclaimed once in-flight requests finish; otherwise it waits
    /// for [`activate_pending`](Self::activate_pending).
    pub async fn upgrade(&self, version: &str) -> Result<InstallReport, Error> {
        let version = version.trim();
        if version.is_empty() {
            return Err(Error::InvalidInput("version cannot be empty".into()));
        }
        let generation = GenerationId::new(&self.config.cache_name, version);
        if self.lifecycle().await.generation() == &generation {
            return Err(Error::InvalidInput(format!("{generation} is already installed")));
        }

        let controller = Arc::new(LifecycleController::new(
            generation,
            self.db.clone(),
            self.active.clone(),
            self.scheduler.clone(),
            self.events.clone(),
            self.pages.clone(),
            self.resources.clone(),
            self.config.skip_waiting,
        ));
        let report = controller.install().await?;

        let replaced = if report.activated {
            *self.lifecycle.write().await = controller;
            self.pending.lock().await.take()
        } else {
            self.pending.lock().await.replace(controller)
        };
        if let Some(abandoned) = replaced {
            tracing::info!("{} abandoned without activating", abandoned.generation());
            self.active.unpin(abandoned.generation()).await;
        }
        Ok(report)
    }

    /// Let the installed, waiting generation take over.
    pub async fn activate_pending(&self) -> Result<GenerationId, Error> {
        let controller = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::InvalidState("no generation is waiting to activate".into()))?;
        if let Err(e) = controller.activate().await {
            *self.pending.lock().await = Some(controller);
            return Err(e);
        }
        let generation = controller.generation().clone();
        *self.lifecycle.write().await = controller;
        Ok(generation)
    }

    /// Wait for the current controller's reclamation; returns what it deleted.
    pub async fn reclaimed(&self) -> Vec<GenerationId> {
        self.lifecycle().await.reclaimed().await
    }

    /// Delete entries of the active generation stored more than `age` ago.
    pub async fn purge_older_than(&self, age: Duration) -> Result<u64, Error> {
        let age = chrono::Duration::from_std(age).map_err(|e| Error::InvalidInput(format!("age: {e}")))?;
        let cutoff = (Utc::now() - age).to_rfc3339_opts(SecondsFormat::Micros, true);
        let Some(lease) = self.active.lease().await else {
            return Ok(0);
        };
        let purged = self.db.purge_stored_before(lease.id(), &cutoff).await?;
        if purged > 0 {
            self.events
                .on_event(EventKind::Evicted, &format!("{purged} entries stored before {cutoff}"));
        }
        Ok(purged)
    }

    /// Look up one stored entry of the active generation; absence is [`Error::NotFound`].
    pub async fn cached_entry(&self, url: &str) -> Result<CacheEntry, Error> {
        let key = ResourceRef::parse(url, self.config.normalize_policy())?;
        let lease = self
            .active
            .lease()
            .await
            .ok_or_else(|| Error::InvalidState("no active generation".into()))?;
        self.db
            .get(lease.id(), &key)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub async fn status(&self) -> StatusReport {
        let lifecycle = self.lifecycle().await;
        let pending = self.pending.lock().await.as_ref().map(|c| c.generation().clone());
        StatusReport {
            state: lifecycle.state().await,
            generation: lifecycle.generation().clone(),
            active: self.active.current_id().await,
            pending,
            pages: self.scheduler.pages().await.len(),
            resources: self.scheduler.working_set().await.len(),
            online: self.connectivity.is_online(),
            refresh_paused: self.scheduler.is_marked_offline(),
            refresh_running: self.scheduler.is_running(),
        }
    }

    /// Handle one control message.
    pub async fn handle(&self, message: ControlMessage) -> Result<ControlReply, Error> {
        let normalize = self.config.normalize_policy();
        match message {
            ControlMessage::CacheResources { resources } => {
                if resources.is_empty() {
                    return Err(Error::InvalidInput("resources cannot be empty".into()));
                }
                let mut valid = Vec::new();
                let mut rejected = Vec::new();
                for raw in resources {
                    match ResourceRef::parse(&raw, normalize) {
                        Ok(r) => valid.push(r),
                        Err(e) => {
                            self.events
                                .on_event(EventKind::ReferenceDropped, &format!("'{raw}': {e}"));
                            rejected.push(FailedResource { url: raw, error: e.to_string(), network: false });
                        }
                    }
                }
                let mut report = if valid.is_empty() {
                    BatchReport::default()
                } else {
                    self.scheduler.cache_resources(valid).await?
                };
                report.failed.extend(rejected);
                Ok(ControlReply::Batch(report))
            }
            ControlMessage::UpdateResources => Ok(ControlReply::Cycle(self.scheduler.run_cycle().await)),
            ControlMessage::ClearCache => {
                let lease = self
                    .active
                    .lease()
                    .await
                    .ok_or_else(|| Error::InvalidState("no active generation".into()))?;
                let entries = self.db.clear_generation(lease.id()).await?;
                self.scheduler.forget_resources().await;
                tracing::info!("cleared {} entries from {}", entries, lease.id());
                Ok(ControlReply::Cleared { entries })
            }
            ControlMessage::GetCachedResources => {
                let listing = match self.active.lease().await {
                    Some(lease) => self.db.list_entries(lease.id()).await?,
                    None => Vec::new(),
                };
                Ok(ControlReply::Resources(listing))
            }
            ControlMessage::GetStorageUsage => Ok(ControlReply::Usage(self.db.storage_usage().await?)),
            ControlMessage::CachePage { url } => {
                let page = ResourceRef::parse(&url, normalize)?;
                Ok(ControlReply::Batch(self.scheduler.cache_page(page).await?))
            }
            ControlMessage::ConnectivityChanged { online } => {
                self.connectivity.set_online(online);
                tracing::info!("host reports {}", if online { "online" } else { "offline" });
                if online {
                    self.scheduler.notify_online();
                    let scheduler = self.scheduler.clone();
                    tokio::spawn(async move {
                        scheduler.run_cycle().await;
                    });
                }
                Ok(ControlReply::Ack)
            }
            ControlMessage::GetStatus => Ok(ControlReply::Status(self.status().await)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleState;
    use crate::policy::ResponseSource;
    use crate::testing::ScriptedNetwork;
    use offgrid_core::MemorySink;
    use url::Url;

    const INDEX: &str = r#"<link rel="stylesheet" href="/app.css"><script src="/app.js"></script>"#;

    fn site() -> ScriptedNetwork {
        ScriptedNetwork::new()
            .ok("https://example.com/", INDEX, "text/html")
            .ok("https://example.com/app.css", "body{}", "text/css")
            .ok("https://example.com/app.js", "run()", "text/javascript")
    }

    fn config() -> AppConfig {
        AppConfig {
            pages: vec!["https://example.com/".into()],
            timeout_ms: 500,
            ..Default::default()
        }
    }

    async fn cache(network: Arc<ScriptedNetwork>, config: AppConfig) -> (OfflineCache, Arc<MemorySink>) {
        let db = CacheDb::open_in_memory().await.unwrap();
        let events = Arc::new(MemorySink::new());
        let cache = OfflineCache::from_config(config, db, network, events.clone()).unwrap();
        (cache, events)
    }

    fn get(url: &str) -> ResourceRequest {
        ResourceRequest::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_boot_then_serve_offline() {
        let network = Arc::new(site());
        let (cache, _) = cache(network.clone(), config()).await;

        let report = cache.boot().await.unwrap();
        assert_eq!(report.batch.updated, 3);

        network.set_offline(true);
        let response = cache.fetch(&get("https://example.com/app.css")).await;
        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(response.body.as_ref(), b"body{}");

        let missing = cache.fetch(&get("https://example.com/img/logo.png")).await;
        assert!(missing.is_unavailable());
    }

    #[tokio::test]
    async fn test_control_listing_and_usage() {
        let (cache, _) = cache(Arc::new(site()), config()).await;
        cache.boot().await.unwrap();

        let ControlReply::Resources(listing) = cache.handle(ControlMessage::GetCachedResources).await.unwrap() else {
            panic!("expected resources");
        };
        let urls: Vec<&str> = listing.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://example.com/", "https://example.com/app.css", "https://example.com/app.js"]);
        assert_eq!(listing[1].content_type.as_deref(), Some("text/css"));
        assert_eq!(listing[1].size, 6);

        let ControlReply::Usage(usage) = cache.handle(ControlMessage::GetStorageUsage).await.unwrap() else {
            panic!("expected usage");
        };
        assert_eq!(usage.used, (INDEX.len() + 6 + 5) as u64);
        assert_eq!(usage.quota, None);
    }

    #[tokio::test]
    async fn test_control_cache_resources_records_invalid() {
        let network = Arc::new(site().ok("https://example.com/extra.js", "x", "text/javascript"));
        let (cache, _) = cache(network, config()).await;
        cache.boot().await.unwrap();

        let reply = cache
            .handle(ControlMessage::CacheResources {
                resources: vec!["https://example.com/extra.js".into(), "javascript:alert(1)".into()],
            })
            .await
            .unwrap();
        let ControlReply::Batch(report) = reply else { panic!("expected batch") };
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].url, "javascript:alert(1)");

        let empty = cache.handle(ControlMessage::CacheResources { resources: vec![] }).await;
        assert!(matches!(empty, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_control_clear_cache() {
        let (cache, _) = cache(Arc::new(site()), config()).await;
        cache.boot().await.unwrap();

        let reply = cache.handle(ControlMessage::ClearCache).await.unwrap();
        assert_eq!(reply, ControlReply::Cleared { entries: 3 });

        let status = cache.status().await;
        assert_eq!(status.resources, 0);
        assert_eq!(status.pages, 1);

        // A cycle rediscovers from the registered pages.
        let ControlReply::Cycle(cycle) = cache.handle(ControlMessage::UpdateResources).await.unwrap() else {
            panic!("expected cycle");
        };
        assert_eq!(cycle.batch.updated, 3);
    }

    #[tokio::test]
    async fn test_control_cache_page() {
        let network = Arc::new(
            site()
                .ok("https://example.com/docs", r#"<img src="/diagram.svg">"#, "text/html")
                .ok("https://example.com/diagram.svg", "<svg/>", "image/svg+xml"),
        );
        let (cache, _) = cache(network, config()).await;
        cache.boot().await.unwrap();

        let reply = cache
            .handle(ControlMessage::CachePage { url: "https://example.com/docs".into() })
            .await
            .unwrap();
        let ControlReply::Batch(report) = reply else { panic!("expected batch") };
        assert_eq!(report.updated, 2);
        assert_eq!(cache.status().await.pages, 2);

        let bad = cache.handle(ControlMessage::CachePage { url: "not a url".into() }).await;
        assert!(matches!(bad, Err(Error::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_connectivity_changes() {
        let network = Arc::new(site());
        let (cache, _) = cache(network.clone(), config()).await;
        cache.boot().await.unwrap();

        cache
            .handle(ControlMessage::ConnectivityChanged { online: false })
            .await
            .unwrap();
        let ControlReply::Cycle(cycle) = cache.handle(ControlMessage::UpdateResources).await.unwrap() else {
            panic!("expected cycle");
        };
        assert_eq!(cycle.skipped, Some(crate::scheduler::SkipReason::Offline));
        assert!(!cache.status().await.online);

        let reply = cache
            .handle(ControlMessage::ConnectivityChanged { online: true })
            .await
            .unwrap();
        assert_eq!(reply, ControlReply::Ack);
        assert!(cache.status().await.online);
    }

    #[tokio::test]
    async fn test_upgrade_supersedes_and_reclaims() {
        let network = Arc::new(site());
        let (cache, _) = cache(network.clone(), config()).await;
        cache.boot().await.unwrap();
        let v1 = cache.lifecycle().await;

        network.replace("https://example.com/app.js", "run(2)", "text/javascript");
        let report = cache.upgrade("v2").await.unwrap();
        assert!(report.activated);
        assert_eq!(v1.state().await, LifecycleState::Superseded);

        let status = cache.status().await;
        assert_eq!(status.state, LifecycleState::Active);
        assert_eq!(status.active, Some(GenerationId::new("offgrid", "v2")));

        assert_eq!(cache.reclaimed().await, vec![GenerationId::new("offgrid", "v1")]);
        let response = cache.fetch(&get("https://example.com/app.js")).await;
        assert_eq!(response.body.as_ref(), b"run(2)");

        assert!(matches!(cache.upgrade("v2").await, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_upgrade_waits_for_activation() {
        let config = AppConfig { skip_waiting: false, ..config() };
        let (cache, _) = cache(Arc::new(site()), config).await;
        cache.boot().await.unwrap();

        let report = cache.upgrade("v2").await.unwrap();
        assert!(!report.activated);
        let status = cache.status().await;
        assert_eq!(status.active, Some(GenerationId::new("offgrid", "v1")));
        assert_eq!(status.pending, Some(GenerationId::new("offgrid", "v2")));

        let activated = cache.activate_pending().await.unwrap();
        assert_eq!(activated, GenerationId::new("offgrid", "v2"));
        assert_eq!(cache.status().await.pending, None);
        assert!(matches!(cache.activate_pending().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_pending_generation_survives_boot_sweep() {
        let config = AppConfig { skip_waiting: false, ..config() };
        let (cache, _) = cache(Arc::new(site()), config).await;
        cache.boot().await.unwrap();

        // The boot activation's sweep may still be running while v2 installs.
        let report = cache.upgrade("v2").await.unwrap();
        assert!(!report.activated);
        cache.reclaimed().await;

        let v2 = GenerationId::new("offgrid", "v2");
        assert!(cache.db.has_generation(&v2).await.unwrap());
        assert_eq!(cache.db.entry_count(&v2).await.unwrap(), 3);
        assert_eq!(cache.activate_pending().await.unwrap(), v2);
    }

    #[tokio::test]
    async fn test_replaced_pending_generation_is_swept() {
        let config = AppConfig { skip_waiting: false, ..config() };
        let (cache, _) = cache(Arc::new(site()), config).await;
        cache.boot().await.unwrap();
        cache.reclaimed().await;

        cache.upgrade("v2").await.unwrap();
        cache.upgrade("v3").await.unwrap();
        let v2 = GenerationId::new("offgrid", "v2");
        let v3 = GenerationId::new("offgrid", "v3");
        assert_eq!(cache.status().await.pending, Some(v3.clone()));
        assert!(!cache.active.is_pinned(&v2).await);
        assert!(cache.active.is_pinned(&v3).await);

        assert_eq!(cache.activate_pending().await.unwrap(), v3);
        let mut reclaimed = cache.reclaimed().await;
        reclaimed.sort();
        assert_eq!(reclaimed, vec![GenerationId::new("offgrid", "v1"), v2]);
        assert!(cache.db.has_generation(&v3).await.unwrap());
    }

    #[tokio::test]
    async fn test_verified_entry_is_not_purged_as_old() {
        let (cache, _) = cache(Arc::new(site()), config()).await;
        cache.boot().await.unwrap();

        let mut entry = cache.cached_entry("https://example.com/app.js").await.unwrap();
        entry.stored_at = "2000-01-01T00:00:00.000000Z".to_string();
        cache.db.put(&GenerationId::new("offgrid", "v1"), &entry).await.unwrap();

        let ControlReply::Cycle(cycle) = cache.handle(ControlMessage::UpdateResources).await.unwrap() else {
            panic!("expected cycle");
        };
        assert_eq!(cycle.batch.unchanged, 3);

        assert_eq!(cache.purge_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
        let entry = cache.cached_entry("https://example.com/app.js").await.unwrap();
        assert!(entry.stored_at.as_str() > "2024-01-01");
    }

    #[tokio::test]
    async fn test_purge_older_than() {
        let (cache, _) = cache(Arc::new(site()), config()).await;
        cache.boot().await.unwrap();

        assert_eq!(cache.purge_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(cache.purge_older_than(Duration::ZERO).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cached_entry_lookup() {
        let (cache, _) = cache(Arc::new(site()), config()).await;
        assert!(matches!(cache.cached_entry("https://example.com/app.js").await, Err(Error::InvalidState(_))));

        cache.boot().await.unwrap();
        let entry = cache.cached_entry("https://example.com/app.js?v=3").await.unwrap();
        assert_eq!(entry.payload.as_ref(), b"run()");
        assert!(matches!(cache.cached_entry("https://example.com/missing.js").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_page() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let config = AppConfig { pages: vec!["ftp://example.com/".into()], ..Default::default() };
        let result = OfflineCache::from_config(config, db, Arc::new(site()), Arc::new(MemorySink::new()));
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }
}
