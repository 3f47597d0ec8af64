//! Fetch policy engine.
//!
//! ### Strategies
//! - Cache-first: store, then network on a miss, then fallback.
//! - Network-first: network, then store when the network fails, then fallback.
//!
//! The strategy is picked per request: the first matching route override,
//! else the configured default.
//!
//! ### Rules
//! - Only GET requests are eligible for storage; everything else passes
//!   through to the network untouched.
//! - A response is stored only when the transport succeeded, the status is
//!   2xx and, with `same_origin_only`, it stayed on an allowed origin.
//!   Other responses are returned but never written.
//! - Store writes never fail a request; the response in hand is delivered.
//! - When nothing can answer, a synthesized unavailable response (status 503)
//!   is returned: an offline page for navigations, a minimal body otherwise.
//! - A request holds a lease on the active generation from first lookup to
//!   last write, so it never observes a generation being reclaimed.

use bytes::Bytes;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use url::{Origin, Url};

use offgrid_core::{AppConfig, CacheDb, CacheEntry, Error, EventKind, EventSink, NormalizePolicy, ResourceRef, Strategy};

use crate::connectivity::Connectivity;
use crate::fetch::{FetchResponse, Network, ResourceRequest, fetch_with_timeout};
use crate::lifecycle::{ActiveGeneration, GenerationLease};

/// Status carried by synthesized unavailable responses.
pub const UNAVAILABLE_STATUS: u16 = 503;

const OFFLINE_PLACEHOLDER: &str = "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page has not been saved for offline use. \
It will load again once the connection is back.</p></body></html>\n";

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Cache,
    Network,
    /// The stored offline page, served for an unserviceable navigation.
    OfflinePage,
    /// Synthesized; nothing could answer.
    Unavailable,
    /// Non-GET or uncacheable request sent straight to the network.
    PassThrough,
}

/// The answer to an intercepted request.
#[derive(Debug, Clone)]
pub struct PolicyResponse {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl PolicyResponse {
    fn from_entry(entry: CacheEntry, source: ResponseSource) -> Self {
        Self {
            url: entry.key.to_string(),
            status: entry.status_code,
            content_type: entry.content_type,
            body: entry.payload,
            source,
        }
    }

    fn from_network(response: FetchResponse, source: ResponseSource) -> Self {
        Self {
            url: response.final_url.to_string(),
            status: response.status.as_u16(),
            content_type: response.content_type,
            body: response.bytes,
            source,
        }
    }

    fn unavailable(request: &ResourceRequest) -> Self {
        let (content_type, body) = if request.is_navigation() {
            ("text/html; charset=utf-8", Bytes::from_static(OFFLINE_PLACEHOLDER.as_bytes()))
        } else {
            ("text/plain; charset=utf-8", Bytes::from_static(b"unavailable"))
        };
        Self {
            url: request.url.to_string(),
            status: UNAVAILABLE_STATUS,
            content_type: Some(content_type.to_string()),
            body,
            source: ResponseSource::Unavailable,
        }
    }

    /// True for offline-page and synthesized responses.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.source, ResponseSource::Unavailable | ResponseSource::OfflinePage)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Static policy configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub default_strategy: Strategy,
    pub routes: Vec<(Regex, Strategy)>,
    pub normalize: NormalizePolicy,
    pub same_origin_only: bool,
    /// Origins responses may be stored from when `same_origin_only` is set.
    /// Empty means the request's own origin.
    pub scope: Vec<Origin>,
    pub timeout: Duration,
    pub offline_page: Option<ResourceRef>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::CacheFirst,
            routes: Vec::new(),
            normalize: NormalizePolicy::default(),
            same_origin_only: false,
            scope: Vec::new(),
            timeout: Duration::from_millis(20_000),
            offline_page: None,
        }
    }
}

impl PolicyConfig {
    pub fn from_app(config: &AppConfig) -> Result<Self, Error> {
        let normalize = config.normalize_policy();
        let routes = config
            .routes
            .iter()
            .map(|route| {
                Regex::new(&route.pattern)
                    .map(|re| (re, route.strategy))
                    .map_err(|e| Error::InvalidInput(format!("route pattern '{}': {e}", route.pattern)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let scope = config
            .pages
            .iter()
            .map(|page| ResourceRef::parse(page, normalize).map(|r| r.url().origin()))
            .collect::<Result<Vec<_>, _>>()?;
        let offline_page = config
            .offline_page
            .as_deref()
            .map(|page| ResourceRef::parse(page, normalize))
            .transpose()?;

        Ok(Self {
            default_strategy: config.strategy,
            routes,
            normalize,
            same_origin_only: config.same_origin_only,
            scope,
            timeout: config.timeout(),
            offline_page,
        })
    }

    /// Strategy for `key`: first matching route, else the default.
    pub fn strategy_for(&self, key: &ResourceRef) -> Strategy {
        self.routes
            .iter()
            .find(|(pattern, _)| pattern.is_match(key.as_str()))
            .map(|(_, strategy)| *strategy)
            .unwrap_or(self.default_strategy)
    }

    fn origin_allowed(&self, requested: &Url, served: &Url) -> bool {
        if !self.same_origin_only {
            return true;
        }
        let origin = served.origin();
        if self.scope.is_empty() { origin == requested.origin() } else { self.scope.contains(&origin) }
    }
}

/// Decides, per request, how to answer from the store and the network.
pub struct FetchPolicyEngine {
    db: CacheDb,
    network: Arc<dyn Network>,
    active: Arc<ActiveGeneration>,
    connectivity: Arc<dyn Connectivity>,
    config: PolicyConfig,
    events: Arc<dyn EventSink>,
}

impl FetchPolicyEngine {
    pub fn new(
        db: CacheDb, network: Arc<dyn Network>, active: Arc<ActiveGeneration>, connectivity: Arc<dyn Connectivity>,
        config: PolicyConfig, events: Arc<dyn EventSink>,
    ) -> Self {
        Self { db, network, active, connectivity, config, events }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Answer `request`. Never fails: failures end in a fallback response.
    pub async fn handle(&self, request: &ResourceRequest) -> PolicyResponse {
        if !request.is_cacheable_method() {
            self.events
                .on_event(EventKind::PassThrough, &format!("{} {}", request.method, request.url));
            return self.pass_through(request).await;
        }

        let key = match ResourceRef::from_url(request.url.clone(), self.config.normalize) {
            Ok(key) => key,
            Err(e) => {
                self.events
                    .on_event(EventKind::PassThrough, &format!("{}: {e}", request.url));
                return self.pass_through(request).await;
            }
        };

        let Some(lease) = self.active.lease().await else {
            return self.network_only(request).await;
        };

        match self.config.strategy_for(&key) {
            Strategy::CacheFirst => self.cache_first(request, &key, &lease).await,
            Strategy::NetworkFirst => self.network_first(request, &key, &lease).await,
        }
    }

    async fn cache_first(&self, request: &ResourceRequest, key: &ResourceRef, lease: &GenerationLease) -> PolicyResponse {
        if let Some(entry) = self.lookup(lease, key).await {
            return PolicyResponse::from_entry(entry, ResponseSource::Cache);
        }

        match self.fetch_network(request).await {
            Ok(response) => self.store_and_return(lease, key, request, response).await,
            Err(_) => self.fallback(request, Some(lease)).await,
        }
    }

    async fn network_first(
        &self, request: &ResourceRequest, key: &ResourceRef, lease: &GenerationLease,
    ) -> PolicyResponse {
        match self.fetch_network(request).await {
            Ok(response) => self.store_and_return(lease, key, request, response).await,
            Err(_) => match self.lookup(lease, key).await {
                Some(entry) => PolicyResponse::from_entry(entry, ResponseSource::Cache),
                None => self.fallback(request, Some(lease)).await,
            },
        }
    }

    /// GET with nothing active to read from or write to.
    async fn network_only(&self, request: &ResourceRequest) -> PolicyResponse {
        match self.fetch_network(request).await {
            Ok(response) => {
                self.events
                    .on_event(EventKind::NotStored, &format!("{}: no active generation", request.url));
                PolicyResponse::from_network(response, ResponseSource::Network)
            }
            Err(_) => self.fallback(request, None).await,
        }
    }

    async fn pass_through(&self, request: &ResourceRequest) -> PolicyResponse {
        match fetch_with_timeout(self.network.as_ref(), request, self.config.timeout).await {
            Ok(response) => PolicyResponse::from_network(response, ResponseSource::PassThrough),
            Err(e) => {
                self.events.on_event(EventKind::NetworkFailed, &e.to_string());
                self.fallback(request, None).await
            }
        }
    }

    async fn fetch_network(&self, request: &ResourceRequest) -> Result<FetchResponse, Error> {
        let result = if self.connectivity.is_online() {
            fetch_with_timeout(self.network.as_ref(), request, self.config.timeout).await
        } else {
            Err(Error::NetworkFailure(format!("{}: host reports offline", request.url)))
        };
        if let Err(e) = &result {
            self.events.on_event(EventKind::NetworkFailed, &e.to_string());
        }
        result
    }

    async fn lookup(&self, lease: &GenerationLease, key: &ResourceRef) -> Option<CacheEntry> {
        match self.db.get(lease.id(), key).await {
            Ok(Some(entry)) => {
                self.events.on_event(EventKind::CacheHit, key.as_str());
                Some(entry)
            }
            Ok(None) => {
                self.events.on_event(EventKind::CacheMiss, key.as_str());
                None
            }
            Err(e) => {
                tracing::warn!("store read for {} failed: {}", key, e);
                self.events
                    .on_event(EventKind::CacheMiss, &format!("{key}: store read failed"));
                None
            }
        }
    }

    async fn store_and_return(
        &self, lease: &GenerationLease, key: &ResourceRef, request: &ResourceRequest, response: FetchResponse,
    ) -> PolicyResponse {
        let qualifies =
            response.status.is_success() && self.config.origin_allowed(&request.url, &response.final_url);
        if !qualifies {
            self.events.on_event(
                EventKind::NotStored,
                &format!("{key}: HTTP {} from {}", response.status.as_u16(), response.final_url),
            );
            return PolicyResponse::from_network(response, ResponseSource::Network);
        }

        // The entry shares the body buffer; the caller still gets the full payload.
        let entry = CacheEntry::new(key.clone(), response.bytes.clone(), response.content_type.clone())
            .with_status(response.status.as_u16())
            .with_validators(response.etag(), response.last_modified());
        match self.db.put(lease.id(), &entry).await {
            Ok(()) => self
                .events
                .on_event(EventKind::Stored, &format!("{key} ({} bytes)", entry.size())),
            Err(e) => self
                .events
                .on_event(EventKind::StoreWriteFailed, &format!("{key}: {e}")),
        }

        PolicyResponse::from_network(response, ResponseSource::Network)
    }

    async fn fallback(&self, request: &ResourceRequest, lease: Option<&GenerationLease>) -> PolicyResponse {
        if request.is_navigation()
            && let (Some(page), Some(lease)) = (&self.config.offline_page, lease)
            && let Ok(Some(entry)) = self.db.get(lease.id(), page).await
        {
            self.events
                .on_event(EventKind::Fallback, &format!("{}: offline page {page}", request.url));
            return PolicyResponse::from_entry(entry, ResponseSource::OfflinePage);
        }

        self.events
            .on_event(EventKind::Fallback, &format!("{}: unavailable", request.url));
        PolicyResponse::unavailable(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityFlag;
    use crate::testing::ScriptedNetwork;
    use offgrid_core::{GenerationId, MemorySink};
    use reqwest::StatusCode;

    struct Fixture {
        engine: FetchPolicyEngine,
        db: CacheDb,
        network: Arc<ScriptedNetwork>,
        connectivity: Arc<ConnectivityFlag>,
        events: Arc<MemorySink>,
        generation: GenerationId,
    }

    async fn fixture(network: ScriptedNetwork, config: PolicyConfig) -> Fixture {
        let db = CacheDb::open_in_memory().await.unwrap();
        let generation = GenerationId::new("offgrid", "v1");
        db.open_generation(&generation).await.unwrap();
        db.activate_generation(&generation).await.unwrap();

        let active = Arc::new(ActiveGeneration::new());
        active.switch_to(generation.clone()).await;

        let network = Arc::new(network);
        let connectivity = Arc::new(ConnectivityFlag::default());
        let events = Arc::new(MemorySink::new());
        let engine = FetchPolicyEngine::new(
            db.clone(),
            network.clone(),
            active,
            connectivity.clone(),
            config,
            events.clone(),
        );
        Fixture { engine, db, network, connectivity, events, generation }
    }

    fn key(url: &str) -> ResourceRef {
        ResourceRef::parse(url, NormalizePolicy::default()).unwrap()
    }

    fn get(url: &str) -> ResourceRequest {
        ResourceRequest::get(Url::parse(url).unwrap())
    }

    fn network_first() -> PolicyConfig {
        PolicyConfig { default_strategy: Strategy::NetworkFirst, ..Default::default() }
    }

    #[tokio::test]
    async fn test_cache_first_hit_with_failing_network() {
        let fx = fixture(ScriptedNetwork::new(), PolicyConfig::default()).await;
        let entry = CacheEntry::new(key("https://example.com/app.js"), Bytes::from_static(b"app()"), None);
        fx.db.put(&fx.generation, &entry).await.unwrap();

        let response = fx.engine.handle(&get("https://example.com/app.js")).await;
        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(response.body, Bytes::from_static(b"app()"));
        assert!(fx.network.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cache_first_miss_stores_network_response() {
        let network = ScriptedNetwork::new().ok("https://example.com/app.css?v=2", "body{}", "text/css");
        let fx = fixture(network, PolicyConfig::default()).await;

        let response = fx.engine.handle(&get("https://example.com/app.css?v=2")).await;
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.body, Bytes::from_static(b"body{}"));

        let stored = fx
            .db
            .get(&fx.generation, &key("https://example.com/app.css"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payload, response.body);
        assert_eq!(stored.content_type.as_deref(), Some("text/css"));
        assert_eq!(fx.events.count(EventKind::Stored), 1);
    }

    #[tokio::test]
    async fn test_network_first_then_offline() {
        let network = ScriptedNetwork::new().ok("https://example.com/data.json", "{\"n\":1}", "application/json");
        let fx = fixture(network, network_first()).await;

        let online = fx.engine.handle(&get("https://example.com/data.json")).await;
        assert_eq!(online.source, ResponseSource::Network);
        assert!(
            fx.db
                .get(&fx.generation, &key("https://example.com/data.json"))
                .await
                .unwrap()
                .is_some()
        );

        fx.network.set_offline(true);
        let offline = fx.engine.handle(&get("https://example.com/data.json")).await;
        assert_eq!(offline.source, ResponseSource::Cache);
        assert_eq!(offline.body, online.body);
    }

    #[tokio::test]
    async fn test_network_first_skips_network_when_host_offline() {
        let network = ScriptedNetwork::new().ok("https://example.com/data.json", "{}", "application/json");
        let fx = fixture(network, network_first()).await;
        fx.connectivity.set_online(false);

        let response = fx.engine.handle(&get("https://example.com/data.json")).await;
        assert!(response.is_unavailable());
        assert!(fx.network.calls().is_empty());
    }

    #[tokio::test]
    async fn test_uncached_offline_is_unavailable() {
        let fx = fixture(ScriptedNetwork::new(), PolicyConfig::default()).await;

        let response = fx.engine.handle(&get("https://example.com/img/logo.png")).await;
        assert_eq!(response.source, ResponseSource::Unavailable);
        assert_eq!(response.status, UNAVAILABLE_STATUS);
        assert_eq!(response.body, Bytes::from_static(b"unavailable"));
        assert_eq!(fx.events.count(EventKind::Fallback), 1);
    }

    #[tokio::test]
    async fn test_navigation_fallbacks() {
        let config =
            PolicyConfig { offline_page: Some(key("https://example.com/offline.html")), ..Default::default() };
        let fx = fixture(ScriptedNetwork::new(), config).await;
        let navigate = ResourceRequest::navigate(Url::parse("https://example.com/docs/").unwrap());

        let placeholder = fx.engine.handle(&navigate).await;
        assert_eq!(placeholder.source, ResponseSource::Unavailable);
        assert_eq!(placeholder.content_type.as_deref(), Some("text/html; charset=utf-8"));
        assert!(String::from_utf8_lossy(&placeholder.body).contains("offline"));

        let page = CacheEntry::new(
            key("https://example.com/offline.html"),
            Bytes::from_static(b"<h1>saved</h1>"),
            Some("text/html".into()),
        );
        fx.db.put(&fx.generation, &page).await.unwrap();

        let served = fx.engine.handle(&navigate).await;
        assert_eq!(served.source, ResponseSource::OfflinePage);
        assert_eq!(served.body, Bytes::from_static(b"<h1>saved</h1>"));
        assert!(served.is_unavailable());
    }

    #[tokio::test]
    async fn test_error_status_returned_but_not_stored() {
        let network =
            ScriptedNetwork::new().respond("https://example.com/missing.js", StatusCode::NOT_FOUND, "nope", "text/plain");
        let fx = fixture(network, PolicyConfig::default()).await;

        let response = fx.engine.handle(&get("https://example.com/missing.js")).await;
        assert_eq!(response.status, 404);
        assert_eq!(response.source, ResponseSource::Network);
        assert!(
            fx.db
                .get(&fx.generation, &key("https://example.com/missing.js"))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(fx.events.count(EventKind::NotStored), 1);
    }

    #[tokio::test]
    async fn test_mutating_requests_pass_through() {
        let network = ScriptedNetwork::new().ok("https://example.com/api", "ok", "text/plain");
        let fx = fixture(network, PolicyConfig::default()).await;
        let post = get("https://example.com/api").with_method(reqwest::Method::POST).with_body("x=1");

        let response = fx.engine.handle(&post).await;
        assert_eq!(response.source, ResponseSource::PassThrough);
        assert_eq!(fx.network.calls()[0].0, reqwest::Method::POST);
        assert_eq!(fx.db.entry_count(&fx.generation).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_write_failure_still_returns_response() {
        let network = ScriptedNetwork::new().ok("https://example.com/big.bin", "0123456789", "application/octet-stream");
        let mut fx = fixture(network, PolicyConfig::default()).await;
        fx.engine.db = fx.db.clone().with_quota(4);

        let response = fx.engine.handle(&get("https://example.com/big.bin")).await;
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.body, Bytes::from_static(b"0123456789"));
        assert_eq!(fx.events.count(EventKind::StoreWriteFailed), 1);
    }

    #[tokio::test]
    async fn test_same_origin_only_refuses_foreign_redirect_target() {
        let network = ScriptedNetwork::new().ok("https://cdn.example.net/lib.js", "lib()", "text/javascript");
        let config = PolicyConfig {
            same_origin_only: true,
            scope: vec![Url::parse("https://example.com/").unwrap().origin()],
            ..Default::default()
        };
        let fx = fixture(network, config).await;

        let response = fx.engine.handle(&get("https://cdn.example.net/lib.js")).await;
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(fx.db.entry_count(&fx.generation).await.unwrap(), 0);
    }

    #[test]
    fn test_route_overrides() {
        let config = PolicyConfig {
            routes: vec![(Regex::new(r"/api/").unwrap(), Strategy::NetworkFirst)],
            ..Default::default()
        };
        assert_eq!(config.strategy_for(&key("https://example.com/api/items")), Strategy::NetworkFirst);
        assert_eq!(config.strategy_for(&key("https://example.com/app.js")), Strategy::CacheFirst);
    }

    #[test]
    fn test_policy_config_from_app() {
        let app = AppConfig {
            pages: vec!["https://example.com/".into()],
            offline_page: Some("https://example.com/offline.html".into()),
            routes: vec![offgrid_core::RouteConfig { pattern: "\\.json$".into(), strategy: Strategy::NetworkFirst }],
            ..Default::default()
        };
        let config = PolicyConfig::from_app(&app).unwrap();
        assert_eq!(config.scope.len(), 1);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.offline_page.unwrap().as_str(), "https://example.com/offline.html");
    }
}
