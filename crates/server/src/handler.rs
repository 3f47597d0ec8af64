//! MCP server handler implementation.
//!
//! This module defines the main server handler that
//! routes tool calls to the offline cache.
use std::sync::Arc;

use crate::tools::{
    cache::{
        CachedEntryParams, PurgeCacheParams, cached_entry_impl, cached_resources_impl, clear_cache_impl, purge_impl,
        storage_usage_impl,
    },
    control::{
        CachePageParams, CacheResourcesParams, SetConnectivityParams, cache_page_impl, cache_resources_impl,
        set_connectivity_impl, update_resources_impl,
    },
    fetch::{OfflineFetchParams, offline_fetch_impl},
    lifecycle::{UpgradeParams, activate_impl, status_impl, upgrade_impl},
};

use offgrid_client::OfflineCache;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{
        tool::{ToolCallContext, ToolRouter},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};

/// The MCP server handler; every tool shares one [`OfflineCache`].
#[derive(Clone)]
pub struct OffgridServer {
    cache: Arc<OfflineCache>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl OffgridServer {
    pub fn new(cache: Arc<OfflineCache>) -> Self {
        Self { cache, tool_router: Self::tool_router() }
    }

    #[tool(description = "Fetch and store resources now and keep them in the refresh working set.")]
    async fn cache_resources(&self, params: Parameters<CacheResourcesParams>) -> Result<CallToolResult, McpError> {
        cache_resources_impl(&self.cache, params.0).await
    }

    #[tool(description = "Register a page and store it together with every stylesheet, script, image and font it references.")]
    async fn cache_page(&self, params: Parameters<CachePageParams>) -> Result<CallToolResult, McpError> {
        cache_page_impl(&self.cache, params.0).await
    }

    #[tool(description = "Run a refresh cycle now. Skipped while offline or while another cycle is running.")]
    async fn update_resources(&self) -> Result<CallToolResult, McpError> {
        update_resources_impl(&self.cache).await
    }

    #[tool(description = "Remove every entry of the active generation and forget the working set.")]
    async fn clear_cache(&self) -> Result<CallToolResult, McpError> {
        clear_cache_impl(&self.cache).await
    }

    /// Delete entries stored longer ago than a given age.
    #[tool(description = "Purge entries of the active generation stored more than older_than_ms milliseconds ago.")]
    async fn purge_cache(&self, params: Parameters<PurgeCacheParams>) -> Result<CallToolResult, McpError> {
        purge_impl(&self.cache, params.0).await
    }

    #[tool(description = "List the resources stored in the active generation with their type, size and store time.")]
    async fn get_cached_resources(&self) -> Result<CallToolResult, McpError> {
        cached_resources_impl(&self.cache).await
    }

    /// Retrieve one stored entry of the active generation.
    #[tool(description = "Get one cached resource by URL: metadata, digest, and body when it is text. Fails with NOT_FOUND when absent.")]
    async fn get_cached_entry(&self, params: Parameters<CachedEntryParams>) -> Result<CallToolResult, McpError> {
        cached_entry_impl(&self.cache, params.0).await
    }

    #[tool(description = "Report bytes used by the store against its quota.")]
    async fn get_storage_usage(&self) -> Result<CallToolResult, McpError> {
        storage_usage_impl(&self.cache).await
    }

    /// Serve a request through the fetch policy engine.
    ///
    /// Same answer an intercepted page load would get: cache-first or
    /// network-first per route, falling back to the store or a 503.
    #[tool(
        description = "Request a URL through the offline cache. Returns status, body, and whether it came from the cache, the network, or a fallback."
    )]
    async fn offline_fetch(&self, params: Parameters<OfflineFetchParams>) -> Result<CallToolResult, McpError> {
        offline_fetch_impl(&self.cache, params.0).await
    }

    #[tool(description = "Tell the cache whether the host is online. Going online triggers a refresh cycle.")]
    async fn set_connectivity(&self, params: Parameters<SetConnectivityParams>) -> Result<CallToolResult, McpError> {
        set_connectivity_impl(&self.cache, params.0).await
    }

    #[tool(description = "Report lifecycle state, active and pending generations, working set size, and refresh status.")]
    async fn lifecycle_status(&self) -> Result<CallToolResult, McpError> {
        status_impl(&self.cache).await
    }

    #[tool(description = "Install a new cache version. It takes over at once when skip_waiting is set, otherwise it waits for activate_pending.")]
    async fn upgrade(&self, params: Parameters<UpgradeParams>) -> Result<CallToolResult, McpError> {
        upgrade_impl(&self.cache, params.0).await
    }

    #[tool(description = "Activate the installed generation that is waiting to take over.")]
    async fn activate_pending(&self) -> Result<CallToolResult, McpError> {
        activate_impl(&self.cache).await
    }
}

impl ServerHandler for OffgridServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "offgrid".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self, _request: Option<PaginatedRequestParam>, _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, rmcp::model::ErrorData> {
        Ok(ListToolsResult { meta: None, tools: self.tool_router.list_all(), next_cursor: None })
    }

    async fn call_tool(
        &self, request: CallToolRequestParam, context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::model::ErrorData> {
        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}
