//! Tools that drive the working set: cache_resources, cache_page,
//! update_resources and set_connectivity.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use offgrid_client::{ControlMessage, ControlReply, OfflineCache};
use offgrid_core::Error;

use super::json_result;

/// Parameters for the cache_resources tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheResourcesParams {
    /// Absolute URLs to fetch, store and keep current.
    pub resources: Vec<String>,
}

/// Parameters for the cache_page tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachePageParams {
    /// Page URL; the page and everything it references are stored.
    pub url: String,
}

/// Parameters for the set_connectivity tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SetConnectivityParams {
    pub online: bool,
}

/// Output from the set_connectivity tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SetConnectivityOutput {
    pub online: bool,
}

async fn send(cache: &OfflineCache, message: ControlMessage) -> Result<CallToolResult, McpError> {
    match cache.handle(message).await? {
        ControlReply::Batch(report) => json_result(&report),
        ControlReply::Cycle(report) => json_result(&report),
        other => json_result(&other),
    }
}

pub async fn cache_resources_impl(
    cache: &OfflineCache, params: CacheResourcesParams,
) -> Result<CallToolResult, McpError> {
    send(cache, ControlMessage::CacheResources { resources: params.resources }).await
}

pub async fn cache_page_impl(cache: &OfflineCache, params: CachePageParams) -> Result<CallToolResult, McpError> {
    if params.url.trim().is_empty() {
        return Err(Error::InvalidInput("url cannot be empty".into()).into());
    }
    send(cache, ControlMessage::CachePage { url: params.url }).await
}

pub async fn update_resources_impl(cache: &OfflineCache) -> Result<CallToolResult, McpError> {
    send(cache, ControlMessage::UpdateResources).await
}

pub async fn set_connectivity_impl(
    cache: &OfflineCache, params: SetConnectivityParams,
) -> Result<CallToolResult, McpError> {
    cache
        .handle(ControlMessage::ConnectivityChanged { online: params.online })
        .await?;
    json_result(&SetConnectivityOutput { online: params.online })
}
