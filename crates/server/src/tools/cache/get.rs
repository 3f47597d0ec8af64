//! get_cached_entry, get_cached_resources and get_storage_usage tool implementations.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use offgrid_client::{ControlMessage, ControlReply, OfflineCache};
use offgrid_core::{Error, ResourceSummary};

use crate::tools::json_result;

/// Parameters for the get_cached_entry tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachedEntryParams {
    /// URL of the resource; normalized the same way stored keys are.
    pub url: String,
}

/// Output from the get_cached_entry tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachedEntryOutput {
    pub url: String,
    pub content_type: Option<String>,
    pub status_code: u16,
    pub stored_at: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub digest: String,
    pub size: u64,
    /// Payload as text; absent for non-UTF-8 payloads.
    pub body: Option<String>,
}

/// Output from the get_cached_resources tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachedResourcesOutput {
    pub count: usize,
    /// Entries of the active generation, ordered by URL.
    pub resources: Vec<ResourceSummary>,
}

fn unexpected(reply: &ControlReply) -> McpError {
    Error::InvalidState(format!("unexpected reply: {reply:?}")).into()
}

pub async fn cached_entry_impl(cache: &OfflineCache, params: CachedEntryParams) -> Result<CallToolResult, McpError> {
    let entry = cache.cached_entry(&params.url).await?;
    let output = CachedEntryOutput {
        url: entry.key.to_string(),
        size: entry.size(),
        body: std::str::from_utf8(&entry.payload).ok().map(str::to_string),
        content_type: entry.content_type,
        status_code: entry.status_code,
        stored_at: entry.stored_at,
        etag: entry.etag,
        last_modified: entry.last_modified,
        digest: entry.digest,
    };
    json_result(&output)
}

pub async fn cached_resources_impl(cache: &OfflineCache) -> Result<CallToolResult, McpError> {
    match cache.handle(ControlMessage::GetCachedResources).await? {
        ControlReply::Resources(resources) => {
            json_result(&CachedResourcesOutput { count: resources.len(), resources })
        }
        other => Err(unexpected(&other)),
    }
}

pub async fn storage_usage_impl(cache: &OfflineCache) -> Result<CallToolResult, McpError> {
    match cache.handle(ControlMessage::GetStorageUsage).await? {
        ControlReply::Usage(usage) => json_result(&usage),
        other => Err(unexpected(&other)),
    }
}
