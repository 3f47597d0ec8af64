//! clear_cache and purge_cache tool implementations.
//!
//! clear_cache empties the active generation and forgets the working set;
//! purge_cache only drops entries stored longer ago than a given age.

use std::time::Duration;

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use offgrid_client::{ControlMessage, ControlReply, OfflineCache};
use offgrid_core::Error;

use crate::error::ToolError;
use crate::tools::json_result;

/// Parameters for the purge_cache tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PurgeCacheParams {
    /// Purge entries stored more than this many milliseconds ago.
    pub older_than_ms: u64,
}

/// Output from the purge_cache tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PurgeCacheOutput {
    /// Number of entries deleted.
    pub deleted: u64,
}

/// Output from the clear_cache tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClearCacheOutput {
    pub cleared: u64,
}

pub async fn clear_cache_impl(cache: &OfflineCache) -> Result<CallToolResult, McpError> {
    match cache.handle(ControlMessage::ClearCache).await? {
        ControlReply::Cleared { entries } => json_result(&ClearCacheOutput { cleared: entries }),
        other => Err(Error::InvalidState(format!("unexpected reply: {other:?}")).into()),
    }
}

pub async fn purge_impl(cache: &OfflineCache, params: PurgeCacheParams) -> Result<CallToolResult, McpError> {
    if params.older_than_ms == 0 {
        return Err(ToolError::InvalidInput("older_than_ms must be positive".into()).into());
    }

    let deleted = cache
        .purge_older_than(Duration::from_millis(params.older_than_ms))
        .await?;
    json_result(&PurgeCacheOutput { deleted })
}
