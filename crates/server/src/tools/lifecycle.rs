//! Generation lifecycle tools: lifecycle_status, upgrade and activate_pending.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use offgrid_client::{ControlMessage, ControlReply, OfflineCache};
use offgrid_core::{Error, GenerationId};

use super::json_result;

/// Parameters for the upgrade tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpgradeParams {
    /// Version label of the new generation, e.g. "v2".
    pub version: String,
}

/// Output from the activate_pending tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ActivateOutput {
    pub active: GenerationId,
}

pub async fn status_impl(cache: &OfflineCache) -> Result<CallToolResult, McpError> {
    match cache.handle(ControlMessage::GetStatus).await? {
        ControlReply::Status(status) => json_result(&status),
        other => Err(Error::InvalidState(format!("unexpected reply: {other:?}")).into()),
    }
}

pub async fn upgrade_impl(cache: &OfflineCache, params: UpgradeParams) -> Result<CallToolResult, McpError> {
    let report = cache.upgrade(&params.version).await?;
    json_result(&report)
}

pub async fn activate_impl(cache: &OfflineCache) -> Result<CallToolResult, McpError> {
    let active = cache.activate_pending().await?;
    json_result(&ActivateOutput { active })
}
