//! MCP tool implementations.
//!
//! Each tool is a thin adapter from JSON parameters onto [`OfflineCache`](offgrid_client::OfflineCache);
//! outputs are returned as pretty-printed JSON text content.

pub mod cache;
pub mod control;
pub mod fetch;
pub mod lifecycle;

use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;

use crate::error::ToolError;

pub(crate) fn json_result<T: Serialize>(output: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(output).map_err(ToolError::from)?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}
