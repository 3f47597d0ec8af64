//! offline_fetch tool implementation.
//!
//! Routes one request through the fetch policy engine, exactly as an
//! intercepted page load would be served.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use offgrid_client::{OfflineCache, RequestKind, ResourceRequest, ResponseSource};

use super::json_result;

/// Input parameters for the offline_fetch tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OfflineFetchParams {
    /// The URL to request.
    pub url: String,

    /// HTTP method (default: GET). Anything else passes straight through.
    #[serde(default = "default_method")]
    pub method: String,

    /// Treat the request as a top-level document load.
    #[serde(default)]
    pub navigate: bool,
}

fn default_method() -> String {
    "GET".into()
}

/// Output structure for the offline_fetch tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineFetchOutput {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub source: ResponseSource,
    pub bytes: usize,
    /// Body as text; absent for non-UTF-8 payloads.
    pub body: Option<String>,
}

pub async fn offline_fetch_impl(
    cache: &OfflineCache, params: OfflineFetchParams,
) -> Result<CallToolResult, McpError> {
    let kind = if params.navigate { RequestKind::Navigation } else { RequestKind::Subresource };
    let request = ResourceRequest::parse(&params.url, &params.method, kind)?;

    let response = cache.fetch(&request).await;
    tracing::debug!("offline_fetch {} -> {} ({:?})", params.url, response.status, response.source);

    let output = OfflineFetchOutput {
        bytes: response.body.len(),
        body: std::str::from_utf8(&response.body).ok().map(str::to_string),
        url: response.url,
        status: response.status,
        content_type: response.content_type,
        source: response.source,
    };
    json_result(&output)
}
