//! Intercepted resource requests.

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use offgrid_core::Error;

/// What kind of load a request is, which decides the shape of the fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A top-level document load.
    Navigation,
    /// Anything a document pulls in: styles, scripts, images, fonts, data.
    #[default]
    Subresource,
}

/// A request the policy engine decides how to serve.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub url: Url,
    pub method: Method,
    pub kind: RequestKind,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl ResourceRequest {
    /// A plain GET for a subresource.
    pub fn get(url: Url) -> Self {
        Self { url, method: Method::GET, kind: RequestKind::Subresource, headers: HeaderMap::new(), body: None }
    }

    /// A GET navigation to a document.
    pub fn navigate(url: Url) -> Self {
        Self { kind: RequestKind::Navigation, ..Self::get(url) }
    }

    /// Parse `url` and build a request with the given method name.
    pub fn parse(url: &str, method: &str, kind: RequestKind) -> Result<Self, Error> {
        let url = Url::parse(url.trim()).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|e| Error::InvalidInput(format!("invalid method '{method}': {e}")))?;
        Ok(Self { method, kind, ..Self::get(url) })
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Only GET reads are eligible for storage.
    pub fn is_cacheable_method(&self) -> bool {
        self.method == Method::GET
    }

    pub fn is_navigation(&self) -> bool {
        self.kind == RequestKind::Navigation
    }
}
