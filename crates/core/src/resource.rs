//! Normalized resource identifiers.
//!
//! A [`ResourceRef`] is the key under which a cacheable unit is stored.
//! Normalization steps:
//! 1. Trim leading/trailing whitespace
//! 2. Resolve against a base URL when the reference is relative
//! 3. Reject anything that is not `http`/`https` (`data:`, `blob:`, `javascript:`, ...)
//! 4. Lowercase the host, drop the default port
//! 5. Remove the fragment, and the query string when the policy says so
//!
//! Normalizing an already normalized value yields the same value.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Error type for reference normalization failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<UrlError> for crate::Error {
    fn from(err: UrlError) -> Self {
        crate::Error::InvalidUrl(err.to_string())
    }
}

/// How much of a URL survives normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizePolicy {
    /// Drop the query string (`?a=1`) in addition to the fragment.
    pub strip_query: bool,
}

impl Default for NormalizePolicy {
    fn default() -> Self {
        Self { strip_query: true }
    }
}

/// A normalized absolute identifier for a cacheable unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRef(Url);

impl ResourceRef {
    /// Normalize an absolute URL string.
    pub fn parse(input: &str, policy: NormalizePolicy) -> Result<Self, UrlError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(UrlError::Empty);
        }

        let parsed = Url::parse(trimmed).map_err(|e| UrlError::InvalidUrl(format!("{trimmed}: {e}")))?;
        Self::from_url(parsed, policy)
    }

    /// Resolve a possibly relative reference against `base`, then normalize.
    pub fn resolve(base: &Url, reference: &str, policy: NormalizePolicy) -> Result<Self, UrlError> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(UrlError::Empty);
        }

        let joined = base
            .join(trimmed)
            .map_err(|e| UrlError::InvalidUrl(format!("{trimmed}: {e}")))?;
        Self::from_url(joined, policy)
    }

    /// Normalize an already parsed URL.
    pub fn from_url(mut url: Url, policy: NormalizePolicy) -> Result<Self, UrlError> {
        match url.scheme() {
            "http" | "https" => {}
            scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
        }

        if let Some(host) = url.host_str() {
            let lowered = host.to_lowercase();
            url.set_host(Some(&lowered))
                .map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
        }

        url.set_fragment(None);
        if policy.strip_query {
            url.set_query(None);
        }

        Ok(Self(url))
    }

    /// Normalized string form; also the store key.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Parsed form of the reference.
    pub fn url(&self) -> &Url {
        &self.0
    }

    /// True when `other` shares scheme, host and port with this ref.
    pub fn same_origin(&self, other: &Url) -> bool {
        self.0.origin() == other.origin()
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl AsRef<str> for ResourceRef {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}
