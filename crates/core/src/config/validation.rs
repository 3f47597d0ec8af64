//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use crate::resource::{NormalizePolicy, ResourceRef};
use regex::Regex;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `batch_size` is outside 1..=16
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `refresh_interval_ms` is below one second
    /// - `max_bytes` is 0 or exceeds 50MB, or `quota_bytes` is 0
    /// - a name, version or user agent is empty
    /// - a route or exclusion regex does not compile
    /// - a page, resource or offline page URL is not an absolute http(s) URL
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > 16 {
            return Err(invalid("batch_size", "must be between 1 and 16"));
        }

        if self.timeout_ms < 100 {
            return Err(invalid("timeout_ms", "must be at least 100ms"));
        }
        if self.timeout_ms > 300_000 {
            return Err(invalid("timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }

        if self.refresh_interval_ms < 1_000 {
            return Err(invalid("refresh_interval_ms", "must be at least 1000ms"));
        }

        if self.max_bytes == 0 {
            return Err(invalid("max_bytes", "must be greater than 0"));
        }
        if self.max_bytes > 50 * 1024 * 1024 {
            return Err(invalid("max_bytes", "must not exceed 50MB"));
        }
        if self.quota_bytes == 0 {
            return Err(invalid("quota_bytes", "must be greater than 0"));
        }

        for (field, value) in
            [("cache_name", &self.cache_name), ("cache_version", &self.cache_version), ("user_agent", &self.user_agent)]
        {
            if value.trim().is_empty() {
                return Err(invalid(field, "must not be empty"));
            }
        }

        for route in &self.routes {
            Regex::new(&route.pattern).map_err(|e| invalid("routes", format!("{}: {e}", route.pattern)))?;
        }
        for pattern in &self.exclude_patterns {
            Regex::new(pattern).map_err(|e| invalid("exclude_patterns", format!("{pattern}: {e}")))?;
        }

        let policy = NormalizePolicy { strip_query: self.strip_query };
        for page in &self.pages {
            ResourceRef::parse(page, policy).map_err(|e| invalid("pages", e.to_string()))?;
        }
        for resource in &self.resources {
            ResourceRef::parse(resource, policy).map_err(|e| invalid("resources", e.to_string()))?;
        }
        if let Some(page) = &self.offline_page {
            ResourceRef::parse(page, policy).map_err(|e| invalid("offline_page", e.to_string()))?;
        }

        if self.pages.is_empty() && self.resources.is_empty() {
            tracing::warn!("neither pages nor resources are configured; install will precache nothing");
        }

        Ok(())
    }
}
