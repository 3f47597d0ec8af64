//! Resource discovery.
//!
//! ### Contract
//! - [`ResourceExtractor::extract`] reads a [`PageContext`] only; it never
//!   touches the store.
//! - The page's own canonical URL is always part of the result.
//! - References are resolved against the document base, normalized and
//!   deduplicated by their normalized form.
//!
//! ### Traversal
//! - Element attributes, `srcset`, inline `<style>` and `style=` attributes.
//! - One level into linked style sheets: their `url(...)` and `@import`
//!   targets are resolved against the sheet's own URL.
//!
//! ### Dropped references
//! Unresolvable values, non-fetchable schemes (`data:`, `blob:`, ...),
//! excluded paths and, when configured, foreign origins are skipped with a
//! [`EventKind::ReferenceDropped`] event. None of these is an error.

pub mod css;
pub mod links;
pub mod page;

pub use links::{document_base, harvest_references, stylesheet_hrefs};
pub use page::PageLoader;

use regex::Regex;
use scraper::Html;
use std::collections::BTreeSet;
use std::sync::Arc;
use url::Url;

use offgrid_core::{Error, EventKind, EventSink, NormalizePolicy, ResourceRef};

/// A loaded page: its final URL, its markup and the linked style sheets
/// that could be fetched.
#[derive(Debug, Clone)]
pub struct PageContext {
    /// URL the document was served from, after redirects.
    pub url: Url,
    pub html: String,
    /// Linked style sheets and their text.
    pub stylesheets: Vec<(ResourceRef, String)>,
}

impl PageContext {
    pub fn new(url: Url, html: impl Into<String>) -> Self {
        Self { url, html: html.into(), stylesheets: Vec::new() }
    }

    pub fn with_stylesheet(mut self, url: ResourceRef, css: impl Into<String>) -> Self {
        self.stylesheets.push((url, css.into()));
        self
    }
}

/// Produces the set of resources a page needs.
pub trait ResourceExtractor: Send + Sync {
    fn extract(&self, page: &PageContext) -> BTreeSet<ResourceRef>;
}

/// Caller-supplied exclusion rules.
#[derive(Debug, Clone, Default)]
pub struct ExclusionRules {
    patterns: Vec<Regex>,
    same_origin_only: bool,
}

impl ExclusionRules {
    /// Compile `patterns`; each is matched against the URL path.
    pub fn new(patterns: &[String], same_origin_only: bool) -> Result<Self, Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| Error::InvalidInput(format!("exclude pattern '{p}': {e}"))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns, same_origin_only })
    }

    /// Why `candidate` is excluded for a page at `page`, if it is.
    pub fn reason(&self, candidate: &ResourceRef, page: &Url) -> Option<String> {
        if self.same_origin_only && !candidate.same_origin(page) {
            return Some("foreign origin".to_string());
        }
        let path = candidate.url().path();
        self.patterns
            .iter()
            .find(|p| p.is_match(path))
            .map(|p| format!("matches exclude pattern '{}'", p.as_str()))
    }
}

/// The HTML/CSS extractor.
pub struct HtmlResourceExtractor {
    rules: ExclusionRules,
    policy: NormalizePolicy,
    events: Arc<dyn EventSink>,
}

impl HtmlResourceExtractor {
    pub fn new(rules: ExclusionRules, policy: NormalizePolicy, events: Arc<dyn EventSink>) -> Self {
        Self { rules, policy, events }
    }

    fn admit(&self, base: &Url, page: &Url, raw: &str, found: &mut BTreeSet<ResourceRef>) {
        match ResourceRef::resolve(base, raw, self.policy) {
            Ok(candidate) => match self.rules.reason(&candidate, page) {
                Some(reason) => self
                    .events
                    .on_event(EventKind::ReferenceDropped, &format!("{candidate}: {reason}")),
                None => {
                    found.insert(candidate);
                }
            },
            Err(e) => self
                .events
                .on_event(EventKind::ReferenceDropped, &format!("'{}': {e}", raw.trim())),
        }
    }
}

impl ResourceExtractor for HtmlResourceExtractor {
    fn extract(&self, page: &PageContext) -> BTreeSet<ResourceRef> {
        let mut found = BTreeSet::new();

        match ResourceRef::from_url(page.url.clone(), self.policy) {
            Ok(canonical) => {
                found.insert(canonical);
            }
            Err(e) => self
                .events
                .on_event(EventKind::ReferenceDropped, &format!("{}: {e}", page.url)),
        }

        let html = Html::parse_document(&page.html);
        let base = document_base(&html, &page.url);
        for raw in harvest_references(&html) {
            self.admit(&base, &page.url, &raw, &mut found);
        }

        for (sheet, css) in &page.stylesheets {
            for raw in css::css_references(css) {
                self.admit(sheet.url(), &page.url, &raw, &mut found);
            }
        }

        tracing::debug!("extracted {} resources from {}", found.len(), page.url);
        found
    }
}
