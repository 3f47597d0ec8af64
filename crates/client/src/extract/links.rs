//! Reference harvesting from HTML documents.

use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::css::css_references;

/// Elements and the attribute holding the fetchable reference.
const REFERENCE_SELECTORS: &[(&str, &str)] = &[
    ("link[href]", "href"),
    ("script[src]", "src"),
    ("img[src]", "src"),
    ("source[src]", "src"),
    ("video[src]", "src"),
    ("video[poster]", "poster"),
    ("audio[src]", "src"),
    ("track[src]", "src"),
    ("iframe[src]", "src"),
    ("embed[src]", "src"),
    ("object[data]", "data"),
    ("input[type=image][src]", "src"),
];

/// `rel` values that name an origin or a relationship rather than a resource.
const NON_FETCHABLE_RELS: &[&str] = &["preconnect", "dns-prefetch", "canonical", "alternate", "author", "license"];

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("invalid selector")
}

fn rel_tokens(element: &ElementRef<'_>) -> Vec<String> {
    element
        .value()
        .attr("rel")
        .map(|rel| rel.split_ascii_whitespace().map(str::to_ascii_lowercase).collect())
        .unwrap_or_default()
}

/// Resolve the document base: a `<base href>` if present, else the page URL.
pub fn document_base(html: &Html, page_url: &Url) -> Url {
    html.select(&selector("base[href]"))
        .next()
        .and_then(|base| base.value().attr("href"))
        .and_then(|href| page_url.join(href.trim()).ok())
        .unwrap_or_else(|| page_url.clone())
}

/// Every raw reference an HTML document points at, grouped by element kind.
///
/// Values are returned unresolved; duplicates are kept. Covers element
/// attributes, `srcset` candidates, inline `<style>` blocks and `style`
/// attributes.
pub fn harvest_references(html: &Html) -> Vec<String> {
    let mut refs = Vec::new();

    for (css, attr) in REFERENCE_SELECTORS {
        for element in html.select(&selector(css)) {
            if element.value().name() == "link" {
                let rels = rel_tokens(&element);
                let stylesheet = rels.iter().any(|r| r == "stylesheet");
                if !stylesheet && rels.iter().any(|r| NON_FETCHABLE_RELS.contains(&r.as_str())) {
                    continue;
                }
            }
            if let Some(value) = element.value().attr(attr) {
                refs.push(value.to_string());
            }
        }
    }

    for element in html.select(&selector("img[srcset], source[srcset]")) {
        if let Some(srcset) = element.value().attr("srcset") {
            refs.extend(srcset_candidates(srcset));
        }
    }

    for style in html.select(&selector("style")) {
        let text = style.text().collect::<String>();
        refs.extend(css_references(&text));
    }

    for element in html.select(&selector("[style]")) {
        if let Some(style) = element.value().attr("style") {
            refs.extend(css_references(style));
        }
    }

    refs
}

/// `href`s of linked style sheets, unresolved.
pub fn stylesheet_hrefs(html: &Html) -> Vec<String> {
    html.select(&selector("link[href]"))
        .filter(|el| rel_tokens(el).iter().any(|r| r == "stylesheet"))
        .filter_map(|el| el.value().attr("href").map(str::to_string))
        .collect()
}

/// URLs of a `srcset` attribute, without width/density descriptors.
fn srcset_candidates(srcset: &str) -> Vec<String> {
    srcset
        .split(',')
        .filter_map(|candidate| candidate.split_ascii_whitespace().next())
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}
