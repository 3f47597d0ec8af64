//! Reference harvesting from style sheets.
//!
//! Picks up `url(...)` tokens (fonts, background images, cursors) and
//! `@import` targets. Values are returned unresolved.

use regex::Regex;
use std::sync::LazyLock;

static URL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"url\(\s*(?:"([^"]*)"|'([^']*)'|([^)'"\s]+))\s*\)"#).expect("invalid url() regex")
});

static IMPORT_STRING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"@import\s+(?:"([^"]+)"|'([^']+)')"#).expect("invalid @import regex"));

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("invalid comment regex"));

/// Every reference a style sheet points at, in source order per kind.
pub fn css_references(css: &str) -> Vec<String> {
    let css = COMMENT.replace_all(css, "");
    let mut refs = Vec::new();

    for caps in URL_TOKEN.captures_iter(&css) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) {
            let value = m.as_str().trim();
            if !value.is_empty() {
                refs.push(value.to_string());
            }
        }
    }

    for caps in IMPORT_STRING.captures_iter(&css) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            refs.push(m.as_str().trim().to_string());
        }
    }

    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_tokens_all_quote_styles() {
        let css = r#"
            @font-face { src: url("/fonts/a.woff2") format("woff2"), url('/fonts/a.woff'); }
            .hero { background: url( /img/hero.png ) no-repeat; }
        "#;
        assert_eq!(css_references(css), vec!["/fonts/a.woff2", "/fonts/a.woff", "/img/hero.png"]);
    }

    #[test]
    fn test_import_forms() {
        let css = r#"
            @import "base.css";
            @import url("theme.css");
            @import 'print.css' print;
        "#;
        let refs = css_references(css);
        assert!(refs.contains(&"base.css".to_string()));
        assert!(refs.contains(&"theme.css".to_string()));
        assert!(refs.contains(&"print.css".to_string()));
    }

    #[test]
    fn test_data_uris_are_returned_for_the_caller_to_drop() {
        let css = "a { cursor: url(data:image/png;base64,AAAA), auto; }";
        assert_eq!(css_references(css), vec!["data:image/png;base64,AAAA"]);
    }

    #[test]
    fn test_comments_ignored() {
        let css = "/* url(/old.png) */ body { background: url(/new.png); }";
        assert_eq!(css_references(css), vec!["/new.png"]);
    }

    #[test]
    fn test_empty_url() {
        assert!(css_references(r#"a { background: url(""); }"#).is_empty());
    }
}
