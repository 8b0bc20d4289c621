//! Link extraction and normalisation.

use std::collections::HashSet;

use scraper::{Html, Selector};
use url::Url;

/// Schemes that never lead to crawlable pages.
const SKIPPED_PREFIXES: &[&str] = &["javascript:", "mailto:", "tel:", "sms:", "ftp:", "data:"];

/// Resolve `href` against `base` into an absolute http(s) URL without a
/// fragment. Returns `None` for links that cannot be crawled.
pub fn normalize_link(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let lower = href.to_ascii_lowercase();
    if SKIPPED_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return None;
    }

    let mut url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// All crawlable `<a href>` targets of a parsed document, in document order.
pub fn extract_links(document: &Html, base: Option<&Url>) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| normalize_link(href, base))
        .filter(|link| seen.insert(link.clone()))
        .collect()
}
