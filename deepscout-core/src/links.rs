//! Link validity, normalization, and extraction from fetched HTML.

use regex::Regex;
use std::collections::HashSet;
use tracing::debug;
use url::Url;

/// File extensions that never carry article text.
const STATIC_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".css", ".js", ".zip", ".tar", ".gz", ".exe", ".svg",
    ".ico", ".mp3", ".mp4", ".avi", ".mov", ".flv", ".wmv",
];

/// Whether a URL is worth fetching: http(s) scheme and not a static asset.
pub fn is_fetchable_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let path = parsed.path().to_lowercase();
    !STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Normalize a URL for dedup: drop query and fragment, strip the trailing
/// slash. Unparsable input is returned slash-trimmed so the seen-set still
/// works on it.
pub fn normalize_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            let mut out = parsed.to_string();
            while out.ends_with('/') {
                out.pop();
            }
            out
        }
        Err(_) => url.trim_end_matches('/').to_string(),
    }
}

/// Whether a URL points at a PDF document (`.pdf` suffix or a `/pdf/` path
/// segment, which covers paper-archive download routes).
pub fn is_pdf_url(url: &str) -> bool {
    let path = Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_else(|_| url.to_lowercase());
    path.ends_with(".pdf") || path.contains("/pdf/")
}

/// Extract candidate links from HTML.
///
/// Every `href` is resolved against `base_url`, filtered through
/// [`is_fetchable_url`], and deduplicated preserving first-seen order.
pub fn extract_links(html: &str, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        debug!(base_url, "unparsable base URL, no links extracted");
        return Vec::new();
    };
    let Ok(href_re) = Regex::new(r#"href\s*=\s*["']([^"'<>\s]+)["']"#) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for caps in href_re.captures_iter(html) {
        let href = &caps[1];
        let Ok(absolute) = base.join(href) else {
            continue;
        };
        let absolute = absolute.to_string();
        if is_fetchable_url(&absolute) && seen.insert(absolute.clone()) {
            links.push(absolute);
        }
    }
    links
}
