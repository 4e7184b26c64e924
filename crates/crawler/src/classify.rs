//! Pure URL and link classification. No I/O lives here.

use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Resolves `raw` against `base` (when given) into a normalized absolute URL.
///
/// Normalization: lower-cased scheme/host (the `url` crate does this on
/// parse), fragment dropped, duplicate slashes in the path collapsed, query
/// string left untouched.
pub fn normalize(raw: &str, base: Option<&Url>) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut url = match base {
        Some(base) => base.join(raw).ok()?,
        None => Url::parse(raw).ok()?,
    };
    url.set_fragment(None);
    let path = url.path();
    if path.contains("//") {
        let collapsed = collapse_slashes(path);
        url.set_path(&collapsed);
    }
    Some(url)
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

/// Host key used for rate limiting, robots caching, and scope checks.
/// Includes the port so distinct servers on one address stay independent.
pub fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Lower-cased extension (including the dot) of the last path segment.
pub fn url_extension(url: &Url) -> Option<String> {
    let last = url.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let dot = last.rfind('.')?;
    if dot == 0 || dot == last.len() - 1 {
        return None;
    }
    Some(last[dot..].to_lowercase())
}

/// True iff the URL's last path segment carries a payload extension.
/// HTML is navigational by definition and never counts as a file.
pub fn is_minute_file(url: &Url, file_exts: &HashSet<String>) -> bool {
    match url_extension(url) {
        Some(ext) if ext == ".html" || ext == ".htm" => false,
        Some(ext) => file_exts.contains(&ext),
        None => false,
    }
}

/// Minutes-likeliness score: 2 for a keyword match in the anchor text or
/// URL, 1 for a romanized hint in the URL, 0 otherwise.
pub fn looks_like_minute(url: &Url, anchor_text: &str, keywords: &[String], url_hints: &[String]) -> u8 {
    let raw = url.as_str();
    if keywords
        .iter()
        .any(|k| anchor_text.contains(k.as_str()) || raw.contains(k.as_str()))
    {
        return 2;
    }
    let lower = raw.to_lowercase();
    if url_hints.iter().any(|h| lower.contains(h.as_str())) {
        return 1;
    }
    0
}

/// Extracts `(absolute_url, anchor_text)` pairs from the anchors of an HTML
/// document. Skips empty, `javascript:`, `mailto:`, and `tel:` hrefs.
pub fn extract_links(html: &str, base: &Url) -> Vec<(Url, String)> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() {
            continue;
        }
        let lower = href.to_lowercase();
        if lower.starts_with("javascript:") || lower.starts_with("mailto:") || lower.starts_with("tel:") {
            continue;
        }
        let Some(url) = normalize(href, Some(base)) else {
            continue;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }
        let text = element
            .text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        links.push((url, text));
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlerConfig;

    fn base() -> Url {
        Url::parse("http://www.city.example.jp/gikai/index.html").unwrap()
    }

    #[test]
    fn normalize_resolves_and_strips_fragment() {
        let url = normalize("minutes.pdf#page=2", Some(&base())).unwrap();
        assert_eq!(url.as_str(), "http://www.city.example.jp/gikai/minutes.pdf");
    }

    #[test]
    fn normalize_collapses_duplicate_slashes() {
        let url = normalize("http://EXAMPLE.jp//a//b/c.pdf?x=1//2", None).unwrap();
        assert_eq!(url.as_str(), "http://example.jp/a/b/c.pdf?x=1//2");
    }

    #[test]
    fn normalize_empty_path_becomes_root() {
        let url = normalize("http://example.jp", None).unwrap();
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn host_key_keeps_port() {
        let url = Url::parse("http://127.0.0.1:8080/x").unwrap();
        assert_eq!(host_key(&url), "127.0.0.1:8080");
    }

    #[test]
    fn minute_file_requires_payload_extension() {
        let cfg = CrawlerConfig::default();
        let pdf = Url::parse("http://a.example/r7/teirei.PDF").unwrap();
        let html = Url::parse("http://a.example/r7/teirei.html").unwrap();
        let bare = Url::parse("http://a.example/r7/teirei").unwrap();
        assert!(is_minute_file(&pdf, &cfg.file_exts));
        assert!(!is_minute_file(&html, &cfg.file_exts));
        assert!(!is_minute_file(&bare, &cfg.file_exts));
    }

    #[test]
    fn minute_score_prefers_keywords_over_hints() {
        let cfg = CrawlerConfig::default();
        let url = Url::parse("http://a.example/gikai/r7.pdf").unwrap();
        assert_eq!(looks_like_minute(&url, "議事録（令和7年）", &cfg.keywords, &cfg.url_hints), 2);
        assert_eq!(looks_like_minute(&url, "ダウンロード", &cfg.keywords, &cfg.url_hints), 1);
        let plain = Url::parse("http://a.example/docs/r7.pdf").unwrap();
        assert_eq!(looks_like_minute(&plain, "ダウンロード", &cfg.keywords, &cfg.url_hints), 0);
    }

    #[test]
    fn extract_links_skips_pseudo_schemes() {
        let html = r#"
            <html><body>
              <a href="minutes.pdf">議事録</a>
              <a href="javascript:void(0)">open</a>
              <a href="mailto:gikai@example.jp">contact</a>
              <a href="tel:0120-000-000">call</a>
              <a href="">blank</a>
              <a href="/gikai/r7/">令和7年 定例会</a>
            </body></html>"#;
        let links = extract_links(html, &base());
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].0.as_str(), "http://www.city.example.jp/gikai/minutes.pdf");
        assert_eq!(links[0].1, "議事録");
        assert_eq!(links[1].0.path(), "/gikai/r7/");
    }

    #[test]
    fn anchor_text_is_whitespace_collapsed() {
        let html = "<a href=\"a.pdf\">  第1回\n  定例会  </a>";
        let links = extract_links(html, &base());
        assert_eq!(links[0].1, "第1回 定例会");
    }
}
