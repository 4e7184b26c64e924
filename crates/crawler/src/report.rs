//! Robots-denial aggregation: in-memory log during the run, JSONL/JSON/CSV
//! reports at the end.

use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;
use url::Url;

use crate::classify::host_key;
use crate::error::{CrawlerError, Result};
use crate::manifest::ts_now;

const TOP_N: usize = 50;

/// First non-empty path segment, `/` when the path has none.
pub fn path_prefix(url: &Url) -> String {
    match url
        .path_segments()
        .and_then(|mut segments| segments.find(|s| !s.is_empty()))
    {
        Some(first) => format!("/{first}"),
        None => "/".to_string(),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DenialEntry {
    pub prefecture: String,
    pub city: String,
    pub host: String,
    pub path_prefix: String,
    pub url: String,
}

#[derive(Default)]
struct DenialLogInner {
    seen: HashSet<(String, String, String)>,
    entries: Vec<DenialEntry>,
}

/// Thread-safe denial accumulator, deduplicated per
/// `(host, path_prefix, url)`.
#[derive(Default)]
pub struct DenialLog {
    inner: Mutex<DenialLogInner>,
}

impl DenialLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the denial was newly recorded.
    pub fn record(&self, prefecture: &str, city: &str, url: &Url) -> bool {
        let host = host_key(url);
        let prefix = path_prefix(url);
        let key = (host.clone(), prefix.clone(), url.to_string());

        let mut inner = self.inner.lock().expect("denial log lock poisoned");
        if !inner.seen.insert(key) {
            return false;
        }
        inner.entries.push(DenialEntry {
            prefecture: prefecture.to_string(),
            city: city.to_string(),
            host,
            path_prefix: prefix,
            url: url.to_string(),
        });
        true
    }

    pub fn entries(&self) -> Vec<DenialEntry> {
        self.inner
            .lock()
            .expect("denial log lock poisoned")
            .entries
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("denial log lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn counts_desc<K: Ord>(keys: impl Iterator<Item = K>) -> Vec<(K, usize)> {
    let mut counts: BTreeMap<K, usize> = BTreeMap::new();
    for key in keys {
        *counts.entry(key).or_default() += 1;
    }
    // BTreeMap iterates key-ascending; the stable sort keeps that order
    // for equal counts.
    let mut sorted: Vec<(K, usize)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    sorted
}

/// Writes the denial report files into `report_dir`.
pub fn write_reports(entries: &[DenialEntry], report_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(report_dir).map_err(|e| CrawlerError::fs(report_dir, e))?;

    let jsonl_path = report_dir.join("robots_disallow_urls.jsonl");
    let mut jsonl =
        std::fs::File::create(&jsonl_path).map_err(|e| CrawlerError::fs(&jsonl_path, e))?;
    for entry in entries {
        let line = serde_json::to_string(entry)
            .map_err(|e| CrawlerError::Parse(format!("denial entry: {e}")))?;
        writeln!(jsonl, "{line}").map_err(|e| CrawlerError::fs(&jsonl_path, e))?;
    }

    let by_city = counts_desc(
        entries
            .iter()
            .map(|e| (e.prefecture.clone(), e.city.clone())),
    );
    let by_domain = counts_desc(entries.iter().map(|e| e.host.clone()));
    let by_prefix = counts_desc(
        entries
            .iter()
            .map(|e| (e.host.clone(), e.path_prefix.clone())),
    );

    let summary = json!({
        "generated_at": ts_now(),
        "robots_disallow_total": entries.len(),
        "top_by_city": by_city.iter().take(TOP_N).map(|((prefecture, city), count)| json!({
            "prefecture": prefecture, "city": city, "count": count,
        })).collect::<Vec<_>>(),
        "top_by_domain": by_domain.iter().take(TOP_N).map(|(host, count)| json!({
            "host": host, "count": count,
        })).collect::<Vec<_>>(),
        "top_by_path_prefix": by_prefix.iter().take(TOP_N).map(|((host, prefix), count)| json!({
            "host": host, "path_prefix": prefix, "count": count,
        })).collect::<Vec<_>>(),
    });
    let summary_path = report_dir.join("robots_disallow_summary.json");
    std::fs::write(
        &summary_path,
        serde_json::to_string_pretty(&summary)
            .map_err(|e| CrawlerError::Parse(format!("denial summary: {e}")))?,
    )
    .map_err(|e| CrawlerError::fs(&summary_path, e))?;

    let city_path = report_dir.join("robots_disallow_by_city.csv");
    let mut w = csv::Writer::from_path(&city_path).map_err(|e| csv_err(&city_path, e))?;
    w.write_record(["prefecture", "city", "count"])
        .map_err(|e| csv_err(&city_path, e))?;
    for ((prefecture, city), count) in &by_city {
        let count = count.to_string();
        w.write_record([prefecture.as_str(), city.as_str(), count.as_str()])
            .map_err(|e| csv_err(&city_path, e))?;
    }
    w.flush().map_err(|e| CrawlerError::fs(&city_path, e))?;

    let domain_path = report_dir.join("robots_disallow_by_domain.csv");
    let mut w = csv::Writer::from_path(&domain_path).map_err(|e| csv_err(&domain_path, e))?;
    w.write_record(["host", "count"])
        .map_err(|e| csv_err(&domain_path, e))?;
    for (host, count) in &by_domain {
        let count = count.to_string();
        w.write_record([host.as_str(), count.as_str()])
            .map_err(|e| csv_err(&domain_path, e))?;
    }
    w.flush().map_err(|e| CrawlerError::fs(&domain_path, e))?;

    let prefix_path = report_dir.join("robots_disallow_by_path_prefix.csv");
    let mut w = csv::Writer::from_path(&prefix_path).map_err(|e| csv_err(&prefix_path, e))?;
    w.write_record(["host", "path_prefix", "count"])
        .map_err(|e| csv_err(&prefix_path, e))?;
    for ((host, prefix), count) in &by_prefix {
        let count = count.to_string();
        w.write_record([host.as_str(), prefix.as_str(), count.as_str()])
            .map_err(|e| csv_err(&prefix_path, e))?;
    }
    w.flush().map_err(|e| CrawlerError::fs(&prefix_path, e))?;

    info!(
        denials = entries.len(),
        dir = %report_dir.display(),
        "robots denial reports written"
    );
    Ok(())
}

fn csv_err(path: &Path, err: csv::Error) -> CrawlerError {
    CrawlerError::fs(path, std::io::Error::other(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_prefix_takes_first_segment() {
        let url = Url::parse("http://b.example/private/minutes.pdf").unwrap();
        assert_eq!(path_prefix(&url), "/private");
        let root = Url::parse("http://b.example/").unwrap();
        assert_eq!(path_prefix(&root), "/");
    }

    #[test]
    fn denials_deduplicate_on_triple() {
        let log = DenialLog::new();
        let url = Url::parse("http://b.example/private/a.pdf").unwrap();
        assert!(log.record("pref", "city", &url));
        assert!(!log.record("pref", "city", &url));
        let other = Url::parse("http://b.example/private/b.pdf").unwrap();
        assert!(log.record("pref", "city", &other));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn reports_cover_all_groupings() {
        let dir = tempfile::tempdir().unwrap();
        let log = DenialLog::new();
        for path in ["/private/a.pdf", "/private/b.pdf", "/secret/c.pdf"] {
            let url = Url::parse(&format!("http://b.example{path}")).unwrap();
            log.record("千葉県", "市川市", &url);
        }
        write_reports(&log.entries(), dir.path()).unwrap();

        let jsonl =
            std::fs::read_to_string(dir.path().join("robots_disallow_urls.jsonl")).unwrap();
        assert_eq!(jsonl.lines().count(), 3);

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("robots_disallow_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["robots_disallow_total"], 3);
        assert_eq!(summary["top_by_path_prefix"][0]["path_prefix"], "/private");
        assert_eq!(summary["top_by_path_prefix"][0]["count"], 2);

        let csv =
            std::fs::read_to_string(dir.path().join("robots_disallow_by_path_prefix.csv")).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("host,path_prefix,count"));
        assert_eq!(lines.next(), Some("b.example,/private,2"));
        assert_eq!(lines.next(), Some("b.example,/secret,1"));

        let city_csv =
            std::fs::read_to_string(dir.path().join("robots_disallow_by_city.csv")).unwrap();
        assert!(city_csv.contains("千葉県,市川市,3"));
    }
}
