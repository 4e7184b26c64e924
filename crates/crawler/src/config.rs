use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Keywords that mark an anchor or URL as minutes-related (score 2).
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "議事録",
    "会議録",
    "議会",
    "本会議",
    "委員会",
    "定例会",
    "臨時会",
    "会議結果",
];

/// Romanized URL fragments that hint at council pages (score 1).
pub const DEFAULT_URL_HINTS: &[&str] = &["gikai", "kaigi", "giji", "minutes", "council"];

/// Document extensions accepted as minute-body payloads. HTML never counts.
pub const DEFAULT_FILE_EXTS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".txt", ".rtf",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    pub input: PathBuf,
    pub outdir: PathBuf,
    pub manifest_path: PathBuf,
    pub report_dir: PathBuf,

    /// Minimum `parent` document count required to seed from `parent` URLs.
    pub threshold: u64,
    pub max_depth: u32,
    pub max_pages: u64,
    pub workers: usize,

    pub delay: Duration,
    pub timeout: Duration,
    pub max_redirects: usize,
    pub user_agent: String,

    pub keywords: Vec<String>,
    pub url_hints: Vec<String>,
    pub file_exts: HashSet<String>,

    pub same_domain_only: bool,
    pub same_path_prefix_only: bool,
    pub respect_robots: bool,

    pub resume: bool,
    pub overwrite_manifest: bool,
    pub skip_completed_seeds: bool,
    pub recheck_seeds: bool,
    pub force_download: bool,
    pub save_pages: bool,
    pub download_files: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        let outdir = PathBuf::from("data/minutes_out");
        Self {
            input: PathBuf::from("data/minute_link_list.json"),
            manifest_path: outdir.join("manifest.jsonl"),
            report_dir: outdir.join("reports"),
            outdir,
            threshold: 5,
            max_depth: 2,
            max_pages: 200,
            workers: 8,
            delay: Duration::from_millis(500),
            timeout: Duration::from_secs(20),
            max_redirects: 5,
            user_agent: "MinutesHarvester/1.0 (+polite municipal minutes crawler)".to_string(),
            keywords: DEFAULT_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            url_hints: DEFAULT_URL_HINTS.iter().map(|s| s.to_string()).collect(),
            file_exts: DEFAULT_FILE_EXTS.iter().map(|s| s.to_string()).collect(),
            same_domain_only: true,
            same_path_prefix_only: false,
            respect_robots: true,
            resume: true,
            overwrite_manifest: false,
            skip_completed_seeds: true,
            recheck_seeds: true,
            force_download: false,
            save_pages: true,
            download_files: true,
        }
    }
}

impl CrawlerConfig {
    /// Config rooted at `outdir`, with manifest and report paths derived from it.
    pub fn for_outdir(outdir: impl Into<PathBuf>) -> Self {
        let outdir = outdir.into();
        Self {
            manifest_path: outdir.join("manifest.jsonl"),
            report_dir: outdir.join("reports"),
            outdir,
            ..Default::default()
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Parses a comma-separated override list, dropping empty entries.
    pub fn split_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Extension overrides are lower-cased and dot-prefixed.
    pub fn split_ext_list(raw: &str) -> HashSet<String> {
        Self::split_list(raw)
            .into_iter()
            .map(|e| {
                let e = e.to_lowercase();
                if e.starts_with('.') {
                    e
                } else {
                    format!(".{e}")
                }
            })
            .collect()
    }
}
