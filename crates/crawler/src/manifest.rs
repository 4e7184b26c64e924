//! Append-only JSONL event log plus the derived in-memory resume index.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::{CrawlerError, Result};

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn ts_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// HTTP validators (or a body hash) captured from a seed index response.
/// At least one field must be populated for a seed to be change-checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
}

impl Validator {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none() && self.content_sha256.is_none()
    }

    pub fn has_http_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Identifies the municipality and seed an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedScope {
    pub prefecture: String,
    pub city: String,
    pub seed_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    File,
    Page,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CompletedUnchanged,
    NoChangeDetected,
    RobotsDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPhase {
    Fetch,
    Parse,
    Download,
    SavePage,
    SeedCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManifestEvent {
    RunStarted {
        ts: String,
        input: String,
        outdir: String,
        workers: usize,
        resume: bool,
        respect_robots: bool,
        save_pages: bool,
        download_files: bool,
    },
    SeedStarted {
        ts: String,
        #[serde(flatten)]
        scope: SeedScope,
    },
    SeedDone {
        ts: String,
        #[serde(flatten)]
        scope: SeedScope,
        pages_fetched: u64,
        files_downloaded: u64,
        index_validator: Validator,
    },
    SeedSkipped {
        ts: String,
        #[serde(flatten)]
        scope: SeedScope,
        reason: SkipReason,
    },
    PageSaved {
        ts: String,
        #[serde(flatten)]
        scope: SeedScope,
        url: String,
        path: String,
        content_sha256: String,
    },
    LinkFound {
        ts: String,
        #[serde(flatten)]
        scope: SeedScope,
        page_url: String,
        target_url: String,
        kind: LinkKind,
        anchor_text: String,
    },
    DownloadedFile {
        ts: String,
        #[serde(flatten)]
        scope: SeedScope,
        url: String,
        path: String,
        size: u64,
        content_sha256: String,
    },
    RobotsDenied {
        ts: String,
        #[serde(flatten)]
        scope: SeedScope,
        url: String,
        host: String,
        path_prefix: String,
    },
    Error {
        ts: String,
        #[serde(flatten)]
        scope: SeedScope,
        url: String,
        phase: ErrorPhase,
        message: String,
    },
    RunFinished {
        ts: String,
        seeds_total: usize,
        seeds_skipped: usize,
        pages_fetched: u64,
        files_downloaded: u64,
        robots_denied: usize,
    },
}

/// Cloneable producer handle; all appends funnel through one writer task.
#[derive(Clone)]
pub struct ManifestWriter {
    tx: mpsc::Sender<ManifestEvent>,
}

impl ManifestWriter {
    /// Opens the manifest for append and spawns the single writer task.
    /// Failing to open the manifest is fatal for the run.
    pub fn spawn(path: &Path) -> Result<(Self, JoinHandle<()>)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CrawlerError::ManifestWrite)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(CrawlerError::ManifestWrite)?;

        let (tx, mut rx) = mpsc::channel::<ManifestEvent>(1024);
        let handle = tokio::spawn(async move {
            let mut file = tokio::fs::File::from_std(file);
            while let Some(event) = rx.recv().await {
                let mut line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "failed to encode manifest event");
                        continue;
                    }
                };
                line.push('\n');
                // Flush-per-event: a crash loses at most the event in flight.
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!(error = %e, "manifest append failed; event dropped");
                    continue;
                }
                if let Err(e) = file.sync_data().await {
                    error!(error = %e, "manifest fsync failed");
                }
            }
        });

        Ok((Self { tx }, handle))
    }

    pub async fn emit(&self, event: ManifestEvent) {
        if self.tx.send(event).await.is_err() {
            error!("manifest writer gone; event dropped");
        }
    }
}

pub type SeedKey = (String, String, String);

/// Resume state derived by replaying the manifest at startup.
#[derive(Debug, Default)]
pub struct ManifestIndex {
    pub completed_seeds: HashMap<SeedKey, Validator>,
    pub downloaded_urls: HashSet<String>,
    pub saved_pages: HashMap<String, String>,
    pub malformed_lines: usize,
}

impl ManifestIndex {
    /// Streams the manifest and folds events into the derived indices.
    /// Malformed lines are counted and skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let mut index = Self::default();
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(CrawlerError::ManifestWrite(e)),
        };

        for line in std::io::BufReader::new(file).lines() {
            let line = line.map_err(CrawlerError::ManifestWrite)?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ManifestEvent>(&line) {
                Ok(event) => index.apply(event),
                Err(_) => index.malformed_lines += 1,
            }
        }
        if index.malformed_lines > 0 {
            warn!(count = index.malformed_lines, "skipped malformed manifest lines");
        }
        Ok(index)
    }

    fn apply(&mut self, event: ManifestEvent) {
        match event {
            ManifestEvent::SeedDone {
                scope,
                index_validator,
                ..
            } => {
                self.completed_seeds.insert(
                    (scope.prefecture, scope.city, scope.seed_url),
                    index_validator,
                );
            }
            ManifestEvent::DownloadedFile { url, .. } => {
                self.downloaded_urls.insert(url);
            }
            ManifestEvent::PageSaved { url, path, .. } => {
                self.saved_pages.insert(url, path);
            }
            _ => {}
        }
    }

    pub fn completed(&self, scope: &SeedScope) -> Option<&Validator> {
        self.completed_seeds.get(&(
            scope.prefecture.clone(),
            scope.city.clone(),
            scope.seed_url.clone(),
        ))
    }
}
