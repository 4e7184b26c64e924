//! Seed-list input: municipality records, seed selection, task ordering.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tracing::debug;
use url::Url;

use crate::classify::{host_key, normalize};
use crate::error::{CrawlerError, Result};

/// One municipality from the upstream discovery stage. The map values are
/// candidate minute-document counts observed under each index URL.
#[derive(Debug, Clone, Deserialize)]
pub struct Municipality {
    pub prefecture: String,
    pub city: String,
    #[serde(default)]
    pub parent: HashMap<String, u64>,
    #[serde(default)]
    pub grand_parent: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedSource {
    Parent,
    GrandParent,
}

#[derive(Debug, Clone)]
pub struct SeedTask {
    pub prefecture: String,
    pub city: String,
    pub source: SeedSource,
    pub url: Url,
}

pub fn load_municipalities(path: &Path) -> Result<Vec<Municipality>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CrawlerError::Config(format!("cannot read input {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| CrawlerError::Config(format!("malformed input {}: {e}", path.display())))
}

impl Municipality {
    /// Seeds come from `parent` when its document count clears the
    /// threshold, otherwise from `grand_parent`. A key that does not parse
    /// as a URL is a defect in the input file, not something to crawl
    /// around.
    pub fn choose_seeds(&self, threshold: u64) -> Result<(SeedSource, Vec<Url>)> {
        let parent_total: u64 = self.parent.values().sum();
        let (source, map) = if parent_total >= threshold && !self.parent.is_empty() {
            (SeedSource::Parent, &self.parent)
        } else {
            (SeedSource::GrandParent, &self.grand_parent)
        };

        let mut urls = Vec::with_capacity(map.len());
        for raw in map.keys() {
            match normalize(raw, None) {
                Some(url) => urls.push(url),
                None => {
                    return Err(CrawlerError::InvalidUrl(format!(
                        "{raw} (seed for {}/{})",
                        self.prefecture, self.city
                    )))
                }
            }
        }
        urls.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        urls.dedup();
        Ok((source, urls))
    }
}

/// Expands municipality records into per-seed tasks. Municipalities with
/// no seed URLs are skipped; a malformed seed URL fails the run as a
/// configuration error.
pub fn build_tasks(records: &[Municipality], threshold: u64) -> Result<Vec<SeedTask>> {
    let mut tasks = Vec::new();
    for record in records {
        if record.prefecture.is_empty() || record.city.is_empty() {
            continue;
        }
        let (source, urls) = record.choose_seeds(threshold)?;
        if urls.is_empty() {
            debug!(
                prefecture = %record.prefecture,
                city = %record.city,
                "no seed urls, skipping municipality"
            );
            continue;
        }
        for url in urls {
            tasks.push(SeedTask {
                prefecture: record.prefecture.clone(),
                city: record.city.clone(),
                source,
                url,
            });
        }
    }
    Ok(tasks)
}

/// Interleaves tasks by host so seeds sharing a rate-limit window are not
/// scheduled back to back.
pub fn round_robin_by_host(tasks: Vec<SeedTask>) -> Vec<SeedTask> {
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, VecDeque<SeedTask>> = HashMap::new();
    for task in tasks {
        let key = host_key(&task.url);
        if !buckets.contains_key(&key) {
            order.push(key.clone());
        }
        buckets.entry(key).or_default().push_back(task);
    }

    let mut ordered = Vec::new();
    loop {
        let mut emitted = false;
        for key in &order {
            if let Some(bucket) = buckets.get_mut(key) {
                if let Some(task) = bucket.pop_front() {
                    ordered.push(task);
                    emitted = true;
                }
            }
        }
        if !emitted {
            break;
        }
    }
    ordered
}
