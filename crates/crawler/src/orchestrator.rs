//! Runs seed crawlers through a bounded worker pool, wiring the shared
//! collaborators: HTTP client, robots cache, rate limiter, download
//! ledger, and the single manifest writer.

use futures::{stream, StreamExt};
use std::sync::Arc;
use tracing::{error, info};

use crate::client::HttpClient;
use crate::config::CrawlerConfig;
use crate::crawl::{DownloadLedger, SeedCrawler, SeedOutcome};
use crate::error::{CrawlerError, Result};
use crate::manifest::{ts_now, ManifestEvent, ManifestIndex, ManifestWriter};
use crate::rate_limiter::HostRateLimiter;
use crate::report::{self, DenialLog};
use crate::robots::RobotsCache;
use crate::seeds::{build_tasks, load_municipalities, round_robin_by_host};

#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub seeds_total: usize,
    pub seeds_skipped: usize,
    pub pages_fetched: u64,
    pub files_downloaded: u64,
    pub robots_denied: usize,
}

pub struct Orchestrator {
    config: Arc<CrawlerConfig>,
}

impl Orchestrator {
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let config = &self.config;
        let records = load_municipalities(&config.input)?;

        if config.overwrite_manifest {
            if let Some(parent) = config.manifest_path.parent() {
                std::fs::create_dir_all(parent).map_err(CrawlerError::ManifestWrite)?;
            }
            std::fs::write(&config.manifest_path, "").map_err(CrawlerError::ManifestWrite)?;
        }

        let index = if config.resume {
            ManifestIndex::load(&config.manifest_path)?
        } else {
            ManifestIndex::default()
        };
        info!(
            completed_seeds = index.completed_seeds.len(),
            downloaded_urls = index.downloaded_urls.len(),
            "resume index loaded"
        );

        let (manifest, writer_task) = ManifestWriter::spawn(&config.manifest_path)?;
        let client = Arc::new(HttpClient::new(config)?);
        let robots = Arc::new(RobotsCache::new(
            client.clone(),
            config.user_agent.clone(),
            config.respect_robots,
        ));
        let limiter = Arc::new(HostRateLimiter::new());
        let denials = Arc::new(DenialLog::new());
        let ledger = Arc::new(DownloadLedger::from_index(&index));
        let resume = Arc::new(index);

        let tasks = round_robin_by_host(build_tasks(&records, config.threshold)?);
        info!(seeds = tasks.len(), workers = config.workers, "starting crawl");

        manifest
            .emit(ManifestEvent::RunStarted {
                ts: ts_now(),
                input: config.input.display().to_string(),
                outdir: config.outdir.display().to_string(),
                workers: config.workers,
                resume: config.resume,
                respect_robots: config.respect_robots,
                save_pages: config.save_pages,
                download_files: config.download_files,
            })
            .await;

        let crawler = Arc::new(SeedCrawler {
            config: self.config.clone(),
            client,
            robots,
            limiter,
            manifest: manifest.clone(),
            denials: denials.clone(),
            ledger,
            resume,
        });

        let seeds_total = tasks.len();
        let outcomes: Vec<SeedOutcome> = stream::iter(tasks)
            .map(|task| {
                let crawler = crawler.clone();
                async move { crawler.run(&task).await }
            })
            .buffer_unordered(config.workers.max(1))
            .collect()
            .await;

        let mut summary = RunSummary {
            seeds_total,
            ..Default::default()
        };
        for outcome in &outcomes {
            if outcome.skipped {
                summary.seeds_skipped += 1;
            }
            summary.pages_fetched += outcome.pages_fetched;
            summary.files_downloaded += outcome.files_downloaded;
        }
        summary.robots_denied = denials.len();

        manifest
            .emit(ManifestEvent::RunFinished {
                ts: ts_now(),
                seeds_total: summary.seeds_total,
                seeds_skipped: summary.seeds_skipped,
                pages_fetched: summary.pages_fetched,
                files_downloaded: summary.files_downloaded,
                robots_denied: summary.robots_denied,
            })
            .await;

        // Close the channel so the writer drains and exits.
        drop(crawler);
        drop(manifest);
        if let Err(e) = writer_task.await {
            error!(error = %e, "manifest writer task failed");
        }

        // Report failures are logged, not fatal; the crawl itself is done.
        if let Err(e) = report::write_reports(&denials.entries(), &config.report_dir) {
            error!(error = %e, "failed to write robots denial reports");
        }

        info!(
            seeds = summary.seeds_total,
            skipped = summary.seeds_skipped,
            pages = summary.pages_fetched,
            files = summary.files_downloaded,
            denials = summary.robots_denied,
            "run finished"
        );
        Ok(summary)
    }
}
