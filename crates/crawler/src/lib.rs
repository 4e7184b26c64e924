//! Polite, resumable crawler that harvests meeting-minutes documents from
//! municipal websites. Seeds come from an upstream discovery stage; this
//! crate owns the crawl engine, the append-only manifest, and the
//! robots-denial reports.

pub mod change;
pub mod classify;
pub mod client;
pub mod config;
pub mod crawl;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod rate_limiter;
pub mod report;
pub mod robots;
pub mod seeds;

pub use config::CrawlerConfig;
pub use error::{CrawlerError, Result};
pub use manifest::{ManifestEvent, ManifestIndex, SkipReason, Validator};
pub use orchestrator::{Orchestrator, RunSummary};

use std::sync::Arc;

/// Facade over the orchestrator for embedding the whole pipeline.
pub struct Harvester {
    config: Arc<CrawlerConfig>,
}

impl Harvester {
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let orchestrator = Orchestrator::new((*self.config).clone());
        orchestrator.run().await
    }
}
