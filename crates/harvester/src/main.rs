use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawler::{CrawlerConfig, CrawlerError, Harvester};

/// Crawl municipal sites for meeting-minutes documents.
#[derive(Parser, Debug)]
#[command(name = "harvester", version)]
struct Cli {
    /// Seed list JSON produced by the discovery stage
    #[arg(long, default_value = "data/minute_link_list.json")]
    input: PathBuf,

    /// Output directory for pages, files, and reports
    #[arg(long, default_value = "data/minutes_out")]
    outdir: PathBuf,

    /// Manifest path (defaults to <outdir>/manifest.jsonl)
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Report directory (defaults to <outdir>/reports)
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Use parent seeds when their document count reaches this value
    #[arg(long, default_value_t = 5)]
    threshold: u64,

    /// Crawl depth (0 = seed page only)
    #[arg(long, default_value_t = 2)]
    max_depth: u32,

    /// Page fetch cap per seed
    #[arg(long, default_value_t = 200)]
    max_pages: u64,

    /// Concurrent seed crawlers
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Minimum seconds between requests to one host
    #[arg(long, default_value_t = 0.5)]
    delay: f64,

    /// HTTP timeout in seconds
    #[arg(long, default_value_t = 20.0)]
    timeout: f64,

    /// User-Agent header
    #[arg(long)]
    user_agent: Option<String>,

    /// Collect links only; save neither pages nor files
    #[arg(long)]
    no_download: bool,

    /// Save pages but skip minute-body downloads
    #[arg(long)]
    no_download_files: bool,

    /// Re-download payloads even when the manifest has them
    #[arg(long)]
    force_download: bool,

    /// Resume from the manifest (default)
    #[arg(long, overrides_with = "no_resume")]
    resume: bool,
    /// Ignore prior manifest state
    #[arg(long)]
    no_resume: bool,

    /// Truncate the manifest before starting
    #[arg(long)]
    overwrite_manifest: bool,

    /// Skip seeds already marked done (default)
    #[arg(long, overrides_with = "no_skip_completed_seeds")]
    skip_completed_seeds: bool,
    /// Re-process completed seeds
    #[arg(long)]
    no_skip_completed_seeds: bool,

    /// Crawl every seed regardless of completion state
    #[arg(long)]
    force_crawl: bool,

    /// Re-crawl completed seeds whose index page changed (default)
    #[arg(long, overrides_with = "no_recheck_seeds")]
    recheck_seeds: bool,
    /// Never change-check completed seeds; always skip them
    #[arg(long)]
    no_recheck_seeds: bool,

    /// Honor robots.txt and Crawl-delay (default)
    #[arg(long, overrides_with = "no_respect_robots")]
    respect_robots: bool,
    /// Ignore robots.txt
    #[arg(long)]
    no_respect_robots: bool,

    /// Stay on the seed's host (default)
    #[arg(long, overrides_with = "no_same_domain_only")]
    same_domain_only: bool,
    /// Allow following links to other hosts
    #[arg(long)]
    no_same_domain_only: bool,

    /// Stay under the seed's path prefix
    #[arg(long)]
    same_path_prefix_only: bool,

    /// Comma-separated keyword overrides for minutes detection
    #[arg(long)]
    keywords: Option<String>,

    /// Comma-separated payload extension overrides
    #[arg(long)]
    file_exts: Option<String>,

    /// Comma-separated URL hint overrides
    #[arg(long)]
    url_hints: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<CrawlerConfig, String> {
        if self.delay < 0.0 {
            return Err(format!("--delay must be non-negative, got {}", self.delay));
        }
        if self.timeout <= 0.0 {
            return Err(format!("--timeout must be positive, got {}", self.timeout));
        }

        let mut config = CrawlerConfig::for_outdir(self.outdir);
        config.input = self.input;
        if let Some(manifest) = self.manifest {
            config.manifest_path = manifest;
        }
        if let Some(report_dir) = self.report_dir {
            config.report_dir = report_dir;
        }
        config.threshold = self.threshold;
        config.max_depth = self.max_depth;
        config.max_pages = self.max_pages;
        config.workers = self.workers.max(1);
        config.delay = Duration::from_secs_f64(self.delay);
        config.timeout = Duration::from_secs_f64(self.timeout);
        if let Some(user_agent) = self.user_agent {
            config.user_agent = user_agent;
        }

        config.save_pages = !self.no_download;
        config.download_files = !self.no_download && !self.no_download_files;
        config.force_download = self.force_download;

        config.resume = !self.no_resume;
        config.overwrite_manifest = self.overwrite_manifest;
        config.skip_completed_seeds = !self.no_skip_completed_seeds && !self.force_crawl;
        config.recheck_seeds = !self.no_recheck_seeds;
        config.respect_robots = !self.no_respect_robots;
        config.same_domain_only = !self.no_same_domain_only;
        config.same_path_prefix_only = self.same_path_prefix_only;

        if let Some(keywords) = self.keywords {
            config.keywords = CrawlerConfig::split_list(&keywords);
        }
        if let Some(url_hints) = self.url_hints {
            config.url_hints = CrawlerConfig::split_list(&url_hints);
        }
        if let Some(file_exts) = self.file_exts {
            config.file_exts = CrawlerConfig::split_ext_list(&file_exts);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harvester=info,crawler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(message) => {
            error!(%message, "configuration rejected");
            return ExitCode::from(1);
        }
    };

    let harvester = Harvester::new(config);
    let result = tokio::select! {
        result = harvester.run() => result,
        _ = tokio::signal::ctrl_c() => {
            // The manifest is flushed per event, so whatever finished so
            // far is already resumable.
            warn!("interrupted; partial progress is recorded in the manifest");
            return ExitCode::SUCCESS;
        }
    };

    match result {
        Ok(summary) => {
            info!(
                seeds = summary.seeds_total,
                skipped = summary.seeds_skipped,
                pages = summary.pages_fetched,
                files = summary.files_downloaded,
                denials = summary.robots_denied,
                "harvest complete"
            );
            ExitCode::SUCCESS
        }
        Err(e @ (CrawlerError::Config(_) | CrawlerError::InvalidUrl(_))) => {
            error!(error = %e, "configuration error");
            ExitCode::from(1)
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(2)
        }
    }
}
