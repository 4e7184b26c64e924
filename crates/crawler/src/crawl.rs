//! Per-seed bounded breadth-first crawl: scope rules, robots, pacing,
//! payload downloads, and manifest events in causal order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::change::{check_seed, SeedCheck};
use crate::classify::{extract_links, host_key, is_minute_file, looks_like_minute};
use crate::client::{FetchResponse, HttpClient};
use crate::config::CrawlerConfig;
use crate::error::CrawlerError;
use crate::manifest::{
    sha256_hex, ts_now, ErrorPhase, LinkKind, ManifestEvent, ManifestIndex, ManifestWriter,
    SeedScope, SkipReason, Validator,
};
use crate::rate_limiter::HostRateLimiter;
use crate::report::{path_prefix, DenialLog};
use crate::robots::RobotsCache;
use crate::seeds::SeedTask;

/// Run-wide download/save bookkeeping shared by all seed crawlers.
/// Seeded from the manifest index on resume.
pub struct DownloadLedger {
    downloaded: RwLock<HashSet<String>>,
    saved_pages: RwLock<HashSet<String>>,
    // path -> content sha reserved this run; keeps one path from carrying
    // two different payloads.
    reserved_paths: Mutex<HashMap<PathBuf, String>>,
}

impl DownloadLedger {
    pub fn from_index(index: &ManifestIndex) -> Self {
        Self {
            downloaded: RwLock::new(index.downloaded_urls.clone()),
            saved_pages: RwLock::new(index.saved_pages.keys().cloned().collect()),
            reserved_paths: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_downloaded(&self, url: &str) -> bool {
        self.downloaded.read().await.contains(url)
    }

    pub async fn mark_downloaded(&self, url: &str) {
        self.downloaded.write().await.insert(url.to_string());
    }

    async fn page_saved(&self, url: &str) -> bool {
        self.saved_pages.read().await.contains(url)
    }

    async fn mark_page_saved(&self, url: &str) {
        self.saved_pages.write().await.insert(url.to_string());
    }

    /// Picks the final on-disk name for a payload, suffixing `_1`, `_2`, …
    /// while a different SHA already occupies the candidate. Returns the
    /// path and whether identical content is already present there.
    async fn reserve_path(
        &self,
        dir: &Path,
        name: &str,
        sha: &str,
    ) -> std::io::Result<(PathBuf, bool)> {
        let (stem, ext) = match name.rfind('.') {
            Some(i) if i > 0 => (&name[..i], &name[i..]),
            _ => (name, ""),
        };

        let mut reserved = self.reserved_paths.lock().await;
        let mut n = 0usize;
        loop {
            let candidate = if n == 0 {
                name.to_string()
            } else {
                format!("{stem}_{n}{ext}")
            };
            let path = dir.join(candidate);
            n += 1;

            match reserved.get(&path) {
                Some(existing) if existing == sha => return Ok((path, true)),
                Some(_) => continue,
                None => {}
            }
            if path.exists() {
                let bytes = std::fs::read(&path)?;
                if sha256_hex(&bytes) == sha {
                    reserved.insert(path.clone(), sha.to_string());
                    return Ok((path, true));
                }
                continue;
            }
            reserved.insert(path.clone(), sha.to_string());
            return Ok((path, false));
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SeedOutcome {
    pub skipped: bool,
    pub pages_fetched: u64,
    pub files_downloaded: u64,
}

#[derive(Default)]
struct CrawlStats {
    pages_fetched: u64,
    files_downloaded: u64,
    validator: Option<Validator>,
}

/// Crawls one seed from start to `seed_done`, sharing caches and the
/// manifest writer with its sibling workers.
pub struct SeedCrawler {
    pub config: Arc<CrawlerConfig>,
    pub client: Arc<HttpClient>,
    pub robots: Arc<RobotsCache>,
    pub limiter: Arc<HostRateLimiter>,
    pub manifest: ManifestWriter,
    pub denials: Arc<DenialLog>,
    pub ledger: Arc<DownloadLedger>,
    pub resume: Arc<ManifestIndex>,
}

impl SeedCrawler {
    pub async fn run(&self, task: &SeedTask) -> SeedOutcome {
        let scope = SeedScope {
            prefecture: task.prefecture.clone(),
            city: task.city.clone(),
            seed_url: task.url.to_string(),
        };

        // A seed denied by robots is skipped without storing a validator,
        // so later runs re-evaluate the rules.
        if self.config.respect_robots && !self.robots.allowed(&task.url).await {
            self.deny(&scope, &task.url).await;
            self.emit_skip(&scope, SkipReason::RobotsDenied).await;
            return SeedOutcome {
                skipped: true,
                ..Default::default()
            };
        }

        if self.config.skip_completed_seeds {
            if let Some(stored) = self.resume.completed(&scope) {
                if !self.config.recheck_seeds {
                    self.emit_skip(&scope, SkipReason::CompletedUnchanged).await;
                    return SeedOutcome {
                        skipped: true,
                        ..Default::default()
                    };
                }
                if stored.is_empty() {
                    // Nothing to compare against: the seed was never
                    // change-checked, so re-crawl it outright.
                    info!(seed = %task.url, "completed seed has no stored validator, re-crawling");
                } else {
                    self.wait_for_host(&task.url).await;
                    match check_seed(&self.client, &task.url, stored).await {
                        Ok(SeedCheck::Unchanged(reason)) => {
                            info!(seed = %task.url, "seed index unchanged, skipping");
                            self.emit_skip(&scope, reason).await;
                            return SeedOutcome {
                                skipped: true,
                                ..Default::default()
                            };
                        }
                        Ok(SeedCheck::Changed) => {
                            info!(seed = %task.url, "seed index changed, re-crawling");
                        }
                        Err(e) => {
                            // Safe side: an unverifiable seed gets re-crawled.
                            self.emit_error(&scope, &task.url, ErrorPhase::SeedCheck, &e)
                                .await;
                        }
                    }
                }
            }
        }

        self.manifest
            .emit(ManifestEvent::SeedStarted {
                ts: ts_now(),
                scope: scope.clone(),
            })
            .await;

        let stats = self.crawl(task, &scope).await;

        match stats.validator {
            Some(validator) => {
                self.manifest
                    .emit(ManifestEvent::SeedDone {
                        ts: ts_now(),
                        scope: scope.clone(),
                        pages_fetched: stats.pages_fetched,
                        files_downloaded: stats.files_downloaded,
                        index_validator: validator,
                    })
                    .await;
            }
            // The seed fetch itself failed; leaving seed_done out makes the
            // next run retry this seed.
            None => {
                warn!(seed = %task.url, "seed index fetch failed; seed left incomplete");
            }
        }

        SeedOutcome {
            skipped: false,
            pages_fetched: stats.pages_fetched,
            files_downloaded: stats.files_downloaded,
        }
    }

    async fn crawl(&self, task: &SeedTask, scope: &SeedScope) -> CrawlStats {
        let seed = &task.url;
        let mut stats = CrawlStats::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<(Url, u32)> = VecDeque::new();
        frontier.push_back((seed.clone(), 0));

        while let Some((url, depth)) = frontier.pop_front() {
            if stats.pages_fetched >= self.config.max_pages {
                debug!(seed = %seed, "page cap reached");
                break;
            }
            if !visited.insert(url.as_str().to_string()) {
                continue;
            }
            if !self.in_scope(seed, &url) {
                continue;
            }
            if self.config.respect_robots && !self.robots.allowed(&url).await {
                self.deny(scope, &url).await;
                continue;
            }

            self.wait_for_host(&url).await;
            let resp = match self.client.get(&url).await {
                Ok(resp) => resp,
                Err(e) => {
                    self.emit_error(scope, &url, ErrorPhase::Fetch, &e).await;
                    continue;
                }
            };
            stats.pages_fetched += 1;
            if depth == 0 && stats.validator.is_none() {
                stats.validator = Some(resp.validator());
            }

            // A frontier URL can turn out to be the payload itself, either
            // by Content-Type or by a payload extension on the final URL.
            if resp.is_binary()
                || (is_minute_file(&resp.final_url, &self.config.file_exts) && !resp.is_html())
            {
                let target = resp.final_url.clone();
                self.manifest
                    .emit(ManifestEvent::LinkFound {
                        ts: ts_now(),
                        scope: scope.clone(),
                        page_url: url.to_string(),
                        target_url: target.to_string(),
                        kind: LinkKind::File,
                        anchor_text: String::new(),
                    })
                    .await;
                if self.config.download_files {
                    stats.files_downloaded += self.store_payload(scope, resp).await;
                }
                continue;
            }

            if self.config.save_pages {
                self.save_page(scope, &resp).await;
            }

            let html = String::from_utf8_lossy(&resp.body);
            let links = extract_links(&html, &resp.final_url);
            for (target, anchor_text) in links {
                // Same-domain applies to every link; the path-prefix rule
                // only constrains the frontier (payloads often live under
                // an upload area outside the index prefix).
                if self.config.same_domain_only && host_key(&target) != host_key(seed) {
                    continue;
                }
                let payload = is_minute_file(&target, &self.config.file_exts);
                if payload {
                    if looks_like_minute(
                        &target,
                        &anchor_text,
                        &self.config.keywords,
                        &self.config.url_hints,
                    ) == 0
                    {
                        continue;
                    }
                    self.manifest
                        .emit(ManifestEvent::LinkFound {
                            ts: ts_now(),
                            scope: scope.clone(),
                            page_url: resp.final_url.to_string(),
                            target_url: target.to_string(),
                            kind: LinkKind::File,
                            anchor_text,
                        })
                        .await;
                    if self.config.download_files {
                        stats.files_downloaded +=
                            self.download(scope, &target).await;
                    }
                } else {
                    if depth + 1 > self.config.max_depth {
                        continue;
                    }
                    if !self.in_scope(seed, &target) {
                        continue;
                    }
                    if visited.contains(target.as_str()) {
                        continue;
                    }
                    self.manifest
                        .emit(ManifestEvent::LinkFound {
                            ts: ts_now(),
                            scope: scope.clone(),
                            page_url: resp.final_url.to_string(),
                            target_url: target.to_string(),
                            kind: LinkKind::Page,
                            anchor_text,
                        })
                        .await;
                    frontier.push_back((target, depth + 1));
                }
            }
        }

        stats
    }

    /// Fetches and stores one payload URL, deduplicated across the run.
    /// Returns the number of files written (0 or 1).
    async fn download(&self, scope: &SeedScope, url: &Url) -> u64 {
        if !self.config.force_download && self.ledger.is_downloaded(url.as_str()).await {
            debug!(%url, "payload already downloaded");
            return 0;
        }
        if self.config.respect_robots && !self.robots.allowed(url).await {
            self.deny(scope, url).await;
            return 0;
        }

        self.wait_for_host(url).await;
        let resp = match self.client.get(url).await {
            Ok(resp) => resp,
            Err(e) => {
                self.emit_error(scope, url, ErrorPhase::Download, &e).await;
                return 0;
            }
        };

        // Redirects can land on a payload another link already fetched.
        if !self.config.force_download
            && resp.final_url.as_str() != url.as_str()
            && self.ledger.is_downloaded(resp.final_url.as_str()).await
        {
            self.ledger.mark_downloaded(url.as_str()).await;
            return 0;
        }

        let stored = self.store_payload(scope, resp).await;
        if stored > 0 {
            self.ledger.mark_downloaded(url.as_str()).await;
        }
        stored
    }

    /// Writes an already-fetched payload body to disk (temp file, fsync,
    /// atomic rename) and emits `downloaded_file`.
    async fn store_payload(&self, scope: &SeedScope, resp: FetchResponse) -> u64 {
        let final_url = resp.final_url.clone();
        if !self.config.force_download && self.ledger.is_downloaded(final_url.as_str()).await {
            return 0;
        }

        let sha = sha256_hex(&resp.body);
        let name = payload_filename(&final_url, resp.content_type(), &sha);
        let dir = self
            .config
            .outdir
            .join(sanitize_filename(&scope.prefecture))
            .join(sanitize_filename(&scope.city))
            .join("files");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            self.emit_error(
                scope,
                &final_url,
                ErrorPhase::Download,
                &CrawlerError::fs(&dir, e),
            )
            .await;
            return 0;
        }

        let (path, already_present) = match self.ledger.reserve_path(&dir, &name, &sha).await {
            Ok(reserved) => reserved,
            Err(e) => {
                self.emit_error(
                    scope,
                    &final_url,
                    ErrorPhase::Download,
                    &CrawlerError::fs(&dir, e),
                )
                .await;
                return 0;
            }
        };
        if !already_present {
            if let Err(e) = atomic_write(&dir, &path, &resp.body) {
                self.emit_error(
                    scope,
                    &final_url,
                    ErrorPhase::Download,
                    &CrawlerError::fs(&path, e),
                )
                .await;
                return 0;
            }
        }

        self.ledger.mark_downloaded(final_url.as_str()).await;
        info!(url = %final_url, path = %path.display(), "downloaded payload");
        self.manifest
            .emit(ManifestEvent::DownloadedFile {
                ts: ts_now(),
                scope: scope.clone(),
                url: final_url.to_string(),
                path: path.to_string_lossy().into_owned(),
                size: resp.body.len() as u64,
                content_sha256: sha,
            })
            .await;
        1
    }

    async fn save_page(&self, scope: &SeedScope, resp: &FetchResponse) {
        let url = &resp.final_url;
        if self.ledger.page_saved(url.as_str()).await {
            return;
        }

        let dir = self
            .config
            .outdir
            .join(sanitize_filename(&scope.prefecture))
            .join(sanitize_filename(&scope.city))
            .join("pages");
        let name = format!("{}.html", sha256_hex(url.as_str().as_bytes()));
        let path = dir.join(name);

        if let Err(e) = std::fs::create_dir_all(&dir) {
            self.emit_error(scope, url, ErrorPhase::SavePage, &CrawlerError::fs(&dir, e))
                .await;
            return;
        }
        if let Err(e) = atomic_write(&dir, &path, &resp.body) {
            self.emit_error(
                scope,
                url,
                ErrorPhase::SavePage,
                &CrawlerError::fs(&path, e),
            )
            .await;
            return;
        }

        self.ledger.mark_page_saved(url.as_str()).await;
        self.manifest
            .emit(ManifestEvent::PageSaved {
                ts: ts_now(),
                scope: scope.clone(),
                url: url.to_string(),
                path: path.to_string_lossy().into_owned(),
                content_sha256: sha256_hex(&resp.body),
            })
            .await;
    }

    fn in_scope(&self, seed: &Url, url: &Url) -> bool {
        if self.config.same_domain_only && host_key(url) != host_key(seed) {
            return false;
        }
        if self.config.same_path_prefix_only {
            let seed_path = seed.path();
            let prefix = format!("{}/", seed_path.trim_end_matches('/'));
            let path = url.path();
            if path != seed_path && !path.starts_with(&prefix) {
                return false;
            }
        }
        true
    }

    /// Rate-limit gate: the larger of the configured delay and the host's
    /// robots `Crawl-delay`.
    async fn wait_for_host(&self, url: &Url) {
        let mut delay = self.config.delay;
        if self.config.respect_robots {
            if let Some(crawl_delay) = self.robots.crawl_delay(url).await {
                delay = delay.max(crawl_delay);
            }
        }
        self.limiter.wait(&host_key(url), delay).await;
    }

    async fn deny(&self, scope: &SeedScope, url: &Url) {
        self.denials.record(&scope.prefecture, &scope.city, url);
        self.manifest
            .emit(ManifestEvent::RobotsDenied {
                ts: ts_now(),
                scope: scope.clone(),
                url: url.to_string(),
                host: host_key(url),
                path_prefix: path_prefix(url),
            })
            .await;
    }

    async fn emit_skip(&self, scope: &SeedScope, reason: SkipReason) {
        self.manifest
            .emit(ManifestEvent::SeedSkipped {
                ts: ts_now(),
                scope: scope.clone(),
                reason,
            })
            .await;
    }

    async fn emit_error(
        &self,
        scope: &SeedScope,
        url: &Url,
        phase: ErrorPhase,
        err: &CrawlerError,
    ) {
        warn!(%url, ?phase, error = %err, "crawl error");
        self.manifest
            .emit(ManifestEvent::Error {
                ts: ts_now(),
                scope: scope.clone(),
                url: url.to_string(),
                phase,
                message: err.to_string(),
            })
            .await;
    }
}

fn atomic_write(dir: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Strips filesystem-hostile characters and caps the name at 200 bytes of
/// UTF-8 on a char boundary.
fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_control() || matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
            continue;
        }
        out.push(c);
    }
    let out = out.trim().to_string();
    if out.len() <= 200 {
        return out;
    }
    let mut end = 200;
    while !out.is_char_boundary(end) {
        end -= 1;
    }
    out[..end].to_string()
}

/// Final payload name: sanitized last URL segment, falling back to the
/// content hash, with an extension derived from the Content-Type when the
/// URL has none.
fn payload_filename(url: &Url, content_type: Option<&str>, sha: &str) -> String {
    let last = url
        .path_segments()
        .and_then(|s| s.filter(|seg| !seg.is_empty()).next_back())
        .unwrap_or_default();
    let mut name = sanitize_filename(last);
    if name.is_empty() {
        name = sha.to_string();
    }
    let has_ext = name
        .rfind('.')
        .map(|i| i > 0 && i < name.len() - 1)
        .unwrap_or(false);
    if !has_ext {
        name.push_str(content_type.and_then(guess_extension).unwrap_or(".bin"));
    }
    name
}

fn guess_extension(content_type: &str) -> Option<&'static str> {
    let ct = content_type.to_lowercase();
    if ct.contains("application/pdf") {
        Some(".pdf")
    } else if ct.contains("wordprocessingml") {
        Some(".docx")
    } else if ct.contains("msword") {
        Some(".doc")
    } else if ct.contains("spreadsheetml") {
        Some(".xlsx")
    } else if ct.contains("ms-excel") {
        Some(".xls")
    } else if ct.contains("presentationml") {
        Some(".pptx")
    } else if ct.contains("ms-powerpoint") {
        Some(".ppt")
    } else if ct.contains("text/plain") {
        Some(".txt")
    } else if ct.contains("rtf") {
        Some(".rtf")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_hostile_characters() {
        assert_eq!(sanitize_filename("a/b\\c:d*e?f\"g<h>i|j"), "abcdefghij");
        assert_eq!(sanitize_filename("議事録 令和7年.pdf"), "議事録 令和7年.pdf");
        assert_eq!(sanitize_filename("\u{0007}bell"), "bell");
    }

    #[test]
    fn sanitize_caps_on_char_boundary() {
        let long = "議".repeat(100); // 300 bytes
        let capped = sanitize_filename(&long);
        assert!(capped.len() <= 200);
        assert!(capped.chars().all(|c| c == '議'));
    }

    #[test]
    fn payload_filename_falls_back_to_hash_and_content_type() {
        let url = Url::parse("http://a.example/dl/").unwrap();
        let name = payload_filename(&url, Some("application/pdf"), "deadbeef");
        // "dl" has no extension, so the content type supplies one.
        assert_eq!(name, "dl.pdf");

        let root = Url::parse("http://a.example/").unwrap();
        let name = payload_filename(&root, None, "deadbeef");
        assert_eq!(name, "deadbeef.bin");

        let plain = Url::parse("http://a.example/giji/r7_teirei.pdf").unwrap();
        assert_eq!(payload_filename(&plain, None, "x"), "r7_teirei.pdf");
    }

    #[tokio::test]
    async fn reserve_path_suffixes_on_sha_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DownloadLedger::from_index(&ManifestIndex::default());

        let (first, present) = ledger
            .reserve_path(dir.path(), "minutes.pdf", "sha-a")
            .await
            .unwrap();
        assert!(!present);
        assert_eq!(first.file_name().unwrap(), "minutes.pdf");

        // Same name, different content: next free suffix.
        let (second, present) = ledger
            .reserve_path(dir.path(), "minutes.pdf", "sha-b")
            .await
            .unwrap();
        assert!(!present);
        assert_eq!(second.file_name().unwrap(), "minutes_1.pdf");

        // Same name and content: the original reservation is reused.
        let (again, present) = ledger
            .reserve_path(dir.path(), "minutes.pdf", "sha-a")
            .await
            .unwrap();
        assert!(present);
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn reserve_path_detects_identical_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("r7.pdf");
        std::fs::write(&existing, b"%PDF-1.7 body").unwrap();
        let sha = sha256_hex(b"%PDF-1.7 body");

        let ledger = DownloadLedger::from_index(&ManifestIndex::default());
        let (path, present) = ledger
            .reserve_path(dir.path(), "r7.pdf", &sha)
            .await
            .unwrap();
        assert!(present);
        assert_eq!(path, existing);

        let (other, present) = ledger
            .reserve_path(dir.path(), "r7.pdf", "different-sha")
            .await
            .unwrap();
        assert!(!present);
        assert_eq!(other.file_name().unwrap(), "r7_1.pdf");
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        atomic_write(dir.path(), &path, b"<html>1</html>").unwrap();
        atomic_write(dir.path(), &path, b"<html>2</html>").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"<html>2</html>");
    }
}
