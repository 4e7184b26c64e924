//! Per-host robots.txt cache with single-flight fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;
use url::Url;

use crate::classify::host_key;
use crate::client::HttpClient;

#[derive(Debug, Clone)]
struct RobotsRule {
    allow: bool,
    pattern: String,
}

/// Rules for the matched user-agent group of one host.
#[derive(Debug, Default)]
pub struct RobotsRecord {
    rules: Vec<RobotsRule>,
    crawl_delay: Option<Duration>,
}

pub struct RobotsCache {
    client: Arc<HttpClient>,
    user_agent: String,
    enforce: bool,
    // Single-flight: concurrent lookups for one host await the same cell.
    hosts: Mutex<HashMap<String, Arc<OnceCell<Arc<RobotsRecord>>>>>,
}

impl RobotsCache {
    pub fn new(client: Arc<HttpClient>, user_agent: String, enforce: bool) -> Self {
        Self {
            client,
            user_agent,
            enforce,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the URL may be fetched. Always true when enforcement is off
    /// or when the host's robots.txt could not be fetched or parsed.
    pub async fn allowed(&self, url: &Url) -> bool {
        if !self.enforce {
            return true;
        }
        self.record_for(url).await.allows(url.path())
    }

    /// `Crawl-delay` for the matched group, if any. Null when enforcement
    /// is disabled.
    pub async fn crawl_delay(&self, url: &Url) -> Option<Duration> {
        if !self.enforce {
            return None;
        }
        self.record_for(url).await.crawl_delay
    }

    async fn record_for(&self, url: &Url) -> Arc<RobotsRecord> {
        let key = host_key(url);
        let cell = {
            let mut hosts = self.hosts.lock().await;
            hosts.entry(key).or_default().clone()
        };
        cell.get_or_init(|| async { Arc::new(self.fetch_record(url).await) })
            .await
            .clone()
    }

    async fn fetch_record(&self, url: &Url) -> RobotsRecord {
        let mut robots_url = url.clone();
        robots_url.set_path("/robots.txt");
        robots_url.set_query(None);
        robots_url.set_fragment(None);

        match self.client.get(&robots_url).await {
            Ok(resp) => {
                let text = String::from_utf8_lossy(&resp.body);
                debug!(host = %host_key(url), "parsed robots.txt");
                RobotsRecord::parse(&text, &self.user_agent)
            }
            // Network errors, 4xx and 5xx alike: treat the host as open.
            Err(e) => {
                debug!(host = %host_key(url), error = %e, "robots.txt unavailable, allowing host");
                RobotsRecord::default()
            }
        }
    }
}

struct Group {
    agents: Vec<String>,
    rules: Vec<RobotsRule>,
    crawl_delay: Option<Duration>,
}

impl RobotsRecord {
    /// Parses robots.txt and keeps only the group matching `user_agent`
    /// (falling back to the `*` groups).
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut pending_agents: Vec<String> = Vec::new();

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    pending_agents.push(value.to_lowercase());
                }
                "disallow" | "allow" => {
                    if !pending_agents.is_empty() {
                        groups.push(Group {
                            agents: std::mem::take(&mut pending_agents),
                            rules: Vec::new(),
                            crawl_delay: None,
                        });
                    }
                    if let Some(group) = groups.last_mut() {
                        if !value.is_empty() {
                            group.rules.push(RobotsRule {
                                allow: directive == "allow",
                                pattern: value.to_string(),
                            });
                        }
                    }
                }
                "crawl-delay" => {
                    if !pending_agents.is_empty() {
                        groups.push(Group {
                            agents: std::mem::take(&mut pending_agents),
                            rules: Vec::new(),
                            crawl_delay: None,
                        });
                    }
                    if let Some(group) = groups.last_mut() {
                        if let Ok(secs) = value.parse::<f64>() {
                            if secs >= 0.0 {
                                group.crawl_delay = Some(Duration::from_secs_f64(secs));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let ua = user_agent.to_lowercase();
        let specific: Vec<&Group> = groups
            .iter()
            .filter(|g| g.agents.iter().any(|a| a != "*" && ua.contains(a.as_str())))
            .collect();
        let chosen: Vec<&Group> = if !specific.is_empty() {
            specific
        } else {
            groups
                .iter()
                .filter(|g| g.agents.iter().any(|a| a == "*"))
                .collect()
        };

        let mut record = RobotsRecord::default();
        for group in chosen {
            record.rules.extend(group.rules.iter().cloned());
            record.crawl_delay = match (record.crawl_delay, group.crawl_delay) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        record
    }

    /// Longest-match precedence; on a tie, `Allow` wins.
    pub fn allows(&self, path: &str) -> bool {
        let mut best: Option<(usize, bool)> = None;
        for rule in &self.rules {
            if pattern_matches(path, &rule.pattern) {
                let specificity = rule.pattern.len();
                best = match best {
                    None => Some((specificity, rule.allow)),
                    Some((len, allow)) => {
                        if specificity > len || (specificity == len && rule.allow && !allow) {
                            Some((specificity, rule.allow))
                        } else {
                            Some((len, allow))
                        }
                    }
                };
            }
        }
        best.map(|(_, allow)| allow).unwrap_or(true)
    }
}

/// robots.txt pattern match supporting `*` wildcards and the `$` anchor.
fn pattern_matches(path: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };

    if !pattern.contains('*') {
        return if anchored {
            path == pattern
        } else {
            path.starts_with(pattern)
        };
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match path[pos..].find(part) {
            Some(found) => {
                if i == 0 && found != 0 {
                    return false;
                }
                pos += found + part.len();
            }
            None => return false,
        }
    }
    if anchored {
        // The final literal part must land at the end of the path.
        if let Some(last) = parts.last() {
            if !last.is_empty() {
                return path.ends_with(last) && pos == path.len();
            }
        }
    }
    true
}
