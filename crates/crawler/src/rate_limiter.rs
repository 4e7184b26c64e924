use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Jitter, Quota, RateLimiter as GovernorRateLimiter,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::trace;

pub type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Per-host pacing. Each host gets its own limiter whose period is the
/// effective minimum interval (global delay vs. robots `Crawl-delay`,
/// whichever is larger); requests to different hosts never wait on each
/// other.
pub struct HostRateLimiter {
    limiters: RwLock<HashMap<String, Arc<DirectLimiter>>>,
}

impl HostRateLimiter {
    pub fn new() -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Blocks until a request to `host` may be issued.
    ///
    /// The period is fixed at first use of a host; callers resolve the
    /// robots crawl-delay before the first wait, so it is stable per run.
    pub async fn wait(&self, host: &str, min_interval: Duration) {
        if host.is_empty() || min_interval.is_zero() {
            return;
        }
        let Some(quota) = Quota::with_period(min_interval) else {
            return;
        };
        let quota = quota.allow_burst(nonzero_ext::nonzero!(1u32));

        let limiter = {
            let limiters = self.limiters.read().await;
            limiters.get(host).cloned()
        };
        let limiter = match limiter {
            Some(limiter) => limiter,
            None => {
                let mut limiters = self.limiters.write().await;
                limiters
                    .entry(host.to_string())
                    .or_insert_with(|| Arc::new(GovernorRateLimiter::direct(quota)))
                    .clone()
            }
        };

        trace!(host, ?min_interval, "rate limit wait");
        limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(50)))
            .await;
    }

    pub async fn hosts_tracked(&self) -> usize {
        self.limiters.read().await.len()
    }
}

impl Default for HostRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
