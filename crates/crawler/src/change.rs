//! Seed index change detection: validators first, body hash as fallback.

use tracing::debug;
use url::Url;

use crate::client::{Conditional, HttpClient};
use crate::error::Result;
use crate::manifest::{sha256_hex, SkipReason, Validator};

#[derive(Debug, PartialEq, Eq)]
pub enum SeedCheck {
    Unchanged(SkipReason),
    Changed,
}

/// Decides whether a previously completed seed's index page has changed.
///
/// HTTP validators are preferred when the prior run stored any (a 304 is a
/// body-free answer); the body SHA-256 is the fallback for servers that
/// emit neither ETag nor Last-Modified.
pub async fn check_seed(client: &HttpClient, url: &Url, stored: &Validator) -> Result<SeedCheck> {
    if stored.has_http_validators() {
        match client.conditional_get(url, stored).await? {
            Conditional::Unchanged => {
                debug!(%url, "seed index not modified (304)");
                return Ok(SeedCheck::Unchanged(SkipReason::CompletedUnchanged));
            }
            Conditional::Missing => {
                debug!(%url, "seed index gone; re-crawling to record the failure");
                return Ok(SeedCheck::Changed);
            }
            Conditional::Changed(resp) => {
                let fresh = resp.validator();
                if let (Some(old), Some(new)) = (&stored.etag, &fresh.etag) {
                    return Ok(compare(old, new));
                }
                if let (Some(old), Some(new)) = (&stored.last_modified, &fresh.last_modified) {
                    return Ok(compare(old, new));
                }
                if let (Some(old), Some(new)) = (&stored.content_sha256, &fresh.content_sha256) {
                    return Ok(compare(old, new));
                }
                return Ok(SeedCheck::Changed);
            }
        }
    }

    // No stored HTTP validators: plain fetch, hash comparison only.
    let resp = client.get(url).await?;
    let fresh = sha256_hex(&resp.body);
    match &stored.content_sha256 {
        Some(old) if *old == fresh => Ok(SeedCheck::Unchanged(SkipReason::NoChangeDetected)),
        _ => Ok(SeedCheck::Changed),
    }
}

fn compare(old: &str, new: &str) -> SeedCheck {
    if old == new {
        SeedCheck::Unchanged(SkipReason::NoChangeDetected)
    } else {
        SeedCheck::Changed
    }
}
