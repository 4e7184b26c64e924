use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::config::CrawlerConfig;
use crate::error::{CrawlerError, Result};
use crate::manifest::{sha256_hex, Validator};

/// Process-wide HTTP client: fixed user agent, hard timeout, capped
/// redirects, no cookie jar.
#[derive(Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
}

/// Outcome of a conditional GET against a stored validator.
#[derive(Debug)]
pub enum Conditional {
    Unchanged,
    Changed(FetchResponse),
    Missing,
}

#[derive(Debug)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub final_url: Url,
}

impl FetchResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn is_html(&self) -> bool {
        match self.content_type() {
            Some(ct) => ct.contains("html"),
            // No Content-Type: sniff for markup.
            None => self.body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'<'),
        }
    }

    /// Binary payloads are identified by Content-Type family.
    pub fn is_binary(&self) -> bool {
        self.content_type()
            .map(|ct| {
                let ct = ct.trim().to_lowercase();
                ct.starts_with("application/") || ct.starts_with("image/")
            })
            .unwrap_or(false)
    }

    pub fn etag(&self) -> Option<String> {
        self.headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn last_modified(&self) -> Option<String> {
        self.headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Validator snapshot for this response; the body hash is always set.
    pub fn validator(&self) -> Validator {
        Validator {
            etag: self.etag(),
            last_modified: self.last_modified(),
            content_sha256: Some(sha256_hex(&self.body)),
        }
    }
}

impl HttpClient {
    pub fn new(config: &CrawlerConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| CrawlerError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { inner })
    }

    /// Plain GET; anything other than 200/206/304 is an error. A 304 from
    /// a stale intermediary comes back with an empty body.
    pub async fn get(&self, url: &Url) -> Result<FetchResponse> {
        let resp = self.request(url, HeaderMap::new()).await?;
        match resp.status.as_u16() {
            200 | 206 | 304 => Ok(resp),
            status => Err(CrawlerError::HttpStatus {
                url: url.to_string(),
                status,
            }),
        }
    }

    /// Conditional GET using whichever validators are stored. A 304 maps to
    /// `Unchanged`; a vanished resource maps to `Missing`.
    pub async fn conditional_get(&self, url: &Url, validator: &Validator) -> Result<Conditional> {
        let mut headers = HeaderMap::new();
        if let Some(etag) = &validator.etag {
            if let Ok(value) = HeaderValue::from_str(etag) {
                headers.insert(IF_NONE_MATCH, value);
            }
        }
        if let Some(last_modified) = &validator.last_modified {
            if let Ok(value) = HeaderValue::from_str(last_modified) {
                headers.insert(IF_MODIFIED_SINCE, value);
            }
        }

        let resp = self.request(url, headers).await?;
        match resp.status.as_u16() {
            304 => Ok(Conditional::Unchanged),
            404 | 410 => Ok(Conditional::Missing),
            200 | 206 => Ok(Conditional::Changed(resp)),
            status => Err(CrawlerError::HttpStatus {
                url: url.to_string(),
                status,
            }),
        }
    }

    async fn request(&self, url: &Url, headers: HeaderMap) -> Result<FetchResponse> {
        debug!(%url, "GET");
        let resp = self
            .inner
            .get(url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(|e| CrawlerError::from_reqwest(url, e))?;

        let status = resp.status();
        let final_url = resp.url().clone();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| CrawlerError::from_reqwest(url, e))?;

        Ok(FetchResponse {
            status,
            headers,
            body,
            final_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(ct: Option<&str>, body: &[u8]) -> FetchResponse {
        let mut headers = HeaderMap::new();
        if let Some(ct) = ct {
            headers.insert(CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
        }
        FetchResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::copy_from_slice(body),
            final_url: Url::parse("http://a.example/x").unwrap(),
        }
    }

    #[test]
    fn html_detection_by_header_and_sniff() {
        assert!(response_with(Some("text/html; charset=shift_jis"), b"").is_html());
        assert!(!response_with(Some("application/pdf"), b"").is_html());
        assert!(response_with(None, b"  <!DOCTYPE html>").is_html());
        assert!(!response_with(None, b"%PDF-1.7").is_html());
    }

    #[test]
    fn binary_detection_by_content_type_family() {
        assert!(response_with(Some("application/pdf"), b"").is_binary());
        assert!(response_with(Some("image/png"), b"").is_binary());
        assert!(!response_with(Some("text/html"), b"").is_binary());
        assert!(!response_with(None, b"").is_binary());
    }

    #[test]
    fn validator_always_carries_body_hash() {
        let mut resp = response_with(Some("text/html"), b"<html></html>");
        resp.headers
            .insert(ETAG, HeaderValue::from_static("\"abc\""));
        let v = resp.validator();
        assert_eq!(v.etag.as_deref(), Some("\"abc\""));
        assert!(v.last_modified.is_none());
        assert_eq!(v.content_sha256.as_deref(), Some(sha256_hex(b"<html></html>").as_str()));
    }
}
