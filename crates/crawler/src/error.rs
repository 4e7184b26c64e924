use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("timeout fetching {0}")]
    Timeout(String),

    #[error("too many redirects fetching {0}")]
    TooManyRedirects(String),

    #[error("unexpected HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("parse error for {0}")]
    Parse(String),

    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest I/O error: {0}")]
    ManifestWrite(#[source] std::io::Error),
}

impl CrawlerError {
    /// Classifies a transport failure from reqwest into the crawl taxonomy.
    pub fn from_reqwest(url: &url::Url, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CrawlerError::Timeout(url.to_string())
        } else if err.is_redirect() {
            CrawlerError::TooManyRedirects(url.to_string())
        } else {
            CrawlerError::Network {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CrawlerError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CrawlerError>;
