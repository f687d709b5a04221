use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::{StatusCode, header};
use thiserror::Error;

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";
const ORIGIN_ACCEPT: &str = "image/*";

/// Origin response whose headers have arrived; the body is still streaming.
pub struct OriginResponse {
    pub content_type: String,
    pub body: ByteStream,
}

impl std::fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginResponse")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("origin did not respond within {0:?}")]
    Timeout(Duration),
    #[error("origin request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("origin responded with status {0}")]
    Status(StatusCode),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "timeout",
            FetchError::Transport(_) => "transport",
            FetchError::Status(_) => "status",
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Resolves once the origin's response headers are in. Anything other
    /// than `200 OK` is a `FetchError::Status`.
    async fn fetch(&self, url: &str) -> Result<OriginResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct OriginFetcher {
    client: reqwest::Client,
    header_timeout: Duration,
}

impl OriginFetcher {
    pub fn new(header_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(header_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build origin HTTP client")?;
        Ok(Self {
            client,
            header_timeout,
        })
    }
}

#[async_trait]
impl Fetcher for OriginFetcher {
    async fn fetch(&self, url: &str) -> Result<OriginResponse, FetchError> {
        let request = self
            .client
            .get(url)
            .header(header::ACCEPT, ORIGIN_ACCEPT)
            .send();
        let response = tokio::time::timeout(self.header_timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(self.header_timeout))?
            .map_err(FetchError::Transport)?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::Status(response.status()));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .unwrap_or(FALLBACK_CONTENT_TYPE)
            .to_string();

        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(OriginResponse { content_type, body })
    }
}
