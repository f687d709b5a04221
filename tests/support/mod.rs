#![allow(dead_code)]

pub mod origin;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use pictee::{
    proxy::{
        self, AppContext,
        cache::{CacheKey, CacheStore},
        negotiate::{EffectiveParameters, OutputFormat},
        origin::OriginFetcher,
        transform::ImageTransformer,
    },
    settings::Settings,
};

pub use origin::OriginFixture;

pub struct ProxyHarness {
    _temp: TempDir,
    pub addr: SocketAddr,
    pub cache: CacheStore,
    pub settings: Arc<Settings>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn spawn(origin: &OriginFixture) -> Result<Self> {
        Self::spawn_with(origin, |_| {}).await
    }

    pub async fn spawn_with<F>(origin: &OriginFixture, configure: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        let temp = TempDir::new()?;
        let mut settings = Settings {
            cache_dir: temp.path().join("image_cache"),
            origin_prefix: origin.prefix(),
            origin_timeout: 5,
            ..Settings::default()
        };
        configure(&mut settings);
        settings.validate()?;
        let settings = Arc::new(settings);

        let cache = CacheStore::open(settings.cache_dir.clone()).await?;
        let fetcher = Arc::new(OriginFetcher::new(settings.origin_timeout())?);
        let transformer = Arc::new(ImageTransformer::new());
        let app = AppContext::new(settings.clone(), cache.clone(), fetcher, transformer);

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(err) = proxy::listener::serve(listener, app).await {
                tracing::error!(error = ?err, "proxy serve failed");
            }
        });

        Ok(Self {
            _temp: temp,
            addr,
            cache,
            settings,
            handle,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn entries_dir(&self) -> PathBuf {
        self.cache.root().join("entries")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.cache.root().join("staging")
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(StdDuration::from_secs(30))
        .build()?)
}

pub fn key_for(
    url: &str,
    width: Option<u32>,
    height: Option<u32>,
    format: OutputFormat,
) -> CacheKey {
    CacheKey::derive(
        url,
        &EffectiveParameters {
            width,
            height,
            format,
        },
    )
}

/// Commits land after the response body finishes, so poll for them.
pub async fn wait_for_entry(cache: &CacheStore, key: &CacheKey) -> Result<()> {
    for _ in 0..200 {
        if cache.exists(key).await {
            return Ok(());
        }
        sleep(StdDuration::from_millis(25)).await;
    }
    Err(anyhow!("cache entry {key} was never committed"))
}

pub async fn wait_for_empty_dir(dir: &Path) -> Result<()> {
    for _ in 0..200 {
        if dir_entries(dir)?.is_empty() {
            return Ok(());
        }
        sleep(StdDuration::from_millis(25)).await;
    }
    Err(anyhow!("{} still has entries", dir.display()))
}

pub fn dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        entries.push(entry?.path());
    }
    Ok(entries)
}

/// Sends a bare GET and returns everything up to the end of the headers,
/// leaving the body unread on the socket.
pub async fn send_raw_get(
    stream: &mut TcpStream,
    path: &str,
    headers: &[(&str, &str)],
) -> Result<String> {
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    timeout(StdDuration::from_secs(30), read_until_double_crlf(stream)).await?
}

pub async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<String> {
    let mut buffer = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let bytes = stream.read(&mut byte).await?;
        if bytes == 0 {
            break;
        }
        buffer.extend_from_slice(&byte);
        if buffer.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8(buffer)?)
}
