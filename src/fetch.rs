//! Cache-through HTTP fetcher
//!
//! The cache is treated as a write-once store of response bodies. Text-like
//! bodies are Brotli-compressed on their way in, binary bodies are stored
//! as-is, and every body that is handed out is read back from the cache so
//! that the first fetch and later ones go through the exact same path.

use crate::{
    cache::{Cache, CacheKey},
    codec,
    config::{Config, NetworkAccess},
    progress::{ProgressConfig, ProgressReport, Work},
    Error, Result,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{header::CONTENT_TYPE, StatusCode};
use std::{
    io::{self, ErrorKind},
    pin::Pin,
    sync::Arc,
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio_util::io::{InspectReader, StreamReader};
use url::Url;

/// Streamed response body
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Last path segment used for URLs whose path designates a directory
const DIRECTORY_INDEX: &str = "index.html";

/// Response to an HTTP GET, before its body has been read
pub struct Response {
    /// Raw Content-Type header, if any
    pub content_type: Option<Box<str>>,

    /// Announced body length, if any
    pub content_length: Option<u64>,

    /// Body of the response
    pub body: ByteStream,
}

/// Network side of the [`Fetcher`]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET request and return the response once headers are in
    async fn get(&self, url: &Url) -> Result<Response>;
}

/// Bounded exponential backoff for transient download failures
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Upper bound on the delay between two attempts
    pub max_backoff: Duration,
}
//
impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before a given retry (starting from 0)
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_backoff)
    }
}
//
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// [`Transport`] that goes through reqwest
#[derive(Clone, Debug)]
pub struct HttpTransport(reqwest::Client);
//
impl HttpTransport {
    /// Set up an HTTP client from the configuration
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&*config.user_agent)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self(client))
    }
}
//
#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<Response> {
        let response = self.0.get(url.clone()).send().await?.error_for_status()?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(Into::into);
        let content_length = response.content_length();
        let body = StreamReader::new(
            response
                .bytes_stream()
                // Translate reqwest errors into I/O errors
                .map_err(|e| io::Error::new(ErrorKind::Other, e)),
        );
        Ok(Response {
            content_type,
            content_length,
            body: Box::pin(body),
        })
    }
}

/// Truth that retrying a failed download may help
fn is_transient(e: &Error) -> bool {
    match e {
        Error::Http(e) => is_transient_http(e),
        Error::Io(e) => match e.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
            | ErrorKind::Interrupted => true,
            // Body streaming errors are reqwest errors wrapped by the transport
            _ => e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                .is_some_and(is_transient_http),
        },
        _ => false,
    }
}

/// Truth that retrying a failed HTTP exchange may help
fn is_transient_http(e: &reqwest::Error) -> bool {
    match e.status() {
        Some(status) => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
        None => e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode(),
    }
}

/// How a response body is stored
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BodyKind {
    /// Compressed before storage
    Text,

    /// Stored as-is
    Binary,
}

/// Decide how a response body should be stored from its Content-Type
///
/// Returns `None` for MIME types that are neither known text forms nor
/// eligible for binary storage.
pub fn classify_body(content_type: &str, url: &Url) -> Option<BodyKind> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if mime.starts_with("text/") {
        return Some(BodyKind::Text);
    } else if mime.starts_with("image/") {
        return Some(BodyKind::Binary);
    }
    match &*mime {
        "application/json" => Some(BodyKind::Text),
        "application/octet-stream" if url.path().ends_with(".csv") => Some(BodyKind::Text),
        "application/octet-stream"
        | "application/gzip"
        | "application/x-gzip"
        | "application/zip" => Some(BodyKind::Binary),
        _ => None,
    }
}

/// Check that a URL can be cached, and compute its uncompressed cache key
///
/// The key only derives from the scheme, host and path of the URL, so URLs
/// carrying credentials, a query, a fragment or an explicit port are
/// rejected: they could not be told apart from their plain counterparts.
pub fn resource_key(url: &str) -> Result<(Url, CacheKey)> {
    let invalid = |reason| Error::InvalidUrl {
        url: url.into(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|_| invalid("not a valid URL"))?;
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(invalid("embedded credentials are not supported"));
    }
    if parsed.query().is_some() {
        return Err(invalid("query strings are not supported"));
    }
    if parsed.fragment().is_some() {
        return Err(invalid("fragments are not supported"));
    }
    if parsed.port().is_some() {
        return Err(invalid("explicit ports are not supported"));
    }
    let host = parsed.host_str().ok_or_else(|| invalid("URL has no host"))?;

    let mut segments = vec![parsed.scheme().to_owned(), host.to_owned()];
    let path = parsed.path();
    segments.extend(
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned),
    );
    if path.ends_with('/') || segments.len() == 2 {
        segments.push(DIRECTORY_INDEX.to_owned());
    }
    let key = CacheKey::new(segments)?;
    Ok((parsed, key))
}

/// Cache-through HTTP client
pub struct Fetcher {
    /// Where response bodies are stored
    cache: Arc<Cache>,

    /// How cache misses are resolved
    transport: Arc<dyn Transport>,

    /// Whether cache misses may be resolved at all
    network: NetworkAccess,

    /// How failed downloads are retried
    retry: RetryPolicy,

    /// Where download progress is shown
    report: ProgressReport,
}
//
impl Fetcher {
    /// Set up a fetcher which never retries failed downloads
    pub fn new(
        cache: Arc<Cache>,
        transport: Arc<dyn Transport>,
        network: NetworkAccess,
        report: ProgressReport,
    ) -> Self {
        Self {
            cache,
            transport,
            network,
            retry: RetryPolicy::none(),
            report,
        }
    }

    /// Rebuild with a different retry policy
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    /// Set up a fetcher that goes through HTTP
    pub fn from_config(config: &Config, cache: Arc<Cache>, report: ProgressReport) -> Result<Self> {
        Ok(Self::new(
            cache,
            Arc::new(HttpTransport::new(config)?),
            config.network,
            report,
        )
        .with_retry(config.retry))
    }

    /// Underlying cache
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Fetch a resource, from the cache if possible
    pub async fn get(&self, url: &str) -> Result<ByteStream> {
        let (url, key) = resource_key(url)?;
        if let Some(body) = self.read_cached(&key).await? {
            return Ok(body);
        }
        if !self.network.is_allowed() {
            return Err(Error::Offline {
                url: url.as_str().into(),
                key: key.to_string().into(),
            });
        }
        if self.cache.is_read_only() {
            return Err(Error::ReadOnly {
                key: key.to_string().into(),
            });
        }
        self.download(&url, &key).await?;
        self.read_cached(&key).await?.ok_or_else(|| {
            io::Error::new(
                ErrorKind::NotFound,
                format!("{key} vanished from the cache right after being written"),
            )
            .into()
        })
    }

    /// Fetch a resource and collect its body in memory
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.get(url).await?.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }

    /// Fetch a textual resource, replacing invalid UTF-8 sequences
    pub async fn get_string(&self, url: &str) -> Result<String> {
        let bytes = self.get_bytes(url).await?;
        Ok(String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
    }

    /// Read a cached body, whether it was stored compressed or not
    async fn read_cached(&self, key: &CacheKey) -> Result<Option<ByteStream>> {
        // Common case, compressed text
        if let Some(reader) = self.cache.get(&key.compressed()).await? {
            return Ok(Some(Box::pin(codec::decompress_text(reader)) as ByteStream));
        }
        // Uncommon case, binary data
        Ok(self
            .cache
            .get(key)
            .await?
            .map(|reader| Box::pin(reader) as ByteStream))
    }

    /// Download a resource into the cache, retrying transient failures
    ///
    /// A transfer that breaks down midway leaves nothing in the cache, so
    /// every attempt starts over from an empty entry.
    async fn download(&self, url: &Url, key: &CacheKey) -> Result<()> {
        let mut retry = 0;
        loop {
            match self.try_download(url, key).await {
                Err(e) if retry < self.retry.max_retries && is_transient(&e) => {
                    let delay = self.retry.backoff(retry);
                    log::warn!("Transient failure while fetching {url} ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                result => return result,
            }
        }
    }

    /// Make one attempt at downloading a resource into the cache
    async fn try_download(&self, url: &Url, key: &CacheKey) -> Result<()> {
        log::info!("Downloading {url}");
        let response = self.transport.get(url).await?;
        let content_type = response
            .content_type
            .as_deref()
            .ok_or_else(|| Error::protocol(url.as_str(), "response has no Content-Type header"))?;
        let kind = classify_body(content_type, url).ok_or_else(|| {
            Error::protocol(
                url.as_str(),
                format!("unrecognized Content-Type: {content_type}"),
            )
        })?;

        // Track how many bytes have been downloaded so far
        let tracker = self.report.add(
            format!("Downloading {url}"),
            ProgressConfig::new(Work::Bytes(response.content_length.unwrap_or(0))),
        );
        let inspector = tracker.clone();
        let body = BufReader::new(InspectReader::new(response.body, move |bytes: &[u8]| {
            inspector.make_progress(bytes.len() as u64);
        }));

        // Stream the body into the cache
        let result = match kind {
            BodyKind::Text => self.cache.set(&key.compressed(), codec::compress_text(body)).await,
            BodyKind::Binary => self.cache.set(key, body).await,
        };
        tracker.finish();
        let written = result?;
        log::info!("Cached {url} as {kind:?} ({written} bytes stored)");
        Ok(())
    }
}
