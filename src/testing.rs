//! Test doubles shared by the unit tests of several modules

use crate::{
    cache::Cache,
    config::NetworkAccess,
    fetch::{Fetcher, Response, Transport},
    progress::ProgressReport,
    Result,
};
use async_compression::tokio::bufread::GzipEncoder;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    io::{self, Cursor, ErrorKind},
    path::Path,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use url::Url;

/// Scripted response of the [`FakeTransport`]
#[derive(Clone, Debug)]
struct FakeResponse {
    content_type: Option<Box<str>>,
    body: Vec<u8>,
    fail_after: usize,

    /// Number of upcoming transfers that break down after `fail_after` bytes
    failures: usize,
}

/// In-memory HTTP transport which counts the requests it receives
#[derive(Debug, Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<Box<str>, FakeResponse>>,
    requests: AtomicUsize,
}
//
impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve a body under some URL
    pub fn serve(&self, url: &str, content_type: Option<&str>, body: impl Into<Vec<u8>>) {
        self.insert(url, content_type, body.into(), 0, 0);
    }

    /// Serve a body whose every transfer breaks down after some bytes
    pub fn serve_truncated(
        &self,
        url: &str,
        content_type: Option<&str>,
        body: impl Into<Vec<u8>>,
        fail_after: usize,
    ) {
        self.insert(url, content_type, body.into(), fail_after, usize::MAX);
    }

    /// Serve a body whose first few transfers break down after some bytes
    pub fn serve_flaky(
        &self,
        url: &str,
        content_type: Option<&str>,
        body: impl Into<Vec<u8>>,
        fail_after: usize,
        failures: usize,
    ) {
        self.insert(url, content_type, body.into(), fail_after, failures);
    }

    fn insert(
        &self,
        url: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
        fail_after: usize,
        failures: usize,
    ) {
        self.responses.lock().unwrap().insert(
            url.into(),
            FakeResponse {
                content_type: content_type.map(Into::into),
                body,
                fail_after,
                failures,
            },
        );
    }

    /// Number of requests received so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}
//
#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, url: &Url) -> Result<Response> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let (response, broken) = {
            let mut responses = self.responses.lock().unwrap();
            let response = responses
                .get_mut(url.as_str())
                .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("nothing served at {url}")))?;
            let broken = response.failures > 0;
            if broken && response.failures != usize::MAX {
                response.failures -= 1;
            }
            (response.clone(), broken)
        };
        let content_length = Some(response.body.len() as u64);
        let body: crate::fetch::ByteStream = if broken {
            let prefix = response.body[..response.fail_after.min(response.body.len())].to_vec();
            Box::pin(Cursor::new(prefix).chain(BrokenReader))
        } else {
            Box::pin(Cursor::new(response.body))
        };
        Ok(Response {
            content_type: response.content_type,
            content_length,
            body,
        })
    }
}

/// Reader whose every read fails, like a connection reset mid-transfer
struct BrokenReader;
//
impl AsyncRead for BrokenReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            ErrorKind::ConnectionReset,
            "connection reset by fake peer",
        )))
    }
}

/// Fetcher backed by a fake transport and a cache in some directory
pub fn fetcher(dir: &Path, transport: Arc<FakeTransport>, network: NetworkAccess) -> Fetcher {
    Fetcher::new(
        Arc::new(Cache::new(dir)),
        transport,
        network,
        ProgressReport::hidden(),
    )
}

/// Gzip some bytes
pub async fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut gz = Vec::new();
    GzipEncoder::new(bytes).read_to_end(&mut gz).await.unwrap();
    gz
}
