//! HTTP(S) range getter.
//!
//! Transport failures are mapped onto the retry reader's taxonomy: timeouts, refused or dropped
//! connections, bodies dying mid-stream and 5xx/429 responses are transient; other client errors
//! are fatal.

use anyhow::Context;
use futures::TryStreamExt;
use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;

use crate::endpoint::Source;
use crate::range::ByteRange;
use crate::retry_reader::{Body, RangeGetter, TransientNetworkError};

/// Kind of the first `io::Error` found while walking the source chain of `error`.
fn underlying_io_kind(error: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<std::io::Error>() {
            return Some(io_error.kind());
        }
        source = cause.source();
    }
    None
}

fn map_reqwest_error(error: reqwest::Error) -> std::io::Error {
    if error.is_timeout() {
        std::io::Error::new(std::io::ErrorKind::TimedOut, error)
    } else if error.is_decode() || error.is_body() {
        // a body that stops short of its advertised length surfaces as a decode error
        let kind = underlying_io_kind(&error).unwrap_or(std::io::ErrorKind::UnexpectedEof);
        std::io::Error::new(kind, TransientNetworkError::new(format!("{error:#}")))
    } else if error.is_connect() || error.is_request() {
        TransientNetworkError::new(format!("{error:#}")).into()
    } else {
        std::io::Error::other(error)
    }
}

fn status_error(status: reqwest::StatusCode, url: &reqwest::Url) -> std::io::Error {
    let message = format!("HTTP {status} for {url}");
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        TransientNetworkError::new(message).into()
    } else {
        std::io::Error::other(message)
    }
}

#[derive(Debug, Clone)]
pub struct HttpRangeGetter {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpRangeGetter {
    pub fn new(client: reqwest::Client, url: reqwest::Url) -> Self {
        Self { client, url }
    }
}

impl RangeGetter for HttpRangeGetter {
    fn get(&self, range: ByteRange) -> BoxFuture<'static, std::io::Result<Body>> {
        let client = self.client.clone();
        let url = self.url.clone();
        Box::pin(async move {
            // inclusive on both ends
            let header = format!("bytes={}-{}", range.offset, range.end().saturating_sub(1));
            tracing::trace!("GET {} {}", &url, &header);
            let response = client
                .get(url.clone())
                .header(reqwest::header::RANGE, header)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let status = response.status();
            let whole_object = status == reqwest::StatusCode::OK && range.offset == 0;
            if status != reqwest::StatusCode::PARTIAL_CONTENT && !whole_object {
                return Err(status_error(status, &url));
            }
            let stream = response.bytes_stream().map_err(map_reqwest_error);
            let reader = tokio_util::io::StreamReader::new(stream);
            // a server ignoring the range sends the whole object
            Ok(Box::pin(reader.take(range.count)) as Body)
        })
    }
}

/// Size of the object at `url`, from a HEAD request.
pub async fn object_size(client: &reqwest::Client, url: &reqwest::Url) -> anyhow::Result<u64> {
    let response = client
        .head(url.clone())
        .send()
        .await
        .with_context(|| format!("HEAD {url} failed"))?;
    let status = response.status();
    anyhow::ensure!(status.is_success(), "HEAD {} returned {}", url, status);
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .context("response has no Content-Length")?
        .to_str()?
        .parse::<u64>()
        .with_context(|| format!("invalid Content-Length for {url}"))
}

/// Objects under a base URL; relative paths are appended to it.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpSource {
    pub fn new(client: reqwest::Client, base: reqwest::Url) -> Self {
        Self { client, base }
    }

    fn url(&self, relative: &std::path::Path) -> anyhow::Result<reqwest::Url> {
        if relative.as_os_str().is_empty() {
            return Ok(self.base.clone());
        }
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| anyhow::anyhow!("{} cannot be a base URL", &self.base))?;
            segments.pop_if_empty();
            for component in relative.components() {
                segments.push(&component.as_os_str().to_string_lossy());
            }
        }
        Ok(url)
    }
}

impl Source for HttpSource {
    fn getter(
        &self,
        relative: &std::path::Path,
    ) -> anyhow::Result<std::sync::Arc<dyn RangeGetter>> {
        Ok(std::sync::Arc::new(HttpRangeGetter::new(
            self.client.clone(),
            self.url(relative)?,
        )))
    }

    fn describe(&self, relative: &std::path::Path) -> String {
        self.url(relative)
            .map_or_else(|_| self.base.to_string(), |url| url.to_string())
    }
}
