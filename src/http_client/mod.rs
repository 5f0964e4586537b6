pub mod reader;
pub mod store;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use mockall::automock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

pub use store::{CacheOptions, Store};

/// upstream response headers worth keeping around; everything else is
/// dropped at this boundary
pub const FORWARDED_HEADERS: [&str; 5] = [
    "Cache-Control",
    "Expires",
    "Last-Modified",
    "ETag",
    "Content-Type",
];

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status code: {0}")]
    Status(u16),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache error: {0}")]
    Cache(String),
}

pub type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// response shape shared by the direct and the caching client: a status,
/// the forwarded header subset and a lazily consumed body
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: BodyStream,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// drains the body into memory; listing decoders consume whole
    /// documents anyway, only the proxy paths stream
    pub async fn bytes(mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

#[automock]
#[async_trait::async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, HttpClientError>;
}

pub type DynHttpClient = Arc<dyn HttpClient + Send + Sync>;

/// plain reqwest client with the provider's extra headers stamped on
/// every request, a 10 minute timeout for slow EPG dumps and a 5 hop
/// redirect cap
pub struct DirectClient {
    client: reqwest::Client,
}

impl DirectClient {
    pub fn new(extra_headers: &[crate::config::common::NameValue]) -> Self {
        let mut headers = HeaderMap::new();
        for nv in extra_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(nv.name.as_bytes()),
                HeaderValue::from_str(&nv.value),
            ) {
                headers.insert(name, value);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .default_headers(headers)
            .build()
            .unwrap_or_default();

        Self { client }
    }
}

#[async_trait::async_trait]
impl HttpClient for DirectClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, HttpClientError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HttpClientError::Request(e.to_string()))?;

        Ok(into_response(response))
    }
}

pub(crate) fn into_response(response: reqwest::Response) -> HttpResponse {
    let status = response.status().as_u16();
    let headers = forwarded_headers(response.headers());
    let body = response
        .bytes_stream()
        .map_err(std::io::Error::other)
        .boxed();

    HttpResponse {
        status,
        headers,
        body,
    }
}

pub(crate) fn forwarded_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(FORWARDED_HEADERS.len());
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            out.insert(name.to_string(), value.to_string());
        }
    }
    out
}

/// gzip is transparent for sources: content type, content encoding or a
/// plain .gz suffix all mean the same thing
pub(crate) fn is_gzipped(
    content_type: Option<&str>,
    content_encoding: Option<&str>,
    url: &str,
) -> bool {
    matches!(
        content_type,
        Some("application/gzip") | Some("application/x-gzip")
    ) || content_encoding == Some("gzip")
        || url.ends_with(".gz")
}
