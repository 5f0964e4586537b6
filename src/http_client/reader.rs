use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::store::{CacheOptions, Store, META_EXTENSION};
use super::{forwarded_headers, is_gzipped, BodyStream, HttpClientError, HttpResponse};
use crate::metrics;

/// distinguishes writers racing on the same entry; each in-flight
/// download gets its own .tmp twin and the last rename wins
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub cached_at: i64,
    pub retention_seconds: Option<i64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

pub async fn read_metadata(path: &Path) -> Result<Metadata, HttpClientError> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw)
        .map_err(|e| HttpClientError::Cache(format!("invalid meta file format: {e}")))
}

async fn write_metadata(meta_path: &Path, metadata: &Metadata) -> Result<(), HttpClientError> {
    let tmp_path = tmp_twin(meta_path);
    let raw = serde_json::to_vec(metadata)
        .map_err(|e| HttpClientError::Cache(format!("failed to encode meta: {e}")))?;
    tokio::fs::write(&tmp_path, raw).await?;
    tokio::fs::rename(&tmp_path, meta_path).await?;
    Ok(())
}

fn tmp_twin(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}.tmp"));
    PathBuf::from(name)
}

enum LookupState {
    Valid(Metadata),
    Renewed(Metadata),
    Expired,
    NotFound,
}

/// the cache lookup state machine: serve fresh entries from disk, renew
/// near-expiry entries by header inspection or a conditional HEAD, and
/// stream everything else from the origin through a .tmp twin
pub(crate) async fn open(
    store: &Store,
    origin: &reqwest::Client,
    url: &str,
    options: &CacheOptions,
) -> Result<HttpResponse, HttpClientError> {
    let name = Store::entry_name(url, options);
    let file_path = store.dir().join(format!("{name}{}", options.data_extension()));
    let meta_path = store.dir().join(format!("{name}{META_EXTENSION}"));

    let state = check_state(origin, url, options, &file_path, &meta_path).await;

    match state {
        LookupState::Valid(metadata) => {
            debug!(cache = "hit", url, "file access");
            metrics::inc_cache_access("hit");
            match serve_cached(&file_path, metadata, options).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    // the sweeper may have unlinked the entry under us;
                    // degrade to a fresh fetch
                    warn!("failed to serve cached body: {e}");
                    fetch_and_cache(origin, url, options, file_path, meta_path).await
                }
            }
        }
        LookupState::Renewed(metadata) => {
            debug!(cache = "renewed", url, "file access");
            metrics::inc_cache_access("renewed");
            match serve_cached(&file_path, metadata, options).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    warn!("failed to serve renewed body: {e}");
                    fetch_and_cache(origin, url, options, file_path, meta_path).await
                }
            }
        }
        LookupState::Expired | LookupState::NotFound => {
            debug!(cache = "miss", url, "file access");
            metrics::inc_cache_access("miss");
            fetch_and_cache(origin, url, options, file_path, meta_path).await
        }
    }
}

async fn check_state(
    origin: &reqwest::Client,
    url: &str,
    options: &CacheOptions,
    file_path: &Path,
    meta_path: &Path,
) -> LookupState {
    if tokio::fs::metadata(meta_path).await.is_err()
        || tokio::fs::metadata(file_path).await.is_err()
    {
        return LookupState::NotFound;
    }

    let metadata = match read_metadata(meta_path).await {
        Ok(metadata) => metadata,
        Err(_) => return LookupState::NotFound,
    };

    let age = Utc::now().timestamp() - metadata.cached_at;
    if !options.ttl.is_zero() && age < options.ttl.as_secs() as i64 {
        return LookupState::Valid(metadata);
    }

    // past ttl but the origin told us when it actually expires
    if let Some(expires) = metadata.headers.get("Expires") {
        if let Ok(expires) = DateTime::parse_from_rfc2822(expires) {
            if expires > Utc::now() {
                return renew(meta_path, metadata, options).await;
            }
        }
    }

    try_revalidation(origin, url, options, meta_path, metadata).await
}

/// rewrites cached_at while keeping the stored headers, so freshness
/// accounting restarts without touching the body
async fn renew(meta_path: &Path, metadata: Metadata, options: &CacheOptions) -> LookupState {
    let renewed = Metadata {
        cached_at: Utc::now().timestamp(),
        retention_seconds: Some(options.retention.as_secs() as i64),
        headers: metadata.headers.clone(),
    };
    match write_metadata(meta_path, &renewed).await {
        Ok(()) => LookupState::Renewed(renewed),
        Err(e) => {
            warn!("failed to renew cache meta: {e}");
            LookupState::Expired
        }
    }
}

async fn try_revalidation(
    origin: &reqwest::Client,
    url: &str,
    options: &CacheOptions,
    meta_path: &Path,
    metadata: Metadata,
) -> LookupState {
    let stored_last_modified = metadata
        .headers
        .get("Last-Modified")
        .and_then(|lm| DateTime::parse_from_rfc2822(lm).ok());
    let etag = metadata.headers.get("ETag").cloned();

    if stored_last_modified.is_none() && etag.is_none() {
        return LookupState::Expired;
    }

    let mut request = origin.head(url);
    if let Some(lm) = &stored_last_modified {
        request = request.header("If-Modified-Since", lm.to_rfc2822());
    }
    if let Some(etag) = &etag {
        request = request.header("If-None-Match", etag);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(_) => return LookupState::Expired,
    };

    if response.status() == reqwest::StatusCode::NOT_MODIFIED {
        return renew(meta_path, metadata, options).await;
    }

    if response.status() == reqwest::StatusCode::OK {
        if let (Some(stored), Some(server)) = (
            stored_last_modified,
            response
                .headers()
                .get("Last-Modified")
                .and_then(|v| v.to_str().ok())
                .and_then(|lm| DateTime::parse_from_rfc2822(lm).ok()),
        ) {
            if server <= stored {
                return renew(meta_path, metadata, options).await;
            }
        }
    }

    LookupState::Expired
}

async fn serve_cached(
    file_path: &Path,
    metadata: Metadata,
    options: &CacheOptions,
) -> Result<HttpResponse, HttpClientError> {
    // readers keep the fd, so a concurrent sweep unlinking the entry
    // cannot truncate a body mid-read on posix
    let file = tokio::fs::File::open(file_path).await?;
    let raw: BodyStream = ReaderStream::new(file).boxed();

    let body = if options.compression {
        GzDecodeBody::new(raw).boxed()
    } else {
        raw
    };

    Ok(HttpResponse {
        status: 200,
        headers: metadata.headers,
        body,
    })
}

async fn fetch_and_cache(
    origin: &reqwest::Client,
    url: &str,
    options: &CacheOptions,
    file_path: PathBuf,
    meta_path: PathBuf,
) -> Result<HttpResponse, HttpClientError> {
    let response = origin
        .get(url)
        .send()
        .await
        .map_err(|e| HttpClientError::Request(e.to_string()))?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(HttpClientError::Status(response.status().as_u16()));
    }

    let headers = forwarded_headers(response.headers());
    let gzipped = is_gzipped(
        headers.get("Content-Type").map(String::as_str),
        response
            .headers()
            .get("Content-Encoding")
            .and_then(|v| v.to_str().ok()),
        url,
    );
    let content_length = response.content_length();

    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);

    tokio::spawn(download(
        response,
        DownloadTarget {
            tmp_path: tmp_twin(&file_path),
            file_path,
            meta_path,
            compression: options.compression,
            gzipped,
            content_length,
            retention_seconds: options.retention.as_secs() as i64,
            headers: headers.clone(),
        },
        tx,
    ));

    Ok(HttpResponse {
        status: 200,
        headers,
        body: tokio_stream_from(rx),
    })
}

fn tokio_stream_from(rx: mpsc::Receiver<std::io::Result<Bytes>>) -> BodyStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

struct DownloadTarget {
    tmp_path: PathBuf,
    file_path: PathBuf,
    meta_path: PathBuf,
    compression: bool,
    gzipped: bool,
    content_length: Option<u64>,
    retention_seconds: i64,
    headers: HashMap<String, String>,
}

/// drives one origin download: counts raw bytes, tees them into the .tmp
/// body file (through the gzip codec the storage format asks for) and
/// forwards always-uncompressed chunks to the consumer; publication is a
/// rename pair that only happens after a verified-complete read
async fn download(
    response: reqwest::Response,
    target: DownloadTarget,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
) {
    let mut file = match tokio::fs::File::create(&target.tmp_path).await {
        Ok(file) => file,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            return;
        }
    };

    // store side: encode when we compress plain upstreams, pass through
    // when the upstream is already gzip and we keep it that way
    let mut store_encoder = (target.compression && !target.gzipped)
        .then(|| GzEncoder::new(Vec::new(), Compression::fast()));
    // consumer side: callers always get uncompressed bytes
    let mut consumer_decoder = target.gzipped.then(|| GzDecoder::new(Vec::new()));

    let mut downloaded: u64 = 0;
    let mut failed = false;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(std::io::Error::other(e))).await;
                failed = true;
                break;
            }
        };
        downloaded += chunk.len() as u64;

        let decoded = match &mut consumer_decoder {
            Some(decoder) => match drain_codec(decoder, &chunk) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    failed = true;
                    break;
                }
            },
            None => None,
        };

        // what lands in the body file depends on the storage format:
        // compressed storage keeps gzip bytes, plain storage keeps the
        // decoded form
        let store_bytes: Bytes = if target.compression {
            if target.gzipped {
                chunk.clone()
            } else {
                match store_encoder
                    .as_mut()
                    .map(|encoder| drain_codec(encoder, &chunk))
                    .transpose()
                {
                    Ok(encoded) => encoded.unwrap_or_default(),
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        failed = true;
                        break;
                    }
                }
            }
        } else if let Some(decoded) = &decoded {
            decoded.clone()
        } else {
            chunk.clone()
        };

        if !store_bytes.is_empty() {
            if let Err(e) = file.write_all(&store_bytes).await {
                let _ = tx.send(Err(e)).await;
                failed = true;
                break;
            }
        }

        let consumer_bytes = decoded.unwrap_or(chunk);
        if !consumer_bytes.is_empty() {
            // a failed send means the request was cancelled downstream
            if tx.send(Ok(consumer_bytes)).await.is_err() {
                failed = true;
                break;
            }
        }
    }

    if !failed {
        if let Err(e) = finalize(
            file,
            store_encoder,
            consumer_decoder,
            &target,
            downloaded,
            &tx,
        )
        .await
        {
            warn!("failed to publish cache entry: {e}");
            failed = true;
        }
    }

    if failed {
        let _ = tokio::fs::remove_file(&target.tmp_path).await;
    }
}

async fn finalize(
    mut file: tokio::fs::File,
    store_encoder: Option<GzEncoder<Vec<u8>>>,
    consumer_decoder: Option<GzDecoder<Vec<u8>>>,
    target: &DownloadTarget,
    downloaded: u64,
    tx: &mpsc::Sender<std::io::Result<Bytes>>,
) -> Result<(), HttpClientError> {
    if let Some(encoder) = store_encoder {
        let tail = encoder.finish()?;
        file.write_all(&tail).await?;
    }

    if let Some(decoder) = consumer_decoder {
        let tail = Bytes::from(decoder.finish()?);
        if !tail.is_empty() {
            if !target.compression {
                file.write_all(&tail).await?;
            }
            if tx.send(Ok(tail)).await.is_err() {
                return Err(HttpClientError::Cache("consumer went away".to_string()));
            }
        }
    }

    // short reads are thrown away and retried by the next request
    let complete = match target.content_length {
        Some(expected) => downloaded == expected,
        None => true,
    };
    if !complete {
        return Err(HttpClientError::Cache(format!(
            "incomplete download: {downloaded} of {:?} bytes",
            target.content_length
        )));
    }

    file.flush().await?;
    drop(file);

    // body first, meta second; a reader that wins the race between the
    // two renames sees consistent body bytes either way
    let _ = tokio::fs::remove_file(&target.file_path).await;
    tokio::fs::rename(&target.tmp_path, &target.file_path).await?;

    write_metadata(
        &target.meta_path,
        &Metadata {
            cached_at: Utc::now().timestamp(),
            retention_seconds: Some(target.retention_seconds),
            headers: target.headers.clone(),
        },
    )
    .await
}

/// pushes one chunk through a write-side flate2 codec and takes whatever
/// output it produced so far
fn drain_codec<W: DrainableCodec>(codec: &mut W, chunk: &[u8]) -> std::io::Result<Bytes> {
    codec.write_all(chunk)?;
    Ok(Bytes::from(codec.take_output()))
}

trait DrainableCodec: Write {
    fn take_output(&mut self) -> Vec<u8>;
}

impl DrainableCodec for GzEncoder<Vec<u8>> {
    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }
}

impl DrainableCodec for GzDecoder<Vec<u8>> {
    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }
}

/// inflates a gzip-stored body while it streams off disk
pub struct GzDecodeBody {
    inner: BodyStream,
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl GzDecodeBody {
    pub fn new(inner: BodyStream) -> Self {
        Self {
            inner,
            decoder: Some(GzDecoder::new(Vec::new())),
        }
    }
}

impl Stream for GzDecodeBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    let Some(decoder) = this.decoder.as_mut() else {
                        return Poll::Ready(None);
                    };
                    match drain_codec(decoder, &chunk) {
                        Ok(decoded) if decoded.is_empty() => continue,
                        Ok(decoded) => return Poll::Ready(Some(Ok(decoded))),
                        Err(e) => {
                            this.decoder = None;
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => {
                    return match this.decoder.take() {
                        Some(decoder) => match decoder.finish() {
                            Ok(tail) if tail.is_empty() => Poll::Ready(None),
                            Ok(tail) => Poll::Ready(Some(Ok(Bytes::from(tail)))),
                            Err(e) => Poll::Ready(Some(Err(e))),
                        },
                        None => Poll::Ready(None),
                    };
                }
            }
        }
    }
}
