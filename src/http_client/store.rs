use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::common::NameValue;

use super::reader::{self, read_metadata};
use super::{HttpClient, HttpClientError, HttpResponse, MAX_REDIRECTS, UPSTREAM_TIMEOUT};

pub const COMPRESSED_EXTENSION: &str = ".gz";
pub const UNCOMPRESSED_EXTENSION: &str = ".cache";
pub const META_EXTENSION: &str = ".meta";

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_RETENTION_SECS: i64 = 24 * 3600;

/// per-provider caching knobs; they participate in the cache key so two
/// providers with different headers never share an entry
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub retention: Duration,
    pub compression: bool,
    pub headers: Vec<NameValue>,
}

impl CacheOptions {
    /// canonical form of everything that distinguishes one cache slot
    /// from another for the same url
    pub fn key(&self) -> String {
        let mut out = String::new();
        out.push_str("ttl=");
        out.push_str(&self.ttl.as_secs().to_string());
        out.push_str(";ret=");
        out.push_str(&self.retention.as_secs().to_string());
        out.push_str(";cmp=");
        out.push_str(if self.compression { "1" } else { "0" });
        out.push_str(";hdr=");
        out.push_str(&canonical_headers(&self.headers));
        out
    }

    pub fn data_extension(&self) -> &'static str {
        if self.compression {
            COMPRESSED_EXTENSION
        } else {
            UNCOMPRESSED_EXTENSION
        }
    }
}

fn canonical_headers(headers: &[NameValue]) -> String {
    if headers.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<String> = headers
        .iter()
        .map(|h| format!("{}:{}", h.name.to_lowercase(), h.value))
        .collect();
    pairs.sort();
    pairs.join("\n")
}

/// content-addressed disk cache over upstream GETs, one flat directory
/// of body files with json meta sidecars; atomic rename is the only
/// synchronization between writers, readers and the sweeper
pub struct Store {
    dir: PathBuf,
    stop_tx: mpsc::Sender<()>,
}

impl Store {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Arc<Self>> {
        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let (stop_tx, stop_rx) = mpsc::channel(1);

        let store = Arc::new(Self { dir, stop_tx });

        tokio::spawn(sweep_routine(store.dir.clone(), stop_rx));

        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// signals the sweeper loop to exit
    pub fn close(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// first 16 bytes of sha256 over url + options, hex encoded
    pub fn entry_name(url: &str, options: &CacheOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        hasher.update(options.key().as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn http_client(self: &Arc<Self>, options: CacheOptions) -> CachedClient {
        CachedClient::new(self.clone(), options)
    }

    /// one sweep pass, also callable directly from tests
    pub async fn clean_expired(&self) {
        sweep_directory(&self.dir).await;
    }
}

async fn sweep_routine(dir: PathBuf, mut stop_rx: mpsc::Receiver<()>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    // the immediate first tick would sweep on startup, skip it
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => sweep_directory(&dir).await,
            _ = stop_rx.recv() => {
                debug!("cache sweeper stopped");
                return;
            }
        }
    }
}

async fn sweep_directory(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            error!("failed to list cache directory {:?}: {e}", dir);
            return;
        }
    };

    let now = Utc::now().timestamp();
    let mut total = 0usize;
    let mut expired = 0usize;
    let mut orphaned = 0usize;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("cache sweep read error: {e}");
                break;
            }
        };

        total += 1;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let file_path = entry.path();

        let data_ext = if file_name.ends_with(COMPRESSED_EXTENSION) {
            Some(COMPRESSED_EXTENSION)
        } else if file_name.ends_with(UNCOMPRESSED_EXTENSION) {
            Some(UNCOMPRESSED_EXTENSION)
        } else {
            None
        };

        if let Some(ext) = data_ext {
            // body without a meta sidecar is garbage
            let name = file_name.strip_suffix(ext).unwrap_or(&file_name);
            let meta_path = dir.join(format!("{name}{META_EXTENSION}"));
            if tokio::fs::metadata(&meta_path).await.is_err() {
                remove_logged(&file_path).await;
                orphaned += 1;
            }
            continue;
        }

        if file_name.ends_with(META_EXTENSION) {
            let metadata = match read_metadata(&file_path).await {
                Ok(metadata) => metadata,
                Err(_) => {
                    // unparseable sidecar, remove it and let the next pass
                    // collect the orphaned body
                    remove_logged(&file_path).await;
                    orphaned += 1;
                    continue;
                }
            };

            let name = file_name.strip_suffix(META_EXTENSION).unwrap_or(&file_name);

            // meta without a body is garbage too
            let gz_body = dir.join(format!("{name}{COMPRESSED_EXTENSION}"));
            let plain_body = dir.join(format!("{name}{UNCOMPRESSED_EXTENSION}"));
            if tokio::fs::metadata(&gz_body).await.is_err()
                && tokio::fs::metadata(&plain_body).await.is_err()
            {
                remove_logged(&file_path).await;
                orphaned += 1;
                continue;
            }

            let retention = metadata.retention_seconds.unwrap_or(DEFAULT_RETENTION_SECS);
            if retention <= 0 || now - metadata.cached_at > retention {
                remove_entry(dir, name).await;
                expired += 1;
            }
            continue;
        }

        // leftover .tmp twins and anything else unexpected
        remove_logged(&file_path).await;
        orphaned += 1;
    }

    info!(total, expired, orphaned, "cache sweep finished");
}

async fn remove_entry(dir: &Path, name: &str) {
    for ext in [COMPRESSED_EXTENSION, UNCOMPRESSED_EXTENSION, META_EXTENSION] {
        let path = dir.join(format!("{name}{ext}"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove cache file {:?}: {e}", path),
        }
    }
}

async fn remove_logged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove cache file {:?}: {e}", path);
        }
    }
}

/// the cache store worn as an http client: hits and renewals read from
/// disk, misses stream through the store on their way to the caller
pub struct CachedClient {
    store: Arc<Store>,
    options: CacheOptions,
    origin: reqwest::Client,
}

impl CachedClient {
    fn new(store: Arc<Store>, options: CacheOptions) -> Self {
        let mut headers = HeaderMap::new();
        for nv in &options.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(nv.name.as_bytes()),
                HeaderValue::from_str(&nv.value),
            ) {
                headers.insert(name, value);
            }
        }

        let origin = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .default_headers(headers)
            .build()
            .unwrap_or_default();

        Self {
            store,
            options,
            origin,
        }
    }
}

#[async_trait::async_trait]
impl HttpClient for CachedClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, HttpClientError> {
        reader::open(&self.store, &self.origin, url, &self.options).await
    }
}
