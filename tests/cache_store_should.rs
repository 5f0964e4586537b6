// disk cache behavior against a live local upstream
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;

use tvmux::config::common::NameValue;
use tvmux::http_client::{CacheOptions, HttpClient, Store};

const LAST_MODIFIED_V1: &str = "Mon, 01 Jan 2024 00:00:00 GMT";
const LAST_MODIFIED_V2: &str = "Tue, 01 Jul 2025 00:00:00 GMT";

#[derive(Clone)]
struct Upstream {
    body: Arc<Mutex<String>>,
    last_modified: Arc<Mutex<String>>,
    not_modified: Arc<Mutex<bool>>,
    get_hits: Arc<AtomicUsize>,
    head_hits: Arc<AtomicUsize>,
}

impl Upstream {
    fn new(body: &str) -> Self {
        Self {
            body: Arc::new(Mutex::new(body.to_string())),
            last_modified: Arc::new(Mutex::new(LAST_MODIFIED_V1.to_string())),
            not_modified: Arc::new(Mutex::new(true)),
            get_hits: Arc::new(AtomicUsize::new(0)),
            head_hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn set(&self, body: &str, last_modified: &str, not_modified: bool) {
        *self.body.lock().unwrap() = body.to_string();
        *self.last_modified.lock().unwrap() = last_modified.to_string();
        *self.not_modified.lock().unwrap() = not_modified;
    }
}

async fn upstream_handler(
    State(upstream): State<Upstream>,
    method: Method,
    _headers: HeaderMap,
) -> Response {
    if method == Method::HEAD {
        upstream.head_hits.fetch_add(1, Ordering::SeqCst);
        if *upstream.not_modified.lock().unwrap() {
            return StatusCode::NOT_MODIFIED.into_response();
        }
        let last_modified = upstream.last_modified.lock().unwrap().clone();
        return ([("Last-Modified", last_modified)], "").into_response();
    }

    upstream.get_hits.fetch_add(1, Ordering::SeqCst);
    let body = upstream.body.lock().unwrap().clone();
    let last_modified = upstream.last_modified.lock().unwrap().clone();
    (
        [
            ("Last-Modified", last_modified),
            ("Content-Type", "application/x-mpegurl".to_string()),
        ],
        body,
    )
        .into_response()
}

async fn spawn_upstream(upstream: Upstream) -> String {
    let app = Router::new()
        .route("/doc", any(upstream_handler))
        .with_state(upstream);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/doc")
}

fn options(ttl_secs: u64, compression: bool) -> CacheOptions {
    CacheOptions {
        ttl: Duration::from_secs(ttl_secs),
        retention: Duration::from_secs(60),
        compression,
        headers: Vec::new(),
    }
}

fn dir_entries(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn test_cache_key_is_stable_and_header_order_free() {
    let headers = vec![
        NameValue {
            name: "Authorization".to_string(),
            value: "Bearer x".to_string(),
        },
        NameValue {
            name: "X-Custom".to_string(),
            value: "1".to_string(),
        },
    ];
    let mut reversed = headers.clone();
    reversed.reverse();

    let base = CacheOptions {
        ttl: Duration::from_secs(60),
        retention: Duration::from_secs(600),
        compression: false,
        headers,
    };
    let permuted = CacheOptions {
        headers: reversed,
        ..base.clone()
    };

    assert_eq!(
        Store::entry_name("http://u/doc", &base),
        Store::entry_name("http://u/doc", &base)
    );
    assert_eq!(
        Store::entry_name("http://u/doc", &base),
        Store::entry_name("http://u/doc", &permuted)
    );

    // different header profiles get different slots
    let other = CacheOptions {
        headers: vec![NameValue {
            name: "Authorization".to_string(),
            value: "Bearer y".to_string(),
        }],
        ..base.clone()
    };
    assert_ne!(
        Store::entry_name("http://u/doc", &base),
        Store::entry_name("http://u/doc", &other)
    );

    let other_ttl = CacheOptions {
        ttl: Duration::from_secs(61),
        ..base.clone()
    };
    assert_ne!(
        Store::entry_name("http://u/doc", &base),
        Store::entry_name("http://u/doc", &other_ttl)
    );
}

#[tokio::test]
async fn test_miss_hit_renew_and_expiry() {
    let upstream = Upstream::new("version-one");
    let url = spawn_upstream(upstream.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();
    let client = store.http_client(options(1, false));

    // miss: fetched and published
    let body = client.get(&url).await.unwrap().bytes().await.unwrap();
    assert_eq!(body, b"version-one");
    assert_eq!(upstream.get_hits.load(Ordering::SeqCst), 1);
    let entries = dir_entries(dir.path());
    assert_eq!(entries.len(), 2, "expected body+meta, got {entries:?}");

    // hit: inside ttl nothing upstream is touched
    let body = client.get(&url).await.unwrap().bytes().await.unwrap();
    assert_eq!(body, b"version-one");
    assert_eq!(upstream.get_hits.load(Ordering::SeqCst), 1);

    // past ttl with a 304 from upstream: renewed, body still served from
    // disk and cached_at pushed forward
    tokio::time::sleep(Duration::from_millis(1200)).await;
    upstream.set("version-two", LAST_MODIFIED_V1, true);

    let body = client.get(&url).await.unwrap().bytes().await.unwrap();
    assert_eq!(body, b"version-one");
    assert_eq!(upstream.get_hits.load(Ordering::SeqCst), 1);
    assert!(upstream.head_hits.load(Ordering::SeqCst) >= 1);

    // renewal restarted the clock, so the next read is a plain hit again
    let body = client.get(&url).await.unwrap().bytes().await.unwrap();
    assert_eq!(body, b"version-one");
    assert_eq!(upstream.get_hits.load(Ordering::SeqCst), 1);

    // past ttl with a modified upstream: refetched
    tokio::time::sleep(Duration::from_millis(1200)).await;
    upstream.set("version-two", LAST_MODIFIED_V2, false);

    let body = client.get(&url).await.unwrap().bytes().await.unwrap();
    assert_eq!(body, b"version-two");
    assert_eq!(upstream.get_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_fetches_publish_one_entry() {
    let upstream = Upstream::new(&"payload-".repeat(512));
    let url = spawn_upstream(upstream.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();
    let client = Arc::new(store.http_client(options(60, false)));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let url = url.clone();
        tasks.push(tokio::spawn(async move {
            client.get(&url).await.unwrap().bytes().await.unwrap()
        }));
    }

    let expected = "payload-".repeat(512).into_bytes();
    for task in tasks {
        assert_eq!(task.await.unwrap(), expected);
    }

    let entries = dir_entries(dir.path());
    assert_eq!(
        entries.len(),
        2,
        "expected exactly one body and one meta, got {entries:?}"
    );
    assert!(entries.iter().any(|name| name.ends_with(".cache")));
    assert!(entries.iter().any(|name| name.ends_with(".meta")));

    let body_file = entries.iter().find(|name| name.ends_with(".cache")).unwrap();
    assert_eq!(std::fs::read(dir.path().join(body_file)).unwrap(), expected);
}

#[tokio::test]
async fn test_compressed_storage_serves_plain_bytes() {
    let upstream = Upstream::new("plain upstream body");
    let url = spawn_upstream(upstream.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();
    let client = store.http_client(options(60, true));

    let body = client.get(&url).await.unwrap().bytes().await.unwrap();
    assert_eq!(body, b"plain upstream body");

    // on disk the body is gzip
    let entries = dir_entries(dir.path());
    let body_file = entries
        .iter()
        .find(|name| name.ends_with(".gz"))
        .expect("no .gz body");
    let stored = std::fs::read(dir.path().join(body_file)).unwrap();
    let mut decoder = flate2::read::GzDecoder::new(stored.as_slice());
    let mut inflated = String::new();
    decoder.read_to_string(&mut inflated).unwrap();
    assert_eq!(inflated, "plain upstream body");

    // and a cached read inflates transparently
    let body = client.get(&url).await.unwrap().bytes().await.unwrap();
    assert_eq!(body, b"plain upstream body");
    assert_eq!(upstream.get_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_short_read_is_not_published() {
    // a hand-rolled upstream that advertises more bytes than it sends
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\nshort")
                    .await;
            });
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();
    let client = store.http_client(options(60, false));

    let result = client.get(&format!("http://{addr}/doc")).await;
    let failed = match result {
        Err(_) => true,
        Ok(response) => response.bytes().await.is_err(),
    };
    assert!(failed, "truncated download should surface an error");

    // the writer task unlinks its tmp twin right after reporting the error
    tokio::time::sleep(Duration::from_millis(200)).await;

    // no body, no meta, no leftover tmp
    assert!(
        dir_entries(dir.path()).is_empty(),
        "found {:?}",
        dir_entries(dir.path())
    );
}

#[tokio::test]
async fn test_sweeper_removes_orphans_and_expired_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();

    let write = |name: &str, content: &str| {
        std::fs::write(dir.path().join(name), content).unwrap();
    };

    let now = chrono::Utc::now().timestamp();
    let meta = |cached_at: i64, retention: i64| {
        format!(r#"{{"cached_at":{cached_at},"retention_seconds":{retention},"headers":{{}}}}"#)
    };

    // healthy entry stays
    write("valid.cache", "body");
    write("valid.meta", &meta(now, 3600));
    // orphans go
    write("orphanbody.cache", "body");
    write("orphanmeta.meta", &meta(now, 3600));
    // unparseable sidecar goes
    write("broken.cache", "body");
    write("broken.meta", "{not json");
    // retention exceeded goes, body and meta together
    write("expired.gz", "body");
    write("expired.meta", &meta(now - 1000, 10));
    // stray twins and unknown files go
    write("inflight.cache.3.tmp", "partial");
    write("README.txt", "what is this doing here");

    // a body whose sidecar is removed in the same pass may only become
    // an orphan for the next pass, so sweep twice
    store.clean_expired().await;
    store.clean_expired().await;

    let remaining = dir_entries(dir.path());
    assert_eq!(remaining, vec!["valid.cache", "valid.meta"]);

    // the surviving pair is untouched
    assert_eq!(
        std::fs::read_to_string(dir.path().join("valid.cache")).unwrap(),
        "body"
    );
}

#[tokio::test]
async fn test_missing_retention_defaults_to_a_day() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();

    let now = chrono::Utc::now().timestamp();
    std::fs::write(dir.path().join("young.cache"), "x").unwrap();
    std::fs::write(
        dir.path().join("young.meta"),
        format!(r#"{{"cached_at":{now},"retention_seconds":null,"headers":{{}}}}"#),
    )
    .unwrap();
    std::fs::write(dir.path().join("old.cache"), "x").unwrap();
    std::fs::write(
        dir.path().join("old.meta"),
        format!(
            r#"{{"cached_at":{},"retention_seconds":null,"headers":{{}}}}"#,
            now - 25 * 3600
        ),
    )
    .unwrap();

    store.clean_expired().await;

    let remaining = dir_entries(dir.path());
    assert_eq!(remaining, vec!["young.cache", "young.meta"]);
}
