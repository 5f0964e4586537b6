pub mod m3u8;
pub mod xmltv;

use std::collections::VecDeque;
use std::io::Read;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::http_client::DynHttpClient;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("unexpected status code {status} fetching {url}")]
    Status { url: String, status: u16 },
    #[error("failed to parse {url}: {reason}")]
    Parse { url: String, reason: String },
    #[error("fetch task failed for {url}")]
    TaskFailed { url: String },
}

type BoxedItems<I> = Box<dyn Iterator<Item = Result<I, String>> + Send>;

/// buffered lazy sequence over one source url: `start` kicks off the
/// fetch in the background so all of a listing's sources download
/// concurrently, `next_item` parses on demand once drained, and items
/// can be pushed back to replay during a later pass
pub struct SourceDecoder<I> {
    source_url: String,
    handle: Option<JoinHandle<Result<Vec<u8>, DecoderError>>>,
    items: Option<BoxedItems<I>>,
    replay: VecDeque<I>,
    make_items: Option<Box<dyn FnOnce(Vec<u8>) -> BoxedItems<I> + Send>>,
    client: Option<DynHttpClient>,
}

impl<I> SourceDecoder<I> {
    pub fn new(
        client: DynHttpClient,
        source_url: impl Into<String>,
        make_items: impl FnOnce(Vec<u8>) -> BoxedItems<I> + Send + 'static,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            handle: None,
            items: None,
            replay: VecDeque::new(),
            make_items: Some(Box::new(make_items)),
            client: Some(client),
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// spawns the upstream fetch; calling it again is a no-op
    pub fn start(&mut self) {
        if self.handle.is_some() || self.items.is_some() {
            return;
        }
        let Some(client) = self.client.take() else {
            return;
        };
        let url = self.source_url.clone();
        self.handle = Some(tokio::spawn(fetch_source(client, url)));
    }

    /// replayed items come out ahead of the live sequence
    pub fn push_back(&mut self, item: I) {
        self.replay.push_back(item);
    }

    pub async fn next_item(&mut self) -> Result<Option<I>, DecoderError> {
        if let Some(item) = self.replay.pop_front() {
            return Ok(Some(item));
        }

        if self.items.is_none() {
            self.start();
            let handle = match self.handle.take() {
                Some(handle) => handle,
                None => return Ok(None),
            };
            let data = handle.await.map_err(|_| DecoderError::TaskFailed {
                url: self.source_url.clone(),
            })??;
            let make = self
                .make_items
                .take()
                .expect("decoder initialized without a parser");
            self.items = Some(make(data));
        }

        match self.items.as_mut().and_then(|items| items.next()) {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(reason)) => Err(DecoderError::Parse {
                url: self.source_url.clone(),
                reason,
            }),
            None => Ok(None),
        }
    }
}

impl<I> Drop for SourceDecoder<I> {
    fn drop(&mut self) {
        // cancellation: dropping the request scope aborts in-flight fetches
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// downloads one source document and transparently inflates gzip; the
/// magic-byte sniff covers .gz urls served through either client
async fn fetch_source(client: DynHttpClient, url: String) -> Result<Vec<u8>, DecoderError> {
    let response = client.get(&url).await.map_err(|e| DecoderError::Fetch {
        url: url.clone(),
        reason: e.to_string(),
    })?;

    if !(200..300).contains(&response.status) {
        return Err(DecoderError::Status {
            url,
            status: response.status,
        });
    }

    let raw = response.bytes().await.map_err(|e| DecoderError::Fetch {
        url: url.clone(),
        reason: e.to_string(),
    })?;

    if raw.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = flate2::read::GzDecoder::new(raw.as_slice());
        let mut decoded = Vec::new();
        decoder
            .read_to_end(&mut decoded)
            .map_err(|e| DecoderError::Fetch {
                url,
                reason: format!("gzip decode failed: {e}"),
            })?;
        return Ok(decoded);
    }

    Ok(raw)
}
