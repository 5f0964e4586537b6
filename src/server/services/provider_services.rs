use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::common::HttpClientSettings;
use crate::config::proxy::ProxySettings;
use crate::config::ProviderSettings;
use crate::http_client::{CacheOptions, DirectClient, DynHttpClient, Store};
use crate::server::services::signer_services::{ProviderInfo, ProviderKind, UrlSigner};
use crate::server::services::stream_services::ShellStreamer;

/// one upstream binding of a client: a named, ordered list of source
/// urls of a single kind plus everything needed to talk to it and to
/// stream on its behalf
pub struct Provider {
    name: String,
    kind: ProviderKind,
    sources: Vec<String>,
    signer: Arc<UrlSigner>,
    http_client: DynHttpClient,
    proxy: ProxySettings,
    semaphore: Option<Arc<Semaphore>>,
    stream_streamer: ShellStreamer,
    rate_limit_streamer: ShellStreamer,
    link_expired_streamer: ShellStreamer,
    upstream_error_streamer: ShellStreamer,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("sources", &self.sources)
            .field("proxy", &self.proxy)
            .field("semaphore", &self.semaphore)
            .field("stream_streamer", &self.stream_streamer)
            .field("rate_limit_streamer", &self.rate_limit_streamer)
            .field("link_expired_streamer", &self.link_expired_streamer)
            .field("upstream_error_streamer", &self.upstream_error_streamer)
            .finish_non_exhaustive()
    }
}

impl Provider {
    pub fn new(
        kind: ProviderKind,
        settings: &ProviderSettings,
        merged_proxy: ProxySettings,
        signer: Arc<UrlSigner>,
        http_client: DynHttpClient,
    ) -> Self {
        // provider concurrency is scoped to this client's binding, the
        // limit comes from the provider's own block rather than the merge
        let semaphore = if settings.proxy.concurrency > 0 {
            Some(Arc::new(Semaphore::new(settings.proxy.concurrency as usize)))
        } else {
            None
        };

        if kind == ProviderKind::Playlist {
            crate::metrics::set_provider_streams(&settings.name, 0);
        }

        Self {
            name: settings.name.clone(),
            kind,
            sources: settings.sources.0.clone(),
            signer,
            http_client,
            semaphore,
            stream_streamer: ShellStreamer::from_handler(&merged_proxy.stream),
            rate_limit_streamer: ShellStreamer::from_handler(&merged_proxy.error.rate_limit_exceeded),
            link_expired_streamer: ShellStreamer::from_handler(&merged_proxy.error.link_expired),
            upstream_error_streamer: ShellStreamer::from_handler(&merged_proxy.error.upstream_error),
            proxy: merged_proxy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: self.kind,
            name: self.name.clone(),
        }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn signer(&self) -> &Arc<UrlSigner> {
        &self.signer
    }

    pub fn http_client(&self) -> &DynHttpClient {
        &self.http_client
    }

    pub fn is_proxied(&self) -> bool {
        self.proxy.is_enabled()
    }

    pub fn proxy(&self) -> &ProxySettings {
        &self.proxy
    }

    pub fn semaphore(&self) -> Option<Arc<Semaphore>> {
        self.semaphore.clone()
    }

    pub fn stream_streamer(&self) -> &ShellStreamer {
        &self.stream_streamer
    }

    pub fn rate_limit_streamer(&self) -> &ShellStreamer {
        &self.rate_limit_streamer
    }

    /// epg providers have no stream links that could expire, their
    /// handler simply stays unconfigured
    pub fn link_expired_streamer(&self) -> &ShellStreamer {
        &self.link_expired_streamer
    }

    pub fn upstream_error_streamer(&self) -> &ShellStreamer {
        &self.upstream_error_streamer
    }
}

/// picks the http client for a provider binding: the cache store worn as
/// a client when caching is enabled, a direct client otherwise
pub fn build_http_client(
    global_http: &HttpClientSettings,
    merged_proxy: &ProxySettings,
    cache_store: Option<&Arc<Store>>,
) -> DynHttpClient {
    let effective = global_http.merged_with(&merged_proxy.http_client);

    match cache_store {
        Some(store) if effective.cache.is_enabled() => Arc::new(store.http_client(CacheOptions {
            ttl: effective.cache.ttl.unwrap_or_default().std(),
            retention: effective.cache.retention.unwrap_or_default().std(),
            compression: effective.cache.compression.unwrap_or(false),
            headers: effective.headers.clone(),
        })),
        _ => Arc::new(DirectClient::new(&effective.headers)),
    }
}
