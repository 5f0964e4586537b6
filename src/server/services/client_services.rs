use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::common::HttpClientSettings;
use crate::config::proxy::{default_proxy, merge_proxies, ProxySettings};
use crate::config::rules::{ChannelRule, PlaylistRule};
use crate::config::{ClientSettings, ProviderSettings, SignerSettings};
use crate::http_client::Store;
use crate::server::services::playlist_services::PlaylistStreamer;
use crate::server::services::provider_services::{build_http_client, Provider};
use crate::server::services::rule_services::{ChannelRuleProcessor, PlaylistRuleProcessor};
use crate::server::services::signer_services::{ProviderKind, UrlSigner};

/// everything a client needs to build the pieces it binds providers with
pub struct ClientContext<'a> {
    pub signer: &'a SignerSettings,
    pub http_client: &'a HttpClientSettings,
    pub server_proxy: &'a ProxySettings,
    pub playlists: &'a [ProviderSettings],
    pub epgs: &'a [ProviderSettings],
    pub channel_rules: Arc<Vec<ChannelRule>>,
    pub playlist_rules: Arc<Vec<PlaylistRule>>,
    pub cache_store: Option<Arc<Store>>,
    pub public_url: String,
}

/// one authenticated downstream consumer: a secret, its bound providers
/// and its rule processors, all immutable after construction
pub struct Client {
    name: String,
    secret: String,
    semaphore: Option<Arc<Semaphore>>,
    signer: Arc<UrlSigner>,
    epg_link: String,
    playlist_providers: Vec<Arc<Provider>>,
    epg_providers: Vec<Arc<Provider>>,
    channel_processor: Arc<ChannelRuleProcessor>,
    playlist_processor: Arc<PlaylistRuleProcessor>,
}

impl Client {
    pub fn build(settings: &ClientSettings, ctx: &ClientContext<'_>) -> Arc<Client> {
        // per-client key: global secret concatenated with the client
        // secret, so tokens cannot travel between clients
        let signer = Arc::new(UrlSigner::new(
            &ctx.public_url,
            &format!("{}{}", ctx.signer.secret, settings.secret),
            ctx.signer.stream_ttl.as_secs(),
            ctx.signer.file_ttl.as_secs(),
        ));

        let semaphore = if settings.proxy.concurrency > 0 {
            Some(Arc::new(Semaphore::new(settings.proxy.concurrency as usize)))
        } else {
            None
        };

        let playlist_providers = bind_providers(
            ProviderKind::Playlist,
            &settings.playlists.0,
            ctx.playlists,
            settings,
            ctx,
            &signer,
        );
        let epg_providers = bind_providers(
            ProviderKind::Epg,
            &settings.epgs.0,
            ctx.epgs,
            settings,
            ctx,
            &signer,
        );

        Arc::new(Client {
            name: settings.name.clone(),
            secret: settings.secret.clone(),
            semaphore,
            epg_link: format!("{}/{}/epg.xml.gz", ctx.public_url, settings.secret),
            signer,
            playlist_providers,
            epg_providers,
            channel_processor: Arc::new(ChannelRuleProcessor::new(
                settings.name.clone(),
                ctx.channel_rules.clone(),
            )),
            playlist_processor: Arc::new(PlaylistRuleProcessor::new(
                settings.name.clone(),
                ctx.playlist_rules.clone(),
            )),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn signer(&self) -> &Arc<UrlSigner> {
        &self.signer
    }

    pub fn epg_link(&self) -> &str {
        &self.epg_link
    }

    pub fn semaphore(&self) -> Option<Arc<Semaphore>> {
        self.semaphore.clone()
    }

    pub fn playlist_providers(&self) -> &[Arc<Provider>] {
        &self.playlist_providers
    }

    pub fn epg_providers(&self) -> &[Arc<Provider>] {
        &self.epg_providers
    }

    pub fn find_provider(&self, kind: ProviderKind, name: &str) -> Option<Arc<Provider>> {
        let pool = match kind {
            ProviderKind::Playlist => &self.playlist_providers,
            ProviderKind::Epg => &self.epg_providers,
        };
        pool.iter().find(|p| p.name() == name).cloned()
    }

    /// the merge pipeline for this client; `epg_url` lands in the
    /// playlist header so players can discover the companion guide
    pub fn playlist_streamer(&self, epg_url: &str) -> PlaylistStreamer {
        PlaylistStreamer::new(
            self.playlist_providers.clone(),
            epg_url,
            self.channel_processor.clone(),
            self.playlist_processor.clone(),
        )
    }
}

/// an empty selection binds every configured provider of that kind, in
/// declaration order
fn bind_providers(
    kind: ProviderKind,
    selected: &[String],
    available: &[ProviderSettings],
    client_settings: &ClientSettings,
    ctx: &ClientContext<'_>,
    signer: &Arc<UrlSigner>,
) -> Vec<Arc<Provider>> {
    let chosen: Vec<&ProviderSettings> = if selected.is_empty() {
        available.iter().collect()
    } else {
        selected
            .iter()
            .filter_map(|name| available.iter().find(|p| &p.name == name))
            .collect()
    };

    chosen
        .into_iter()
        .map(|provider_settings| {
            // defaults, then server, provider and client blocks in
            // ascending precedence
            let merged = merge_proxies(&[
                &default_proxy(),
                ctx.server_proxy,
                &provider_settings.proxy,
                &client_settings.proxy,
            ]);
            let http_client =
                build_http_client(ctx.http_client, &merged, ctx.cache_store.as_ref());
            Arc::new(Provider::new(
                kind,
                provider_settings,
                merged,
                signer.clone(),
                http_client,
            ))
        })
        .collect()
}
