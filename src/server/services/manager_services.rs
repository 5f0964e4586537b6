use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::Settings;
use crate::http_client::Store;
use crate::server::services::client_services::{Client, ClientContext};

/// owns the client set, the shared cache store and the server-wide
/// stream semaphore; constructed once at startup from validated settings
pub struct Manager {
    clients: Vec<Arc<Client>>,
    by_secret: HashMap<String, Arc<Client>>,
    semaphore: Option<Arc<Semaphore>>,
    cache_store: Option<Arc<Store>>,
}

impl Manager {
    pub fn new(settings: &Settings) -> anyhow::Result<Arc<Self>> {
        let public_url = settings.server.public_url.trim_end_matches('/').to_string();

        let cache_store = if settings.http_client.cache.is_enabled() {
            let path = settings
                .http_client
                .cache
                .path
                .as_deref()
                .context("http_client.cache.path is required when cache is enabled")?;
            let store = Store::new(path)
                .with_context(|| format!("failed to create cache directory {path}"))?;
            info!(path, "cache store ready");
            Some(store)
        } else {
            None
        };

        let semaphore = if settings.proxy.is_enabled() && settings.proxy.concurrency > 0 {
            Some(Arc::new(Semaphore::new(settings.proxy.concurrency as usize)))
        } else {
            None
        };

        let ctx = ClientContext {
            signer: &settings.url_signer,
            http_client: &settings.http_client,
            server_proxy: &settings.proxy,
            playlists: &settings.playlists,
            epgs: &settings.epgs,
            channel_rules: Arc::new(settings.channel_rules.clone()),
            playlist_rules: Arc::new(settings.playlist_rules.clone()),
            cache_store: cache_store.clone(),
            public_url,
        };

        let mut clients = Vec::with_capacity(settings.clients.len());
        let mut by_secret = HashMap::with_capacity(settings.clients.len());
        for client_settings in &settings.clients {
            let client = Client::build(client_settings, &ctx);
            by_secret.insert(client_settings.secret.clone(), client.clone());
            clients.push(client);
            debug!(name = %client_settings.name, "client initialized");
        }

        Ok(Arc::new(Self {
            clients,
            by_secret,
            semaphore,
            cache_store,
        }))
    }

    pub fn client_by_secret(&self, secret: &str) -> Option<Arc<Client>> {
        self.by_secret.get(secret).cloned()
    }

    pub fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }

    pub fn semaphore(&self) -> Option<Arc<Semaphore>> {
        self.semaphore.clone()
    }

    pub fn close(&self) {
        if let Some(store) = &self.cache_store {
            store.close();
        }
    }
}
