pub mod common;
pub mod proxy;
pub mod rules;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use common::{Duration, HttpClientSettings, StringOrList};
use proxy::ProxySettings;
use rules::{ChannelRule, Condition, PlaylistRule};

#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

/// process-level knobs come from flags/env, the gateway itself is
/// described by the yaml file behind --config
#[derive(clap::Parser)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum, default_value = "development")]
    pub cargo_env: CargoEnv,

    // path to the gateway yaml config
    #[clap(long, env, default_value = "tvmux.yaml")]
    pub config: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_public_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            public_url: default_public_url(),
            metrics_addr: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerSettings {
    // this is what keeps generated stream links opaque, have it be
    // anything secure like 'openssl rand -base64 32'
    pub secret: String,
    #[serde(default = "default_stream_ttl")]
    pub stream_ttl: Duration,
    #[serde(default)]
    pub file_ttl: Duration,
}

fn default_stream_ttl() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub name: String,
    pub secret: String,
    #[serde(default)]
    pub playlists: StringOrList,
    #[serde(default)]
    pub epgs: StringOrList,
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub name: String,
    pub sources: StringOrList,
    #[serde(default)]
    pub proxy: ProxySettings,
}

impl ProviderSettings {
    fn validate(&self, kind: &str) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("{kind} name is required");
        }
        if self.sources.is_empty() {
            anyhow::bail!("{kind} '{}' needs at least one source", self.name);
        }
        for (i, source) in self.sources.iter().enumerate() {
            if source.is_empty() {
                anyhow::bail!("{kind} '{}' source[{i}] cannot be empty", self.name);
            }
        }
        self.proxy
            .validate_override()
            .map_err(|e| anyhow::anyhow!("{kind} '{}' proxy: {e}", self.name))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub url_signer: SignerSettings,
    #[serde(default)]
    pub http_client: HttpClientSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub clients: Vec<ClientSettings>,
    #[serde(default)]
    pub playlists: Vec<ProviderSettings>,
    #[serde(default)]
    pub epgs: Vec<ProviderSettings>,
    #[serde(default)]
    pub channel_rules: Vec<ChannelRule>,
    #[serde(default)]
    pub playlist_rules: Vec<PlaylistRule>,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url_signer.secret.is_empty() {
            anyhow::bail!("url_signer.secret is required");
        }

        self.http_client
            .validate_global()
            .map_err(|e| anyhow::anyhow!("http_client: {e}"))?;
        self.proxy
            .validate_global()
            .map_err(|e| anyhow::anyhow!("proxy: {e}"))?;

        let mut playlist_names = HashSet::new();
        for (i, playlist) in self.playlists.iter().enumerate() {
            playlist
                .validate("playlist")
                .with_context(|| format!("playlists[{i}]"))?;
            if !playlist_names.insert(playlist.name.clone()) {
                anyhow::bail!("duplicate playlist name: {}", playlist.name);
            }
        }

        let mut epg_names = HashSet::new();
        for (i, epg) in self.epgs.iter().enumerate() {
            epg.validate("epg").with_context(|| format!("epgs[{i}]"))?;
            if !epg_names.insert(epg.name.clone()) {
                anyhow::bail!("duplicate epg name: {}", epg.name);
            }
        }

        let mut client_names = HashSet::new();
        let mut secret_owners: HashMap<&str, &str> = HashMap::new();
        for (i, client) in self.clients.iter().enumerate() {
            if client.name.is_empty() {
                anyhow::bail!("clients[{i}]: name is required");
            }
            if client.secret.is_empty() {
                anyhow::bail!("client '{}': secret is required", client.name);
            }
            if !client_names.insert(client.name.clone()) {
                anyhow::bail!("duplicate client name: {}", client.name);
            }
            if let Some(owner) = secret_owners.insert(&client.secret, &client.name) {
                anyhow::bail!("clients {owner:?} and {:?} share a secret", client.name);
            }
            for name in client.playlists.iter() {
                if !playlist_names.contains(name) {
                    anyhow::bail!("client '{}' references unknown playlist: {name}", client.name);
                }
            }
            for name in client.epgs.iter() {
                if !epg_names.contains(name) {
                    anyhow::bail!("client '{}' references unknown epg: {name}", client.name);
                }
            }
            client
                .proxy
                .validate_override()
                .map_err(|e| anyhow::anyhow!("client '{}' proxy: {e}", client.name))?;
        }

        for (i, rule) in self.channel_rules.iter().enumerate() {
            rule.validate()
                .map_err(|e| anyhow::anyhow!("channel_rules[{i}]: {e}"))?;
            if let Some(condition) = rule.condition() {
                self.validate_condition_refs(condition, &client_names, &playlist_names)
                    .with_context(|| format!("channel_rules[{i}]"))?;
            }
        }

        for (i, rule) in self.playlist_rules.iter().enumerate() {
            rule.validate()
                .map_err(|e| anyhow::anyhow!("playlist_rules[{i}]: {e}"))?;
            if let Some(condition) = rule.condition() {
                self.validate_condition_refs(condition, &client_names, &playlist_names)
                    .with_context(|| format!("playlist_rules[{i}]"))?;
            }
        }

        Ok(())
    }

    fn validate_condition_refs(
        &self,
        condition: &Condition,
        client_names: &HashSet<String>,
        playlist_names: &HashSet<String>,
    ) -> anyhow::Result<()> {
        for name in condition.clients.iter() {
            if !client_names.contains(name) {
                anyhow::bail!("rule references unknown client: {name}");
            }
        }
        for name in condition.playlists.iter() {
            if !playlist_names.contains(name) {
                anyhow::bail!("rule references unknown playlist: {name}");
            }
        }
        for child in condition.and.iter().chain(condition.or.iter()) {
            self.validate_condition_refs(child, client_names, playlist_names)?;
        }
        Ok(())
    }
}
