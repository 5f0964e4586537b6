use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::parsers::m3u8::{M3u8Parser, M3u8Writer, Track, ATTR_TVG_ID};
use crate::parsers::{DecoderError, SourceDecoder};
use crate::server::services::provider_services::Provider;
use crate::server::services::rule_services::{ChannelRuleProcessor, PlaylistRuleProcessor};
use crate::server::services::signer_services::StreamEntry;
use crate::server::utils::hash_utils::hash_id;

#[derive(Debug, Error)]
pub enum ListingError {
    #[error(transparent)]
    Decoder(#[from] DecoderError),
    #[error("no channels found in any source")]
    NoChannels,
    #[error("no epg data found in any source")]
    NoData,
    #[error("{0}")]
    Internal(String),
}

/// in-memory record for one logical channel while a listing response is
/// being assembled; rules mutate it, the merge pass folds duplicates
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    duration: String,
    attributes: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
    uri: Option<String>,
    playlist: Arc<Provider>,
    priority: usize,
    hidden: bool,
    removed: bool,
}

impl Channel {
    pub fn new(track: Track, playlist: Arc<Provider>, priority: usize) -> Self {
        Self {
            name: track.name,
            duration: track.duration,
            attributes: track.attributes,
            tags: track.tags,
            uri: track.uri,
            playlist,
            priority,
            hidden: false,
            removed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn remove_attr(&mut self, key: &str) {
        self.attributes.remove(key);
    }

    pub fn attrs(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn remove_tag(&mut self, key: &str) {
        self.tags.remove(key);
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = Some(uri.into());
    }

    pub fn playlist(&self) -> &Arc<Provider> {
        &self.playlist
    }

    pub fn priority(&self) -> usize {
        self.priority
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn mark_hidden(&mut self) {
        self.hidden = true;
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn mark_removed(&mut self) {
        self.removed = true;
    }

    /// identity for cross-source deduplication: tvg-id when present,
    /// lowercased display name otherwise
    pub fn identity(&self) -> String {
        match self.attr(ATTR_TVG_ID) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.name.to_lowercase(),
        }
    }

    fn to_track(&self) -> Track {
        let mut attributes = self.attributes.clone();
        if self.hidden {
            // players can filter on this, hidden channels stay listed
            attributes.insert("tvg-hidden".to_string(), "1".to_string());
        }
        Track {
            duration: self.duration.clone(),
            name: self.name.clone(),
            attributes,
            tags: self.tags.clone(),
            uri: self.uri.clone(),
        }
    }
}

/// channels in the order they were drained from the sources; rule
/// application iterates this order, which makes every run deterministic
#[derive(Default)]
pub struct ChannelStore {
    channels: Vec<Channel>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn add(&mut self, channel: Channel) {
        self.channels.push(channel);
    }

    pub fn get(&self, idx: usize) -> &Channel {
        &self.channels[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Channel {
        &mut self.channels[idx]
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut Vec<Channel> {
        &mut self.channels
    }
}

pub struct MergedListing {
    pub tracks: Vec<Track>,
    /// channel id to display name, feeds the epg reconciliation
    pub channel_map: HashMap<String, String>,
}

struct Survivor {
    store_idx: usize,
    streams: Vec<StreamEntry>,
}

/// the m3u8 merge pipeline: drains every source of every bound playlist
/// provider into one store, applies both rule sets, folds duplicate
/// identities into priority-ordered stream lists and rewrites proxied
/// urls into signed tokens
pub struct PlaylistStreamer {
    providers: Vec<Arc<Provider>>,
    epg_url: String,
    channel_processor: Arc<ChannelRuleProcessor>,
    playlist_processor: Arc<PlaylistRuleProcessor>,
}

impl PlaylistStreamer {
    pub fn new(
        providers: Vec<Arc<Provider>>,
        epg_url: impl Into<String>,
        channel_processor: Arc<ChannelRuleProcessor>,
        playlist_processor: Arc<PlaylistRuleProcessor>,
    ) -> Self {
        Self {
            providers,
            epg_url: epg_url.into(),
            channel_processor,
            playlist_processor,
        }
    }

    pub async fn write_playlist(&self) -> Result<String, ListingError> {
        let listing = self.merged().await?;

        let mut writer = M3u8Writer::new(&self.epg_url);
        for track in &listing.tracks {
            writer.write_track(track);
        }
        Ok(writer.finish())
    }

    pub async fn channel_map(&self) -> Result<HashMap<String, String>, ListingError> {
        Ok(self.merged().await?.channel_map)
    }

    pub async fn merged(&self) -> Result<MergedListing, ListingError> {
        let mut store = self.fetch_sources().await?;

        self.channel_processor.apply(&mut store);
        self.playlist_processor.apply(&mut store);

        self.fold(store)
    }

    /// one decoder per source url, all fetches start immediately so the
    /// network latency of every source overlaps, then drained in
    /// declaration order
    async fn fetch_sources(&self) -> Result<ChannelStore, ListingError> {
        let mut decoders = Vec::new();
        for provider in &self.providers {
            for (priority, source) in provider.sources().iter().enumerate() {
                let client = provider.http_client().clone();
                let mut decoder = SourceDecoder::new(client, source.clone(), |data| {
                    Box::new(M3u8Parser::new(data).map(Ok))
                });
                decoder.start();
                decoders.push((decoder, provider.clone(), priority));
            }
        }

        let mut store = ChannelStore::new();
        for (decoder, provider, priority) in &mut decoders {
            while let Some(track) = decoder.next_item().await? {
                store.add(Channel::new(track, provider.clone(), *priority));
            }
        }

        if store.is_empty() {
            return Err(ListingError::NoChannels);
        }

        debug!(channels = store.len(), "playlist sources drained");
        Ok(store)
    }

    fn fold(&self, mut store: ChannelStore) -> Result<MergedListing, ListingError> {
        let mut order: Vec<String> = Vec::new();
        let mut survivors: HashMap<String, Survivor> = HashMap::new();

        for idx in 0..store.len() {
            if store.get(idx).is_removed() {
                continue;
            }
            let identity = store.get(idx).identity();

            if let Some(survivor) = survivors.get_mut(&identity) {
                // identity collision: fold this channel's stream into the
                // surviving channel's priority-ordered list
                if store.get(idx).uri().is_none() {
                    continue;
                }
                let entry = stream_entry(store.get(idx));
                let existing_priority = store.get(survivor.store_idx).priority();
                if store.get(idx).priority() < existing_priority {
                    survivor.streams.insert(0, entry);
                    survivor.store_idx = idx;
                } else {
                    survivor.streams.push(entry);
                }
                continue;
            }

            if store.get(idx).playlist().is_proxied() {
                proxy_channel_attributes(store.get_mut(idx))?;
            }

            let streams = match store.get(idx).uri() {
                Some(_) => vec![stream_entry(store.get(idx))],
                None => Vec::new(),
            };
            survivors.insert(
                identity.clone(),
                Survivor {
                    store_idx: idx,
                    streams,
                },
            );
            order.push(identity);
        }

        // proxied survivors get their uri swapped for a stream token that
        // carries the whole fallback vector
        for identity in &order {
            let survivor = &survivors[identity];
            let channel = store.get(survivor.store_idx);
            if channel.playlist().is_proxied() && !survivor.streams.is_empty() {
                let url = channel
                    .playlist()
                    .signer()
                    .create_stream_url(channel.name(), survivor.streams.clone())
                    .map_err(|e| ListingError::Internal(e.to_string()))?;
                store.get_mut(survivor.store_idx).set_uri(url.to_string());
            }
        }

        let mut tracks = Vec::with_capacity(order.len());
        let mut channel_map = HashMap::with_capacity(order.len());
        for identity in &order {
            let channel = store.get(survivors[identity].store_idx);
            match channel.attr(ATTR_TVG_ID) {
                Some(id) if !id.is_empty() => {
                    channel_map.insert(id.to_string(), channel.name().to_string());
                }
                _ => {
                    // unlabeled channels are reachable from the epg side
                    // through the hash of their display name
                    channel_map.insert(hash_id(channel.name()), channel.name().to_string());
                }
            }
            tracks.push(channel.to_track());
        }

        Ok(MergedListing {
            tracks,
            channel_map,
        })
    }
}

fn stream_entry(channel: &Channel) -> StreamEntry {
    StreamEntry {
        provider: channel.playlist().provider_info(),
        url: channel.uri().unwrap_or_default().to_string(),
        hidden: channel.is_hidden(),
    }
}

/// every attribute value that parses as an absolute url is swapped for a
/// signed file token, which funnels logo fetches through the proxy
fn proxy_channel_attributes(channel: &mut Channel) -> Result<(), ListingError> {
    let keys: Vec<String> = channel
        .attrs()
        .iter()
        .filter(|(_, value)| is_absolute_url(value))
        .map(|(key, _)| key.clone())
        .collect();

    for key in keys {
        let value = channel.attr(&key).unwrap_or_default().to_string();
        let signed = channel
            .playlist()
            .signer()
            .create_file_url(channel.playlist().provider_info(), &value)
            .map_err(|e| ListingError::Internal(format!("failed to encode attribute url: {e}")))?;
        channel.set_attr(key, signed.to_string());
    }
    Ok(())
}

fn is_absolute_url(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    match url::Url::parse(value) {
        Ok(url) => url.host_str().is_some(),
        Err(_) => false,
    }
}
