use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::parsers::xmltv::{XmltvChannel, XmltvItem, XmltvParser, XmltvProgramme, XmltvWriter};
use crate::parsers::SourceDecoder;
use crate::server::services::playlist_services::ListingError;
use crate::server::services::provider_services::Provider;
use crate::server::utils::hash_utils::{hash_id, hash_id_parts};

struct EpgDecoder {
    inner: SourceDecoder<XmltvItem>,
    provider: Arc<Provider>,
    source_url: String,
}

/// merges every bound epg source into one guide, reconciling upstream
/// channel ids against the channel map the playlist pipeline produced
pub struct EpgStreamer {
    providers: Vec<Arc<Provider>>,
    channel_map: HashMap<String, String>,
}

impl EpgStreamer {
    pub fn new(providers: Vec<Arc<Provider>>, channel_map: HashMap<String, String>) -> Self {
        Self {
            providers,
            channel_map,
        }
    }

    pub async fn write_epg(&self) -> Result<Vec<u8>, ListingError> {
        if self.providers.iter().all(|p| p.sources().is_empty()) {
            return Err(ListingError::NoData);
        }

        let mut decoders = Vec::new();
        for provider in &self.providers {
            for source in provider.sources() {
                let mut inner = SourceDecoder::new(
                    provider.http_client().clone(),
                    source.clone(),
                    |data| Box::new(XmltvParser::new(data)),
                );
                inner.start();
                decoders.push(EpgDecoder {
                    inner,
                    provider: provider.clone(),
                    source_url: source.clone(),
                });
            }
        }

        let mut writer = XmltvWriter::new();
        let mut state = Reconciliation::new(&self.channel_map);

        // pass one: channels; a programme showing up early is pushed back
        // and replayed in pass two
        for decoder in &mut decoders {
            loop {
                match decoder.inner.next_item().await? {
                    None => break,
                    Some(XmltvItem::Programme(programme)) => {
                        decoder.inner.push_back(XmltvItem::Programme(programme));
                        break;
                    }
                    Some(XmltvItem::Channel(mut channel)) => {
                        rewrite_icons(&decoder.provider, &mut channel.icons);
                        if state.admit_channel(&mut channel, &decoder.source_url) {
                            writer
                                .write_channel(&channel)
                                .map_err(ListingError::Internal)?;
                            state.channels_written += 1;
                        }
                    }
                }
            }
        }

        // pass two: programmes, keyed back onto the accepted channel ids
        for decoder in &mut decoders {
            loop {
                match decoder.inner.next_item().await? {
                    None => break,
                    Some(XmltvItem::Channel(_)) => continue,
                    Some(XmltvItem::Programme(mut programme)) => {
                        rewrite_icons(&decoder.provider, &mut programme.icons);
                        if state.admit_programme(&mut programme, &decoder.source_url) {
                            writer
                                .write_programme(&programme)
                                .map_err(ListingError::Internal)?;
                            state.programmes_written += 1;
                        }
                    }
                }
            }
        }

        if state.channels_written == 0 && state.programmes_written == 0 {
            return Err(ListingError::NoData);
        }

        debug!(
            channels = state.channels_written,
            programmes = state.programmes_written,
            "epg merge finished"
        );

        writer.finish().map_err(ListingError::Internal)
    }

    pub async fn write_epg_gzip(&self) -> Result<Vec<u8>, ListingError> {
        let body = self.write_epg().await?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(&body)
            .map_err(|e| ListingError::Internal(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| ListingError::Internal(e.to_string()))
    }
}

struct Reconciliation<'a> {
    channel_map: &'a HashMap<String, String>,
    /// accepted id -> display names of the source that claimed it
    added_channels: HashMap<String, Vec<String>>,
    /// H(original id + source url) -> accepted id
    id_mapping: HashMap<String, String>,
    programme_keys: HashSet<String>,
    channels_written: usize,
    programmes_written: usize,
}

impl<'a> Reconciliation<'a> {
    fn new(channel_map: &'a HashMap<String, String>) -> Self {
        let channels = channel_map.len();
        Self {
            channel_map,
            added_channels: HashMap::with_capacity(channels),
            id_mapping: HashMap::with_capacity(channels),
            programme_keys: HashSet::with_capacity(300 * channels),
            channels_written: 0,
            programmes_written: 0,
        }
    }

    /// candidate ids are the original id followed by the hash of every
    /// display name; the first one present in the channel map wins
    fn admit_channel(&mut self, channel: &mut XmltvChannel, source_url: &str) -> bool {
        let original_id = channel.id.clone();
        let composite_key = hash_id_parts(&[&original_id, source_url]);

        let mut candidates = Vec::with_capacity(1 + channel.display_names.len());
        candidates.push(original_id);
        for display_name in &channel.display_names {
            candidates.push(hash_id(display_name));
        }

        for candidate in candidates {
            let Some(mapped_name) = self.channel_map.get(&candidate) else {
                continue;
            };

            if let Some(existing_names) = self.added_channels.get(&candidate) {
                // a later source claiming the same id only gets to route
                // its programmes here if at least one display name agrees;
                // different stations sharing an upstream id stay apart
                if !names_intersect(&channel.display_names, existing_names) {
                    return false;
                }
                self.id_mapping.insert(composite_key, candidate);
                return false;
            }

            self.id_mapping.insert(composite_key, candidate.clone());
            self.added_channels
                .insert(candidate.clone(), channel.display_names.clone());

            channel.id = candidate;
            if !mapped_name.is_empty() {
                channel.display_names = vec![mapped_name.clone()];
            }
            return true;
        }

        false
    }

    fn admit_programme(&mut self, programme: &mut XmltvProgramme, source_url: &str) -> bool {
        let composite_key = hash_id_parts(&[&programme.channel, source_url]);

        let Some(accepted_id) = self.id_mapping.get(&composite_key) else {
            return false;
        };
        programme.channel = accepted_id.clone();

        let mut key = programme.channel.clone();
        key.push_str(&programme.start);
        key.push_str(&programme.id);

        self.programme_keys.insert(key)
    }
}

fn names_intersect(current: &[String], existing: &[String]) -> bool {
    current.iter().any(|name| existing.contains(name))
}

/// every non-empty icon src funnels back through the proxy as a signed
/// file url
fn rewrite_icons(provider: &Arc<Provider>, icons: &mut [String]) {
    for icon in icons.iter_mut() {
        if icon.is_empty() {
            continue;
        }
        if let Ok(signed) = provider
            .signer()
            .create_file_url(provider.provider_info(), icon)
        {
            *icon = signed.to_string();
        }
    }
}
