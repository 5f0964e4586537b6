use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

const NONCE_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Playlist,
    Epg,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Playlist => f.write_str("playlist"),
            ProviderKind::Epg => f.write_str("epg"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub name: String,
}

/// one upstream url inside a stream token; the first entry's provider is
/// authoritative for routing, the rest are kept as fallbacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub provider: ProviderInfo,
    pub url: String,
    pub hidden: bool,
}

/// the two disjoint payload shapes a token can carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenData {
    Stream {
        channel: String,
        streams: Vec<StreamEntry>,
        issued_at: i64,
        ttl_secs: u64,
    },
    File {
        provider: ProviderInfo,
        url: String,
        issued_at: i64,
        ttl_secs: u64,
    },
}

impl TokenData {
    /// the provider that routing decisions are based on
    pub fn provider_info(&self) -> Option<&ProviderInfo> {
        match self {
            TokenData::Stream { streams, .. } => streams.first().map(|s| &s.provider),
            TokenData::File { provider, .. } => Some(provider),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignerError {
    /// expired stream link, payload kept so the router can find the
    /// provider's link-expired clip
    #[error("stream link expired")]
    Expired(Box<TokenData>),
    #[error("invalid token")]
    Invalid,
    #[error("failed to build url: {0}")]
    UrlBuild(String),
}

/// encrypts request payloads into opaque, time-limited path segments;
/// the key is derived from the global secret concatenated with the
/// client secret so tokens are not transferable between clients
pub struct UrlSigner {
    public_url: String,
    cipher: XChaCha20Poly1305,
    stream_ttl_secs: u64,
    file_ttl_secs: u64,
}

impl UrlSigner {
    pub fn new(public_url: &str, secret: &str, stream_ttl_secs: u64, file_ttl_secs: u64) -> Self {
        // aead wants exactly 32 key bytes, the configured secret is free form
        let key_bytes: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));

        Self {
            public_url: public_url.trim_end_matches('/').to_string(),
            cipher,
            stream_ttl_secs,
            file_ttl_secs,
        }
    }

    pub fn create_stream_url(
        &self,
        channel_name: &str,
        streams: Vec<StreamEntry>,
    ) -> Result<Url, SignerError> {
        let data = TokenData::Stream {
            channel: channel_name.to_string(),
            streams,
            issued_at: Utc::now().timestamp(),
            ttl_secs: self.stream_ttl_secs,
        };
        let token = self.encrypt(&data)?;
        // the suffix is only there so players can sniff a content kind
        self.build_url(&token, "stream.ts")
    }

    pub fn create_file_url(
        &self,
        provider: ProviderInfo,
        original_url: &str,
    ) -> Result<Url, SignerError> {
        let suffix = file_suffix(original_url);
        let data = TokenData::File {
            provider,
            url: original_url.to_string(),
            issued_at: Utc::now().timestamp(),
            ttl_secs: self.file_ttl_secs,
        };
        let token = self.encrypt(&data)?;
        self.build_url(&token, &suffix)
    }

    /// authenticates and decodes a token; the opaque suffix after it is
    /// never part of the ciphertext and must already be stripped
    pub fn decrypt(&self, token: &str) -> Result<TokenData, SignerError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim_end_matches('='))
            .map_err(|_| SignerError::Invalid)?;

        if raw.len() <= NONCE_LEN {
            return Err(SignerError::Invalid);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| SignerError::Invalid)?;

        let data: TokenData =
            serde_json::from_slice(&plaintext).map_err(|_| SignerError::Invalid)?;

        let now = Utc::now().timestamp();
        match &data {
            TokenData::Stream {
                issued_at,
                ttl_secs,
                ..
            } => {
                // ttl zero disables expiry
                if *ttl_secs > 0 && now - issued_at > *ttl_secs as i64 {
                    return Err(SignerError::Expired(Box::new(data)));
                }
            }
            TokenData::File {
                issued_at,
                ttl_secs,
                ..
            } => {
                // expired file links are indistinguishable from invalid ones
                if *ttl_secs > 0 && now - issued_at > *ttl_secs as i64 {
                    return Err(SignerError::Invalid);
                }
            }
        }

        Ok(data)
    }

    fn encrypt(&self, data: &TokenData) -> Result<String, SignerError> {
        let plaintext =
            serde_json::to_vec(data).map_err(|e| SignerError::UrlBuild(e.to_string()))?;

        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| SignerError::UrlBuild(e.to_string()))?;

        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    fn build_url(&self, token: &str, suffix: &str) -> Result<Url, SignerError> {
        Url::parse(&format!("{}/{token}/{suffix}", self.public_url))
            .map_err(|e| SignerError::UrlBuild(e.to_string()))
    }
}

/// picks a content-kind suffix from the original url so players that
/// sniff extensions stay happy; decrypt ignores it entirely
fn file_suffix(original_url: &str) -> String {
    let extension = Url::parse(original_url).ok().and_then(|url| {
        let path = url.path().to_string();
        let (_, last) = path.rsplit_once('/')?;
        let (_, ext) = last.rsplit_once('.')?;
        if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            Some(ext.to_lowercase())
        } else {
            None
        }
    });

    match extension {
        Some(ext) => format!("file.{ext}"),
        None => "file".to_string(),
    }
}
