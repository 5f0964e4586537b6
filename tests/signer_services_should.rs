// token round-trip and expiry tests; the signer is pure computation so
// no server is needed here
use tvmux::server::services::signer_services::{
    ProviderInfo, ProviderKind, SignerError, StreamEntry, TokenData, UrlSigner,
};

fn signer(stream_ttl: u64, file_ttl: u64) -> UrlSigner {
    UrlSigner::new("http://gateway.local", "global-secret-client-secret", stream_ttl, file_ttl)
}

fn sample_streams() -> Vec<StreamEntry> {
    vec![
        StreamEntry {
            provider: ProviderInfo {
                kind: ProviderKind::Playlist,
                name: "main".to_string(),
            },
            url: "http://upstream/a".to_string(),
            hidden: false,
        },
        StreamEntry {
            provider: ProviderInfo {
                kind: ProviderKind::Playlist,
                name: "main".to_string(),
            },
            url: "http://upstream/a2".to_string(),
            hidden: true,
        },
    ]
}

fn token_of(url: &url::Url) -> String {
    url.path_segments().unwrap().next().unwrap().to_string()
}

#[test]
fn test_stream_token_round_trip() {
    let signer = signer(3600, 0);
    let url = signer.create_stream_url("Channel A", sample_streams()).unwrap();

    assert!(url.as_str().starts_with("http://gateway.local/"));
    assert!(url.as_str().ends_with("/stream.ts"));

    let data = signer.decrypt(&token_of(&url)).unwrap();
    match data {
        TokenData::Stream {
            channel, streams, ..
        } => {
            assert_eq!(channel, "Channel A");
            assert_eq!(streams, sample_streams());
        }
        other => panic!("expected stream token, got {other:?}"),
    }
}

#[test]
fn test_file_token_round_trip_and_suffix() {
    let signer = signer(3600, 3600);
    let info = ProviderInfo {
        kind: ProviderKind::Epg,
        name: "guide".to_string(),
    };
    let url = signer
        .create_file_url(info.clone(), "http://upstream/logos/cnn.png")
        .unwrap();

    // suffix is sniffed from the original url but stays out of the payload
    assert!(url.as_str().ends_with("/file.png"));

    match signer.decrypt(&token_of(&url)).unwrap() {
        TokenData::File { provider, url, .. } => {
            assert_eq!(provider, info);
            assert_eq!(url, "http://upstream/logos/cnn.png");
        }
        other => panic!("expected file token, got {other:?}"),
    }
}

#[test]
fn test_tokens_are_unique_per_message() {
    let signer = signer(3600, 0);
    let first = signer.create_stream_url("A", sample_streams()).unwrap();
    let second = signer.create_stream_url("A", sample_streams()).unwrap();

    // fresh nonce per message, identical payloads still differ on the wire
    assert_ne!(first.as_str(), second.as_str());
}

#[test]
fn test_foreign_key_cannot_decrypt() {
    let ours = signer(3600, 0);
    let theirs = UrlSigner::new("http://gateway.local", "global-secret-other-client", 3600, 0);

    let url = ours.create_stream_url("A", sample_streams()).unwrap();
    assert!(matches!(
        theirs.decrypt(&token_of(&url)),
        Err(SignerError::Invalid)
    ));
}

#[test]
fn test_garbage_tokens_are_invalid() {
    let signer = signer(3600, 0);
    assert!(matches!(signer.decrypt("garbage"), Err(SignerError::Invalid)));
    assert!(matches!(signer.decrypt(""), Err(SignerError::Invalid)));
    assert!(matches!(
        signer.decrypt("bm90LWEtdG9rZW4tYXQtYWxsLWp1c3QtYmFzZTY0"),
        Err(SignerError::Invalid)
    ));
}

#[test]
fn test_zero_ttl_never_expires() {
    let signer = signer(0, 0);
    let url = signer.create_stream_url("A", sample_streams()).unwrap();
    assert!(signer.decrypt(&token_of(&url)).is_ok());
}

#[test]
fn test_expired_stream_token_keeps_payload() {
    // a 1 second ttl with a sleep would make the test slow, so issue the
    // token through a signer whose clock has effectively already passed:
    // decrypting with the same key but checking against a tiny ttl
    let issuing = signer(1, 0);
    let url = issuing.create_stream_url("A", sample_streams()).unwrap();
    let token = token_of(&url);

    std::thread::sleep(std::time::Duration::from_millis(1100));

    match issuing.decrypt(&token) {
        Err(SignerError::Expired(data)) => match *data {
            TokenData::Stream { streams, .. } => assert_eq!(streams.len(), 2),
            other => panic!("expected stream payload, got {other:?}"),
        },
        other => panic!("expected expired error, got {other:?}"),
    }
}

#[test]
fn test_expired_file_token_reads_as_invalid() {
    let issuing = signer(0, 1);
    let info = ProviderInfo {
        kind: ProviderKind::Playlist,
        name: "main".to_string(),
    };
    let url = issuing.create_file_url(info, "http://upstream/logo.png").unwrap();
    let token = token_of(&url);

    std::thread::sleep(std::time::Duration::from_millis(1100));

    assert!(matches!(issuing.decrypt(&token), Err(SignerError::Invalid)));
}
