// epg channel-id reconciliation against the playlist channel map
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;

use tvmux::config::proxy::ProxySettings;
use tvmux::config::ProviderSettings;
use tvmux::http_client::{DynHttpClient, HttpResponse, MockHttpClient};
use tvmux::server::services::epg_services::EpgStreamer;
use tvmux::server::services::provider_services::Provider;
use tvmux::server::services::signer_services::{ProviderKind, TokenData, UrlSigner};
use tvmux::server::utils::hash_utils::hash_id;

const PUBLIC_URL: &str = "http://gateway.local";

fn mock_client(bodies: Vec<(&'static str, String)>) -> DynHttpClient {
    let mut mock = MockHttpClient::new();
    mock.expect_get().returning(move |url| {
        let body = bodies
            .iter()
            .find(|(source, _)| *source == url)
            .map(|(_, body)| body.clone())
            .unwrap_or_else(|| "<tv></tv>".to_string());
        Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(
                body.into_bytes(),
            ))])
            .boxed(),
        })
    });
    Arc::new(mock)
}

fn epg_provider(sources: &[&str], client: DynHttpClient, signer: &Arc<UrlSigner>) -> Arc<Provider> {
    let settings = ProviderSettings {
        name: "guide".to_string(),
        sources: sources
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into(),
        proxy: ProxySettings::default(),
    };
    Arc::new(Provider::new(
        ProviderKind::Epg,
        &settings,
        ProxySettings::default(),
        signer.clone(),
        client,
    ))
}

fn signer() -> Arc<UrlSigner> {
    Arc::new(UrlSigner::new(PUBLIC_URL, "secret-s1", 3600, 0))
}

fn source(display_name: &str, start: &str) -> String {
    format!(
        r#"<tv>
<channel id="1337"><display-name>{display_name}</display-name></channel>
<programme start="{start}" channel="1337"><title>Show</title></programme>
</tv>"#
    )
}

#[tokio::test]
async fn test_three_sources_same_station_merge_into_one_channel() {
    let sources = ["http://e/1.xml", "http://e/2.xml", "http://e/3.xml"];
    let bodies = vec![
        ("http://e/1.xml", source("CNN", "20260801200000 +0000")),
        ("http://e/2.xml", source("CNN", "20260801210000 +0000")),
        ("http://e/3.xml", source("CNN", "20260801220000 +0000")),
    ];

    let signer = signer();
    let provider = epg_provider(&sources, mock_client(bodies), &signer);
    let channel_map = HashMap::from([(hash_id("CNN"), "CNN".to_string())]);

    let out = EpgStreamer::new(vec![provider], channel_map)
        .write_epg()
        .await
        .unwrap();
    let text = String::from_utf8(out).unwrap();

    let accepted = hash_id("CNN");
    assert_eq!(text.matches("<channel").count(), 1);
    assert!(text.contains(&format!("channel id=\"{accepted}\"")));
    assert_eq!(text.matches("<programme").count(), 3);
    assert_eq!(
        text.matches(&format!("channel=\"{accepted}\"")).count(),
        3
    );
}

#[tokio::test]
async fn test_colliding_upstream_id_with_different_names_is_dropped() {
    // sources 1-2 are CNN, source 3 reuses id 1337 for a different
    // station; its programmes must not co-mingle
    let sources = ["http://e/1.xml", "http://e/2.xml", "http://e/3.xml"];
    let bodies = vec![
        ("http://e/1.xml", source("CNN", "20260801200000 +0000")),
        ("http://e/2.xml", source("CNN", "20260801210000 +0000")),
        ("http://e/3.xml", source("FOX", "20260801220000 +0000")),
    ];

    let signer = signer();
    let provider = epg_provider(&sources, mock_client(bodies), &signer);
    let channel_map = HashMap::from([(hash_id("CNN"), "CNN".to_string())]);

    let out = EpgStreamer::new(vec![provider], channel_map)
        .write_epg()
        .await
        .unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(text.matches("<channel").count(), 1);
    assert_eq!(text.matches("<programme").count(), 2);
    assert!(!text.contains("20260801220000"));
}

#[tokio::test]
async fn test_unmatched_channels_are_dropped_entirely() {
    let bodies = vec![(
        "http://e/1.xml",
        source("Unknown Station", "20260801200000 +0000"),
    )];

    let signer = signer();
    let provider = epg_provider(&["http://e/1.xml"], mock_client(bodies), &signer);
    let channel_map = HashMap::from([(hash_id("CNN"), "CNN".to_string())]);

    // nothing matched, nothing to serve
    assert!(EpgStreamer::new(vec![provider], channel_map)
        .write_epg()
        .await
        .is_err());
}

#[tokio::test]
async fn test_duplicate_programmes_are_deduplicated() {
    // both sources carry the same programme for the same station
    let sources = ["http://e/1.xml", "http://e/2.xml"];
    let bodies = vec![
        ("http://e/1.xml", source("CNN", "20260801200000 +0000")),
        ("http://e/2.xml", source("CNN", "20260801200000 +0000")),
    ];

    let signer = signer();
    let provider = epg_provider(&sources, mock_client(bodies), &signer);
    let channel_map = HashMap::from([(hash_id("CNN"), "CNN".to_string())]);

    let out = EpgStreamer::new(vec![provider], channel_map)
        .write_epg()
        .await
        .unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(text.matches("<programme").count(), 1);
}

#[tokio::test]
async fn test_matched_by_original_id() {
    let bodies = vec![(
        "http://e/1.xml",
        source("Whatever Name", "20260801200000 +0000"),
    )];

    let signer = signer();
    let provider = epg_provider(&["http://e/1.xml"], mock_client(bodies), &signer);
    // the playlist side already had tvg-id 1337
    let channel_map = HashMap::from([("1337".to_string(), "CNN".to_string())]);

    let out = EpgStreamer::new(vec![provider], channel_map)
        .write_epg()
        .await
        .unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.contains("channel id=\"1337\""));
    // display name is overridden to the playlist's name
    assert!(text.contains(">CNN</display-name>"));
    assert!(!text.contains("Whatever Name"));
}

#[tokio::test]
async fn test_icons_are_rewritten_to_file_tokens() {
    let body = r#"<tv>
<channel id="1337">
  <display-name>CNN</display-name>
  <icon src="http://up/logos/cnn.png"/>
</channel>
<programme start="20260801200000 +0000" channel="1337">
  <title>Show</title>
  <icon src="http://up/stills/show.jpg"/>
</programme>
</tv>"#;

    let signer = signer();
    let provider = epg_provider(
        &["http://e/1.xml"],
        mock_client(vec![("http://e/1.xml", body.to_string())]),
        &signer,
    );
    let channel_map = HashMap::from([(hash_id("CNN"), "CNN".to_string())]);

    let out = EpgStreamer::new(vec![provider], channel_map)
        .write_epg()
        .await
        .unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(!text.contains("http://up/logos/cnn.png"));
    assert!(!text.contains("http://up/stills/show.jpg"));

    // pull one rewritten icon out and decrypt it
    let prefix = "icon src=\"";
    let idx = text
        .find(&format!("{prefix}{PUBLIC_URL}/"))
        .expect("no rewritten icon");
    let icon_url: String = text[idx + prefix.len()..]
        .chars()
        .take_while(|c| *c != '"')
        .collect();
    let token = icon_url
        .strip_prefix(&format!("{PUBLIC_URL}/"))
        .unwrap()
        .split('/')
        .next()
        .unwrap();

    match signer.decrypt(token).unwrap() {
        TokenData::File { url, provider, .. } => {
            assert!(url.starts_with("http://up/"));
            assert_eq!(provider.kind, ProviderKind::Epg);
            assert_eq!(provider.name, "guide");
        }
        other => panic!("expected file token, got {other:?}"),
    }
}

#[tokio::test]
async fn test_gzipped_source_is_decoded() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let plain = source("CNN", "20260801200000 +0000");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plain.as_bytes()).unwrap();
    let gz = encoder.finish().unwrap();

    let mut mock = MockHttpClient::new();
    mock.expect_get().returning(move |_| {
        Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(gz.clone()))])
                .boxed(),
        })
    });

    let signer = signer();
    let provider = epg_provider(&["http://e/guide.xml.gz"], Arc::new(mock), &signer);
    let channel_map = HashMap::from([(hash_id("CNN"), "CNN".to_string())]);

    let out = EpgStreamer::new(vec![provider], channel_map)
        .write_epg()
        .await
        .unwrap();
    assert_eq!(String::from_utf8(out).unwrap().matches("<programme").count(), 1);
}

#[tokio::test]
async fn test_gzip_output_inflates_back() {
    let bodies = vec![("http://e/1.xml", source("CNN", "20260801200000 +0000"))];
    let signer = signer();
    let provider = epg_provider(&["http://e/1.xml"], mock_client(bodies), &signer);
    let channel_map = HashMap::from([(hash_id("CNN"), "CNN".to_string())]);

    let gz = EpgStreamer::new(vec![provider], channel_map)
        .write_epg_gzip()
        .await
        .unwrap();

    let mut decoder = flate2::read::GzDecoder::new(gz.as_slice());
    let mut inflated = String::new();
    decoder.read_to_string(&mut inflated).unwrap();
    assert!(inflated.contains("<programme"));
}
