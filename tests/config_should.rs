// settings deserialization and startup validation
use tvmux::config::common::Duration;
use tvmux::config::Settings;

const VALID_CONFIG: &str = r#"
server:
  listen_addr: "0.0.0.0:8080"
  public_url: "http://gateway.local"
url_signer:
  secret: "super-secret"
  stream_ttl: 1h
  file_ttl: 0
http_client:
  cache:
    enabled: true
    path: "cache"
    ttl: 24h
    retention: 30d
proxy:
  enabled: true
  concurrency: 10
clients:
  - name: living-room
    secret: s1
    playlists: main
  - name: bedroom
    secret: s2
playlists:
  - name: main
    sources:
      - "http://upstream/main.m3u"
      - "http://upstream/backup.m3u"
epgs:
  - name: guide
    sources: "http://upstream/epg.xml.gz"
channel_rules:
  - remove_channel:
      condition:
        clients: [bedroom]
        selector: { type: tag, value: EXTGRP }
        patterns: ["(?i)adult"]
playlist_rules:
  - remove_duplicates:
      selector: { type: name }
      patterns: [" HD$", " FHD$"]
"#;

#[test]
fn test_valid_config_parses() {
    let settings: Settings = serde_yaml::from_str(VALID_CONFIG).unwrap();
    settings.validate().unwrap();

    assert_eq!(settings.clients.len(), 2);
    assert_eq!(settings.clients[0].playlists.0, vec!["main"]);
    // single string source becomes a one element list
    assert_eq!(settings.epgs[0].sources.len(), 1);
    assert_eq!(settings.url_signer.stream_ttl, Duration::from_secs(3600));
    assert!(settings.url_signer.file_ttl.is_zero());
    assert_eq!(settings.channel_rules.len(), 1);
    assert_eq!(settings.playlist_rules.len(), 1);
}

#[test]
fn test_duration_forms() {
    assert_eq!(Duration::parse("90").unwrap().as_secs(), 90);
    assert_eq!(Duration::parse("90s").unwrap().as_secs(), 90);
    assert_eq!(Duration::parse("15m").unwrap().as_secs(), 900);
    assert_eq!(Duration::parse("2h").unwrap().as_secs(), 7200);
    assert_eq!(Duration::parse("30d").unwrap().as_secs(), 30 * 86400);
    assert!(Duration::parse("5w").is_err());
    assert!(Duration::parse("").is_err());
}

#[test]
fn test_duplicate_client_secret_is_rejected() {
    let raw = VALID_CONFIG.replace("secret: s2", "secret: s1");
    let settings: Settings = serde_yaml::from_str(&raw).unwrap();
    let err = settings.validate().unwrap_err().to_string();
    assert!(err.contains("share a secret"), "unexpected error: {err}");
}

#[test]
fn test_duplicate_client_name_is_rejected() {
    let raw = VALID_CONFIG.replace("name: bedroom", "name: living-room");
    let settings: Settings = serde_yaml::from_str(&raw).unwrap();
    let err = settings.validate().unwrap_err().to_string();
    assert!(err.contains("duplicate client name"), "unexpected error: {err}");
}

#[test]
fn test_unknown_playlist_reference_is_rejected() {
    let raw = VALID_CONFIG.replace("playlists: main", "playlists: nonexistent");
    let settings: Settings = serde_yaml::from_str(&raw).unwrap();
    let err = settings.validate().unwrap_err().to_string();
    assert!(err.contains("unknown playlist"), "unexpected error: {err}");
}

#[test]
fn test_rule_referencing_unknown_client_is_rejected() {
    let raw = VALID_CONFIG.replace("clients: [bedroom]", "clients: [ghost]");
    let settings: Settings = serde_yaml::from_str(&raw).unwrap();
    let err = settings.validate().unwrap_err().to_string();
    assert!(err.contains("unknown client"), "unexpected error: {err}");
}

#[test]
fn test_enabled_cache_requires_path_and_ttl() {
    let raw = VALID_CONFIG.replace("    path: \"cache\"\n", "");
    let settings: Settings = serde_yaml::from_str(&raw).unwrap();
    let err = settings.validate().unwrap_err().to_string();
    assert!(err.contains("path is required"), "unexpected error: {err}");
}

#[test]
fn test_provider_needs_sources() {
    let raw = r#"
url_signer:
  secret: x
playlists:
  - name: empty
    sources: []
"#;
    let settings: Settings = serde_yaml::from_str(raw).unwrap();
    assert!(settings.validate().is_err());
}

#[test]
fn test_invalid_rule_pattern_fails_at_parse_time() {
    let raw = VALID_CONFIG.replace("patterns: [\"(?i)adult\"]", "patterns: [\"([\"]");
    assert!(serde_yaml::from_str::<Settings>(&raw).is_err());
}

#[test]
fn test_channel_rule_must_have_exactly_one_action() {
    let raw = r#"
url_signer:
  secret: x
channel_rules:
  - set_field:
      selector: { type: name }
      template: "x"
    mark_hidden: {}
"#;
    let settings: Settings = serde_yaml::from_str(raw).unwrap();
    let err = settings.validate().unwrap_err().to_string();
    assert!(err.contains("exactly one action"), "unexpected error: {err}");
}
