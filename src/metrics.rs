use std::sync::OnceLock;

use prometheus::{
    Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// process-wide registry; collectors register once on first touch
static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CACHE_ACCESS: OnceLock<IntCounterVec> = OnceLock::new();
static LISTING_DOWNLOADS: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_STREAMS: OnceLock<IntGauge> = OnceLock::new();
static PROVIDER_STREAMS: OnceLock<IntGaugeVec> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn cache_access() -> &'static IntCounterVec {
    CACHE_ACCESS.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("tvmux_cache_access_total", "cache store lookups by outcome"),
            &["status"],
        )
        .unwrap();
        let _ = registry().register(Box::new(counter.clone()));
        counter
    })
}

fn listing_downloads() -> &'static IntCounterVec {
    LISTING_DOWNLOADS.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("tvmux_listing_downloads_total", "listing responses by kind"),
            &["kind"],
        )
        .unwrap();
        let _ = registry().register(Box::new(counter.clone()));
        counter
    })
}

pub fn active_streams() -> &'static IntGauge {
    ACTIVE_STREAMS.get_or_init(|| {
        let gauge = IntGauge::new("tvmux_active_streams", "streams currently proxied").unwrap();
        let _ = registry().register(Box::new(gauge.clone()));
        gauge
    })
}

fn provider_streams() -> &'static IntGaugeVec {
    PROVIDER_STREAMS.get_or_init(|| {
        let gauge = IntGaugeVec::new(
            Opts::new(
                "tvmux_provider_streams_active",
                "streams currently proxied per playlist provider",
            ),
            &["provider"],
        )
        .unwrap();
        let _ = registry().register(Box::new(gauge.clone()));
        gauge
    })
}

pub fn inc_cache_access(status: &str) {
    cache_access().with_label_values(&[status]).inc();
}

pub fn inc_listing_download(kind: &str) {
    listing_downloads().with_label_values(&[kind]).inc();
}

pub fn set_provider_streams(provider: &str, value: i64) {
    provider_streams().with_label_values(&[provider]).set(value);
}

pub fn add_provider_streams(provider: &str, delta: i64) {
    provider_streams().with_label_values(&[provider]).add(delta);
}

/// prometheus text exposition of everything registered so far
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry().gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
