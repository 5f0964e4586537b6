use axum::http::{header, StatusCode};
use axum::response::IntoResponse;

use crate::metrics;

/// liveness probe, nothing to check beyond the process being up since
/// upstreams are only contacted per request
pub async fn healthz_endpoint() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
