use std::sync::Arc;

use axum::body::Body;
use axum::extract::Path;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Extension;
use tracing::{debug, error, warn};

use crate::http_client::HttpClientError;
use crate::server::error::{AppResult, Error};
use crate::server::services::client_services::Client;
use crate::server::services::manager_services::Manager;
use crate::server::services::provider_services::Provider;
use crate::server::services::signer_services::{SignerError, StreamEntry, TokenData};
use crate::server::services::stream_services::{
    acquire_permits, run_clip, run_stream, ProcessBody,
};

const STREAM_CONTENT_TYPE: &str = "video/mp2t";

/// GET /{token}/{anything} - dereferences a signed token; the trailing
/// segment only exists for content sniffing and is ignored here
pub async fn proxy_endpoint(
    Extension(manager): Extension<Arc<Manager>>,
    Path((token, _suffix)): Path<(String, String)>,
) -> AppResult<Response> {
    // tokens are client-keyed, try each client's key until one opens it
    for client in manager.clients() {
        match client.signer().decrypt(&token) {
            Ok(data) => {
                let Some(info) = data.provider_info().cloned() else {
                    continue;
                };
                let Some(provider) = client.find_provider(info.kind, &info.name) else {
                    continue;
                };

                return match data {
                    TokenData::Stream {
                        channel, streams, ..
                    } => handle_stream(&manager, client, &provider, &channel, streams).await,
                    TokenData::File { url, .. } => handle_file(&provider, &url).await,
                };
            }
            Err(SignerError::Expired(data)) => {
                debug!(client = client.name(), "expired stream link");
                // the link-expired clip replaces a plain 401 when the
                // provider has one; permits are never touched here
                if let Some(info) = data.provider_info() {
                    if let Some(provider) = client.find_provider(info.kind, &info.name) {
                        if let Some(body) = run_clip(provider.link_expired_streamer()).await {
                            return Ok(mpegts_response(body));
                        }
                    }
                }
                return Err(Error::Unauthorized);
            }
            // not ours, maybe another client's key fits
            Err(_) => continue,
        }
    }

    Err(Error::Unauthorized)
}

async fn handle_stream(
    manager: &Manager,
    client: &Arc<Client>,
    provider: &Arc<Provider>,
    channel_name: &str,
    streams: Vec<StreamEntry>,
) -> AppResult<Response> {
    let Some(first) = streams.first() else {
        return Err(Error::BadRequest(
            "stream token carries no streams".to_string(),
        ));
    };

    debug!(
        channel = channel_name,
        provider = provider.name(),
        fallbacks = streams.len() - 1,
        "stream request"
    );

    let wait = provider.proxy().permit_timeout.map(|d| d.std());
    let permits = match acquire_permits(
        manager.semaphore(),
        provider.semaphore(),
        client.semaphore(),
        wait,
    )
    .await
    {
        Ok(permits) => permits,
        Err(_) => {
            warn!(
                client = client.name(),
                provider = provider.name(),
                "stream permits exhausted"
            );
            return match run_clip(provider.rate_limit_streamer()).await {
                Some(body) => Ok(mpegts_response(body)),
                None => Err(Error::RateLimited),
            };
        }
    };

    // only the highest priority url is played; the rest of the vector
    // travels in the token for observability
    match run_stream(provider, &first.url, permits).await {
        Ok(body) => Ok(mpegts_response(body)),
        Err(e) => {
            error!(provider = provider.name(), "stream failed: {e}");
            match run_clip(provider.upstream_error_streamer()).await {
                Some(body) => Ok(mpegts_response(body)),
                None => Err(Error::BadGateway(e.to_string())),
            }
        }
    }
}

async fn handle_file(provider: &Arc<Provider>, url: &str) -> AppResult<Response> {
    debug!(provider = provider.name(), "proxying file");

    let response = provider.http_client().get(url).await.map_err(|e| match e {
        HttpClientError::Status(code) => Error::UpstreamStatus(code),
        other => {
            error!("file proxy failed: {other}");
            Error::BadGateway(other.to_string())
        }
    })?;

    if response.status > 299 {
        error!(status = response.status, "upstream returned error");
        return Err(Error::UpstreamStatus(response.status));
    }

    let mut builder = Response::builder().status(StatusCode::OK);
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from_stream(response.body))
        .map_err(|e| Error::InternalServerErrorWithContext(e.to_string()))
}

fn mpegts_response(body: ProcessBody) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)
        .body(Body::from_stream(body))
        .unwrap_or_default()
}
