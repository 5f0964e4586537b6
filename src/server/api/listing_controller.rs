use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use crate::metrics;
use crate::server::error::{AppResult, Error};
use crate::server::extractors::ClientAuthentication;
use crate::server::services::epg_services::EpgStreamer;
use crate::server::services::playlist_services::ListingError;

/// GET /{secret}/playlist.m3u8 - the consolidated playlist for one client
pub async fn playlist_endpoint(
    ClientAuthentication(client): ClientAuthentication,
) -> AppResult<Response> {
    debug!(client = client.name(), "playlist request");

    let streamer = client.playlist_streamer(client.epg_link());
    let body = streamer.write_playlist().await.map_err(listing_error)?;

    metrics::inc_listing_download("playlist");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-mpegurl"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// GET /{secret}/epg.xml - the merged guide for the same channel set
pub async fn epg_endpoint(ClientAuthentication(client): ClientAuthentication) -> AppResult<Response> {
    debug!(client = client.name(), "epg request");

    let body = epg_streamer(&client).await?.write_epg().await.map_err(listing_error)?;

    metrics::inc_listing_download("epg");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/xml"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// GET /{secret}/epg.xml.gz - same guide, compressed for slow boxes
pub async fn epg_gzip_endpoint(
    ClientAuthentication(client): ClientAuthentication,
) -> AppResult<Response> {
    debug!(client = client.name(), "gzipped epg request");

    let body = epg_streamer(&client)
        .await?
        .write_epg_gzip()
        .await
        .map_err(listing_error)?;

    metrics::inc_listing_download("epg");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/gzip"),
            (header::CACHE_CONTROL, "no-cache"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"epg.xml.gz\"",
            ),
        ],
        body,
    )
        .into_response())
}

/// the epg merger needs the channel ids the playlist pipeline settled
/// on, so the m3u8 merge runs first with rules applied
async fn epg_streamer(
    client: &crate::server::services::client_services::Client,
) -> AppResult<EpgStreamer> {
    let channel_map = client
        .playlist_streamer("")
        .channel_map()
        .await
        .map_err(listing_error)?;

    Ok(EpgStreamer::new(
        client.epg_providers().to_vec(),
        channel_map,
    ))
}

fn listing_error(err: ListingError) -> Error {
    error!("listing failed: {err}");
    Error::BadGateway(err.to_string())
}
