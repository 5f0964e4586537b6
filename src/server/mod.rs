pub mod api;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::{Extension, Router};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Settings;
use api::{health_controller, listing_controller, proxy_controller};
use services::manager_services::Manager;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct ApplicationServer;

impl ApplicationServer {
    pub async fn serve(settings: Settings) -> anyhow::Result<()> {
        let manager = Manager::new(&settings)?;

        // optional second listener so metrics can stay off the public port
        if let Some(metrics_addr) = settings.server.metrics_addr.clone() {
            let metrics_router =
                Router::new().route("/metrics", get(health_controller::metrics_endpoint));
            let listener = TcpListener::bind(&metrics_addr)
                .await
                .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
            info!(address = %metrics_addr, "starting metrics server");
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, metrics_router).await {
                    warn!("metrics server failed: {e}");
                }
            });
        }

        let app = Self::router(manager.clone(), settings.server.metrics_addr.is_some());

        let listener = TcpListener::bind(&settings.server.listen_addr)
            .await
            .with_context(|| {
                format!("failed to bind on {}", settings.server.listen_addr)
            })?;
        info!(address = %settings.server.listen_addr, "starting http server");

        let server = async {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("shutdown signal received");
                })
                .await
        };

        tokio::select! {
            result = server => {
                result.context("server failed")?;
            }
            _ = async {
                let _ = tokio::signal::ctrl_c().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                warn!("shutdown grace elapsed, force closing connections");
            }
        }

        manager.close();
        info!("server stopped");
        Ok(())
    }

    /// listing routes are keyed by client secret, everything else under
    /// a single path segment is treated as an encrypted token; static
    /// suffixes win over the catch-all so the two cannot collide
    pub fn router(manager: Arc<Manager>, metrics_enabled: bool) -> Router {
        let mut router = Router::new().route("/healthz", get(health_controller::healthz_endpoint));

        if metrics_enabled {
            router = router.route("/metrics", get(health_controller::metrics_endpoint));
        }

        router
            .route(
                "/{handle}/playlist.m3u8",
                get(listing_controller::playlist_endpoint),
            )
            .route("/{handle}/epg.xml", get(listing_controller::epg_endpoint))
            .route(
                "/{handle}/epg.xml.gz",
                get(listing_controller::epg_gzip_endpoint),
            )
            .route("/{handle}/{*rest}", get(proxy_controller::proxy_endpoint))
            .layer(Extension(manager))
    }
}
