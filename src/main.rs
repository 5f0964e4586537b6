use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::info;

use tvmux::{AppConfig, ApplicationServer, Logger, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = AppConfig::parse();

    // guards are kept alive to flush logs and keep the sentry connection
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!("logger ready, loading gateway config...");

    let settings = Settings::load(&config.config)?;

    info!(
        clients = settings.clients.len(),
        playlists = settings.playlists.len(),
        epgs = settings.epgs.len(),
        "config ok, starting server..."
    );

    ApplicationServer::serve(settings)
        .await
        .context("server failed to start")?;

    Ok(())
}
