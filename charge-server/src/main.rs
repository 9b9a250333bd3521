//! Charge Worlds server: WebSocket room sync plus the HTTP event and
//! membership endpoints.

use std::future::IntoFuture;

use anyhow::Context;
use charge_collab::server::SyncServer;

mod config;
mod http;

use config::AppConfig;
use http::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;
    log::info!("Starting Charge server");
    match &config.storage_path {
        Some(path) => log::info!("Persisting worlds under {}", path.display()),
        None => log::warn!("CHARGE_STORAGE_PATH not set, worlds live in memory only"),
    }

    let sync = SyncServer::new(config.server_config()).context("failed to open room store")?;
    let restored = sync.recover().await.context("failed to recover stored worlds")?;
    log::info!("Restored {restored} world(s)");

    let sync_listener = tokio::net::TcpListener::bind(&config.sync_addr)
        .await
        .with_context(|| format!("failed to bind sync listener on {}", config.sync_addr))?;
    let sync_server = sync.clone();
    let sync_task = tokio::spawn(async move {
        if let Err(e) = sync_server.run_on(sync_listener).await {
            log::error!("Sync server stopped: {e}");
        }
    });

    let router = http::routes(AppState {
        hub: sync.hub(),
        memberships: sync.memberships(),
    });
    let http_listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http_addr))?;
    log::info!("HTTP listening on {}", config.http_addr);

    tokio::select! {
        served = axum::serve(http_listener, router).into_future() => served.context("HTTP server failed")?,
        _ = sync_task => anyhow::bail!("sync server exited"),
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }
    Ok(())
}
