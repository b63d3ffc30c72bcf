//! caskd — Cask secure file-upload daemon.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use cask_core::config::CaskConfig;
use cask_core::wire::SERVER_VERSION;
use cask_services::{server, FileStorage, RecordStore, SessionContext, SessionSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CaskConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CaskConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CaskConfig::default()
    });

    let (port, source) = config.resolve_port();
    tracing::info!(version = SERVER_VERSION, port, source = ?source, "caskd starting");

    // Shared state
    let store = RecordStore::open(&config.storage.database_path).with_context(|| {
        format!(
            "failed to open record store at {}",
            config.storage.database_path.display()
        )
    })?;
    let storage = FileStorage::new(&config.storage.files_dir).with_context(|| {
        format!(
            "failed to create storage area at {}",
            config.storage.files_dir.display()
        )
    })?;
    tracing::info!(path = %storage.root().display(), "storage area ready");

    let settings = SessionSettings::from(&config.session);
    tracing::info!(
        idle_timeout_secs = config.session.idle_timeout_secs,
        padding = ?settings.upload_padding,
        checksum = ?settings.checksum,
        "session settings"
    );
    let ctx = SessionContext {
        store,
        storage,
        settings,
    };

    // Bind
    let addr: SocketAddr = format!("{}:{}", config.network.host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.network.host, port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    server::serve(listener, ctx, shutdown_rx).await?;

    tracing::info!("caskd stopped");
    Ok(())
}
