mod api;
mod autojoin;
mod config;
mod content;
mod directory;
mod discovery;
mod engine;
mod error;
mod filter;
mod launcher;
mod manager;
mod probe;
mod sort;
mod store;
mod store_manager;
mod view;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::content::InstalledContent;
use crate::directory::DirectoryHandle;
use crate::discovery::lan::LanSource;
use crate::discovery::master::MasterListSource;
use crate::discovery::saved::SavedListSource;
use crate::discovery::DiscoverySource;
use crate::engine::RefreshEngine;
use crate::launcher::CommandLauncher;
use crate::manager::{Collaborators, DirectoryManager, ManagerOptions};
use crate::probe::UdpProbe;
use crate::store::db::StoreDb;
use crate::store_manager::{SettingsStore, StoreHandle};
use crate::view::ViewRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server_directoryd=info"))
        )
        .init();

    tracing::info!("Starting server-directoryd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/server-directory/directoryd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open SQLite database
    let db = StoreDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);
    let store = StoreHandle::spawn(db);

    // mDNS daemon for LAN discovery
    let mdns_daemon = if config.sources.lan_enabled {
        Some(ServiceDaemon::new().context("Failed to create mDNS daemon")?)
    } else {
        None
    };

    // Discovery sources
    let mut sources: Vec<Box<dyn DiscoverySource>> = Vec::new();
    if !config.sources.master_urls.is_empty() {
        let master = MasterListSource::new(
            config.sources.master_urls.clone(),
            Duration::from_millis(config.sources.master_timeout_ms),
        )
        .context("Failed to set up master list client")?;
        sources.push(Box::new(master));
    }
    if config.sources.saved_enabled {
        sources.push(Box::new(SavedListSource::new(store.clone())));
    }
    if let Some(daemon) = &mdns_daemon {
        sources.push(Box::new(LanSource::new(
            daemon.clone(),
            config.sources.lan_service_type.clone(),
            Duration::from_millis(config.sources.lan_window_ms),
        )));
    }
    tracing::info!("{} discovery sources enabled", sources.len());

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let probe = Arc::new(UdpProbe::new(config.probe.timeout()));
    let engine = RefreshEngine::new(probe.clone(), config.probe.concurrency, config.probe.timeout());
    let manager = Arc::new(DirectoryManager::new(
        DirectoryHandle::spawn(),
        engine,
        sources,
        Collaborators {
            booker: probe,
            launcher: Arc::new(CommandLauncher::new(
                config.launcher.program.clone(),
                config.launcher.args.clone(),
            )),
            catalog: Arc::new(InstalledContent::new(config.content.root.clone())),
            store: store.clone(),
        },
        ManagerOptions {
            driver_name: config.launcher.driver_name.clone(),
            policy: config.directory.refresh_policy(),
        },
        cancel.clone(),
    ));

    // Spawn periodic scan / sweep / refresh loop
    let mgr_handle = tokio::spawn(manager.clone().run(config.directory.clone()));

    // Build API router
    let settings: Arc<dyn SettingsStore> = Arc::new(store.clone());
    let views = Arc::new(ViewRegistry::new(manager.clone(), settings));
    let app_state = api::routes::AppState {
        manager: manager.clone(),
        views: views.clone(),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();
    views.close_all().await;

    // Wait for all tasks to complete
    let _ = tokio::join!(mgr_handle, server_handle);

    // Shutdown store thread
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    // Shutdown mDNS daemon
    if let Some(daemon) = mdns_daemon {
        if let Err(e) = daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
