//! Keymaster bootstrap reaper.
//!
//! A long-running companion process that sweeps bootstrap sessions (C10):
//! on startup it reclaims any session left `Active` by a process that died
//! mid-bootstrap, marking it `Orphaned` (§4.10 crash recovery); on a tick it
//! expires sessions that outlived their TTL without operator confirmation.

use std::sync::Arc;

use keymaster_core::bootstrap::BootstrapManager;
use keymaster_core::clock::SystemClock;
use keymaster_core::config::KeymasterConfig;
use keymaster_core::store::MemoryStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[keymaster-reaper] .env not loaded: {e} (using system environment)");
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into())))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(KeymasterConfig::from_env());

    // The real store is an external collaborator wired in by deployment
    // tooling; `MemoryStore` stands in here so this binary is runnable for
    // local smoke-testing without one. See `keymaster_core::store::Store`.
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(BootstrapManager::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store,
        Arc::new(SystemClock),
        Arc::clone(&config),
    ));

    match manager.recover_orphaned().await {
        Ok(n) if n > 0 => tracing::info!(recovered = n, "reclaimed orphaned bootstrap sessions on startup"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "startup orphan recovery failed"),
    }

    tracing::info!(interval_secs = config.reaper_interval_secs, "keymaster reaper started");

    let mut interval = tokio::time::interval(config.reaper_interval());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match manager.sweep_expired().await {
                    Ok(n) if n > 0 => tracing::info!(expired = n, "swept expired bootstrap sessions"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; interrupting in-flight bootstraps and shutting down");
                manager.interrupt_all().await;
                break;
            }
        }
    }
}
