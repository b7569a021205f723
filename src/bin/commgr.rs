//! commgr: Communication Manager daemon
//!
//! Binds every configured socket listener, optionally attaches the native
//! channel and chains to a downstream manager, then routes events until
//! interrupted.
//!
//! ## Configuration
//! - `commgr.yaml` in the working directory, or the path given as the
//!   first argument, or `COMMGR_CONFIG`
//! - `COMMGR__*` environment overrides (e.g. `COMMGR__WATCHDOG__TIMEOUT_TICKS=10`)
//! - `COMMGR_LOG`: tracing filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use commgr::backend::native::NativeChannelBackend;
use commgr::backend::socket::SocketBackend;
use commgr::backend::Backend;
use commgr::config::Config;
use commgr::manager::CommManager;
use commgr::utils::bootstrap::{connect_downstream_with_retry, init_tracing, LoggingWatchdogListener};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let manager = CommManager::new(config.manager());
    manager.set_watchdog_listener(Arc::new(LoggingWatchdogListener));

    let mut backends: Vec<Box<dyn Backend>> = Vec::new();
    for listener in &config.listeners {
        let backend =
            SocketBackend::bind(Arc::clone(&manager), listener, config.socket.clone()).await?;
        backends.push(Box::new(backend));
    }

    // Kept alive for the daemon's lifetime; in-process peers clone it.
    let _native_channel = if config.native_channel.enabled {
        let (backend, channel) =
            NativeChannelBackend::attach(Arc::clone(&manager), &config.native_channel.name);
        backends.push(Box::new(backend));
        Some(channel)
    } else {
        None
    };

    if let Some(address) = &config.downstream {
        if let Err(e) = connect_downstream_with_retry(&manager, address).await {
            error!(address = %address, error = %e, "Giving up on downstream manager");
        }
    }

    info!(backends = backends.len(), "commgr started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for backend in &backends {
        info!(backend = %backend.name(), "Stopping backend");
        backend.shutdown().await;
    }
    manager.shutdown().await;

    Ok(())
}
