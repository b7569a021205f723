//! Bootstrap utilities for the daemon binary.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;
use crate::manager::{ClientId, ClientInfo, CommManager, ManagerError, WatchdogListener};
use crate::protocol::QueueStall;

use super::retry::connection_backoff;

/// Initialize tracing with the COMMGR_LOG environment variable.
///
/// Defaults to "info" level if COMMGR_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect the downstream manager, retrying with exponential backoff.
///
/// An already-present downstream is not retried.
pub async fn connect_downstream_with_retry(
    manager: &Arc<CommManager>,
    address: &str,
) -> Result<ClientId, ManagerError> {
    let id = (move || async move { manager.connect_downstream(address).await })
        .retry(connection_backoff())
        .when(|e| matches!(e, ManagerError::Connect(_)))
        .notify(|err: &ManagerError, dur: Duration| {
            warn!(address = %address, error = %err, delay = ?dur, "Downstream connection failed, retrying");
        })
        .await?;
    info!(address = %address, client = %id, "Connected to downstream manager");
    Ok(id)
}

/// Watchdog listener that only logs.
pub struct LoggingWatchdogListener;

impl WatchdogListener for LoggingWatchdogListener {
    fn com_channel_died(&self, client: &ClientInfo) {
        error!(
            client = %client.id,
            name = %client.name,
            pid = ?client.pid,
            peer = %client.peer,
            "Client stopped responding"
        );
    }

    fn com_queue_watchdog(&self, client: &ClientInfo, stall: &QueueStall) {
        warn!(
            client = %client.id,
            name = %client.name,
            queue = %stall.queue,
            event_id = %format!("{:#010x}", stall.event_id),
            entered = stall.time_entered,
            started = stall.time_started,
            expired = stall.time_expired,
            now = stall.now,
            "Dispatch queue handler overran"
        );
    }
}
