//! Socket-stream backend.
//!
//! One accept task per listener. Each accepted peer gets a reader task
//! (frames in, `dispatch_message`) and a writer task (queue out, batched
//! vectored writes). Failed connections are reported back to the accept
//! task, which deregisters them from the manager.

mod frame;
mod link;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{ClientOrigin, LinkKind};
use crate::manager::{ClientId, CommManager};
use crate::transport::{connect_to_address, Listener, ListenerConfig};

use super::{Backend, BackendError, Result};

pub use frame::{FrameError, HEADER_LEN};

use link::SocketConnection;

/// Default upper bound on a single frame's payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Default number of queued frames coalesced into one write.
pub const DEFAULT_WRITE_BATCH: usize = 8;

/// Default bound on frames queued for one peer.
pub const DEFAULT_MAX_QUEUE: usize = 1024;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Framing options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Frames longer than this close the connection.
    pub max_frame_len: usize,
    /// Maximum frames per vectored write.
    pub write_batch: usize,
    /// Frames queued for a peer before it is dropped as too slow.
    pub max_queue: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            write_batch: DEFAULT_WRITE_BATCH,
            max_queue: DEFAULT_MAX_QUEUE,
        }
    }
}

/// Listening socket backend.
pub struct SocketBackend {
    name: String,
    local_address: String,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SocketBackend {
    /// Bind `listener` and start accepting peers for `manager`.
    pub async fn bind(
        manager: Arc<CommManager>,
        listener: &ListenerConfig,
        config: SocketConfig,
    ) -> Result<Self> {
        let bound = Listener::bind(listener)
            .await
            .map_err(|source| BackendError::Bind {
                address: describe(listener),
                source,
            })?;
        let local_address = bound.local_address()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(manager, bound, config, shutdown_rx));

        info!(address = %local_address, "Socket backend started");
        Ok(Self {
            name: format!("socket({local_address})"),
            local_address,
            shutdown: shutdown_tx,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    /// Address peers can connect to.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }
}

#[async_trait]
impl Backend for SocketBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Socket accept task failed");
            }
        }
    }
}

fn describe(listener: &ListenerConfig) -> String {
    match listener.transport_type {
        crate::transport::TransportType::Tcp => listener.tcp.addr(),
        crate::transport::TransportType::Uds => listener.uds.socket_path().display().to_string(),
    }
}

async fn accept_loop(
    manager: Arc<CommManager>,
    listener: Listener,
    config: SocketConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<ClientId>();
    let mut live: HashMap<ClientId, SocketConnection> = HashMap::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    let peer = conn.peer.clone();
                    let origin = ClientOrigin::peer(conn.pid);
                    let connection = link::attach(
                        &manager,
                        conn,
                        origin,
                        LinkKind::SocketStream,
                        &config,
                        closed_tx.clone(),
                    );
                    debug!(client = %connection.id, peer = %peer, "Accepted");
                    live.insert(connection.id, connection);
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(id) = closed_rx.recv() => {
                if let Some(connection) = live.remove(&id) {
                    manager.deregister_client(id);
                    connection.close().await;
                }
            }
        }
    }

    drop(listener);
    let count = live.len();
    let ids: Vec<ClientId> = live.keys().copied().collect();
    futures::future::join_all(live.into_values().map(SocketConnection::close)).await;
    for id in ids {
        manager.deregister_client(id);
    }
    info!(clients = count, "Socket backend stopped");
}

/// Outbound connection to another manager.
pub struct OutboundLink {
    id: ClientId,
    cancel: oneshot::Sender<()>,
    supervisor: JoinHandle<()>,
}

impl OutboundLink {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Disconnect, deregister and wait for the connection tasks.
    pub async fn close(self) {
        let _ = self.cancel.send(());
        let _ = self.supervisor.await;
    }
}

/// Open a socket to `address` and register it as a manager link.
///
/// The connection is deregistered when it fails or when the returned
/// handle is closed.
pub async fn connect(
    manager: &Arc<CommManager>,
    address: &str,
    origin: ClientOrigin,
    config: &SocketConfig,
) -> Result<OutboundLink> {
    let conn = connect_to_address(address)
        .await
        .map_err(|source| BackendError::Connect {
            address: address.to_string(),
            source,
        })?;

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let connection = link::attach(manager, conn, origin, LinkKind::ManagerLink, config, closed_tx);
    let id = connection.id;

    let (cancel_tx, cancel_rx) = oneshot::channel();
    let weak = Arc::downgrade(manager);
    let address = address.to_string();
    let supervisor = tokio::spawn(async move {
        tokio::select! {
            _ = closed_rx.recv() => info!(client = %id, address = %address, "Manager link closed"),
            _ = cancel_rx => debug!(client = %id, address = %address, "Closing manager link"),
        }
        if let Some(manager) = weak.upgrade() {
            manager.deregister_client(id);
        }
        connection.close().await;
    });

    Ok(OutboundLink {
        id,
        cancel: cancel_tx,
        supervisor,
    })
}
