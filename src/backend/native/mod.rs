//! Native-channel backend.
//!
//! A single multiplexer task services every peer of a named channel.
//! Requests (connect, send, receive) are answered through a per-request
//! reply slot; pulses (disconnect, close, unblock) carry no reply. A
//! receive that finds nothing queued is parked on the client's link and
//! answered from `push_message` once data arrives.

mod channel;
mod link;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::Buffer;
use crate::client::ClientOrigin;
use crate::manager::{ClientId, CommManager};

use super::Backend;

pub use channel::{Coid, NativeChannel, NativeConnection, NativeProcess, Received, Scoid};

use channel::{Pulse, Reply, Request};
use link::NativeLink;

/// Default channel name.
pub const DEFAULT_CHANNEL_NAME: &str = "commgr";

/// Native channel options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NativeChannelConfig {
    pub enabled: bool,
    /// Name the channel is attached under.
    pub name: String,
}

impl Default for NativeChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: DEFAULT_CHANNEL_NAME.to_string(),
        }
    }
}

struct Attached {
    id: ClientId,
    link: Arc<NativeLink>,
}

/// Backend servicing one native channel.
pub struct NativeChannelBackend {
    name: String,
    tx: mpsc::UnboundedSender<Request>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl NativeChannelBackend {
    /// Attach a channel under `name` and start its multiplexer.
    ///
    /// Returns the backend and the handle peers connect through.
    pub fn attach(manager: Arc<CommManager>, name: &str) -> (Self, NativeChannel) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(multiplex(manager, name.to_string(), rx));
        info!(channel = %name, "Native channel attached");

        let channel = NativeChannel::new(name, tx.clone());
        let backend = Self {
            name: format!("native({name})"),
            tx,
            task: tokio::sync::Mutex::new(Some(task)),
        };
        (backend, channel)
    }
}

#[async_trait]
impl Backend for NativeChannelBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Native channel task failed");
            }
        }
    }
}

async fn multiplex(
    manager: Arc<CommManager>,
    name: String,
    mut rx: mpsc::UnboundedReceiver<Request>,
) {
    let mut clients: HashMap<(Scoid, Coid), Attached> = HashMap::new();

    while let Some(request) = rx.recv().await {
        match request {
            Request::Connect {
                scoid,
                coid,
                pid,
                reply,
            } => {
                let link = Arc::new(NativeLink::new(scoid, coid));
                let id = manager.register_client(link.clone(), ClientOrigin::peer(Some(pid)));
                if let Some(stale) = clients.insert((scoid, coid), Attached { id, link }) {
                    warn!(scoid, coid, client = %stale.id, "Replacing stale native client");
                    manager.deregister_client(stale.id);
                }
                let _ = reply.send(Reply::Ok);
            }

            Request::Send {
                scoid,
                coid,
                payload,
                reply,
            } => {
                let Some(attached) = clients.get(&(scoid, coid)) else {
                    let _ = reply.send(Reply::UnknownConnection);
                    continue;
                };
                let msg = Buffer::from_payload(&payload);
                let _ = reply.send(Reply::Ok);
                manager.dispatch_message(attached.id, msg);
            }

            Request::Receive {
                scoid,
                coid,
                max_len,
                reply,
            } => match clients.get(&(scoid, coid)) {
                Some(attached) => attached.link.receive(max_len, reply),
                None => {
                    let _ = reply.send(Reply::UnknownConnection);
                }
            },

            Request::Pulse(Pulse::Unblock { scoid, coid }) => {
                if let Some(attached) = clients.get(&(scoid, coid)) {
                    attached.link.unblock();
                }
            }

            Request::Pulse(Pulse::Close { scoid, coid }) => {
                if let Some(attached) = clients.remove(&(scoid, coid)) {
                    debug!(scoid, coid, client = %attached.id, "Native connection closed");
                    attached.link.unblock();
                    manager.deregister_client(attached.id);
                }
            }

            Request::Pulse(Pulse::Disconnect { scoid }) => {
                let gone: Vec<(Scoid, Coid)> = clients
                    .keys()
                    .filter(|(s, _)| *s == scoid)
                    .copied()
                    .collect();
                for key in &gone {
                    if let Some(attached) = clients.remove(key) {
                        attached.link.unblock();
                        manager.deregister_client(attached.id);
                    }
                }
                info!(channel = %name, scoid, clients = gone.len(), "Native process disconnected");
            }

            Request::Shutdown => break,
        }
    }

    let count = clients.len();
    for (_, attached) in clients {
        attached.link.unblock();
        manager.deregister_client(attached.id);
    }
    info!(channel = %name, clients = count, "Native channel detached");
}
