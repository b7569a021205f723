//! Communication Manager: the routing core.
//!
//! Every frame received by any backend ends up in `dispatch_message`.
//! Administrative events mutate the subscription table or watchdog
//! state; everything else is fanned out to the local subscribers of its
//! event ID and, unless it came from another manager, across the
//! upstream/downstream links that asked for it.
//!
//! All routing state lives in one `Registry` behind one lock. The lock is
//! held for the whole of each operation and never across an `.await`.
//! `ClientLink::push_message` is non-blocking, so fan-out under the lock
//! is bounded.

mod registry;
pub mod watchdog;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::backend::socket::{self, OutboundLink, SocketConfig};
use crate::backend::BackendError;
use crate::buffer::Buffer;
use crate::client::{ClientLink, ClientOrigin};
use crate::protocol::{is_admin, AdminMessage, EventId, QueueStall, Registration};

pub use registry::{
    ClientId, ClientInfo, DOWNSTREAM_NAME, UNKNOWN_CLIENT_NAME, UPSTREAM_NAME,
};
pub use watchdog::{WatchdogConfig, WatchdogListener, WatchdogState};

use registry::{Registry, Side};
use watchdog::{Tick, TickerHandle};

/// Receiver name put in (de)registration messages the manager sends.
pub const MANAGER_RECEIVER_NAME: &str = "commgr";

/// Result type for manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Errors surfaced by manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("a downstream manager is already connected ({0})")]
    DownstreamExists(ClientId),

    #[error("failed to connect downstream manager: {0}")]
    Connect(#[from] BackendError),
}

/// Manager configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerConfig {
    pub watchdog: WatchdogConfig,
    /// Framing options for links the manager opens itself.
    pub socket: SocketConfig,
}

/// Callback work collected under the lock and run after releasing it.
enum Notice {
    ChannelDied(ClientInfo),
    QueueStalled(ClientInfo, QueueStall),
}

/// The routing core.
pub struct CommManager {
    config: ManagerConfig,
    state: Mutex<Registry>,
    listener: Mutex<Option<Arc<dyn WatchdogListener>>>,
    ticker: Mutex<Option<TickerHandle>>,
    downstream: tokio::sync::Mutex<Option<OutboundLink>>,
}

impl CommManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(Registry::new()),
            listener: Mutex::new(None),
            ticker: Mutex::new(None),
            downstream: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn timeout(&self) -> u32 {
        self.config.watchdog.timeout()
    }

    /// Add a client to the routing table.
    pub fn register_client(&self, link: Arc<dyn ClientLink>, origin: ClientOrigin) -> ClientId {
        let kind = link.kind();
        let peer = link.peer();
        let pid = origin.pid;
        let mut reg = self.state.lock();
        let id = reg.insert(link, origin);
        info!(
            client = %id,
            kind = %kind,
            peer = %peer,
            pid = ?pid,
            clients = reg.len(),
            "Client registered"
        );
        id
    }

    /// Remove a client and every subscription-table reference to it.
    ///
    /// Idempotent: removing an unknown client is a no-op.
    pub fn deregister_client(&self, id: ClientId) {
        let removed = {
            let mut reg = self.state.lock();
            let Some(removed) = reg.remove(id) else {
                trace!(client = %id, "Deregister of unknown client ignored");
                return;
            };
            Self::propagate_deregister(&reg, &removed.lost);
            info!(
                client = %id,
                name = %removed.entry.name,
                lost_events = removed.lost.len(),
                clients = reg.len(),
                "Client deregistered"
            );
            removed
        };
        // Link released outside the lock.
        drop(removed);
    }

    /// Route one received frame. Always consumes `msg`.
    pub fn dispatch_message(&self, sender: ClientId, msg: Buffer) {
        let Some(event_id) = msg.event_id() else {
            debug!(client = %sender, len = msg.len(), "Dropping frame without event id");
            return;
        };

        let mut notices = Vec::new();
        {
            let mut reg = self.state.lock();
            let Some(transmit_enabled) = reg.get(sender).map(|e| e.transmit_enabled) else {
                debug!(client = %sender, "Dropping message from unregistered client");
                return;
            };

            if is_admin(event_id) {
                self.handle_admin(&mut reg, sender, &msg, &mut notices);
            } else if transmit_enabled {
                Self::forward_message(&reg, sender, event_id, &msg);
            } else {
                trace!(
                    client = %sender,
                    event_id = %format!("{:#010x}", event_id),
                    "Transmit disabled, message dropped"
                );
            }
        }
        drop(msg);
        self.notify(notices);
    }

    fn forward_message(reg: &Registry, sender: ClientId, event_id: EventId, msg: &Buffer) {
        let mut delivered = 0usize;
        if let Some(subscribers) = reg.subscribers(event_id) {
            for id in subscribers {
                if let Some(entry) = reg.get(*id) {
                    if entry.receive_enabled {
                        entry.link.push_message(msg);
                        delivered += 1;
                    }
                }
            }
        }

        // Traffic from another manager never crosses a link again.
        let from_manager = reg.get(sender).is_some_and(|e| e.is_manager);
        if !from_manager {
            for side in [Side::Upstream, Side::Downstream] {
                if !reg.forwarded(side).contains(&event_id) {
                    continue;
                }
                if let Some(entry) = reg.link(side).and_then(|id| reg.get(id)) {
                    if entry.receive_enabled {
                        entry.link.push_message(msg);
                        delivered += 1;
                    }
                }
            }
        }

        trace!(
            client = %sender,
            event_id = %format!("{:#010x}", event_id),
            delivered,
            "Message routed"
        );
    }

    fn handle_admin(
        &self,
        reg: &mut Registry,
        sender: ClientId,
        msg: &Buffer,
        notices: &mut Vec<Notice>,
    ) {
        let admin = match AdminMessage::decode(msg.payload()) {
            Ok(admin) => admin,
            Err(e) => {
                debug!(client = %sender, error = %e, "Dropping malformed administrative event");
                return;
            }
        };
        let timeout = self.timeout();

        match admin {
            AdminMessage::RegisterCcEvents(r) | AdminMessage::RegisterCmEvents(r) => {
                debug!(client = %sender, events = ?r.events, "Register events");
                let first = reg.register(sender, &r.events);
                Self::propagate_register(reg, &first);
            }
            AdminMessage::DeregisterCcEvents(r) | AdminMessage::DeregisterCmEvents(r) => {
                debug!(client = %sender, events = ?r.events, "Deregister events");
                let last = reg.deregister(sender, &r.events);
                Self::propagate_deregister(reg, &last);
            }
            AdminMessage::Helo { name } => {
                let Some(entry) = reg.get_mut(sender) else { return };
                if entry.is_manager {
                    debug!(client = %sender, name = %name, "HELO from manager link ignored");
                    return;
                }
                let blacklisted = self.config.watchdog.is_blacklisted(&name);
                if blacklisted {
                    entry.watchdog.disable();
                } else {
                    entry.watchdog.arm();
                }
                info!(client = %sender, name = %name, watchdog = !blacklisted, "HELO");
                entry.name = name;
            }
            AdminMessage::InitCmEvents if reg.link(Side::Downstream) == Some(sender) => {
                warn!(client = %sender, "INIT_CM_EVENTS from downstream manager ignored");
            }
            AdminMessage::InitCmEvents => match reg.promote(sender, Side::Upstream, UPSTREAM_NAME) {
                Ok(lost) => {
                    Self::propagate_deregister(reg, &lost);
                    info!(client = %sender, "Peer promoted to upstream manager");
                    Self::replay(reg, Side::Upstream);
                }
                Err(existing) => {
                    warn!(
                        client = %sender,
                        upstream = %existing,
                        "Second upstream manager ignored"
                    );
                }
            },
            AdminMessage::Ping { challenge } => {
                if let Some(entry) = reg.get(sender) {
                    let pong = AdminMessage::Pong {
                        response: challenge.wrapping_add(1),
                    };
                    entry.link.push_message(&pong.encode());
                }
            }
            AdminMessage::Pong { response } => {
                let Some(entry) = reg.get_mut(sender) else { return };
                if !entry.watchdog.on_pong(response, timeout) {
                    trace!(client = %sender, response, "Stale PONG ignored");
                }
            }
            AdminMessage::WatchdogExpired(stall) => {
                let Some(entry) = reg.get_mut(sender) else { return };
                entry.watchdog.on_queue_expired(timeout);
                warn!(
                    client = %sender,
                    name = %entry.name,
                    queue = %stall.queue,
                    event_id = %format!("{:#010x}", stall.event_id),
                    "Dispatch queue watchdog expired"
                );
                notices.push(Notice::QueueStalled(entry.info(sender, timeout), stall));
            }
            AdminMessage::DebugDisableRx { disable, name } => {
                for (id, entry) in reg.iter_mut().filter(|(_, e)| e.name == name) {
                    entry.receive_enabled = !disable;
                    info!(client = %id, name = %name, receive_enabled = !disable, "Debug RX toggle");
                }
            }
            AdminMessage::DebugDisableTx { disable, name } => {
                for (id, entry) in reg.iter_mut().filter(|(_, e)| e.name == name) {
                    entry.transmit_enabled = !disable;
                    info!(client = %id, name = %name, transmit_enabled = !disable, "Debug TX toggle");
                }
            }
        }
    }

    fn send_to_link(reg: &Registry, side: Side, msg: &AdminMessage) {
        if let Some(entry) = reg.link(side).and_then(|id| reg.get(id)) {
            entry.link.push_message(&msg.encode());
        }
    }

    /// Tell the neighbours about IDs that gained their first local subscriber.
    fn propagate_register(reg: &Registry, events: &[EventId]) {
        if events.is_empty() {
            return;
        }
        let registration = Registration::new(MANAGER_RECEIVER_NAME, events.to_vec());
        Self::send_to_link(reg, Side::Upstream, &AdminMessage::RegisterCmEvents(registration.clone()));
        Self::send_to_link(reg, Side::Downstream, &AdminMessage::RegisterCcEvents(registration));
    }

    /// Tell the neighbours about IDs that lost their last local subscriber.
    fn propagate_deregister(reg: &Registry, events: &[EventId]) {
        if events.is_empty() {
            return;
        }
        let registration = Registration::new(MANAGER_RECEIVER_NAME, events.to_vec());
        Self::send_to_link(reg, Side::Upstream, &AdminMessage::DeregisterCmEvents(registration.clone()));
        Self::send_to_link(reg, Side::Downstream, &AdminMessage::DeregisterCcEvents(registration));
    }

    /// Send the full local subscription set across one link.
    fn replay(reg: &Registry, side: Side) {
        let events = reg.local_events();
        if events.is_empty() {
            return;
        }
        let registration = Registration::new(MANAGER_RECEIVER_NAME, events);
        let msg = match side {
            Side::Upstream => AdminMessage::RegisterCmEvents(registration),
            Side::Downstream => AdminMessage::RegisterCcEvents(registration),
        };
        Self::send_to_link(reg, side, &msg);
    }

    /// Register an already-connected link as the downstream manager,
    /// announce ourselves and replay our subscriptions.
    pub fn attach_downstream(&self, id: ClientId) -> Result<()> {
        let mut reg = self.state.lock();
        let lost = reg
            .promote(id, Side::Downstream, DOWNSTREAM_NAME)
            .map_err(ManagerError::DownstreamExists)?;
        Self::propagate_deregister(&reg, &lost);
        Self::send_to_link(&reg, Side::Downstream, &AdminMessage::InitCmEvents);
        Self::replay(&reg, Side::Downstream);
        info!(client = %id, "Downstream manager attached");
        Ok(())
    }

    /// Connect to another manager and make it our downstream.
    ///
    /// Fails if a downstream manager is already connected.
    pub async fn connect_downstream(self: &Arc<Self>, address: &str) -> Result<ClientId> {
        let mut slot = self.downstream.lock().await;

        let existing = self.state.lock().link(Side::Downstream);
        if let Some(existing) = existing {
            return Err(ManagerError::DownstreamExists(existing));
        }
        // A previous link that died on its own.
        if let Some(stale) = slot.take() {
            stale.close().await;
        }

        let link = socket::connect(
            self,
            address,
            ClientOrigin::manager(DOWNSTREAM_NAME),
            &self.config.socket,
        )
        .await?;
        let id = link.id();

        if let Err(e) = self.attach_downstream(id) {
            link.close().await;
            return Err(e);
        }

        info!(client = %id, address = %address, "Connected downstream manager");
        *slot = Some(link);
        Ok(id)
    }

    /// Install the liveness listener and start the periodic tick.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_watchdog_listener(self: &Arc<Self>, listener: Arc<dyn WatchdogListener>) {
        *self.listener.lock() = Some(listener);

        let mut ticker = self.ticker.lock();
        if ticker.is_none() {
            *ticker = Some(watchdog::spawn_ticker(
                Arc::downgrade(self),
                self.config.watchdog.tick_interval(),
            ));
        }
    }

    /// Advance every client's watchdog by one tick.
    pub fn watchdog_tick(&self) {
        let timeout = self.timeout();
        let mut notices = Vec::new();
        {
            let mut reg = self.state.lock();
            for (id, entry) in reg.iter_mut() {
                match entry.watchdog.tick(timeout) {
                    Tick::Idle => {}
                    Tick::Ping(challenge) => {
                        entry.link.push_message(&AdminMessage::Ping { challenge }.encode());
                    }
                    Tick::Died => {
                        warn!(client = %id, name = %entry.name, "Watchdog: client stopped answering");
                        notices.push(Notice::ChannelDied(entry.info(id, timeout)));
                    }
                }
            }
        }
        self.notify(notices);
    }

    fn notify(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let Some(listener) = self.listener.lock().clone() else {
            return;
        };
        for notice in notices {
            match notice {
                Notice::ChannelDied(info) => listener.com_channel_died(&info),
                Notice::QueueStalled(info, stall) => listener.com_queue_watchdog(&info, &stall),
            }
        }
    }

    pub fn client_info(&self, id: ClientId) -> Option<ClientInfo> {
        let reg = self.state.lock();
        reg.get(id).map(|e| e.info(id, self.timeout()))
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let timeout = self.timeout();
        let reg = self.state.lock();
        reg.iter().map(|(id, e)| e.info(id, timeout)).collect()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().len()
    }

    /// Local subscribers of `event`.
    pub fn subscribers(&self, event: EventId) -> Vec<ClientId> {
        let reg = self.state.lock();
        reg.subscribers(event)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// IDs forwarded to the upstream manager.
    pub fn upstream_events(&self) -> Vec<EventId> {
        self.state.lock().forwarded(Side::Upstream).iter().copied().collect()
    }

    /// IDs forwarded to the downstream manager.
    pub fn downstream_events(&self) -> Vec<EventId> {
        self.state.lock().forwarded(Side::Downstream).iter().copied().collect()
    }

    pub fn upstream(&self) -> Option<ClientId> {
        self.state.lock().link(Side::Upstream)
    }

    pub fn downstream(&self) -> Option<ClientId> {
        self.state.lock().link(Side::Downstream)
    }

    pub fn watchdog_state(&self, id: ClientId) -> Option<WatchdogState> {
        let reg = self.state.lock();
        reg.get(id).map(|e| e.watchdog.state(self.timeout()))
    }

    /// Current challenge of a client's watchdog.
    pub fn watchdog_challenge(&self, id: ClientId) -> Option<u32> {
        self.state.lock().get(id).map(|e| e.watchdog.challenge())
    }

    /// Stop the watchdog ticker and close the downstream link, waiting for both.
    pub async fn shutdown(&self) {
        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            ticker.join().await;
        }
        if let Some(link) = self.downstream.lock().await.take() {
            link.close().await;
        }
        info!("Communication manager stopped");
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        self.state.lock().check_invariants();
    }
}

impl Drop for CommManager {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.stop();
        }
    }
}
