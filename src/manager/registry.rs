//! Client registry and subscription table.
//!
//! Everything in here is guarded by the manager's single lock. The
//! registry performs no I/O; mutations report the interest transitions
//! the caller has to propagate to the neighbouring managers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::client::{ClientLink, ClientOrigin, LinkKind};
use crate::protocol::EventId;

use super::watchdog::{Watchdog, WatchdogState};

/// Name of a client that has not sent HELO yet.
pub const UNKNOWN_CLIENT_NAME: &str = "unknown";
/// Name given to a peer promoted by INIT_CM_EVENTS.
pub const UPSTREAM_NAME: &str = "upstreamCM";
/// Name of the link created by `connect_downstream`.
pub const DOWNSTREAM_NAME: &str = "downstreamCM";

/// Registry key of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Routing state of one client.
pub(crate) struct ClientEntry {
    pub(crate) link: Arc<dyn ClientLink>,
    pub(crate) name: String,
    pub(crate) pid: Option<u32>,
    pub(crate) receive_enabled: bool,
    pub(crate) transmit_enabled: bool,
    pub(crate) is_manager: bool,
    /// Per-event registration counts. `count > 0` iff the client is in
    /// the matching subscriber set (or forwarded set for manager links).
    pub(crate) registrations: HashMap<EventId, u32>,
    pub(crate) watchdog: Watchdog,
}

impl ClientEntry {
    fn new(link: Arc<dyn ClientLink>, origin: ClientOrigin) -> Self {
        Self {
            link,
            name: origin
                .name
                .unwrap_or_else(|| UNKNOWN_CLIENT_NAME.to_string()),
            pid: origin.pid,
            receive_enabled: true,
            transmit_enabled: true,
            is_manager: origin.is_manager,
            registrations: HashMap::new(),
            watchdog: Watchdog::new(),
        }
    }

    pub(crate) fn info(&self, id: ClientId, timeout: u32) -> ClientInfo {
        ClientInfo {
            id,
            name: self.name.clone(),
            pid: self.pid,
            kind: self.link.kind(),
            peer: self.link.peer(),
            receive_enabled: self.receive_enabled,
            transmit_enabled: self.transmit_enabled,
            is_manager: self.is_manager,
            registrations: self
                .registrations
                .iter()
                .map(|(id, count)| (*id, *count))
                .collect(),
            watchdog: self.watchdog.state(timeout),
        }
    }
}

/// Snapshot of a client's routing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    pub pid: Option<u32>,
    pub kind: LinkKind,
    pub peer: String,
    pub receive_enabled: bool,
    pub transmit_enabled: bool,
    pub is_manager: bool,
    pub registrations: BTreeMap<EventId, u32>,
    pub watchdog: WatchdogState,
}

/// A client removed from the registry.
pub(crate) struct Removed {
    pub(crate) entry: ClientEntry,
    /// IDs that lost their last local subscriber.
    pub(crate) lost: Vec<EventId>,
}

/// Which side of the broker tree a manager link sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Upstream,
    Downstream,
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    clients: BTreeMap<ClientId, ClientEntry>,
    /// Local subscriber sets.
    events: HashMap<EventId, BTreeSet<ClientId>>,
    /// IDs forwarded across the upstream link.
    upstream_events: BTreeSet<EventId>,
    /// IDs forwarded across the downstream link.
    downstream_events: BTreeSet<EventId>,
    upstream: Option<ClientId>,
    downstream: Option<ClientId>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, link: Arc<dyn ClientLink>, origin: ClientOrigin) -> ClientId {
        self.next_id += 1;
        let id = ClientId(self.next_id);
        self.clients.insert(id, ClientEntry::new(link, origin));
        id
    }

    /// Remove a client and scrub every reference to it.
    ///
    /// Returns `None` if the client is not registered.
    pub(crate) fn remove(&mut self, id: ClientId) -> Option<Removed> {
        let entry = self.clients.remove(&id)?;

        if self.upstream == Some(id) {
            self.upstream = None;
            self.upstream_events.clear();
        }
        if self.downstream == Some(id) {
            self.downstream = None;
            self.downstream_events.clear();
        }

        let mut lost = Vec::new();
        if !entry.is_manager {
            for event in entry.registrations.keys() {
                if let Some(set) = self.events.get_mut(event) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.events.remove(event);
                        lost.push(*event);
                    }
                }
            }
        }
        lost.sort_unstable();

        Some(Removed { entry, lost })
    }

    pub(crate) fn get(&self, id: ClientId) -> Option<&ClientEntry> {
        self.clients.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientEntry> {
        self.clients.get_mut(&id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ClientId, &ClientEntry)> {
        self.clients.iter().map(|(id, e)| (*id, e))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (ClientId, &mut ClientEntry)> {
        self.clients.iter_mut().map(|(id, e)| (*id, e))
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn link(&self, side: Side) -> Option<ClientId> {
        match side {
            Side::Upstream => self.upstream,
            Side::Downstream => self.downstream,
        }
    }

    fn side_of(&self, id: ClientId) -> Option<Side> {
        if self.upstream == Some(id) {
            Some(Side::Upstream)
        } else if self.downstream == Some(id) {
            Some(Side::Downstream)
        } else {
            None
        }
    }

    pub(crate) fn forwarded(&self, side: Side) -> &BTreeSet<EventId> {
        match side {
            Side::Upstream => &self.upstream_events,
            Side::Downstream => &self.downstream_events,
        }
    }

    fn forwarded_mut(&mut self, side: Side) -> &mut BTreeSet<EventId> {
        match side {
            Side::Upstream => &mut self.upstream_events,
            Side::Downstream => &mut self.downstream_events,
        }
    }

    /// Local subscribers of `event`, in registration-key order.
    pub(crate) fn subscribers(&self, event: EventId) -> Option<&BTreeSet<ClientId>> {
        self.events.get(&event)
    }

    /// Every ID with at least one local subscriber.
    pub(crate) fn local_events(&self) -> Vec<EventId> {
        let mut ids: Vec<EventId> = self.events.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Add interest of `id` in `events`.
    ///
    /// Local clients land in the subscriber table; manager links land in
    /// their side's forwarded set. Returns the IDs that gained their first
    /// local subscriber.
    pub(crate) fn register(&mut self, id: ClientId, events: &[EventId]) -> Vec<EventId> {
        let side = self.side_of(id);
        let Some(entry) = self.clients.get_mut(&id) else {
            return Vec::new();
        };
        let is_manager = entry.is_manager;

        let mut first = Vec::new();
        let mut linked = Vec::new();
        for event in events {
            let count = entry.registrations.entry(*event).or_insert(0);
            *count += 1;
            if *count > 1 {
                continue;
            }
            if is_manager {
                linked.push(*event);
                continue;
            }
            let set = self.events.entry(*event).or_default();
            if set.is_empty() {
                first.push(*event);
            }
            set.insert(id);
        }

        if let Some(side) = side {
            self.forwarded_mut(side).extend(linked);
        }
        first
    }

    /// Drop interest of `id` in `events`.
    ///
    /// Returns the IDs that lost their last local subscriber.
    pub(crate) fn deregister(&mut self, id: ClientId, events: &[EventId]) -> Vec<EventId> {
        let side = self.side_of(id);
        let Some(entry) = self.clients.get_mut(&id) else {
            return Vec::new();
        };
        let is_manager = entry.is_manager;

        let mut last = Vec::new();
        let mut unlinked = Vec::new();
        for event in events {
            let Some(count) = entry.registrations.get_mut(event) else {
                continue;
            };
            *count -= 1;
            if *count > 0 {
                continue;
            }
            entry.registrations.remove(event);
            if is_manager {
                unlinked.push(*event);
                continue;
            }
            if let Some(set) = self.events.get_mut(event) {
                set.remove(&id);
                if set.is_empty() {
                    self.events.remove(event);
                    last.push(*event);
                }
            }
        }

        if let Some(side) = side {
            let forwarded = self.forwarded_mut(side);
            for event in unlinked {
                forwarded.remove(&event);
            }
        }
        last
    }

    /// Turn `id` into the link on `side`.
    ///
    /// Any local subscriptions it held are dropped (returned as lost
    /// IDs). Fails if another client already holds that side.
    pub(crate) fn promote(&mut self, id: ClientId, side: Side, name: &str) -> Result<Vec<EventId>, ClientId> {
        if let Some(existing) = self.link(side) {
            if existing != id {
                return Err(existing);
            }
        }

        let Some(entry) = self.clients.get_mut(&id) else {
            return Ok(Vec::new());
        };
        let held: Vec<EventId> = if entry.is_manager {
            Vec::new()
        } else {
            entry.registrations.drain().map(|(event, _)| event).collect()
        };
        entry.is_manager = true;
        entry.name = name.to_string();
        entry.watchdog.disable();

        let mut lost = Vec::new();
        for event in held {
            if let Some(set) = self.events.get_mut(&event) {
                set.remove(&id);
                if set.is_empty() {
                    self.events.remove(&event);
                    lost.push(event);
                }
            }
        }
        lost.sort_unstable();

        match side {
            Side::Upstream => self.upstream = Some(id),
            Side::Downstream => self.downstream = Some(id),
        }
        Ok(lost)
    }

    /// Verify the cross-field invariants. Test support.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for (event, set) in &self.events {
            assert!(!set.is_empty(), "empty subscriber set for {:#010x}", event);
            for id in set {
                let entry = self.clients.get(id).expect("subscriber not registered");
                assert!(!entry.is_manager, "manager link in local table");
                assert!(entry.registrations.get(event).copied().unwrap_or(0) > 0);
            }
        }
        for (id, entry) in &self.clients {
            for (event, count) in &entry.registrations {
                assert!(*count > 0);
                match self.side_of(*id) {
                    Some(side) => assert!(self.forwarded(side).contains(event)),
                    None if entry.is_manager => {}
                    None => assert!(self.events.get(event).is_some_and(|s| s.contains(id))),
                }
            }
        }
        for side in [Side::Upstream, Side::Downstream] {
            match self.link(side) {
                Some(id) => {
                    let entry = self.clients.get(&id).expect("link not registered");
                    for event in self.forwarded(side) {
                        assert!(entry.registrations.contains_key(event));
                    }
                }
                None => assert!(self.forwarded(side).is_empty()),
            }
        }
    }
}
