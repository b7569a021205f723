//! Test utilities and in-memory implementations.
//!
//! `RecordingLink` stands in for a transport: it keeps every buffer the
//! manager pushes so tests can inspect deliveries and reference counts
//! without sockets. `RecordingListener` captures watchdog callbacks.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::client::{ClientLink, LinkKind};
use crate::manager::{ClientInfo, WatchdogListener};
use crate::protocol::{AdminMessage, EventId, QueueStall, Registration};

/// In-memory client link that records everything pushed to it.
pub struct RecordingLink {
    kind: LinkKind,
    peer: String,
    received: Mutex<Vec<Buffer>>,
}

impl RecordingLink {
    pub fn new(peer: impl Into<String>) -> Arc<Self> {
        Self::with_kind(peer, LinkKind::SocketStream)
    }

    pub fn with_kind(peer: impl Into<String>, kind: LinkKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            peer: peer.into(),
            received: Mutex::new(Vec::new()),
        })
    }

    /// Buffers received so far, in delivery order.
    pub fn received(&self) -> Vec<Buffer> {
        self.received.lock().clone()
    }

    /// Event IDs received so far, in delivery order.
    pub fn event_ids(&self) -> Vec<EventId> {
        self.received
            .lock()
            .iter()
            .filter_map(Buffer::event_id)
            .collect()
    }

    /// Received messages decoded as administrative events; others skipped.
    pub fn admin_messages(&self) -> Vec<AdminMessage> {
        self.received
            .lock()
            .iter()
            .filter_map(|b| AdminMessage::decode(b.payload()).ok())
            .collect()
    }

    /// Drain and return everything received.
    pub fn take(&self) -> Vec<Buffer> {
        std::mem::take(&mut *self.received.lock())
    }

    pub fn clear(&self) {
        self.received.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }
}

impl ClientLink for RecordingLink {
    fn push_message(&self, msg: &Buffer) {
        self.received.lock().push(msg.clone());
    }

    fn kind(&self) -> LinkKind {
        self.kind
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Watchdog listener that records callbacks.
#[derive(Default)]
pub struct RecordingListener {
    died: Mutex<Vec<ClientInfo>>,
    stalls: Mutex<Vec<(ClientInfo, QueueStall)>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn died(&self) -> Vec<ClientInfo> {
        self.died.lock().clone()
    }

    pub fn stalls(&self) -> Vec<(ClientInfo, QueueStall)> {
        self.stalls.lock().clone()
    }
}

impl WatchdogListener for RecordingListener {
    fn com_channel_died(&self, client: &ClientInfo) {
        self.died.lock().push(client.clone());
    }

    fn com_queue_watchdog(&self, client: &ClientInfo, stall: &QueueStall) {
        self.stalls.lock().push((client.clone(), stall.clone()));
    }
}

/// Encoded REGISTER_CC_EVENTS for `events`.
pub fn register(events: &[EventId]) -> Buffer {
    AdminMessage::RegisterCcEvents(Registration::new("test", events.to_vec())).encode()
}

/// Encoded DEREGISTER_CC_EVENTS for `events`.
pub fn deregister(events: &[EventId]) -> Buffer {
    AdminMessage::DeregisterCcEvents(Registration::new("test", events.to_vec())).encode()
}

/// Encoded HELO carrying `name`.
pub fn helo(name: &str) -> Buffer {
    AdminMessage::Helo {
        name: name.to_string(),
    }
    .encode()
}

/// Plain event with an empty body.
pub fn event(id: EventId) -> Buffer {
    Buffer::event(id, &[])
}
