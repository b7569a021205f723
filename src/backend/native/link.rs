//! Outbound half of a native-channel client.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::backend::socket::HEADER_LEN;
use crate::buffer::Buffer;
use crate::client::{ClientLink, LinkKind};

use super::channel::{Coid, Reply, Scoid};

struct PendingReceive {
    max_len: usize,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct LinkState {
    queue: VecDeque<Buffer>,
    pending: Option<PendingReceive>,
}

/// Queue plus at most one blocked receive.
///
/// `push_message` answers a blocked receive directly; otherwise the
/// buffer waits in the queue for the next receive request.
pub(crate) struct NativeLink {
    scoid: Scoid,
    coid: Coid,
    state: Mutex<LinkState>,
}

/// Reply bytes for `msg`: length prefix then payload.
fn encode(msg: &Buffer) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + msg.len());
    out.extend_from_slice(&(msg.len() as u32).to_ne_bytes());
    out.extend_from_slice(msg.payload());
    out
}

fn required(msg: &Buffer) -> usize {
    HEADER_LEN + msg.len()
}

impl NativeLink {
    pub(crate) fn new(scoid: Scoid, coid: Coid) -> Self {
        Self {
            scoid,
            coid,
            state: Mutex::new(LinkState::default()),
        }
    }

    /// Handle a receive request: reply now if something is queued,
    /// otherwise park it.
    pub(crate) fn receive(&self, max_len: usize, reply: oneshot::Sender<Reply>) {
        let mut state = self.state.lock();

        if let Some(front) = state.queue.front() {
            if required(front) > max_len {
                let _ = reply.send(Reply::TooSmall(required(front)));
                return;
            }
            if let Some(msg) = state.queue.pop_front() {
                if let Err(Reply::Data(_)) = reply.send(Reply::Data(encode(&msg))) {
                    // Caller went away; keep the message for the next receive.
                    state.queue.push_front(msg);
                }
            }
            return;
        }

        if let Some(previous) = state.pending.replace(PendingReceive { max_len, reply }) {
            let _ = previous.reply.send(Reply::Interrupted);
        }
    }

    /// Abandon a parked receive.
    pub(crate) fn unblock(&self) {
        if let Some(pending) = self.state.lock().pending.take() {
            let _ = pending.reply.send(Reply::Interrupted);
        }
    }

    /// Buffers waiting for a receive.
    pub(crate) fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl ClientLink for NativeLink {
    fn push_message(&self, msg: &Buffer) {
        let mut state = self.state.lock();

        if state.queue.is_empty() {
            if let Some(pending) = state.pending.take() {
                if required(msg) > pending.max_len {
                    let _ = pending.reply.send(Reply::TooSmall(required(msg)));
                } else if pending.reply.send(Reply::Data(encode(msg))).is_ok() {
                    return;
                }
            }
        }
        state.queue.push_back(msg.clone());
    }

    fn kind(&self) -> LinkKind {
        LinkKind::NativeChannel
    }

    fn peer(&self) -> String {
        format!("native:{}/{}", self.scoid, self.coid)
    }
}
