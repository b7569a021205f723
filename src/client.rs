//! Transport side of a routing-table entry.
//!
//! The manager owns the routing state of every client (name, flags,
//! registrations, watchdog counters). The transport that actually moves
//! bytes to the peer is a `ClientLink`, supplied by the backend that
//! accepted the peer.

use std::fmt;

use crate::buffer::Buffer;

/// Transport kinds a client can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Byte-stream socket (TCP or Unix-domain).
    SocketStream,
    /// Synchronous native message-passing channel.
    NativeChannel,
    /// Connection to another communication manager.
    ManagerLink,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketStream => write!(f, "socket"),
            Self::NativeChannel => write!(f, "native"),
            Self::ManagerLink => write!(f, "manager"),
        }
    }
}

/// Outbound half of a connected peer.
///
/// `push_message` is called with the manager's lock held and must not
/// block: implementations queue the buffer (keeping their own reference)
/// or hand it straight to a waiting receiver. A link whose peer is gone
/// drops the buffer silently.
pub trait ClientLink: Send + Sync {
    /// Queue `msg` for delivery to the peer.
    fn push_message(&self, msg: &Buffer);

    /// Transport kind.
    fn kind(&self) -> LinkKind;

    /// Human-readable peer address for logs.
    fn peer(&self) -> String;
}

/// What the transport knows about a peer when it registers it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOrigin {
    /// Peer process id, when the transport can tell.
    pub pid: Option<u32>,
    /// True for links to other managers.
    pub is_manager: bool,
    /// Initial name. Defaults to `"unknown"` until HELO.
    pub name: Option<String>,
}

impl ClientOrigin {
    /// Origin of an ordinary peer with an optional pid.
    pub fn peer(pid: Option<u32>) -> Self {
        Self {
            pid,
            ..Default::default()
        }
    }

    /// Origin of a link to another manager.
    pub fn manager(name: impl Into<String>) -> Self {
        Self {
            pid: None,
            is_manager: true,
            name: Some(name.into()),
        }
    }
}
