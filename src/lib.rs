//! commgr - Communication Manager
//!
//! An inter-process event broker. Processes connect over TCP, Unix-domain
//! sockets or an in-process native channel, declare interest in 32-bit
//! event IDs and exchange events without knowing their receivers.
//! Managers chain into a tree so events cross machine boundaries.

pub mod backend;
pub mod buffer;
pub mod client;
pub mod config;
pub mod manager;
pub mod protocol;
pub mod transport;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use buffer::{Buffer, BufferMut};
pub use client::{ClientLink, ClientOrigin, LinkKind};
pub use manager::{ClientId, ClientInfo, CommManager, ManagerConfig, ManagerError, WatchdogListener};
pub use protocol::{AdminMessage, EventId};
