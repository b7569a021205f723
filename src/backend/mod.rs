//! Transport backends.
//!
//! A backend accepts peers on some transport, wraps each one in a
//! `ClientLink`, registers it with the manager and feeds every inbound
//! frame to `CommManager::dispatch_message`. When a peer goes away the
//! backend deregisters it.
//!
//! Backends:
//! - `socket`: length-prefixed frames over TCP or Unix-domain sockets
//! - `native`: in-process synchronous message passing

pub mod native;
pub mod socket;

use async_trait::async_trait;

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors from backend setup and I/O.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("native channel '{0}' is closed")]
    ChannelClosed(String),
}

/// A running transport backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Stop accepting peers, disconnect every peer the backend owns and
    /// wait for its tasks to finish.
    async fn shutdown(&self);
}
