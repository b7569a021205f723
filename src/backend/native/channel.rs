//! Peer side of the native channel.
//!
//! A process first `connect`s to the channel, which gives it a
//! process-level id (`scoid`). Each `open` on that process yields a
//! connection with its own `coid`; the backend keys clients by the pair.
//! Requests are synchronous: the caller waits for the backend's reply.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::backend::{BackendError, Result};

/// Process-level connection id.
pub type Scoid = u32;
/// Per-connection id within a process.
pub type Coid = u32;

/// Asynchronous notifications that carry no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pulse {
    /// Every connection of the process is gone.
    Disconnect { scoid: Scoid },
    /// One connection was dropped.
    Close { scoid: Scoid, coid: Coid },
    /// A blocked receive was abandoned.
    Unblock { scoid: Scoid, coid: Coid },
}

/// Reply to a synchronous request.
#[derive(Debug)]
pub(crate) enum Reply {
    Ok,
    /// Native-endian `u32` length followed by the payload.
    Data(Vec<u8>),
    /// Caller's buffer is too small; this many bytes are needed.
    TooSmall(usize),
    Interrupted,
    UnknownConnection,
}

pub(crate) enum Request {
    Connect {
        scoid: Scoid,
        coid: Coid,
        pid: u32,
        reply: oneshot::Sender<Reply>,
    },
    Send {
        scoid: Scoid,
        coid: Coid,
        payload: Vec<u8>,
        reply: oneshot::Sender<Reply>,
    },
    Receive {
        scoid: Scoid,
        coid: Coid,
        max_len: usize,
        reply: oneshot::Sender<Reply>,
    },
    Pulse(Pulse),
    Shutdown,
}

/// Outcome of `NativeConnection::receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Native-endian `u32` length followed by the payload.
    Data(Vec<u8>),
    /// Nothing was consumed; retry with at least this many bytes.
    TooSmall(usize),
    /// The receive was unblocked before data arrived.
    Interrupted,
}

impl Received {
    /// Payload of a `Data` reply, without the length prefix.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Data(bytes) => bytes.get(4..),
            _ => None,
        }
    }
}

/// Handle peers use to reach a native-channel backend.
#[derive(Clone)]
pub struct NativeChannel {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Request>,
    next_scoid: Arc<AtomicU32>,
}

impl NativeChannel {
    pub(crate) fn new(name: &str, tx: mpsc::UnboundedSender<Request>) -> Self {
        Self {
            name: Arc::from(name),
            tx,
            next_scoid: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Name the backend is attached under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a process to the channel.
    pub fn connect(&self, pid: u32) -> NativeProcess {
        let scoid = self.next_scoid.fetch_add(1, Ordering::Relaxed);
        NativeProcess {
            inner: Arc::new(ProcessInner {
                channel: self.clone(),
                scoid,
                pid,
                next_coid: AtomicU32::new(1),
                exited: AtomicBool::new(false),
            }),
        }
    }

    /// Attach the calling process.
    #[cfg(unix)]
    pub fn connect_current(&self) -> NativeProcess {
        let pid = nix::unistd::getpid().as_raw();
        self.connect(u32::try_from(pid).unwrap_or_default())
    }

    fn post(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| BackendError::ChannelClosed(self.name.to_string()))
    }

    async fn call(&self, request: Request, reply: oneshot::Receiver<Reply>) -> Result<Reply> {
        self.post(request)?;
        reply
            .await
            .map_err(|_| BackendError::ChannelClosed(self.name.to_string()))
    }
}

struct ProcessInner {
    channel: NativeChannel,
    scoid: Scoid,
    pid: u32,
    next_coid: AtomicU32,
    /// Set once the disconnect pulse has been posted.
    exited: AtomicBool,
}

impl ProcessInner {
    fn disconnect(&self) {
        if !self.exited.swap(true, Ordering::AcqRel) {
            let _ = self.channel.post(Request::Pulse(Pulse::Disconnect { scoid: self.scoid }));
        }
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A process attached to the channel.
///
/// Dropping connections closes them one at a time. `exit` models the
/// process dying with connections still open: the backend drops every
/// client of the process in one pass.
pub struct NativeProcess {
    inner: Arc<ProcessInner>,
}

impl NativeProcess {
    pub fn scoid(&self) -> Scoid {
        self.inner.scoid
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Terminate the process. Its open connections stay in the caller's
    /// hands but are dead: the backend scrubs them all on one disconnect
    /// pulse, and dropping them later sends nothing.
    pub fn exit(self) {
        self.inner.disconnect();
    }

    /// Open a new connection; registers one client with the manager.
    pub async fn open(&self) -> Result<NativeConnection> {
        let coid = self.inner.next_coid.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        let reply = self
            .inner
            .channel
            .call(
                Request::Connect {
                    scoid: self.inner.scoid,
                    coid,
                    pid: self.inner.pid,
                    reply: reply_tx,
                },
                reply_rx,
            )
            .await?;

        match reply {
            Reply::Ok => Ok(NativeConnection {
                process: self.inner.clone(),
                coid,
            }),
            _ => Err(BackendError::ChannelClosed(self.inner.channel.name.to_string())),
        }
    }
}

/// One client connection over the native channel.
pub struct NativeConnection {
    process: Arc<ProcessInner>,
    coid: Coid,
}

impl NativeConnection {
    pub fn coid(&self) -> Coid {
        self.coid
    }

    pub fn scoid(&self) -> Scoid {
        self.process.scoid
    }

    /// Send one payload (event ID first). Returns once the backend has
    /// copied it.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let reply = self
            .process
            .channel
            .call(
                Request::Send {
                    scoid: self.process.scoid,
                    coid: self.coid,
                    payload: payload.to_vec(),
                    reply: reply_tx,
                },
                reply_rx,
            )
            .await?;

        match reply {
            Reply::Ok => Ok(()),
            _ => Err(self.closed()),
        }
    }

    /// Wait for the next queued message.
    ///
    /// `max_len` is the caller's buffer size; the reply needs room for the
    /// length prefix as well as the payload. Dropping the future unblocks
    /// the pending receive on the backend side.
    pub async fn receive(&self, max_len: usize) -> Result<Received> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.process.channel.post(Request::Receive {
            scoid: self.process.scoid,
            coid: self.coid,
            max_len,
            reply: reply_tx,
        })?;

        let mut guard = UnblockOnDrop {
            connection: self,
            armed: true,
        };
        let reply = reply_rx.await;
        guard.armed = false;

        match reply.map_err(|_| self.closed())? {
            Reply::Data(bytes) => Ok(Received::Data(bytes)),
            Reply::TooSmall(required) => Ok(Received::TooSmall(required)),
            Reply::Interrupted => Ok(Received::Interrupted),
            Reply::Ok | Reply::UnknownConnection => Err(self.closed()),
        }
    }

    /// Interrupt a receive blocked on this connection.
    pub fn unblock(&self) -> Result<()> {
        self.pulse(Pulse::Unblock {
            scoid: self.process.scoid,
            coid: self.coid,
        })
    }

    fn pulse(&self, pulse: Pulse) -> Result<()> {
        self.process.channel.post(Request::Pulse(pulse))
    }

    fn closed(&self) -> BackendError {
        BackendError::ChannelClosed(self.process.channel.name.to_string())
    }
}

impl Drop for NativeConnection {
    fn drop(&mut self) {
        if self.process.has_exited() {
            return;
        }
        let _ = self.pulse(Pulse::Close {
            scoid: self.process.scoid,
            coid: self.coid,
        });
    }
}

struct UnblockOnDrop<'a> {
    connection: &'a NativeConnection,
    armed: bool,
}

impl Drop for UnblockOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.connection.unblock();
        }
    }
}
