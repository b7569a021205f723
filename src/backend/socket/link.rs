//! Per-connection tasks of the socket backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::client::{ClientLink, ClientOrigin, LinkKind};
use crate::manager::{ClientId, CommManager};
use crate::transport::Connection;

use super::frame::{write_frames, FrameDecoder};
use super::SocketConfig;

/// Outbound half of a socket client: a bounded queue drained by the
/// connection's writer task.
///
/// A peer that lets the queue fill up is reported on the closed queue once
/// and torn down by the backend.
pub(crate) struct SocketLink {
    tx: mpsc::Sender<Buffer>,
    peer: String,
    kind: LinkKind,
    id: OnceLock<ClientId>,
    closed: mpsc::UnboundedSender<ClientId>,
    overflowed: AtomicBool,
}

impl SocketLink {
    fn new(
        tx: mpsc::Sender<Buffer>,
        peer: String,
        kind: LinkKind,
        closed: mpsc::UnboundedSender<ClientId>,
    ) -> Self {
        Self {
            tx,
            peer,
            kind,
            id: OnceLock::new(),
            closed,
            overflowed: AtomicBool::new(false),
        }
    }

    fn overflow(&self) {
        if self.overflowed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.id.get() {
            Some(id) => {
                warn!(client = %id, peer = %self.peer, "Outbound queue full, dropping slow peer");
                let _ = self.closed.send(*id);
            }
            None => warn!(peer = %self.peer, "Outbound queue full before registration"),
        }
    }
}

impl ClientLink for SocketLink {
    fn push_message(&self, msg: &Buffer) {
        match self.tx.try_send(msg.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.overflow(),
            // Writer gone; the clone is dropped here.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn kind(&self) -> LinkKind {
        self.kind
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Reader and writer tasks of one registered connection.
pub(crate) struct SocketConnection {
    pub(crate) id: ClientId,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SocketConnection {
    /// Stop both tasks and wait for them.
    pub(crate) async fn close(self) {
        self.reader.abort();
        self.writer.abort();
        let _ = futures::future::join(self.reader, self.writer).await;
    }
}

/// Register `conn` with the manager and start its tasks.
///
/// Either task reports the client id on `closed` when the connection
/// fails; the owner deregisters it.
pub(crate) fn attach(
    manager: &Arc<CommManager>,
    conn: Connection,
    origin: ClientOrigin,
    kind: LinkKind,
    config: &SocketConfig,
    closed: mpsc::UnboundedSender<ClientId>,
) -> SocketConnection {
    let (read_half, write_half) = tokio::io::split(conn.stream);
    let (tx, rx) = mpsc::channel(config.max_queue.max(1));

    let link = Arc::new(SocketLink::new(tx, conn.peer, kind, closed.clone()));
    let id = manager.register_client(link.clone(), origin);
    let _ = link.id.set(id);

    let reader = tokio::spawn(read_loop(
        manager.clone(),
        id,
        read_half,
        config.max_frame_len,
        closed.clone(),
    ));
    let writer = tokio::spawn(write_loop(id, write_half, rx, config.write_batch.max(1), closed));

    SocketConnection { id, reader, writer }
}

async fn read_loop<R>(
    manager: Arc<CommManager>,
    id: ClientId,
    mut reader: R,
    max_frame_len: usize,
    closed: mpsc::UnboundedSender<ClientId>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(max_frame_len);

    'read: loop {
        match reader.read_buf(decoder.read_buf()).await {
            Ok(0) => {
                debug!(client = %id, "Peer closed connection");
                break;
            }
            Ok(n) => trace!(client = %id, bytes = n, "Read"),
            Err(e) => {
                debug!(client = %id, error = %e, "Read failed");
                break;
            }
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(msg)) => manager.dispatch_message(id, msg),
                Ok(None) => break,
                Err(e) => {
                    warn!(client = %id, error = %e, "Dropping connection");
                    break 'read;
                }
            }
        }
    }

    let _ = closed.send(id);
}

async fn write_loop<W>(
    id: ClientId,
    mut writer: W,
    mut rx: mpsc::Receiver<Buffer>,
    batch: usize,
    closed: mpsc::UnboundedSender<ClientId>,
) where
    W: AsyncWrite + Unpin,
{
    let mut pending: Vec<Buffer> = Vec::with_capacity(batch);

    while let Some(first) = rx.recv().await {
        pending.push(first);
        while pending.len() < batch {
            match rx.try_recv() {
                Ok(msg) => pending.push(msg),
                Err(_) => break,
            }
        }

        if let Err(e) = write_frames(&mut writer, &pending).await {
            debug!(client = %id, error = %e, "Write failed");
            let _ = closed.send(id);
            return;
        }
        trace!(client = %id, frames = pending.len(), "Wrote batch");
        pending.clear();
    }

    // Queue closed: the client was deregistered.
    let _ = writer.shutdown().await;
}
