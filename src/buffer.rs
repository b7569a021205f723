//! Reference-counted message buffer.
//!
//! A `Buffer` is the unit of zero-copy fan-out: the router hands the same
//! buffer to every subscribed client, each client queue holds its own
//! reference, and the payload is freed when the last holder drops it.
//!
//! Buffers are built in two phases. `Buffer::alloc` returns a `BufferMut`
//! that is filled exactly once, then frozen into an immutable `Buffer`.
//! Only the reference count changes after that point.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::protocol::EventId;

/// Round a payload length up to the next 4-byte boundary.
pub const fn round_up4(len: usize) -> usize {
    (len + 3) & !3
}

/// Immutable, atomically reference-counted payload.
///
/// The header (length, timestamp) lives in the handle; the payload storage
/// is one shared allocation of `round_up4(len)` bytes. `Clone` takes a
/// reference, `Drop` releases it.
#[derive(Clone)]
pub struct Buffer {
    timestamp: DateTime<Utc>,
    len: usize,
    data: Arc<[u8]>,
}

/// A buffer that has been allocated but not yet shared.
pub struct BufferMut {
    timestamp: DateTime<Utc>,
    len: usize,
    data: Arc<[u8]>,
    cursor: usize,
}

impl Buffer {
    /// Allocate a buffer for `len` payload bytes.
    pub fn alloc(len: usize) -> BufferMut {
        BufferMut {
            timestamp: Utc::now(),
            len,
            // Sized iterator: collected straight into the Arc allocation.
            data: std::iter::repeat(0u8).take(round_up4(len)).collect(),
            cursor: 0,
        }
    }

    /// Allocate and fill a buffer from a complete payload.
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut buf = Self::alloc(payload.len());
        buf.fill(payload);
        buf.freeze()
    }

    /// Build an event payload: the event ID followed by `body`.
    pub fn event(id: EventId, body: &[u8]) -> Self {
        let mut buf = Self::alloc(4 + body.len());
        buf.fill(&id.to_ne_bytes());
        buf.fill(body);
        buf.freeze()
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Declared payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated capacity (payload length rounded up to 4 bytes).
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Time at which the buffer was allocated.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Event ID carried in the first four payload bytes.
    ///
    /// Returns `None` for payloads too short to carry one.
    pub fn event_id(&self) -> Option<EventId> {
        let bytes = self.payload().get(..4)?;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Payload after the event ID.
    pub fn body(&self) -> &[u8] {
        self.payload().get(4..).unwrap_or(&[])
    }

    /// Number of live references to this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("event_id", &self.event_id().map(|id| format!("{:#010x}", id)))
            .field("len", &self.len)
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl BufferMut {
    /// Copy as much of `data` as fits after the cursor.
    ///
    /// Returns the number of bytes actually copied.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        // Unshared until `freeze`.
        let Some(storage) = Arc::get_mut(&mut self.data) else {
            return 0;
        };
        storage[self.cursor..self.cursor + n].copy_from_slice(&data[..n]);
        self.cursor += n;
        n
    }

    /// Bytes still to be filled.
    pub fn remaining(&self) -> usize {
        self.len - self.cursor
    }

    /// Declared payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Publish the buffer. The payload is immutable from here on.
    pub fn freeze(self) -> Buffer {
        Buffer {
            timestamp: self.timestamp,
            len: self.len,
            data: self.data,
        }
    }
}
