//! Length-prefixed framing.
//!
//! Each frame is a native-endian `u32` payload length followed by the
//! payload. The payload itself starts with the event ID.

use std::io::{self, IoSlice};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::buffer::Buffer;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Minimum spare capacity kept in the read buffer.
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}

/// Incremental frame extractor.
///
/// Callers read into `read_buf()` and then drain `next_frame()` until it
/// returns `None`.
pub(crate) struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub(crate) fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_len,
        }
    }

    /// Buffer to read into, with room for at least the rest of the
    /// current frame.
    pub(crate) fn read_buf(&mut self) -> &mut BytesMut {
        let wanted = match self.pending_len() {
            Some(len) if len <= self.max_frame_len => (HEADER_LEN + len).saturating_sub(self.buf.len()),
            _ => 0,
        };
        self.buf.reserve(wanted.max(READ_CHUNK));
        &mut self.buf
    }

    fn pending_len(&self) -> Option<usize> {
        let header = self.buf.get(..HEADER_LEN)?;
        Some(u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize)
    }

    /// Next complete frame, if one is buffered.
    ///
    /// Frames too short to carry an event ID are skipped.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Buffer>, FrameError> {
        loop {
            let Some(len) = self.pending_len() else {
                return Ok(None);
            };
            if len > self.max_frame_len {
                return Err(FrameError::TooLarge {
                    len,
                    max: self.max_frame_len,
                });
            }
            if self.buf.len() < HEADER_LEN + len {
                return Ok(None);
            }

            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(len);
            if len < HEADER_LEN {
                debug!(len, "Skipping frame without event id");
                continue;
            }
            return Ok(Some(Buffer::from_payload(&payload)));
        }
    }

    /// Bytes buffered but not yet returned as frames.
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Write `frames` with as few syscalls as the stream allows, resuming
/// after partial writes.
pub(crate) async fn write_frames<W>(writer: &mut W, frames: &[Buffer]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let headers: Vec<[u8; HEADER_LEN]> = frames
        .iter()
        .map(|b| (b.len() as u32).to_ne_bytes())
        .collect();
    let parts: Vec<&[u8]> = headers
        .iter()
        .zip(frames)
        .flat_map(|(h, b)| [&h[..], b.payload()])
        .collect();

    let mut index = 0;
    let mut offset = 0;
    loop {
        while index < parts.len() && offset == parts[index].len() {
            index += 1;
            offset = 0;
        }
        if index == parts.len() {
            break;
        }

        let slices: Vec<IoSlice<'_>> = std::iter::once(&parts[index][offset..])
            .chain(parts[index + 1..].iter().copied())
            .map(IoSlice::new)
            .collect();
        let mut written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        while written > 0 {
            let left = parts[index].len() - offset;
            if written >= left {
                written -= left;
                index += 1;
                offset = 0;
            } else {
                offset += written;
                written = 0;
            }
        }
    }
    writer.flush().await
}
