//! Frame-level codec: splits a byte stream into tagged frames and back.
//!
//! Frame layout: `u8 tag | u32 length | payload`. The length is big-endian
//! and counts itself (4 bytes) plus the payload, but not the tag, so a
//! frame occupies `1 + length` bytes on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::{Error, FrameError};

/// Default cap on a single frame, matching the configured maximum message
/// size of the server (256 MiB).
pub const DEFAULT_MAX_FRAME: u32 = 256 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// One complete wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: u8, payload: impl Into<Bytes>) -> Frame {
        Frame {
            kind,
            payload: payload.into(),
        }
    }

    /// Serialize this frame, header included.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind);
        buf.put_u32(self.payload.len() as u32 + 4);
        buf.put_slice(&self.payload);
    }
}

/// Incremental decoder with partial-read buffering.
///
/// Feed raw chunks with [`FrameDecoder::extend`], then drain complete frames
/// with [`FrameDecoder::next_frame`]; a chunk may yield zero or more frames.
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame: u32,
}

impl FrameDecoder {
    pub fn new(max_frame: u32) -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::with_capacity(8192),
            max_frame,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let declared = u32::from_be_bytes(self.buf[1..5].try_into().unwrap());
        if declared < 4 || declared > self.max_frame {
            return Err(FrameError::BadFrame {
                len: declared,
                max: self.max_frame,
            });
        }
        let total = 1 + declared as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let kind = self.buf[0];
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(declared as usize - 4).freeze();
        Ok(Some(Frame { kind, payload }))
    }

    /// Called when the peer closes the stream: leftover bytes mean the
    /// stream died mid-frame.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Truncated)
        }
    }
}

/// Read the next frame from `stream`, buffering through `decoder`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<S>(stream: &mut S, decoder: &mut FrameDecoder) -> Result<Option<Frame>, Error>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(Some(frame));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            decoder.finish()?;
            return Ok(None);
        }
        decoder.extend(&chunk[..n]);
    }
}
