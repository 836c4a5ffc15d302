//! Wire protocol implementation for backhaul.
//!
//! Every frame on a multiplexed link starts with a big-endian connection id.
//! Two variants exist:
//!
//! - Sentinel: `id:u32 ++ payload`. One socket read is one frame.
//! - Length-prefixed: `id:u32 ++ len:i32 ++ payload[len]`. Frames may be split
//!   across reads or packed several to a read.
//!
//! In both variants a payload equal to [`CLOSE_LITERAL`] signals that the
//! logical connection is closed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use thiserror::Error;

/// Payload that signals a close instead of carrying data.
pub const CLOSE_LITERAL: &[u8] = b"__close";

/// First byte the server writes on a pooled link once it is paired with a
/// requester. Everything after it is raw connection data.
pub const PAIRED_SIGNAL: u8 = 0x01;

/// Size of the connection id header field.
pub const ID_SIZE: usize = 4;

/// Size of the full length-prefixed header (id + length).
pub const LENGTH_PREFIXED_HEADER_SIZE: usize = 8;

/// Largest payload a length-prefixed frame may announce (16MB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Protocol error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A sentinel chunk was too short to carry an id. The chunk is dropped.
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// A length-prefixed header announced an impossible length.
    #[error("invalid frame length: {0}")]
    InvalidLength(i64),
}

impl ProtocolError {
    /// Returns true if the decoder can no longer find frame boundaries and the
    /// link has to be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::InvalidLength(_))
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Frame layout used on a multiplexed link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Framing {
    /// `id ++ payload`, one read per frame (legacy peers).
    Sentinel,
    /// `id ++ length ++ payload`.
    #[default]
    LengthPrefixed,
}

/// Content of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Bytes belonging to the logical connection.
    Data(Bytes),
    /// The peer closed or errored; tear the connection down.
    Close,
}

impl Payload {
    /// Interprets raw payload bytes as they appear on the wire.
    pub fn from_wire(bytes: Bytes) -> Self {
        if bytes[..] == *CLOSE_LITERAL {
            Payload::Close
        } else {
            Payload::Data(bytes)
        }
    }

    /// Returns true for the close marker.
    pub fn is_close(&self) -> bool {
        matches!(self, Payload::Close)
    }
}

/// One frame on a multiplexed link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Logical connection id.
    pub id: u32,
    /// Data or close marker.
    pub payload: Payload,
}

impl Frame {
    /// Creates a data frame.
    pub fn data(id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: Payload::Data(data.into()),
        }
    }

    /// Creates a close frame.
    pub fn close(id: u32) -> Self {
        Self {
            id,
            payload: Payload::Close,
        }
    }

    /// Encode this frame to a byte buffer.
    ///
    /// With length-prefixed framing, data that is byte-for-byte equal to the
    /// close literal is written as two frames so the peer cannot mistake it
    /// for a close. Data above [`MAX_FRAME_LEN`] is split the same way.
    ///
    /// Sentinel framing has no frame boundaries inside one read, so it always
    /// writes exactly one frame. A sentinel peer reads data equal to the close
    /// literal as a close.
    pub fn encode(&self, framing: Framing, buf: &mut BytesMut) {
        match &self.payload {
            Payload::Close => put_frame(framing, self.id, CLOSE_LITERAL, buf),
            Payload::Data(data) if framing == Framing::Sentinel => {
                put_frame(framing, self.id, data, buf)
            }
            Payload::Data(data) if data[..] == *CLOSE_LITERAL => {
                let (head, tail) = data.split_at(CLOSE_LITERAL.len() - 2);
                put_frame(framing, self.id, head, buf);
                put_frame(framing, self.id, tail, buf);
            }
            Payload::Data(data) if data.is_empty() => put_frame(framing, self.id, &[], buf),
            Payload::Data(data) => {
                for chunk in data.chunks(MAX_FRAME_LEN) {
                    put_frame(framing, self.id, chunk, buf);
                }
            }
        }
    }

    /// Encodes this frame into a fresh buffer.
    pub fn to_bytes(&self, framing: Framing) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(framing, &mut buf);
        buf.freeze()
    }
}

fn put_frame(framing: Framing, id: u32, payload: &[u8], buf: &mut BytesMut) {
    match framing {
        Framing::Sentinel => buf.reserve(ID_SIZE + payload.len()),
        Framing::LengthPrefixed => buf.reserve(LENGTH_PREFIXED_HEADER_SIZE + payload.len()),
    }
    buf.put_u32(id);
    if framing == Framing::LengthPrefixed {
        buf.put_u32(payload.len() as u32);
    }
    buf.put_slice(payload);
}

/// Incremental frame decoder for one physical link.
///
/// Feed it whatever the socket returned with [`FrameDecoder::extend`], then
/// pull frames with [`FrameDecoder::next_frame`] until it yields `None`.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    /// Unparsed bytes (length-prefixed variant).
    buffer: BytesMut,
    /// Unparsed reads (sentinel variant).
    chunks: VecDeque<Bytes>,
}

impl FrameDecoder {
    /// Creates an empty decoder for the given framing.
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: BytesMut::new(),
            chunks: VecDeque::new(),
        }
    }

    /// Returns the framing this decoder parses.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Appends one socket read.
    pub fn extend(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        match self.framing {
            Framing::Sentinel => self.chunks.push_back(chunk),
            Framing::LengthPrefixed => self.buffer.extend_from_slice(&chunk),
        }
    }

    /// Decode the next complete frame.
    ///
    /// Returns `Ok(None)` if there isn't enough data yet. A non-fatal error
    /// means one chunk was discarded and decoding may continue.
    pub fn next_frame(&mut self) -> ProtocolResult<Option<Frame>> {
        match self.framing {
            Framing::Sentinel => self.next_sentinel(),
            Framing::LengthPrefixed => self.next_length_prefixed(),
        }
    }

    /// Returns the number of bytes held back waiting for the rest of a frame.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len() + self.chunks.iter().map(Bytes::len).sum::<usize>()
    }

    fn next_sentinel(&mut self) -> ProtocolResult<Option<Frame>> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Ok(None);
        };
        if chunk.len() < ID_SIZE {
            return Err(ProtocolError::FrameTooShort(chunk.len()));
        }
        let id = chunk.get_u32();
        Ok(Some(Frame {
            id,
            payload: Payload::from_wire(chunk),
        }))
    }

    fn next_length_prefixed(&mut self) -> ProtocolResult<Option<Frame>> {
        if self.buffer.len() < LENGTH_PREFIXED_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &self.buffer[..LENGTH_PREFIXED_HEADER_SIZE];
        let id = header.get_u32();
        let length = header.get_i32();
        if length < 0 || length as usize > MAX_FRAME_LEN {
            return Err(ProtocolError::InvalidLength(length as i64));
        }

        let total = LENGTH_PREFIXED_HEADER_SIZE + length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total);
        frame.advance(LENGTH_PREFIXED_HEADER_SIZE);
        Ok(Some(Frame {
            id,
            payload: Payload::from_wire(frame.freeze()),
        }))
    }
}
