//! Frame envelope and the streaming frame decoder.
//!
//! ```text
//! +-----------+-------------+------------------+-----------+----------+
//! | type: u8  | channel: u16| payload_len: u32 | payload   | end: 0xCE|
//! +-----------+-------------+------------------+-----------+----------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::WireError;

/// Protocol header sent by the client before any frame
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// Octet terminating every frame
pub const FRAME_END: u8 = 206;

/// Type, channel and payload length
pub const FRAME_HEADER_SIZE: usize = 7;

/// Header plus end octet
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// Smallest frame_max a peer may negotiate
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Heartbeat frame on channel 0 with an empty payload
pub const HEARTBEAT_FRAME: [u8; 8] = [8, 0, 0, 0, 0, 0, 0, FRAME_END];

/// Frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Method frame
    Method = 1,
    /// Content header frame
    Header = 2,
    /// Content body frame
    Body = 3,
    /// Heartbeat frame
    Heartbeat = 8,
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Method),
            2 => Ok(FrameType::Header),
            3 => Ok(FrameType::Body),
            8 => Ok(FrameType::Heartbeat),
            _ => Err(WireError::UnknownFrameType(value)),
        }
    }
}

/// A single frame: type, channel and raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Channel number, 0 for connection-level frames
    pub channel: u16,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame
    pub fn new(frame_type: FrameType, channel: u16, payload: Bytes) -> Self {
        Self {
            frame_type,
            channel,
            payload,
        }
    }

    /// Heartbeat frame
    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat, 0, Bytes::new())
    }

    /// Total size on the wire
    pub fn encoded_size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Append the encoded frame to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(self.channel);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_u8(FRAME_END);
    }

    /// Append the encoded frame, refusing frames larger than `frame_max`.
    ///
    /// A `frame_max` of 0 means no limit has been negotiated.
    pub fn encode_limited(&self, buf: &mut BytesMut, frame_max: u32) -> Result<(), WireError> {
        let size = self.encoded_size();
        if frame_max != 0 && size > frame_max as usize {
            return Err(WireError::FrameTooLarge {
                size,
                max: frame_max,
            });
        }
        self.encode(buf);
        Ok(())
    }

    /// Decode one complete frame; `bytes` must hold exactly the frame
    pub fn decode(mut bytes: Bytes) -> Result<Frame, WireError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(WireError::truncated(FRAME_OVERHEAD, bytes.len()));
        }
        let frame_type = FrameType::try_from(bytes.get_u8())?;
        let channel = bytes.get_u16();
        let len = bytes.get_u32() as usize;
        if bytes.len() != len + 1 {
            return Err(WireError::truncated(len + 1, bytes.len()));
        }
        let payload = bytes.split_to(len);
        let end = bytes.get_u8();
        if end != FRAME_END {
            return Err(WireError::MalformedFrame(end));
        }
        Ok(Frame {
            frame_type,
            channel,
            payload,
        })
    }
}

/// Turns an unbounded byte stream into complete frames.
///
/// Bytes are buffered across calls, so the input may be split at any boundary:
/// one byte at a time, mid-header, or many frames per chunk.
///
/// Until [`set_frame_max`](Self::set_frame_max) is called with the tuned value,
/// frames are limited to [`FRAME_MIN_SIZE`].
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    frame_max: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            frame_max: FRAME_MIN_SIZE,
        }
    }
}

impl FrameDecoder {
    /// Create a decoder accepting frames up to [`FRAME_MIN_SIZE`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject inbound frames larger than `frame_max` (0 disables the check)
    pub fn set_frame_max(&mut self, frame_max: u32) {
        self.frame_max = frame_max;
    }

    /// Bytes buffered but not yet forming a complete frame
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Feed a chunk and collect every frame it completes
    pub fn extract(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, WireError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Pop the next complete frame from the buffered bytes
    pub fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len =
            u32::from_be_bytes([self.buf[3], self.buf[4], self.buf[5], self.buf[6]]) as usize;
        let frame_len = payload_len + FRAME_OVERHEAD;

        if self.frame_max != 0 && frame_len > self.frame_max as usize {
            return Err(WireError::FrameTooLarge {
                size: frame_len,
                max: self.frame_max,
            });
        }

        if self.buf.len() < frame_len {
            // Unlimited: grow only as bytes arrive
            if self.frame_max != 0 {
                self.buf.reserve(frame_len - self.buf.len());
            }
            return Ok(None);
        }

        let frame = Frame::decode(self.buf.split_to(frame_len).freeze())?;
        trace!(
            frame_type = ?frame.frame_type,
            channel = frame.channel,
            len = payload_len,
            "decoded frame"
        );
        Ok(Some(frame))
    }
}
