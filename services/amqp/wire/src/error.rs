//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
///
/// Every variant except [`WireError::ShortStringTooLong`], [`WireError::ValueTooLong`],
/// [`WireError::ArgumentType`], [`WireError::FrameTooLarge`] and
/// [`WireError::FrameMaxUnnegotiated`] describes
/// inbound data the peer got wrong. Those are unrecoverable for the connection because
/// frame boundaries can no longer be trusted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame did not end with the frame-end octet
    #[error("malformed frame: expected frame end 0xCE, found {0:#04x}")]
    MalformedFrame(u8),

    /// Buffer ended before the value was complete
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the value being read
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Unknown frame type octet
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// Unknown field-table value tag
    #[error("unknown field tag {0:?}")]
    UnknownFieldTag(char),

    /// No argument template for the class/method pair
    #[error("unknown method {class_id}.{method_id}")]
    UnknownMethod {
        /// Protocol class id
        class_id: u16,
        /// Method id within the class
        method_id: u16,
    },

    /// Short strings are limited to 255 bytes
    #[error("short string too long: {0} bytes (max 255)")]
    ShortStringTooLong(usize),

    /// Long strings, arrays and tables are limited by their 32-bit length prefix
    #[error("value of {0} bytes does not fit a 32-bit length prefix")]
    ValueTooLong(usize),

    /// String field was not valid UTF-8
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// Argument value does not match the template type
    #[error("argument {name} expects {expected}")]
    ArgumentType {
        /// Template argument name
        name: &'static str,
        /// Expected argument type
        expected: &'static str,
    },

    /// Encoded frame exceeds the negotiated frame_max
    #[error("frame of {size} bytes exceeds frame_max {max}")]
    FrameTooLarge {
        /// Encoded frame size
        size: usize,
        /// Negotiated maximum
        max: u32,
    },

    /// A body was sent before frame_max was negotiated
    #[error("frame_max not negotiated, cannot split a {0} byte body")]
    FrameMaxUnnegotiated(usize),

    /// Property flags carry bits this codec does not understand
    #[error("unsupported property flags {0:#06x}")]
    UnsupportedPropertyFlags(u16),

    /// Frame arrived in a state that does not accept it
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl WireError {
    pub(crate) fn truncated(needed: usize, available: usize) -> Self {
        WireError::Truncated { needed, available }
    }
}
