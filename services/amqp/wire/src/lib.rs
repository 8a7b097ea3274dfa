//! AMQP 0-9-1 wire protocol: field tables, frames and command assembly.
//!
//! This crate is pure encoding/decoding with no I/O. The session layer feeds socket
//! bytes into a [`FrameDecoder`], runs each channel's frames through a
//! [`CommandAssembler`], and writes outbound [`Command`]s with a [`CommandWriter`].
//!
//! ## Features
//!
//! - **Field Tables**: every AMQP value tag, nested tables and arrays, two-pass sizing
//! - **Packed Bits**: consecutive bit arguments share one octet, LSB first
//! - **Streaming Decode**: frames are recovered from arbitrarily chunked input
//! - **Command Assembly**: method, header and body frames glued into one unit
//! - **Zero-Copy Bodies**: body frames are `Bytes` slices of the outbound body
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u8 frame type        | 1 method, 2 header, 3 body,|
//! |                      | 8 heartbeat                |
//! +----------------------+----------------------------+
//! | u16 channel          | 0 for the connection       |
//! +----------------------+----------------------------+
//! | u32 payload_len      | length of the payload      |
//! +----------------------+----------------------------+
//! | payload              | method / header / body     |
//! +----------------------+----------------------------+
//! | u8 frame end         | always 0xCE                |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod content;
pub mod error;
pub mod field;
pub mod frame;
pub mod method;

// Re-export main types
pub use command::{AssemblerState, Command, CommandAssembler, CommandWriter};
pub use content::{
    BasicProperties, ContentHeader, PropertyFlags, DELIVERY_MODE_PERSISTENT,
    DELIVERY_MODE_TRANSIENT,
};
pub use error::WireError;
pub use field::{ArgType, FieldReader, FieldTable, FieldValue, FieldWriter, SHORT_STR_MAX};
pub use frame::{
    Frame, FrameDecoder, FrameType, FRAME_END, FRAME_HEADER_SIZE, FRAME_MIN_SIZE,
    FRAME_OVERHEAD, HEARTBEAT_FRAME, PROTOCOL_HEADER,
};
pub use method::{basic, channel, confirm, connection, exchange, has_content, queue, Method};
