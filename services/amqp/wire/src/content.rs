//! Content header frames and basic message properties.
//!
//! ```text
//! +---------------+--------------+----------------+-------------+------------------+
//! | class_id: u16 | weight: u16  | body_size: u64 | flags: u16  | present props... |
//! +---------------+--------------+----------------+-------------+------------------+
//! ```
//!
//! Property presence is a bitmask with the first declared property in the most
//! significant bit. Bit 0 would announce a continuation flags word, which basic
//! properties never need.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::field::{FieldReader, FieldTable, FieldWriter};
use crate::frame::{Frame, FrameType};

bitflags! {
    /// Presence bits for [`BasicProperties`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyFlags: u16 {
        /// content-type
        const CONTENT_TYPE = 1 << 15;
        /// content-encoding
        const CONTENT_ENCODING = 1 << 14;
        /// headers
        const HEADERS = 1 << 13;
        /// delivery-mode
        const DELIVERY_MODE = 1 << 12;
        /// priority
        const PRIORITY = 1 << 11;
        /// correlation-id
        const CORRELATION_ID = 1 << 10;
        /// reply-to
        const REPLY_TO = 1 << 9;
        /// expiration
        const EXPIRATION = 1 << 8;
        /// message-id
        const MESSAGE_ID = 1 << 7;
        /// timestamp
        const TIMESTAMP = 1 << 6;
        /// type
        const TYPE = 1 << 5;
        /// user-id
        const USER_ID = 1 << 4;
        /// app-id
        const APP_ID = 1 << 3;
        /// cluster-id
        const CLUSTER_ID = 1 << 2;
    }
}

/// Delivery mode for transient messages
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
/// Delivery mode for persistent messages
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Optional message properties of the basic class
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    /// MIME content type
    pub content_type: Option<String>,
    /// MIME content encoding
    pub content_encoding: Option<String>,
    /// Application headers
    pub headers: Option<FieldTable>,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
    /// Priority 0..9
    pub priority: Option<u8>,
    /// Correlation identifier
    pub correlation_id: Option<String>,
    /// Reply queue
    pub reply_to: Option<String>,
    /// Expiration, milliseconds as a string
    pub expiration: Option<String>,
    /// Message identifier
    pub message_id: Option<String>,
    /// Seconds since the epoch
    pub timestamp: Option<u64>,
    /// Message type name
    pub kind: Option<String>,
    /// Creating user id
    pub user_id: Option<String>,
    /// Creating application id
    pub app_id: Option<String>,
    /// Reserved, must be empty
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    /// Set content-type
    pub fn with_content_type(mut self, v: impl Into<String>) -> Self {
        self.content_type = Some(v.into());
        self
    }

    /// Set content-encoding
    pub fn with_content_encoding(mut self, v: impl Into<String>) -> Self {
        self.content_encoding = Some(v.into());
        self
    }

    /// Set headers
    pub fn with_headers(mut self, v: FieldTable) -> Self {
        self.headers = Some(v);
        self
    }

    /// Set delivery-mode
    pub fn with_delivery_mode(mut self, v: u8) -> Self {
        self.delivery_mode = Some(v);
        self
    }

    /// Set priority
    pub fn with_priority(mut self, v: u8) -> Self {
        self.priority = Some(v);
        self
    }

    /// Set correlation-id
    pub fn with_correlation_id(mut self, v: impl Into<String>) -> Self {
        self.correlation_id = Some(v.into());
        self
    }

    /// Set reply-to
    pub fn with_reply_to(mut self, v: impl Into<String>) -> Self {
        self.reply_to = Some(v.into());
        self
    }

    /// Set expiration
    pub fn with_expiration(mut self, v: impl Into<String>) -> Self {
        self.expiration = Some(v.into());
        self
    }

    /// Set message-id
    pub fn with_message_id(mut self, v: impl Into<String>) -> Self {
        self.message_id = Some(v.into());
        self
    }

    /// Set timestamp
    pub fn with_timestamp(mut self, v: u64) -> Self {
        self.timestamp = Some(v);
        self
    }

    /// Set type
    pub fn with_kind(mut self, v: impl Into<String>) -> Self {
        self.kind = Some(v.into());
        self
    }

    /// Set user-id
    pub fn with_user_id(mut self, v: impl Into<String>) -> Self {
        self.user_id = Some(v.into());
        self
    }

    /// Set app-id
    pub fn with_app_id(mut self, v: impl Into<String>) -> Self {
        self.app_id = Some(v.into());
        self
    }

    /// Presence bits for the set properties
    pub fn flags(&self) -> PropertyFlags {
        let mut flags = PropertyFlags::empty();
        flags.set(PropertyFlags::CONTENT_TYPE, self.content_type.is_some());
        flags.set(PropertyFlags::CONTENT_ENCODING, self.content_encoding.is_some());
        flags.set(PropertyFlags::HEADERS, self.headers.is_some());
        flags.set(PropertyFlags::DELIVERY_MODE, self.delivery_mode.is_some());
        flags.set(PropertyFlags::PRIORITY, self.priority.is_some());
        flags.set(PropertyFlags::CORRELATION_ID, self.correlation_id.is_some());
        flags.set(PropertyFlags::REPLY_TO, self.reply_to.is_some());
        flags.set(PropertyFlags::EXPIRATION, self.expiration.is_some());
        flags.set(PropertyFlags::MESSAGE_ID, self.message_id.is_some());
        flags.set(PropertyFlags::TIMESTAMP, self.timestamp.is_some());
        flags.set(PropertyFlags::TYPE, self.kind.is_some());
        flags.set(PropertyFlags::USER_ID, self.user_id.is_some());
        flags.set(PropertyFlags::APP_ID, self.app_id.is_some());
        flags.set(PropertyFlags::CLUSTER_ID, self.cluster_id.is_some());
        flags
    }

    fn encode(&self, writer: &mut FieldWriter<'_>) -> Result<(), WireError> {
        let short = |w: &mut FieldWriter<'_>, v: &Option<String>| match v {
            Some(s) => w.write_short_str(s),
            None => Ok(()),
        };

        short(writer, &self.content_type)?;
        short(writer, &self.content_encoding)?;
        if let Some(headers) = &self.headers {
            writer.write_table(headers)?;
        }
        if let Some(v) = self.delivery_mode {
            writer.write_u8(v);
        }
        if let Some(v) = self.priority {
            writer.write_u8(v);
        }
        short(writer, &self.correlation_id)?;
        short(writer, &self.reply_to)?;
        short(writer, &self.expiration)?;
        short(writer, &self.message_id)?;
        if let Some(v) = self.timestamp {
            writer.write_u64(v);
        }
        short(writer, &self.kind)?;
        short(writer, &self.user_id)?;
        short(writer, &self.app_id)?;
        short(writer, &self.cluster_id)?;
        Ok(())
    }

    fn decode(flags: PropertyFlags, reader: &mut FieldReader) -> Result<Self, WireError> {
        let short = |flag: PropertyFlags, r: &mut FieldReader| -> Result<_, WireError> {
            if flags.contains(flag) {
                r.read_short_str().map(Some)
            } else {
                Ok(None)
            }
        };

        let mut props = BasicProperties {
            content_type: short(PropertyFlags::CONTENT_TYPE, reader)?,
            content_encoding: short(PropertyFlags::CONTENT_ENCODING, reader)?,
            ..Default::default()
        };
        if flags.contains(PropertyFlags::HEADERS) {
            props.headers = Some(reader.read_table()?);
        }
        if flags.contains(PropertyFlags::DELIVERY_MODE) {
            props.delivery_mode = Some(reader.read_u8()?);
        }
        if flags.contains(PropertyFlags::PRIORITY) {
            props.priority = Some(reader.read_u8()?);
        }
        props.correlation_id = short(PropertyFlags::CORRELATION_ID, reader)?;
        props.reply_to = short(PropertyFlags::REPLY_TO, reader)?;
        props.expiration = short(PropertyFlags::EXPIRATION, reader)?;
        props.message_id = short(PropertyFlags::MESSAGE_ID, reader)?;
        if flags.contains(PropertyFlags::TIMESTAMP) {
            props.timestamp = Some(reader.read_u64()?);
        }
        props.kind = short(PropertyFlags::TYPE, reader)?;
        props.user_id = short(PropertyFlags::USER_ID, reader)?;
        props.app_id = short(PropertyFlags::APP_ID, reader)?;
        props.cluster_id = short(PropertyFlags::CLUSTER_ID, reader)?;
        Ok(props)
    }
}

/// Content header: body size and properties of a content-bearing method
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentHeader {
    /// Class of the method carrying the content
    pub class_id: u16,
    /// Total body size across all body frames
    pub body_size: u64,
    /// Message properties
    pub properties: BasicProperties,
}

impl ContentHeader {
    /// Create a header
    pub fn new(class_id: u16, body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id,
            body_size,
            properties,
        }
    }

    /// Encode the header payload
    pub fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u16(self.class_id);
        buf.put_u16(0);
        buf.put_u64(self.body_size);
        buf.put_u16(self.properties.flags().bits());
        self.properties.encode(&mut FieldWriter::new(buf))
    }

    /// Decode a header payload
    pub fn decode_payload(payload: Bytes) -> Result<Self, WireError> {
        let mut reader = FieldReader::new(payload);
        let class_id = reader.read_u16()?;
        let _weight = reader.read_u16()?;
        let body_size = reader.read_u64()?;
        let raw = reader.read_u16()?;
        let flags = PropertyFlags::from_bits(raw).ok_or(WireError::UnsupportedPropertyFlags(raw))?;
        let properties = BasicProperties::decode(flags, &mut reader)?;
        Ok(Self {
            class_id,
            body_size,
            properties,
        })
    }

    /// Wrap the header in a frame for `channel`
    pub fn to_frame(&self, channel: u16) -> Result<Frame, WireError> {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload)?;
        Ok(Frame::new(FrameType::Header, channel, payload.freeze()))
    }

    /// Decode the header carried by a header frame
    pub fn from_frame(frame: &Frame) -> Result<Self, WireError> {
        if frame.frame_type != FrameType::Header {
            return Err(WireError::ProtocolViolation(format!(
                "expected header frame, got {:?}",
                frame.frame_type
            )));
        }
        Self::decode_payload(frame.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldValue;

    #[test]
    fn test_content_type_is_most_significant_bit() {
        let header = ContentHeader::new(
            60,
            13,
            BasicProperties::default().with_content_type("text/plain"),
        );
        let frame = header.to_frame(1).unwrap();
        assert_eq!(frame.frame_type, FrameType::Header);
        assert_eq!(&frame.payload[..14], &[0, 60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 13, 0x80, 0x00]);
        assert_eq!(&frame.payload[14..], b"\x0atext/plain");
    }

    #[test]
    fn test_flag_positions() {
        let props = BasicProperties {
            cluster_id: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(props.flags().bits(), 0x0004);

        let props = BasicProperties::default()
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_kind("order.created");
        assert_eq!(props.flags().bits(), (1 << 12) | (1 << 5));
    }

    #[test]
    fn test_all_properties_round_trip() {
        let props = BasicProperties {
            content_type: Some("application/json".into()),
            content_encoding: Some("utf-8".into()),
            headers: Some(FieldTable::new().with("x-retry", FieldValue::U8(3))),
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            priority: Some(5),
            correlation_id: Some("c-1".into()),
            reply_to: Some("amq.rabbitmq.reply-to".into()),
            expiration: Some("60000".into()),
            message_id: Some("m-1".into()),
            timestamp: Some(1_700_000_000),
            kind: Some("order.created".into()),
            user_id: Some("guest".into()),
            app_id: Some("billing".into()),
            cluster_id: Some(String::new()),
        };
        assert!(props.flags().is_all());

        let header = ContentHeader::new(60, 1024, props);
        let frame = header.to_frame(9).unwrap();
        assert_eq!(ContentHeader::from_frame(&frame).unwrap(), header);
    }

    #[test]
    fn test_sparse_properties_round_trip() {
        let header = ContentHeader::new(
            60,
            0,
            BasicProperties::default()
                .with_correlation_id("abc")
                .with_timestamp(42)
                .with_app_id("svc"),
        );
        let frame = header.to_frame(1).unwrap();
        assert_eq!(ContentHeader::from_frame(&frame).unwrap(), header);
    }

    #[test]
    fn test_continuation_bit_rejected() {
        let payload = Bytes::from_static(&[0, 60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x01]);
        assert_eq!(
            ContentHeader::decode_payload(payload),
            Err(WireError::UnsupportedPropertyFlags(1))
        );
    }
}
