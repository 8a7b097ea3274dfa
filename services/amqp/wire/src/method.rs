//! Protocol classes, method ids and argument templates.
//!
//! A [`Method`] is a `(class_id, method_id)` pair plus named arguments. The template
//! for the pair fixes the argument order and types on the wire; arguments missing
//! from the map are written as the zero value of their type.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::field::{ArgType, FieldReader, FieldTable, FieldValue, FieldWriter};
use crate::frame::{Frame, FrameType};

/// One template slot: argument name and type
pub type ArgSpec = (&'static str, ArgType);

use ArgType::{Bit, Long, LongLong, LongStr, Octet, Short, ShortStr, Table};

/// `connection` class (10)
pub mod connection {
    /// Class id
    pub const CLASS: u16 = 10;
    /// connection.start
    pub const START: u16 = 10;
    /// connection.start-ok
    pub const START_OK: u16 = 11;
    /// connection.secure
    pub const SECURE: u16 = 20;
    /// connection.secure-ok
    pub const SECURE_OK: u16 = 21;
    /// connection.tune
    pub const TUNE: u16 = 30;
    /// connection.tune-ok
    pub const TUNE_OK: u16 = 31;
    /// connection.open
    pub const OPEN: u16 = 40;
    /// connection.open-ok
    pub const OPEN_OK: u16 = 41;
    /// connection.close
    pub const CLOSE: u16 = 50;
    /// connection.close-ok
    pub const CLOSE_OK: u16 = 51;
    /// connection.blocked
    pub const BLOCKED: u16 = 60;
    /// connection.unblocked
    pub const UNBLOCKED: u16 = 61;
}

/// `channel` class (20)
pub mod channel {
    /// Class id
    pub const CLASS: u16 = 20;
    /// channel.open
    pub const OPEN: u16 = 10;
    /// channel.open-ok
    pub const OPEN_OK: u16 = 11;
    /// channel.flow
    pub const FLOW: u16 = 20;
    /// channel.flow-ok
    pub const FLOW_OK: u16 = 21;
    /// channel.close
    pub const CLOSE: u16 = 40;
    /// channel.close-ok
    pub const CLOSE_OK: u16 = 41;
}

/// `exchange` class (40)
pub mod exchange {
    /// Class id
    pub const CLASS: u16 = 40;
    /// exchange.declare
    pub const DECLARE: u16 = 10;
    /// exchange.declare-ok
    pub const DECLARE_OK: u16 = 11;
    /// exchange.delete
    pub const DELETE: u16 = 20;
    /// exchange.delete-ok
    pub const DELETE_OK: u16 = 21;
}

/// `queue` class (50)
pub mod queue {
    /// Class id
    pub const CLASS: u16 = 50;
    /// queue.declare
    pub const DECLARE: u16 = 10;
    /// queue.declare-ok
    pub const DECLARE_OK: u16 = 11;
    /// queue.bind
    pub const BIND: u16 = 20;
    /// queue.bind-ok
    pub const BIND_OK: u16 = 21;
    /// queue.purge
    pub const PURGE: u16 = 30;
    /// queue.purge-ok
    pub const PURGE_OK: u16 = 31;
    /// queue.delete
    pub const DELETE: u16 = 40;
    /// queue.delete-ok
    pub const DELETE_OK: u16 = 41;
    /// queue.unbind
    pub const UNBIND: u16 = 50;
    /// queue.unbind-ok
    pub const UNBIND_OK: u16 = 51;
}

/// `basic` class (60)
pub mod basic {
    /// Class id
    pub const CLASS: u16 = 60;
    /// basic.qos
    pub const QOS: u16 = 10;
    /// basic.qos-ok
    pub const QOS_OK: u16 = 11;
    /// basic.consume
    pub const CONSUME: u16 = 20;
    /// basic.consume-ok
    pub const CONSUME_OK: u16 = 21;
    /// basic.cancel
    pub const CANCEL: u16 = 30;
    /// basic.cancel-ok
    pub const CANCEL_OK: u16 = 31;
    /// basic.publish
    pub const PUBLISH: u16 = 40;
    /// basic.return
    pub const RETURN: u16 = 50;
    /// basic.deliver
    pub const DELIVER: u16 = 60;
    /// basic.get
    pub const GET: u16 = 70;
    /// basic.get-ok
    pub const GET_OK: u16 = 71;
    /// basic.get-empty
    pub const GET_EMPTY: u16 = 72;
    /// basic.ack
    pub const ACK: u16 = 80;
    /// basic.reject
    pub const REJECT: u16 = 90;
    /// basic.recover-async
    pub const RECOVER_ASYNC: u16 = 100;
    /// basic.recover
    pub const RECOVER: u16 = 110;
    /// basic.recover-ok
    pub const RECOVER_OK: u16 = 111;
    /// basic.nack
    pub const NACK: u16 = 120;
}

/// `confirm` class (85)
pub mod confirm {
    /// Class id
    pub const CLASS: u16 = 85;
    /// confirm.select
    pub const SELECT: u16 = 10;
    /// confirm.select-ok
    pub const SELECT_OK: u16 = 11;
}

const CLOSE_ARGS: &[ArgSpec] = &[
    ("reply_code", Short),
    ("reply_text", ShortStr),
    ("class_id", Short),
    ("method_id", Short),
];

const TUNE_ARGS: &[ArgSpec] = &[
    ("channel_max", Short),
    ("frame_max", Long),
    ("heartbeat", Short),
];

/// Argument template for a class/method pair
pub fn template(class_id: u16, method_id: u16) -> Option<&'static [ArgSpec]> {
    let args: &'static [ArgSpec] = match (class_id, method_id) {
        (connection::CLASS, connection::START) => &[
            ("version_major", Octet),
            ("version_minor", Octet),
            ("server_properties", Table),
            ("mechanisms", LongStr),
            ("locales", LongStr),
        ],
        (connection::CLASS, connection::START_OK) => &[
            ("client_properties", Table),
            ("mechanism", ShortStr),
            ("response", LongStr),
            ("locale", ShortStr),
        ],
        (connection::CLASS, connection::SECURE) => &[("challenge", LongStr)],
        (connection::CLASS, connection::SECURE_OK) => &[("response", LongStr)],
        (connection::CLASS, connection::TUNE) | (connection::CLASS, connection::TUNE_OK) => {
            TUNE_ARGS
        }
        (connection::CLASS, connection::OPEN) => &[
            ("virtual_host", ShortStr),
            ("reserved1", ShortStr),
            ("reserved2", Bit),
        ],
        (connection::CLASS, connection::OPEN_OK) => &[("reserved1", ShortStr)],
        (connection::CLASS, connection::CLOSE) | (channel::CLASS, channel::CLOSE) => CLOSE_ARGS,
        (connection::CLASS, connection::CLOSE_OK) | (channel::CLASS, channel::CLOSE_OK) => &[],
        (connection::CLASS, connection::BLOCKED) => &[("reason", ShortStr)],
        (connection::CLASS, connection::UNBLOCKED) => &[],

        (channel::CLASS, channel::OPEN) => &[("reserved1", ShortStr)],
        (channel::CLASS, channel::OPEN_OK) => &[("reserved1", LongStr)],
        (channel::CLASS, channel::FLOW) | (channel::CLASS, channel::FLOW_OK) => {
            &[("active", Bit)]
        }

        (exchange::CLASS, exchange::DECLARE) => &[
            ("reserved1", Short),
            ("exchange", ShortStr),
            ("type", ShortStr),
            ("passive", Bit),
            ("durable", Bit),
            ("auto_delete", Bit),
            ("internal", Bit),
            ("no_wait", Bit),
            ("arguments", Table),
        ],
        (exchange::CLASS, exchange::DECLARE_OK) => &[],
        (exchange::CLASS, exchange::DELETE) => &[
            ("reserved1", Short),
            ("exchange", ShortStr),
            ("if_unused", Bit),
            ("no_wait", Bit),
        ],
        (exchange::CLASS, exchange::DELETE_OK) => &[],

        (queue::CLASS, queue::DECLARE) => &[
            ("reserved1", Short),
            ("queue", ShortStr),
            ("passive", Bit),
            ("durable", Bit),
            ("exclusive", Bit),
            ("auto_delete", Bit),
            ("no_wait", Bit),
            ("arguments", Table),
        ],
        (queue::CLASS, queue::DECLARE_OK) => &[
            ("queue", ShortStr),
            ("message_count", Long),
            ("consumer_count", Long),
        ],
        (queue::CLASS, queue::BIND) => &[
            ("reserved1", Short),
            ("queue", ShortStr),
            ("exchange", ShortStr),
            ("routing_key", ShortStr),
            ("no_wait", Bit),
            ("arguments", Table),
        ],
        (queue::CLASS, queue::BIND_OK) => &[],
        (queue::CLASS, queue::UNBIND) => &[
            ("reserved1", Short),
            ("queue", ShortStr),
            ("exchange", ShortStr),
            ("routing_key", ShortStr),
            ("arguments", Table),
        ],
        (queue::CLASS, queue::UNBIND_OK) => &[],
        (queue::CLASS, queue::PURGE) => &[
            ("reserved1", Short),
            ("queue", ShortStr),
            ("no_wait", Bit),
        ],
        (queue::CLASS, queue::PURGE_OK) | (queue::CLASS, queue::DELETE_OK) => {
            &[("message_count", Long)]
        }
        (queue::CLASS, queue::DELETE) => &[
            ("reserved1", Short),
            ("queue", ShortStr),
            ("if_unused", Bit),
            ("if_empty", Bit),
            ("no_wait", Bit),
        ],

        (basic::CLASS, basic::QOS) => &[
            ("prefetch_size", Long),
            ("prefetch_count", Short),
            ("global", Bit),
        ],
        (basic::CLASS, basic::QOS_OK) => &[],
        (basic::CLASS, basic::CONSUME) => &[
            ("reserved1", Short),
            ("queue", ShortStr),
            ("consumer_tag", ShortStr),
            ("no_local", Bit),
            ("no_ack", Bit),
            ("exclusive", Bit),
            ("no_wait", Bit),
            ("arguments", Table),
        ],
        (basic::CLASS, basic::CONSUME_OK) | (basic::CLASS, basic::CANCEL_OK) => {
            &[("consumer_tag", ShortStr)]
        }
        (basic::CLASS, basic::CANCEL) => &[("consumer_tag", ShortStr), ("no_wait", Bit)],
        (basic::CLASS, basic::PUBLISH) => &[
            ("reserved1", Short),
            ("exchange", ShortStr),
            ("routing_key", ShortStr),
            ("mandatory", Bit),
            ("immediate", Bit),
        ],
        (basic::CLASS, basic::RETURN) => &[
            ("reply_code", Short),
            ("reply_text", ShortStr),
            ("exchange", ShortStr),
            ("routing_key", ShortStr),
        ],
        (basic::CLASS, basic::DELIVER) => &[
            ("consumer_tag", ShortStr),
            ("delivery_tag", LongLong),
            ("redelivered", Bit),
            ("exchange", ShortStr),
            ("routing_key", ShortStr),
        ],
        (basic::CLASS, basic::GET) => &[
            ("reserved1", Short),
            ("queue", ShortStr),
            ("no_ack", Bit),
        ],
        (basic::CLASS, basic::GET_OK) => &[
            ("delivery_tag", LongLong),
            ("redelivered", Bit),
            ("exchange", ShortStr),
            ("routing_key", ShortStr),
            ("message_count", Long),
        ],
        (basic::CLASS, basic::GET_EMPTY) => &[("reserved1", ShortStr)],
        (basic::CLASS, basic::ACK) => &[("delivery_tag", LongLong), ("multiple", Bit)],
        (basic::CLASS, basic::REJECT) => &[("delivery_tag", LongLong), ("requeue", Bit)],
        (basic::CLASS, basic::RECOVER_ASYNC) | (basic::CLASS, basic::RECOVER) => {
            &[("requeue", Bit)]
        }
        (basic::CLASS, basic::RECOVER_OK) => &[],
        (basic::CLASS, basic::NACK) => &[
            ("delivery_tag", LongLong),
            ("multiple", Bit),
            ("requeue", Bit),
        ],

        (confirm::CLASS, confirm::SELECT) => &[("no_wait", Bit)],
        (confirm::CLASS, confirm::SELECT_OK) => &[],

        _ => return None,
    };
    Some(args)
}

/// Whether the method is followed by a content header and body
pub fn has_content(class_id: u16, method_id: u16) -> bool {
    class_id == basic::CLASS
        && matches!(
            method_id,
            basic::PUBLISH | basic::RETURN | basic::DELIVER | basic::GET_OK
        )
}

/// A protocol method with its named arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    /// Protocol class id
    pub class_id: u16,
    /// Method id within the class
    pub method_id: u16,
    /// Arguments by template name
    pub args: FieldTable,
}

impl Method {
    /// Create a method with no arguments set
    pub fn new(class_id: u16, method_id: u16) -> Self {
        Self {
            class_id,
            method_id,
            args: FieldTable::new(),
        }
    }

    /// Builder-style argument setter
    pub fn arg(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.args.insert(name, value);
        self
    }

    /// Builder-style short string argument
    pub fn short_str(self, name: &str, value: impl Into<String>) -> Self {
        self.arg(name, FieldValue::ShortStr(value.into()))
    }

    /// Whether this is the given class/method pair
    pub fn is(&self, class_id: u16, method_id: u16) -> bool {
        self.class_id == class_id && self.method_id == method_id
    }

    /// Whether this method carries content
    pub fn has_content(&self) -> bool {
        has_content(self.class_id, self.method_id)
    }

    /// Argument as a string, empty when absent
    pub fn get_str(&self, name: &str) -> &str {
        self.args.get(name).and_then(FieldValue::as_str).unwrap_or("")
    }

    /// Argument as a bit, false when absent
    pub fn get_bool(&self, name: &str) -> bool {
        self.args
            .get(name)
            .and_then(FieldValue::as_bool)
            .unwrap_or(false)
    }

    /// Argument as u16, 0 when absent
    pub fn get_u16(&self, name: &str) -> u16 {
        self.args.get(name).and_then(FieldValue::as_u16).unwrap_or(0)
    }

    /// Argument as u32, 0 when absent
    pub fn get_u32(&self, name: &str) -> u32 {
        self.args.get(name).and_then(FieldValue::as_u32).unwrap_or(0)
    }

    /// Argument as u64, 0 when absent
    pub fn get_u64(&self, name: &str) -> u64 {
        self.args.get(name).and_then(FieldValue::as_u64).unwrap_or(0)
    }

    /// Argument as a table, if present
    pub fn get_table(&self, name: &str) -> Option<&FieldTable> {
        self.args.get(name).and_then(FieldValue::as_table)
    }

    fn template(&self) -> Result<&'static [ArgSpec], WireError> {
        template(self.class_id, self.method_id).ok_or(WireError::UnknownMethod {
            class_id: self.class_id,
            method_id: self.method_id,
        })
    }

    /// Encode the method payload: class, method, then arguments in template order
    pub fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        let template = self.template()?;
        buf.put_u16(self.class_id);
        buf.put_u16(self.method_id);
        let mut writer = FieldWriter::new(buf);
        for &(name, ty) in template {
            match self.args.get(name) {
                Some(value) => writer.write_arg(name, ty, value)?,
                None => writer.write_arg(name, ty, &ty.zero())?,
            }
        }
        Ok(())
    }

    /// Decode a method payload
    pub fn decode_payload(payload: Bytes) -> Result<Method, WireError> {
        let mut reader = FieldReader::new(payload);
        let class_id = reader.read_u16()?;
        let method_id = reader.read_u16()?;
        let mut method = Method::new(class_id, method_id);
        for &(name, ty) in method.template()? {
            let value = reader.read_arg(ty)?;
            method.args.insert(name, value);
        }
        Ok(method)
    }

    /// Wrap the method in a frame for `channel`
    pub fn to_frame(&self, channel: u16) -> Result<Frame, WireError> {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload)?;
        Ok(Frame::new(FrameType::Method, channel, payload.freeze()))
    }

    /// Decode the method carried by a method frame
    pub fn from_frame(frame: &Frame) -> Result<Method, WireError> {
        if frame.frame_type != FrameType::Method {
            return Err(WireError::ProtocolViolation(format!(
                "expected method frame, got {:?}",
                frame.frame_type
            )));
        }
        Method::decode_payload(frame.payload.clone())
    }
}
