//! Session error types and peer close reasons.

use std::time::Duration;

use amqp_wire::{Method, WireError};
use thiserror::Error;

use crate::channel::ChannelState;
use crate::connection::ConnectionState;

/// Result alias for session operations
pub type Result<T, E = AmqpError> = std::result::Result<T, E>;

/// AMQP reply codes carried by `connection.close` and `channel.close`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    /// 200
    Success,
    /// 311
    ContentTooLarge,
    /// 312
    NoRoute,
    /// 313
    NoConsumers,
    /// 320
    ConnectionForced,
    /// 402
    InvalidPath,
    /// 403
    AccessRefused,
    /// 404
    NotFound,
    /// 405
    ResourceLocked,
    /// 406
    PreconditionFailed,
    /// 501
    FrameError,
    /// 502
    SyntaxError,
    /// 503
    CommandInvalid,
    /// 504
    ChannelError,
    /// 505
    UnexpectedFrame,
    /// 506
    ResourceError,
    /// 530
    NotAllowed,
    /// 540
    NotImplemented,
    /// 541
    InternalError,
    /// Anything else
    Other(u16),
}

impl From<u16> for ReplyCode {
    fn from(code: u16) -> Self {
        match code {
            200 => ReplyCode::Success,
            311 => ReplyCode::ContentTooLarge,
            312 => ReplyCode::NoRoute,
            313 => ReplyCode::NoConsumers,
            320 => ReplyCode::ConnectionForced,
            402 => ReplyCode::InvalidPath,
            403 => ReplyCode::AccessRefused,
            404 => ReplyCode::NotFound,
            405 => ReplyCode::ResourceLocked,
            406 => ReplyCode::PreconditionFailed,
            501 => ReplyCode::FrameError,
            502 => ReplyCode::SyntaxError,
            503 => ReplyCode::CommandInvalid,
            504 => ReplyCode::ChannelError,
            505 => ReplyCode::UnexpectedFrame,
            506 => ReplyCode::ResourceError,
            530 => ReplyCode::NotAllowed,
            540 => ReplyCode::NotImplemented,
            541 => ReplyCode::InternalError,
            other => ReplyCode::Other(other),
        }
    }
}

/// Why a peer closed a channel or the connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reply_code} {reply_text} (class {class_id}, method {method_id})")]
pub struct CloseReason {
    /// Numeric reply code
    pub reply_code: u16,
    /// Human-readable text
    pub reply_text: String,
    /// Class of the method that caused the close, 0 if none
    pub class_id: u16,
    /// Method that caused the close, 0 if none
    pub method_id: u16,
}

impl CloseReason {
    /// Create a close reason
    pub fn new(reply_code: u16, reply_text: impl Into<String>, class_id: u16, method_id: u16) -> Self {
        Self {
            reply_code,
            reply_text: reply_text.into(),
            class_id,
            method_id,
        }
    }

    /// Reason used for client-initiated closes
    pub fn normal() -> Self {
        Self::new(200, "Goodbye", 0, 0)
    }

    /// Extract the reason from a `connection.close` or `channel.close` method
    pub fn from_method(method: &Method) -> Self {
        Self::new(
            method.get_u16("reply_code"),
            method.get_str("reply_text"),
            method.get_u16("class_id"),
            method.get_u16("method_id"),
        )
    }

    /// Build the close method for `class_id` (connection or channel)
    pub fn to_method(&self, class_id: u16, close_method_id: u16) -> Method {
        Method::new(class_id, close_method_id)
            .arg("reply_code", self.reply_code)
            .short_str("reply_text", self.reply_text.clone())
            .arg("class_id", self.class_id)
            .arg("method_id", self.method_id)
    }

    /// Classified reply code
    pub fn code(&self) -> ReplyCode {
        ReplyCode::from(self.reply_code)
    }

    /// Whether the reason names the given method as the one rejected with an error
    pub fn rejects(&self, class_id: u16, method_id: u16) -> bool {
        self.reply_code >= 400 && self.class_id == class_id && self.method_id == method_id
    }
}

/// Session errors
#[derive(Error, Debug)]
pub enum AmqpError {
    /// Malformed frame or protocol violation; fatal to the connection
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the channel
    #[error("channel closed by server: {0}")]
    ChannelClosed(CloseReason),

    /// The server closed the connection
    #[error("connection closed by server: {0}")]
    ConnectionClosed(CloseReason),

    /// The socket went away without a close handshake
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Arguments rejected before any network I/O
    #[error("validation failed: {0}")]
    Validation(String),

    /// Could not establish the TCP connection
    #[error("connect to {addr} failed after {attempts} attempt(s): {source}")]
    Connect {
        /// Target address
        addr: String,
        /// Attempts made
        attempts: u32,
        /// Last socket error
        #[source]
        source: std::io::Error,
    },

    /// Connect or handshake did not finish in time
    #[error("connect to {addr} timed out after {after:?}")]
    ConnectTimeout {
        /// Target address
        addr: String,
        /// Configured timeout
        after: Duration,
    },

    /// Handshake rejected
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No response within the RPC timeout
    #[error("rpc {class_id}.{method_id} timed out after {after:?}")]
    RpcTimeout {
        /// Request class
        class_id: u16,
        /// Request method
        method_id: u16,
        /// Configured timeout
        after: Duration,
    },

    /// Verb invoked on a channel that is not open
    #[error("channel {channel} is {state:?}")]
    ChannelState {
        /// Channel number
        channel: u16,
        /// Current state
        state: ChannelState,
    },

    /// Operation invoked on a connection that is not open
    #[error("connection is {0:?}")]
    ConnectionState(ConnectionState),

    /// Every channel number is in use
    #[error("no free channel numbers")]
    ChannelsExhausted,

    /// Requested channel number is taken
    #[error("channel {0} already in use")]
    ChannelInUse(u16),

    /// Requested channel number is outside 1..=channel_max
    #[error("channel {0} outside the negotiated range")]
    ChannelOutOfRange(u16),

    /// Inbound frame for a channel this connection never opened
    #[error("frame for unknown channel {0}")]
    UnknownChannel(u16),

    /// The pool is shutting down
    #[error("channel pool closed")]
    PoolClosed,
}

impl AmqpError {
    /// The peer's close reason, for errors caused by a close
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            AmqpError::ChannelClosed(r) | AmqpError::ConnectionClosed(r) => Some(r),
            _ => None,
        }
    }

    /// Whether the error ends the connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::Wire(_)
                | AmqpError::Io(_)
                | AmqpError::ConnectionClosed(_)
                | AmqpError::ConnectionLost(_)
                | AmqpError::UnknownChannel(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_wire::channel;

    #[test]
    fn test_close_reason_from_method() {
        let method = CloseReason::new(404, "NOT_FOUND - no queue 'missing'", 50, 10)
            .to_method(channel::CLASS, channel::CLOSE);
        let reason = CloseReason::from_method(&method);
        assert_eq!(reason.code(), ReplyCode::NotFound);
        assert_eq!(reason.reply_text, "NOT_FOUND - no queue 'missing'");
        assert!(reason.rejects(50, 10));
        assert!(!reason.rejects(50, 20));
    }

    #[test]
    fn test_soft_codes_do_not_reject() {
        let reason = CloseReason::new(312, "NO_ROUTE", 60, 40);
        assert!(!reason.rejects(60, 40));
        assert_eq!(ReplyCode::from(999), ReplyCode::Other(999));
    }

    #[test]
    fn test_error_classification() {
        let closed = AmqpError::ChannelClosed(CloseReason::new(406, "PRECONDITION_FAILED", 50, 10));
        assert!(!closed.is_fatal());
        assert_eq!(closed.close_reason().map(|r| r.code()), Some(ReplyCode::PreconditionFailed));

        let wire = AmqpError::from(WireError::MalformedFrame(0));
        assert!(wire.is_fatal());
    }
}
