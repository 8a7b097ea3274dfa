//! Command assembly: method + header + body frames as one logical unit.
//!
//! [`CommandAssembler`] runs per channel on the inbound side; [`CommandWriter`]
//! performs the inverse split on the outbound side.

use bytes::{Bytes, BytesMut};

use crate::content::{BasicProperties, ContentHeader};
use crate::error::WireError;
use crate::frame::{Frame, FrameType, FRAME_OVERHEAD};
use crate::method::Method;

/// A method with its optional content
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Channel the command travels on
    pub channel: u16,
    /// The method
    pub method: Method,
    /// Content header, present for content-bearing methods
    pub header: Option<ContentHeader>,
    /// Body, present for content-bearing methods
    pub body: Option<Bytes>,
}

impl Command {
    /// Method-only command
    pub fn method(channel: u16, method: Method) -> Self {
        Self {
            channel,
            method,
            header: None,
            body: None,
        }
    }

    /// Content-bearing command; the header's body size is taken from `body`
    pub fn with_content(
        channel: u16,
        method: Method,
        properties: BasicProperties,
        body: Bytes,
    ) -> Self {
        let header = ContentHeader::new(method.class_id, body.len() as u64, properties);
        Self {
            channel,
            method,
            header: Some(header),
            body: Some(body),
        }
    }

    /// Whether the method is the given class/method pair
    pub fn is(&self, class_id: u16, method_id: u16) -> bool {
        self.method.is(class_id, method_id)
    }

    /// Message properties, default when the command has no header
    pub fn properties(&self) -> BasicProperties {
        self.header
            .as_ref()
            .map(|h| h.properties.clone())
            .unwrap_or_default()
    }
}

/// Assembler states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// Waiting for a method frame
    ExpectingMethod,
    /// Content-bearing method seen, waiting for its header
    ExpectingHeader,
    /// Header seen, collecting body frames
    ExpectingBody,
    /// A complete command is ready
    Ready,
}

/// Per-channel state machine gluing frames into commands
#[derive(Debug)]
pub struct CommandAssembler {
    state: AssemblerState,
    method: Option<Method>,
    header: Option<ContentHeader>,
    body: BytesMut,
    remaining: u64,
    channel: u16,
}

impl Default for CommandAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandAssembler {
    /// Create an assembler in `ExpectingMethod`
    pub fn new() -> Self {
        Self {
            state: AssemblerState::ExpectingMethod,
            method: None,
            header: None,
            body: BytesMut::new(),
            remaining: 0,
            channel: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Feed one frame. Returns the command once it is complete.
    ///
    /// Heartbeats are ignored. A frame that the current state does not accept is a
    /// protocol violation; the connection cannot continue after one.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Command>, WireError> {
        match (self.state, frame.frame_type) {
            (_, FrameType::Heartbeat) => return Ok(None),
            (AssemblerState::ExpectingMethod, FrameType::Method) => {
                let method = Method::from_frame(&frame)?;
                self.channel = frame.channel;
                self.state = if method.has_content() {
                    AssemblerState::ExpectingHeader
                } else {
                    AssemblerState::Ready
                };
                self.method = Some(method);
            }
            (AssemblerState::ExpectingHeader, FrameType::Header) => {
                let header = ContentHeader::from_frame(&frame)?;
                self.remaining = header.body_size;
                self.state = if header.body_size > 0 {
                    self.body = BytesMut::with_capacity(capacity_hint(header.body_size));
                    AssemblerState::ExpectingBody
                } else {
                    AssemblerState::Ready
                };
                self.header = Some(header);
            }
            (AssemblerState::ExpectingBody, FrameType::Body) => {
                let len = frame.payload.len() as u64;
                if len > self.remaining {
                    return Err(WireError::ProtocolViolation(format!(
                        "body frame of {len} bytes exceeds the {} bytes remaining",
                        self.remaining
                    )));
                }
                self.body.extend_from_slice(&frame.payload);
                self.remaining -= len;
                if self.remaining == 0 {
                    self.state = AssemblerState::Ready;
                }
            }
            (state, frame_type) => {
                return Err(WireError::ProtocolViolation(format!(
                    "{frame_type:?} frame on channel {} while {state:?}",
                    frame.channel
                )));
            }
        }

        if self.state == AssemblerState::Ready {
            return Ok(self.take());
        }
        Ok(None)
    }

    fn take(&mut self) -> Option<Command> {
        self.state = AssemblerState::ExpectingMethod;
        let method = self.method.take()?;
        let header = self.header.take();
        let body = header
            .as_ref()
            .map(|_| std::mem::take(&mut self.body).freeze());
        Some(Command {
            channel: self.channel,
            method,
            header,
            body,
        })
    }
}

fn capacity_hint(body_size: u64) -> usize {
    // Large bodies grow as frames arrive instead of reserving up front
    body_size.min(1 << 20) as usize
}

/// Splits commands into frames that fit the negotiated frame_max
#[derive(Debug, Clone, Copy)]
pub struct CommandWriter {
    frame_max: u32,
}

impl CommandWriter {
    /// Writer for a negotiated `frame_max`; 0 means not negotiated yet
    pub fn new(frame_max: u32) -> Self {
        Self { frame_max }
    }

    /// Negotiated frame_max
    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    /// Split a command into its frames
    pub fn to_frames(&self, command: &Command) -> Result<Vec<Frame>, WireError> {
        let mut frames = vec![command.method.to_frame(command.channel)?];
        if let Some(header) = &command.header {
            frames.push(header.to_frame(command.channel)?);
        }
        if let Some(body) = command.body.as_ref().filter(|b| !b.is_empty()) {
            if self.frame_max == 0 {
                return Err(WireError::FrameMaxUnnegotiated(body.len()));
            }
            let chunk = (self.frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1);
            let mut offset = 0;
            while offset < body.len() {
                let end = (offset + chunk).min(body.len());
                frames.push(Frame::new(
                    FrameType::Body,
                    command.channel,
                    body.slice(offset..end),
                ));
                offset = end;
            }
        }
        Ok(frames)
    }

    /// Encode every frame of a command into `buf`.
    ///
    /// Nothing is appended when any frame fails, so the frames of one command
    /// always reach the socket contiguously or not at all.
    pub fn encode(&self, command: &Command, buf: &mut BytesMut) -> Result<(), WireError> {
        let mut out = BytesMut::new();
        for frame in self.to_frames(command)? {
            frame.encode_limited(&mut out, self.frame_max)?;
        }
        buf.extend_from_slice(&out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{basic, queue};

    fn publish() -> Method {
        Method::new(basic::CLASS, basic::PUBLISH)
            .short_str("exchange", "")
            .short_str("routing_key", "movies")
    }

    #[test]
    fn test_content_command_assembly() {
        let mut assembler = CommandAssembler::new();
        let props = BasicProperties::default().with_content_type("text/plain");

        assert!(assembler.push(publish().to_frame(1).unwrap()).unwrap().is_none());
        assert_eq!(assembler.state(), AssemblerState::ExpectingHeader);

        let header = ContentHeader::new(basic::CLASS, 13, props.clone());
        assert!(assembler.push(header.to_frame(1).unwrap()).unwrap().is_none());
        assert_eq!(assembler.state(), AssemblerState::ExpectingBody);

        // Heartbeats between body frames do not disturb assembly
        assert!(assembler.push(Frame::heartbeat()).unwrap().is_none());

        let first = Frame::new(FrameType::Body, 1, Bytes::from_static(b"hello, "));
        assert!(assembler.push(first).unwrap().is_none());
        let second = Frame::new(FrameType::Body, 1, Bytes::from_static(b"world!"));
        let command = assembler.push(second).unwrap().unwrap();

        assert_eq!(assembler.state(), AssemblerState::ExpectingMethod);
        assert!(command.is(basic::CLASS, basic::PUBLISH));
        assert_eq!(command.body.as_deref(), Some(&b"hello, world!"[..]));
        assert_eq!(command.properties(), props);
    }

    #[test]
    fn test_method_only_command() {
        let mut assembler = CommandAssembler::new();
        let frame = Method::new(queue::CLASS, queue::DECLARE_OK)
            .short_str("queue", "movies")
            .to_frame(2)
            .unwrap();
        let command = assembler.push(frame).unwrap().unwrap();
        assert_eq!(command.channel, 2);
        assert!(command.header.is_none());
        assert!(command.body.is_none());
        assert_eq!(assembler.state(), AssemblerState::ExpectingMethod);
    }

    #[test]
    fn test_empty_body_completes_on_header() {
        let mut assembler = CommandAssembler::new();
        assembler.push(publish().to_frame(1).unwrap()).unwrap();
        let header = ContentHeader::new(basic::CLASS, 0, BasicProperties::default());
        let command = assembler.push(header.to_frame(1).unwrap()).unwrap().unwrap();
        assert_eq!(command.body.as_deref(), Some(&b""[..]));
    }

    #[test]
    fn test_out_of_order_frames_are_violations() {
        let mut assembler = CommandAssembler::new();
        let header = ContentHeader::new(basic::CLASS, 3, BasicProperties::default());
        assert!(matches!(
            assembler.push(header.to_frame(1).unwrap()),
            Err(WireError::ProtocolViolation(_))
        ));

        let mut assembler = CommandAssembler::new();
        assembler.push(publish().to_frame(1).unwrap()).unwrap();
        let body = Frame::new(FrameType::Body, 1, Bytes::from_static(b"abc"));
        assert!(assembler.push(body).is_err());
    }

    #[test]
    fn test_body_overrun_is_violation() {
        let mut assembler = CommandAssembler::new();
        assembler.push(publish().to_frame(1).unwrap()).unwrap();
        let header = ContentHeader::new(basic::CLASS, 2, BasicProperties::default());
        assembler.push(header.to_frame(1).unwrap()).unwrap();
        let body = Frame::new(FrameType::Body, 1, Bytes::from_static(b"abc"));
        assert!(assembler.push(body).is_err());
    }

    #[test]
    fn test_writer_splits_body() {
        let body = Bytes::from(vec![7u8; 25]);
        let command = Command::with_content(1, publish(), BasicProperties::default(), body.clone());

        // frame_max 18 leaves 10 payload bytes per body frame
        let frames = CommandWriter::new(18).to_frames(&command).unwrap();
        let bodies: Vec<usize> = frames
            .iter()
            .filter(|f| f.frame_type == FrameType::Body)
            .map(|f| f.payload.len())
            .collect();
        assert_eq!(bodies, vec![10, 10, 5]);
        assert_eq!(frames[1].frame_type, FrameType::Header);

        // Splitting then assembling gives the original command back
        let mut assembler = CommandAssembler::new();
        let mut assembled = None;
        for frame in frames {
            assembled = assembler.push(frame).unwrap();
        }
        let assembled = assembled.unwrap();
        assert_eq!(assembled.header, command.header);
        assert_eq!(assembled.body, command.body);
        assert_eq!(assembled.method.get_str("routing_key"), "movies");
    }

    #[test]
    fn test_writer_requires_frame_max_for_body() {
        let command = Command::with_content(
            1,
            publish(),
            BasicProperties::default(),
            Bytes::from_static(b"x"),
        );
        assert_eq!(
            CommandWriter::new(0).to_frames(&command),
            Err(WireError::FrameMaxUnnegotiated(1))
        );

        let empty =
            Command::with_content(1, publish(), BasicProperties::default(), Bytes::new());
        assert_eq!(CommandWriter::new(0).to_frames(&empty).unwrap().len(), 2);
    }

    #[test]
    fn test_encode_rejects_oversized_method_frame() {
        let method = Method::new(queue::CLASS, queue::DECLARE).short_str("queue", "q".repeat(200));
        let command = Command::method(1, method);
        let mut buf = BytesMut::new();
        assert!(matches!(
            CommandWriter::new(64).encode(&command, &mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
        assert!(buf.is_empty());
    }
}
