//! Outbound path: commands are encoded on the caller's task and queued for a
//! single writer task that owns the socket's write half.

use std::fmt;

use amqp_wire::{Command, CommandWriter, HEARTBEAT_FRAME};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::connection::ConnectionState;
use crate::error::{AmqpError, Result};

/// Queue depth between callers and the writer task
pub const OUTBOUND_QUEUE: usize = 1024;

/// Where channels send their commands
#[async_trait]
pub trait CommandSink: Send + Sync + fmt::Debug {
    /// Encode and queue a command; its frames are written contiguously
    async fn send(&self, command: Command) -> Result<()>;
}

/// Items consumed by the writer task
#[derive(Debug)]
pub enum Outbound {
    /// Pre-encoded frames of one command
    Frames(Bytes),
    /// A heartbeat frame
    Heartbeat,
    /// Flush, shut the socket down and acknowledge
    Shutdown(oneshot::Sender<()>),
}

/// Sink feeding the connection's writer task
#[derive(Debug, Clone)]
pub struct OutboundSink {
    tx: mpsc::Sender<Outbound>,
    writer: CommandWriter,
}

impl OutboundSink {
    /// Sink that splits bodies for `frame_max`
    pub fn new(tx: mpsc::Sender<Outbound>, frame_max: u32) -> Self {
        Self {
            tx,
            writer: CommandWriter::new(frame_max),
        }
    }

    /// Raw queue handle, used for heartbeats and shutdown
    pub fn queue(&self) -> mpsc::Sender<Outbound> {
        self.tx.clone()
    }
}

#[async_trait]
impl CommandSink for OutboundSink {
    async fn send(&self, command: Command) -> Result<()> {
        let mut buf = BytesMut::new();
        self.writer.encode(&command, &mut buf)?;
        trace!(
            channel = command.channel,
            class_id = command.method.class_id,
            method_id = command.method.method_id,
            bytes = buf.len(),
            "queue command"
        );
        self.tx
            .send(Outbound::Frames(buf.freeze()))
            .await
            .map_err(|_| AmqpError::ConnectionState(ConnectionState::Closed))
    }
}

/// Drain the outbound queue into `io` until shutdown or the queue closes.
///
/// Items already queued are coalesced into one write.
pub async fn run_writer<W>(mut io: W, mut rx: mpsc::Receiver<Outbound>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    while let Some(item) = rx.recv().await {
        let mut ack = push(&mut buf, item);
        while ack.is_none() {
            match rx.try_recv() {
                Ok(next) => ack = push(&mut buf, next),
                Err(_) => break,
            }
        }

        if !buf.is_empty() {
            io.write_all(&buf).await?;
            buf.clear();
        }

        if let Some(ack) = ack {
            io.flush().await?;
            let _ = io.shutdown().await;
            let _ = ack.send(());
            debug!("writer shut down");
            return Ok(());
        }
    }
    let _ = io.shutdown().await;
    Ok(())
}

fn push(buf: &mut BytesMut, item: Outbound) -> Option<oneshot::Sender<()>> {
    match item {
        Outbound::Frames(bytes) => buf.extend_from_slice(&bytes),
        Outbound::Heartbeat => buf.extend_from_slice(&HEARTBEAT_FRAME),
        Outbound::Shutdown(ack) => return Some(ack),
    }
    None
}


#[cfg(test)]
mod tests {
    use super::*;
    use amqp_wire::{basic, BasicProperties, FrameDecoder, FrameType, Method};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_writer_keeps_command_frames_contiguous() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let sink = OutboundSink::new(tx.clone(), 4096);
        let writer = tokio::spawn(run_writer(client, rx));

        let publish = Method::new(basic::CLASS, basic::PUBLISH).short_str("routing_key", "movies");
        let body = Bytes::from(vec![7u8; 10_000]);
        sink.send(Command::with_content(1, publish, BasicProperties::default(), body))
            .await
            .unwrap();
        tx.send(Outbound::Heartbeat).await.unwrap();

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Outbound::Shutdown(ack_tx)).await.unwrap();
        ack_rx.await.unwrap();
        writer.await.unwrap().unwrap();

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        let frames = FrameDecoder::new().extract(&raw).unwrap();
        let kinds: Vec<FrameType> = frames.iter().map(|f| f.frame_type).collect();
        assert_eq!(
            kinds,
            vec![
                FrameType::Method,
                FrameType::Header,
                FrameType::Body,
                FrameType::Body,
                FrameType::Body,
                FrameType::Heartbeat,
            ]
        );
        let body_len: usize = frames[2..5].iter().map(|f| f.payload.len()).sum();
        assert_eq!(body_len, 10_000);
    }

    #[tokio::test]
    async fn test_encode_error_reaches_caller() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = OutboundSink::new(tx, 0);
        let publish = Method::new(basic::CLASS, basic::PUBLISH);
        let err = sink
            .send(Command::with_content(
                1,
                publish,
                BasicProperties::default(),
                Bytes::from_static(b"x"),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::Wire(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let sink = OutboundSink::new(tx, 4096);
        let err = sink
            .send(Command::method(1, Method::new(basic::CLASS, basic::QOS)))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::ConnectionState(ConnectionState::Closed)));
    }
}
