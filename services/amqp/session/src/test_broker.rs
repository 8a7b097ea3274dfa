//! Scripted in-process broker for end-to-end tests, built on the wire codec.

use std::collections::{HashMap, VecDeque};

use amqp_wire::{
    basic, channel, connection, queue, BasicProperties, Command, CommandAssembler, CommandWriter,
    FieldTable, FrameDecoder, FrameType, Method, PROTOCOL_HEADER,
};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel0::Tuning;
use crate::connection::ConnectionConfig;

/// Listener on an ephemeral port and a client config pointing at it
pub(crate) async fn bind() -> (TcpListener, ConnectionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ConnectionConfig {
        host: "127.0.0.1".to_string(),
        port,
        heartbeat: 0,
        connect_timeout: None,
        ..Default::default()
    };
    (listener, config)
}

/// Limits the broker proposes unless a test needs others
pub(crate) fn tuning() -> Tuning {
    Tuning {
        channel_max: 0,
        frame_max: 4096,
        heartbeat: 0,
    }
}

pub(crate) fn start_method() -> Method {
    Method::new(connection::CLASS, connection::START)
        .arg("version_major", 0u8)
        .arg("version_minor", 9u8)
        .arg(
            "server_properties",
            FieldTable::new().with("product", "test-broker").with("version", "0.0.0"),
        )
        .arg("mechanisms", "PLAIN AMQPLAIN")
        .arg("locales", "en_US")
}

/// Server side of one client connection
pub(crate) struct Broker {
    stream: TcpStream,
    decoder: FrameDecoder,
    assemblers: HashMap<u16, CommandAssembler>,
    inbox: VecDeque<Command>,
    writer: CommandWriter,
}

impl Broker {
    /// Accept one client and consume its protocol header
    pub(crate) async fn accept(listener: &TcpListener) -> Self {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header, PROTOCOL_HEADER);
        Self {
            stream,
            decoder: FrameDecoder::new(),
            assemblers: HashMap::new(),
            inbox: VecDeque::new(),
            writer: CommandWriter::new(0),
        }
    }

    /// Run start / tune / open; returns the client's `start-ok`
    pub(crate) async fn handshake(&mut self, tuning: Tuning) -> Method {
        self.send(0, start_method()).await;
        let start_ok = self.expect(connection::CLASS, connection::START_OK).await;
        self.send(
            0,
            Method::new(connection::CLASS, connection::TUNE)
                .arg("channel_max", tuning.channel_max)
                .arg("frame_max", tuning.frame_max)
                .arg("heartbeat", tuning.heartbeat),
        )
        .await;
        let tune_ok = self.expect(connection::CLASS, connection::TUNE_OK).await;
        self.writer = CommandWriter::new(tune_ok.method.get_u32("frame_max"));
        self.decoder.set_frame_max(tune_ok.method.get_u32("frame_max"));
        self.expect(connection::CLASS, connection::OPEN).await;
        self.send(0, Method::new(connection::CLASS, connection::OPEN_OK).short_str("reserved1", ""))
            .await;
        start_ok.method
    }

    /// Next command from the client, `None` once it hangs up
    pub(crate) async fn recv(&mut self) -> Option<Command> {
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            if let Some(command) = self.inbox.pop_front() {
                return Some(command);
            }
            let n = self.stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            for frame in self.decoder.extract(&chunk[..n]).unwrap() {
                if frame.frame_type == FrameType::Heartbeat {
                    continue;
                }
                let assembler = self.assemblers.entry(frame.channel).or_default();
                if let Some(command) = assembler.push(frame).unwrap() {
                    self.inbox.push_back(command);
                }
            }
        }
    }

    /// Next command, which must be `class_id.method_id`
    pub(crate) async fn expect(&mut self, class_id: u16, method_id: u16) -> Command {
        let command = self.recv().await.expect("client hung up");
        assert!(
            command.is(class_id, method_id),
            "expected {class_id}.{method_id}, got {}.{}",
            command.method.class_id,
            command.method.method_id
        );
        command
    }

    pub(crate) async fn send(&mut self, channel: u16, method: Method) {
        self.write(Command::method(channel, method)).await;
    }

    pub(crate) async fn send_content(
        &mut self,
        channel: u16,
        method: Method,
        properties: BasicProperties,
        body: Bytes,
    ) {
        self.write(Command::with_content(channel, method, properties, body)).await;
    }

    async fn write(&mut self, command: Command) {
        let mut buf = BytesMut::new();
        self.writer.encode(&command, &mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub(crate) async fn read_exact_raw(&mut self, n: usize) -> Vec<u8> {
        assert!(self.decoder.buffered().is_empty());
        let mut out = vec![0u8; n];
        self.stream.read_exact(&mut out).await.unwrap();
        out
    }

    /// Whatever the client still sends until it shuts the socket down
    pub(crate) async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = self.decoder.buffered().to_vec();
        self.stream.read_to_end(&mut out).await.unwrap();
        out
    }

    /// Answer the usual RPCs automatically until the client closes.
    ///
    /// Methods pushed on `control` are sent as they arrive. Returns every command
    /// the client sent.
    pub(crate) async fn serve(mut self, mut control: mpsc::UnboundedReceiver<(u16, Method)>) -> Vec<Command> {
        let mut seen = Vec::new();
        let mut consumers = 0;
        loop {
            tokio::select! {
                Some((channel, method)) = control.recv() => self.send(channel, method).await,
                command = self.recv() => {
                    let Some(command) = command else { return seen };
                    let ch = command.channel;
                    let (class_id, method_id) = (command.method.class_id, command.method.method_id);
                    match (class_id, method_id) {
                        (channel::CLASS, channel::OPEN) => {
                            self.send(ch, Method::new(channel::CLASS, channel::OPEN_OK).arg("reserved1", "")).await
                        }
                        (channel::CLASS, channel::CLOSE) => {
                            self.send(ch, Method::new(channel::CLASS, channel::CLOSE_OK)).await
                        }
                        (basic::CLASS, basic::QOS) => {
                            self.send(ch, Method::new(basic::CLASS, basic::QOS_OK)).await
                        }
                        (basic::CLASS, basic::CONSUME) => {
                            consumers += 1;
                            let tag = format!("ctag-{consumers}");
                            self.send(ch, Method::new(basic::CLASS, basic::CONSUME_OK).short_str("consumer_tag", tag)).await
                        }
                        (queue::CLASS, queue::DECLARE) => {
                            let name = command.method.get_str("queue").to_string();
                            let ok = Method::new(queue::CLASS, queue::DECLARE_OK)
                                .short_str("queue", name)
                                .arg("message_count", 0u32)
                                .arg("consumer_count", 0u32);
                            self.send(ch, ok).await
                        }
                        (connection::CLASS, connection::CLOSE) => {
                            self.send(0, Method::new(connection::CLASS, connection::CLOSE_OK)).await;
                            seen.push(command);
                            return seen;
                        }
                        _ => {}
                    }
                    seen.push(command);
                }
            }
        }
    }
}

/// Broker that completes the handshake and then [`serve`](Broker::serve)s
pub(crate) async fn spawn_auto() -> (
    ConnectionConfig,
    mpsc::UnboundedSender<(u16, Method)>,
    JoinHandle<Vec<Command>>,
) {
    let (listener, config) = bind().await;
    let (control, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut broker = Broker::accept(&listener).await;
        broker.handshake(tuning()).await;
        broker.serve(rx).await
    });
    (config, control, task)
}
