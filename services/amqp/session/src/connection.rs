//! Connection orchestration: connect, channel-0 handshake, steady state and close.
//!
//! One reader task owns the socket's read half and demultiplexes frames to channel 0
//! or the [`ChannelManager`]; one writer task owns the write half and drains the
//! outbound queue that every channel, the heartbeat emitter and channel 0 share.
//!
//! The connection stays up until [`Connection::close`] is called or the broker or
//! socket ends it; dropping handles does not close it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use amqp_wire::{
    Command, CommandAssembler, CommandWriter, FieldTable, Frame, FrameDecoder,
    FrameType, WireError, PROTOCOL_HEADER,
};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::channel0::{Channel0, Channel0Action, HandshakeParams, Tuning};
use crate::error::{AmqpError, CloseReason, Result};
use crate::heartbeat::{self, Heartbeat};
use crate::manager::ChannelManager;
use crate::sink::{run_writer, CommandSink, Outbound, OutboundSink, OUTBOUND_QUEUE};
use crate::transport;

/// Socket read size
const READ_BUFFER: usize = 64 * 1024;

/// Connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// PLAIN user
    pub username: String,
    /// PLAIN password
    pub password: String,
    /// Virtual host
    pub vhost: String,
    /// Locale sent in `start-ok`
    pub locale: String,
    /// Name shown by the broker for this connection, empty to omit
    pub connection_name: String,
    /// Total TCP connect attempts; only "connection refused" is retried
    pub max_retries: u32,
    /// Pause between connect attempts
    pub retry_delay: Duration,
    /// Limit on connect plus handshake, `None` to wait indefinitely
    pub connect_timeout: Option<Duration>,
    /// Preferred highest channel number, 0 to accept the broker's
    pub channel_max: u16,
    /// Preferred frame size limit, 0 to accept the broker's
    pub frame_max: u32,
    /// Preferred heartbeat interval in seconds, 0 to accept the broker's
    pub heartbeat: u16,
    /// How long a channel RPC waits for its response
    pub rpc_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            locale: "en_US".to_string(),
            connection_name: String::new(),
            max_retries: 1,
            retry_delay: Duration::from_secs(1),
            connect_timeout: Some(Duration::from_secs(30)),
            channel_max: 0,
            frame_max: 131_072,
            heartbeat: 60,
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Handshake parameters derived from this config
    pub fn handshake_params(&self) -> HandshakeParams {
        HandshakeParams {
            username: self.username.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
            locale: self.locale.clone(),
            connection_name: self.connection_name.clone(),
            tuning: Tuning {
                channel_max: self.channel_max,
                frame_max: self.frame_max,
                heartbeat: self.heartbeat,
            },
        }
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ended, or never opened
    Closed,
    /// TCP connect in progress
    Connecting,
    /// Protocol handshake in progress
    Handshake,
    /// Ready for channels
    Open,
    /// `close()` in progress
    Closing,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
struct ConnectionInner {
    addr: String,
    state: watch::Sender<ConnectionState>,
    channel0: Mutex<Channel0>,
    tuning: Tuning,
    server_properties: FieldTable,
    sink: OutboundSink,
    manager: ChannelManager,
    blocked: watch::Sender<Option<String>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    close_ok: Mutex<Option<oneshot::Sender<()>>>,
    ended: OnceLock<Option<CloseReason>>,
    stop_reader: Notify,
    rpc_timeout: Duration,
}

/// Handle to an open AMQP connection; clones share the connection
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Result of a completed handshake
struct Handshaken {
    channel0: Channel0,
    tuning: Tuning,
    decoder: FrameDecoder,
    backlog: Vec<Frame>,
}

impl Connection {
    /// Connect over TCP and run the handshake.
    ///
    /// `connect_timeout` bounds the whole attempt, retries included.
    pub async fn connect(config: &ConnectionConfig) -> Result<Connection> {
        let addr = config.addr();
        debug!(%addr, state = ?ConnectionState::Connecting, "connecting");
        let attempt = async {
            let stream =
                transport::connect_tcp(&addr, config.max_retries, config.retry_delay).await?;
            Self::open(stream, config).await
        };
        match config.connect_timeout {
            Some(after) if !after.is_zero() => tokio::time::timeout(after, attempt)
                .await
                .map_err(|_| AmqpError::ConnectTimeout {
                    addr: addr.clone(),
                    after,
                })?,
            _ => attempt.await,
        }
    }

    /// Run the handshake over an already connected stream and start the I/O tasks
    pub async fn open<S>(stream: S, config: &ConnectionConfig) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let addr = config.addr();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let Handshaken {
            channel0,
            tuning,
            decoder,
            backlog,
        } = handshake(&mut reader, &mut writer, config.handshake_params()).await?;

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let sink = OutboundSink::new(tx, tuning.frame_max);
        let manager = ChannelManager::new(tuning.channel_max, Arc::new(sink.clone()), config.rpc_timeout);
        let heartbeat = (tuning.heartbeat > 0)
            .then(|| Heartbeat::spawn(Duration::from_secs(tuning.heartbeat.into()), sink.queue()));
        let (state, _) = watch::channel(ConnectionState::Open);
        let (blocked, _) = watch::channel(None);

        let inner = Arc::new(ConnectionInner {
            addr: addr.clone(),
            state,
            server_properties: channel0.server_properties().clone(),
            channel0: Mutex::new(channel0),
            tuning,
            sink,
            manager,
            blocked,
            heartbeat: Mutex::new(heartbeat),
            close_ok: Mutex::new(None),
            ended: OnceLock::new(),
            stop_reader: Notify::new(),
            rpc_timeout: config.rpc_timeout,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            if let Err(e) = run_writer(writer, rx).await {
                if let Some(inner) = weak.upgrade() {
                    error!(addr = %inner.addr, error = %e, "connection write failed");
                    inner.teardown(None);
                }
            }
        });
        tokio::spawn(run_reader(inner.clone(), reader, decoder, backlog));

        info!(
            %addr,
            channel_max = tuning.channel_max,
            frame_max = tuning.frame_max,
            heartbeat = tuning.heartbeat,
            "amqp connection established"
        );
        Ok(Connection { inner })
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether channels can be opened
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Negotiated limits
    pub fn tuning(&self) -> Tuning {
        self.inner.tuning
    }

    /// Properties the broker announced in `connection.start`
    pub fn server_properties(&self) -> &FieldTable {
        &self.inner.server_properties
    }

    /// The broker's reason while it refuses to read from this connection
    pub fn blocked(&self) -> Option<String> {
        self.inner.blocked.borrow().clone()
    }

    /// Follow `connection.blocked` / `connection.unblocked` notifications
    pub fn blocked_changes(&self) -> watch::Receiver<Option<String>> {
        self.inner.blocked.subscribe()
    }

    /// Channel manager of this connection
    pub fn channels(&self) -> &ChannelManager {
        &self.inner.manager
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            state => Err(match self.inner.ended.get() {
                Some(Some(reason)) => AmqpError::ConnectionClosed(reason.clone()),
                _ => AmqpError::ConnectionState(state),
            }),
        }
    }

    /// Open a channel on the next free number
    pub async fn open_channel(&self) -> Result<Channel> {
        self.ensure_open()?;
        self.inner.manager.open(None).await
    }

    /// The channel numbered `number`, opening it on that number if it is not live yet
    pub async fn channel(&self, number: u16) -> Result<Channel> {
        self.ensure_open()?;
        if let Some(channel) = self.inner.manager.get(number) {
            return Ok(channel);
        }
        self.inner.manager.open(Some(number)).await
    }

    /// Close every channel, then the connection.
    ///
    /// Waits up to the RPC timeout for the broker's `close-ok`; the socket is shut
    /// down either way.
    pub async fn close(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Closing => {
                self.closed().await;
                return Ok(());
            }
            _ => {}
        }
        self.inner.state.send_replace(ConnectionState::Closing);
        info!(addr = %self.inner.addr, "closing connection");

        self.inner.manager.close_all().await;

        let (tx, rx) = oneshot::channel();
        *lock(&self.inner.close_ok) = Some(tx);
        let close = lock(&self.inner.channel0).close(&CloseReason::normal());
        let sent = self.inner.sink.send(Command::method(0, close)).await;
        if sent.is_ok() && tokio::time::timeout(self.inner.rpc_timeout, rx).await.is_err() {
            warn!(addr = %self.inner.addr, "no connection.close-ok from server");
        }

        if let Some(flushed) = self.inner.teardown(None) {
            let _ = tokio::time::timeout(self.inner.rpc_timeout, flushed).await;
        }
        sent
    }

    /// Wait until the connection has ended; returns the broker's reason if it closed it
    pub async fn closed(&self) -> Option<CloseReason> {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
        self.inner.ended.get().cloned().flatten()
    }
}

impl ConnectionInner {
    /// End the connection. Runs once; returns a receiver that fires when the writer
    /// has flushed and shut the socket down.
    fn teardown(&self, reason: Option<CloseReason>) -> Option<oneshot::Receiver<()>> {
        if self.ended.set(reason.clone()).is_err() {
            return None;
        }
        self.state.send_replace(ConnectionState::Closed);
        lock(&self.heartbeat).take();
        self.manager.fail_all(reason);
        self.stop_reader.notify_one();
        if let Some(waiter) = lock(&self.close_ok).take() {
            let _ = waiter.send(());
        }

        let (ack, flushed) = oneshot::channel();
        let queue = self.sink.queue();
        tokio::spawn(async move {
            let _ = queue.send(Outbound::Shutdown(ack)).await;
        });
        debug!(addr = %self.addr, "connection torn down");
        Some(flushed)
    }

    async fn on_frame(&self, frame: Frame, assemblers: &mut HashMap<u16, CommandAssembler>) -> Result<()> {
        if frame.frame_type == FrameType::Heartbeat {
            return Ok(());
        }
        for freed in self.manager.take_released() {
            assemblers.remove(&freed);
        }
        let number = frame.channel;
        let assembler = assemblers.entry(number).or_default();
        let Some(command) = assembler.push(frame)? else {
            return Ok(());
        };
        if number == 0 {
            self.on_channel0(command).await
        } else {
            self.manager.dispatch(command).await
        }
    }

    async fn on_channel0(&self, command: Command) -> Result<()> {
        let actions = lock(&self.channel0).handle(command.method)?;
        for action in actions {
            match action {
                Channel0Action::Send(method) => self.sink.send(Command::method(0, method)).await?,
                Channel0Action::Blocked(reason) => {
                    self.blocked.send_replace(Some(reason));
                }
                Channel0Action::Unblocked => {
                    self.blocked.send_replace(None);
                }
                Channel0Action::PeerClosed(reason) => {
                    self.teardown(Some(reason));
                }
                Channel0Action::CloseCompleted => {
                    if let Some(waiter) = lock(&self.close_ok).take() {
                        let _ = waiter.send(());
                    }
                }
                Channel0Action::Tuned(_) | Channel0Action::Opened => {}
            }
        }
        Ok(())
    }

    /// Best-effort `connection.close` for a fatal inbound error
    async fn abort(&self, err: &AmqpError) {
        let reply_code = match err {
            AmqpError::Wire(WireError::ProtocolViolation(_)) => 505,
            AmqpError::Wire(_) => 501,
            AmqpError::UnknownChannel(_) => 504,
            _ => return,
        };
        let reason = CloseReason::new(reply_code, err.to_string(), 0, 0);
        let close = lock(&self.channel0).close(&reason);
        if let Err(e) = self.sink.send(Command::method(0, close)).await {
            debug!(error = %e, "could not send connection.close");
        }
    }
}

async fn handshake<R, W>(reader: &mut R, writer: &mut W, params: HandshakeParams) -> Result<Handshaken>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&PROTOCOL_HEADER).await?;
    writer.flush().await?;
    let mut channel0 = Channel0::new(params);
    channel0.begin();
    debug!(state = ?ConnectionState::Handshake, "protocol header sent");

    let mut decoder = FrameDecoder::new();
    let mut assembler = CommandAssembler::new();
    let mut out = CommandWriter::new(0);
    let mut chunk = vec![0u8; READ_BUFFER];
    let mut first = true;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(AmqpError::ConnectionLost(
                "server closed the socket during the handshake".to_string(),
            ));
        }
        let bytes = &chunk[..n];
        if first && bytes.starts_with(b"AMQP") {
            let offered = bytes
                .get(5..8)
                .map(|v| format!("{}-{}-{}", v[0], v[1], v[2]))
                .unwrap_or_else(|| "an unknown version".to_string());
            return Err(AmqpError::Handshake(format!(
                "server does not accept AMQP 0-9-1, it offered {offered}"
            )));
        }
        first = false;

        let mut frames = decoder.extract(bytes)?.into_iter();
        while let Some(frame) = frames.next() {
            if frame.channel != 0 {
                return Err(AmqpError::Wire(WireError::ProtocolViolation(format!(
                    "frame on channel {} during the handshake",
                    frame.channel
                ))));
            }
            let Some(command) = assembler.push(frame)? else {
                continue;
            };
            for action in channel0.handle(command.method)? {
                match action {
                    Channel0Action::Send(method) => {
                        let mut buf = BytesMut::new();
                        out.encode(&Command::method(0, method), &mut buf)?;
                        writer.write_all(&buf).await?;
                    }
                    Channel0Action::Tuned(tuning) => {
                        out = CommandWriter::new(tuning.frame_max);
                        decoder.set_frame_max(tuning.frame_max);
                    }
                    Channel0Action::Opened => {
                        writer.flush().await?;
                        let tuning = channel0.tuning().unwrap_or_default();
                        return Ok(Handshaken {
                            channel0,
                            tuning,
                            decoder,
                            backlog: frames.collect(),
                        });
                    }
                    Channel0Action::PeerClosed(reason) => {
                        writer.flush().await?;
                        return Err(AmqpError::ConnectionClosed(reason));
                    }
                    Channel0Action::Blocked(_)
                    | Channel0Action::Unblocked
                    | Channel0Action::CloseCompleted => {}
                }
            }
        }
        writer.flush().await?;
    }
}

async fn read_within<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8], idle: Option<Duration>) -> Result<usize> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, reader.read(buf))
            .await
            .map_err(|_| AmqpError::ConnectionLost(format!("nothing received from server for {limit:?}")))?
            .map_err(AmqpError::from),
        None => Ok(reader.read(buf).await?),
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    inner: &ConnectionInner,
    reader: &mut R,
    mut decoder: FrameDecoder,
    backlog: Vec<Frame>,
) -> Result<()> {
    let idle = heartbeat::idle_timeout(inner.tuning.heartbeat);
    let mut assemblers = HashMap::new();
    let mut chunk = vec![0u8; READ_BUFFER];

    for frame in backlog {
        inner.on_frame(frame, &mut assemblers).await?;
    }
    loop {
        let n = tokio::select! {
            biased;
            _ = inner.stop_reader.notified() => return Ok(()),
            read = read_within(reader, &mut chunk, idle) => read?,
        };
        if n == 0 {
            return Err(AmqpError::ConnectionLost("server closed the socket".to_string()));
        }
        for frame in decoder.extract(&chunk[..n])? {
            inner.on_frame(frame, &mut assemblers).await?;
            if inner.ended.get().is_some() {
                return Ok(());
            }
        }
    }
}

async fn run_reader<R: AsyncRead + Unpin>(
    inner: Arc<ConnectionInner>,
    mut reader: R,
    decoder: FrameDecoder,
    backlog: Vec<Frame>,
) {
    match read_loop(&inner, &mut reader, decoder, backlog).await {
        Ok(()) => debug!(addr = %inner.addr, "reader stopped"),
        Err(e) if inner.ended.get().is_some() => {
            debug!(addr = %inner.addr, error = %e, "reader stopped after close")
        }
        Err(e) => {
            error!(addr = %inner.addr, error = %e, "connection failed");
            inner.abort(&e).await;
            inner.teardown(None);
        }
    }
}
