//! Channel 0: connection handshake and close as a pure state machine.
//!
//! The connection feeds every channel-0 method into [`Channel0::handle`] and
//! carries out the returned actions; no I/O happens here.

use amqp_wire::{connection, FieldTable, Method, WireError};
use tracing::{debug, info, warn};

use crate::error::{AmqpError, CloseReason, Result};

/// Handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel0State {
    /// Protocol header not sent yet
    Closed,
    /// Waiting for `connection.start`
    AwaitingStart,
    /// Waiting for `connection.tune`
    AwaitingTune,
    /// Waiting for `connection.open-ok`
    AwaitingOpenOk,
    /// Handshake complete
    Open,
    /// `connection.close` sent, waiting for `close-ok`
    Closing,
}

/// Negotiated connection limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tuning {
    /// Highest channel number, 0 for no limit
    pub channel_max: u16,
    /// Largest frame in bytes, 0 for no limit
    pub frame_max: u32,
    /// Heartbeat interval in seconds, 0 disables heartbeats
    pub heartbeat: u16,
}

fn pick<T: Ord + Default + Copy>(client: T, server: T) -> T {
    let zero = T::default();
    if client == zero || server == zero {
        client.max(server)
    } else {
        client.min(server)
    }
}

impl Tuning {
    /// Combine the client's preferences with the server's proposal.
    ///
    /// Where either side says 0 the other side's value is used, otherwise the
    /// smaller one.
    pub fn negotiate(client: Tuning, server: Tuning) -> Tuning {
        Tuning {
            channel_max: pick(client.channel_max, server.channel_max),
            frame_max: pick(client.frame_max, server.frame_max),
            heartbeat: pick(client.heartbeat, server.heartbeat),
        }
    }

    fn from_method(method: &Method) -> Self {
        Self {
            channel_max: method.get_u16("channel_max"),
            frame_max: method.get_u32("frame_max"),
            heartbeat: method.get_u16("heartbeat"),
        }
    }
}

/// Credentials and preferences sent during the handshake
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    /// PLAIN user
    pub username: String,
    /// PLAIN password
    pub password: String,
    /// Virtual host to open
    pub vhost: String,
    /// Locale
    pub locale: String,
    /// Shown by the broker's management UI, empty to omit
    pub connection_name: String,
    /// Client-side tuning preferences
    pub tuning: Tuning,
}

/// What the connection must do after a channel-0 method
#[derive(Debug, Clone, PartialEq)]
pub enum Channel0Action {
    /// Write this method on channel 0
    Send(Method),
    /// Limits are final; apply them before anything else is sent
    Tuned(Tuning),
    /// `open-ok` received
    Opened,
    /// The broker stopped reading from this connection
    Blocked(String),
    /// The broker resumed reading
    Unblocked,
    /// The broker closed the connection; `close-ok` has been queued
    PeerClosed(CloseReason),
    /// Our close was acknowledged
    CloseCompleted,
}

/// Channel-0 state machine
#[derive(Debug)]
pub struct Channel0 {
    state: Channel0State,
    params: HandshakeParams,
    server_properties: FieldTable,
    tuning: Option<Tuning>,
}

fn client_properties(connection_name: &str) -> FieldTable {
    let capabilities = FieldTable::new()
        .with("publisher_confirms", true)
        .with("consumer_cancel_notify", true)
        .with("basic.nack", true)
        .with("connection.blocked", true)
        .with("exchange_exchange_bindings", true);
    let mut props = FieldTable::new()
        .with("product", env!("CARGO_PKG_NAME"))
        .with("version", env!("CARGO_PKG_VERSION"))
        .with("platform", "Rust")
        .with("capabilities", capabilities);
    if !connection_name.is_empty() {
        props.insert("connection_name", connection_name);
    }
    props
}

impl Channel0 {
    /// New state machine; call [`begin`](Self::begin) once the protocol header is sent
    pub fn new(params: HandshakeParams) -> Self {
        Self {
            state: Channel0State::Closed,
            params,
            server_properties: FieldTable::new(),
            tuning: None,
        }
    }

    /// Current state
    pub fn state(&self) -> Channel0State {
        self.state
    }

    /// Properties the server announced in `connection.start`
    pub fn server_properties(&self) -> &FieldTable {
        &self.server_properties
    }

    /// Negotiated limits, once tuned
    pub fn tuning(&self) -> Option<Tuning> {
        self.tuning
    }

    /// The protocol header went out; expect `connection.start`
    pub fn begin(&mut self) {
        self.state = Channel0State::AwaitingStart;
    }

    /// Start a client close and return the `connection.close` to send
    pub fn close(&mut self, reason: &CloseReason) -> Method {
        self.state = Channel0State::Closing;
        reason.to_method(connection::CLASS, connection::CLOSE)
    }

    fn unexpected(&self, method: &Method) -> AmqpError {
        AmqpError::Wire(WireError::ProtocolViolation(format!(
            "unexpected connection method {}.{} in state {:?}",
            method.class_id, method.method_id, self.state
        )))
    }

    /// Advance on one channel-0 method
    pub fn handle(&mut self, method: Method) -> Result<Vec<Channel0Action>> {
        if method.class_id != connection::CLASS {
            return Err(self.unexpected(&method));
        }

        match (self.state, method.method_id) {
            (Channel0State::Closing, connection::CLOSE_OK) => {
                self.state = Channel0State::Closed;
                Ok(vec![Channel0Action::CloseCompleted])
            }
            (Channel0State::Closing, connection::CLOSE) => {
                debug!("connection close crossed with server close");
                self.state = Channel0State::Closed;
                Ok(vec![
                    Channel0Action::Send(Method::new(connection::CLASS, connection::CLOSE_OK)),
                    Channel0Action::CloseCompleted,
                ])
            }
            (Channel0State::Closing, _) => Ok(Vec::new()),
            (Channel0State::Closed, _) => Err(self.unexpected(&method)),
            (_, connection::CLOSE) => {
                let reason = CloseReason::from_method(&method);
                warn!(%reason, "connection closed by server");
                self.state = Channel0State::Closed;
                Ok(vec![
                    Channel0Action::Send(Method::new(connection::CLASS, connection::CLOSE_OK)),
                    Channel0Action::PeerClosed(reason),
                ])
            }
            (Channel0State::AwaitingStart, connection::START) => self.on_start(method),
            (Channel0State::AwaitingTune, connection::TUNE) => {
                let server = Tuning::from_method(&method);
                let tuning = Tuning::negotiate(self.params.tuning, server);
                debug!(?server, ?tuning, "tuned");
                self.tuning = Some(tuning);
                self.state = Channel0State::AwaitingOpenOk;
                let tune_ok = Method::new(connection::CLASS, connection::TUNE_OK)
                    .arg("channel_max", tuning.channel_max)
                    .arg("frame_max", tuning.frame_max)
                    .arg("heartbeat", tuning.heartbeat);
                let open = Method::new(connection::CLASS, connection::OPEN)
                    .short_str("virtual_host", self.params.vhost.clone())
                    .short_str("reserved1", "")
                    .arg("reserved2", false);
                Ok(vec![
                    Channel0Action::Tuned(tuning),
                    Channel0Action::Send(tune_ok),
                    Channel0Action::Send(open),
                ])
            }
            (Channel0State::AwaitingTune, connection::SECURE) => Err(AmqpError::Handshake(
                "server sent a SASL challenge; only PLAIN is supported".to_string(),
            )),
            (Channel0State::AwaitingOpenOk, connection::OPEN_OK) => {
                self.state = Channel0State::Open;
                info!(vhost = %self.params.vhost, "connection open");
                Ok(vec![Channel0Action::Opened])
            }
            (Channel0State::Open, connection::BLOCKED) => {
                let reason = method.get_str("reason").to_string();
                warn!(%reason, "connection blocked by server");
                Ok(vec![Channel0Action::Blocked(reason)])
            }
            (Channel0State::Open, connection::UNBLOCKED) => {
                info!("connection unblocked");
                Ok(vec![Channel0Action::Unblocked])
            }
            _ => Err(self.unexpected(&method)),
        }
    }

    fn on_start(&mut self, method: Method) -> Result<Vec<Channel0Action>> {
        let major = method.args.get("version_major").and_then(|v| v.as_u8()).unwrap_or(0);
        let minor = method.args.get("version_minor").and_then(|v| v.as_u8()).unwrap_or(0);
        if (major, minor) != (0, 9) {
            return Err(AmqpError::Handshake(format!(
                "server speaks AMQP {major}-{minor}, expected 0-9"
            )));
        }

        let mechanisms = method.get_str("mechanisms");
        if !mechanisms.split(' ').any(|m| m == "PLAIN") {
            return Err(AmqpError::Handshake(format!(
                "PLAIN authentication not offered (server offers '{mechanisms}')"
            )));
        }

        if let Some(props) = method.get_table("server_properties") {
            self.server_properties = props.clone();
        }
        debug!(
            product = self.server_properties.get("product").and_then(|v| v.as_str()).unwrap_or(""),
            version = self.server_properties.get("version").and_then(|v| v.as_str()).unwrap_or(""),
            "connection.start received"
        );

        let response = format!("\0{}\0{}", self.params.username, self.params.password);
        let start_ok = Method::new(connection::CLASS, connection::START_OK)
            .arg("client_properties", client_properties(&self.params.connection_name))
            .short_str("mechanism", "PLAIN")
            .arg("response", response)
            .short_str("locale", self.params.locale.clone());
        self.state = Channel0State::AwaitingTune;
        Ok(vec![Channel0Action::Send(start_ok)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_wire::FieldValue;

    fn params() -> HandshakeParams {
        HandshakeParams {
            username: "guest".into(),
            password: "secret".into(),
            vhost: "/films".into(),
            locale: "en_US".into(),
            connection_name: "catalog".into(),
            tuning: Tuning {
                channel_max: 0,
                frame_max: 131_072,
                heartbeat: 60,
            },
        }
    }

    fn start() -> Method {
        Method::new(connection::CLASS, connection::START)
            .arg("version_major", 0u8)
            .arg("version_minor", 9u8)
            .arg("server_properties", FieldTable::new().with("product", "RabbitMQ"))
            .arg("mechanisms", "AMQPLAIN PLAIN")
            .arg("locales", "en_US")
    }

    fn tune(channel_max: u16, frame_max: u32, heartbeat: u16) -> Method {
        Method::new(connection::CLASS, connection::TUNE)
            .arg("channel_max", channel_max)
            .arg("frame_max", frame_max)
            .arg("heartbeat", heartbeat)
    }

    fn sent(actions: &[Channel0Action]) -> Vec<&Method> {
        actions
            .iter()
            .filter_map(|a| match a {
                Channel0Action::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_full_handshake() {
        let mut ch0 = Channel0::new(params());
        ch0.begin();

        let actions = ch0.handle(start()).unwrap();
        let start_ok = sent(&actions)[0];
        assert!(start_ok.is(connection::CLASS, connection::START_OK));
        assert_eq!(start_ok.get_str("mechanism"), "PLAIN");
        assert_eq!(
            start_ok.args.get("response"),
            Some(&FieldValue::from("\0guest\0secret"))
        );
        let props = start_ok.get_table("client_properties").unwrap();
        assert_eq!(props.get("connection_name").and_then(|v| v.as_str()), Some("catalog"));
        assert!(props.get("capabilities").and_then(|v| v.as_table()).is_some());
        assert_eq!(ch0.server_properties().get("product").and_then(|v| v.as_str()), Some("RabbitMQ"));

        let actions = ch0.handle(tune(2047, 131_072, 30)).unwrap();
        let expected = Tuning {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 30,
        };
        assert_eq!(actions[0], Channel0Action::Tuned(expected));
        let out = sent(&actions);
        assert!(out[0].is(connection::CLASS, connection::TUNE_OK));
        assert_eq!(out[0].get_u16("heartbeat"), 30);
        assert!(out[1].is(connection::CLASS, connection::OPEN));
        assert_eq!(out[1].get_str("virtual_host"), "/films");

        let actions = ch0
            .handle(Method::new(connection::CLASS, connection::OPEN_OK))
            .unwrap();
        assert_eq!(actions, vec![Channel0Action::Opened]);
        assert_eq!(ch0.state(), Channel0State::Open);
        assert_eq!(ch0.tuning(), Some(expected));
    }

    #[test]
    fn test_tuning_negotiation() {
        let client = Tuning {
            channel_max: 0,
            frame_max: 131_072,
            heartbeat: 0,
        };
        let server = Tuning {
            channel_max: 2047,
            frame_max: 0,
            heartbeat: 60,
        };
        assert_eq!(Tuning::negotiate(client, server), Tuning {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
        });
        let both = Tuning {
            channel_max: 10,
            frame_max: 8192,
            heartbeat: 5,
        };
        assert_eq!(Tuning::negotiate(both, server).frame_max, 8192);
        assert_eq!(Tuning::negotiate(both, server).channel_max, 10);
    }

    #[test]
    fn test_close_during_handshake() {
        let mut ch0 = Channel0::new(params());
        ch0.begin();
        ch0.handle(start()).unwrap();

        let reason = CloseReason::new(403, "ACCESS_REFUSED - Login was refused", 10, 11);
        let actions = ch0
            .handle(reason.to_method(connection::CLASS, connection::CLOSE))
            .unwrap();
        assert!(sent(&actions)[0].is(connection::CLASS, connection::CLOSE_OK));
        assert_eq!(actions[1], Channel0Action::PeerClosed(reason));
        assert_eq!(ch0.state(), Channel0State::Closed);
    }

    #[test]
    fn test_rejects_unsupported_server() {
        let mut ch0 = Channel0::new(params());
        ch0.begin();
        let wrong_version = start().arg("version_major", 1u8).arg("version_minor", 0u8);
        assert!(matches!(ch0.handle(wrong_version), Err(AmqpError::Handshake(_))));

        let mut ch0 = Channel0::new(params());
        ch0.begin();
        let no_plain = start().arg("mechanisms", "EXTERNAL");
        assert!(matches!(ch0.handle(no_plain), Err(AmqpError::Handshake(_))));

        let mut ch0 = Channel0::new(params());
        ch0.begin();
        ch0.handle(start()).unwrap();
        let secure = Method::new(connection::CLASS, connection::SECURE).arg("challenge", "x");
        assert!(matches!(ch0.handle(secure), Err(AmqpError::Handshake(_))));
    }

    #[test]
    fn test_out_of_order_method_is_violation() {
        let mut ch0 = Channel0::new(params());
        ch0.begin();
        let err = ch0.handle(tune(0, 0, 0)).unwrap_err();
        assert!(matches!(err, AmqpError::Wire(WireError::ProtocolViolation(_))));
    }

    #[test]
    fn test_blocked_and_close() {
        let mut ch0 = Channel0::new(params());
        ch0.begin();
        ch0.handle(start()).unwrap();
        ch0.handle(tune(0, 0, 0)).unwrap();
        ch0.handle(Method::new(connection::CLASS, connection::OPEN_OK)).unwrap();

        let blocked = Method::new(connection::CLASS, connection::BLOCKED).short_str("reason", "low on memory");
        assert_eq!(
            ch0.handle(blocked).unwrap(),
            vec![Channel0Action::Blocked("low on memory".into())]
        );
        assert_eq!(
            ch0.handle(Method::new(connection::CLASS, connection::UNBLOCKED)).unwrap(),
            vec![Channel0Action::Unblocked]
        );

        let close = ch0.close(&CloseReason::normal());
        assert_eq!(close.get_u16("reply_code"), 200);
        assert_eq!(ch0.state(), Channel0State::Closing);
        // Anything but close/close-ok is dropped while closing
        assert!(ch0.handle(Method::new(connection::CLASS, connection::UNBLOCKED)).unwrap().is_empty());
        assert_eq!(
            ch0.handle(Method::new(connection::CLASS, connection::CLOSE_OK)).unwrap(),
            vec![Channel0Action::CloseCompleted]
        );
        assert_eq!(ch0.state(), Channel0State::Closed);
    }
}
