//! Arguments for the exchange, queue and basic verbs.

use std::fmt;
use std::time::Duration;

use amqp_wire::{BasicProperties, FieldTable, FieldValue, Method};

use crate::error::{AmqpError, Result};

/// Prefix of names reserved for the broker
pub const RESERVED_PREFIX: &str = "amq.";

/// Reject names the broker reserves for itself
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.starts_with(RESERVED_PREFIX) {
        return Err(AmqpError::Validation(format!(
            "{kind} name '{name}' is not acceptable"
        )));
    }
    Ok(())
}

/// Exchange routing type
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    /// Exact routing key match
    #[default]
    Direct,
    /// Every bound queue
    Fanout,
    /// Pattern match on the routing key
    Topic,
    /// Match on message headers
    Headers,
    /// Plugin-provided type
    Custom(String),
}

impl ExchangeKind {
    /// Name used on the wire
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Custom(s) => s,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `exchange.declare` flags and arguments
#[derive(Debug, Clone, Default)]
pub struct ExchangeDeclareOptions {
    /// Only check that the exchange exists
    pub passive: bool,
    /// Survive broker restarts
    pub durable: bool,
    /// Delete once the last binding goes away
    pub auto_delete: bool,
    /// Not publishable by clients
    pub internal: bool,
    /// Do not wait for `declare-ok`
    pub no_wait: bool,
    /// Exchange receiving unroutable messages
    pub alternate_exchange: Option<String>,
    /// Extra arguments
    pub arguments: FieldTable,
}

impl ExchangeDeclareOptions {
    pub(crate) fn to_method(&self, name: &str, kind: &ExchangeKind) -> Method {
        let mut arguments = self.arguments.clone();
        if let Some(alt) = &self.alternate_exchange {
            arguments.insert("alternate-exchange", alt.as_str());
        }
        Method::new(amqp_wire::exchange::CLASS, amqp_wire::exchange::DECLARE)
            .arg("reserved1", 0u16)
            .short_str("exchange", name)
            .short_str("type", kind.as_str())
            .arg("passive", self.passive)
            .arg("durable", self.durable)
            .arg("auto_delete", self.auto_delete)
            .arg("internal", self.internal)
            .arg("no_wait", self.no_wait)
            .arg("arguments", arguments)
    }
}

/// `x-queue-mode` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Keep messages in memory when possible
    Default,
    /// Move messages to disk early
    Lazy,
}

/// `x-overflow` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Drop from the head when full
    DropHead,
    /// Refuse new publishes when full
    RejectPublish,
    /// Refuse and dead-letter new publishes when full
    RejectPublishDlx,
}

impl Overflow {
    fn as_str(self) -> &'static str {
        match self {
            Overflow::DropHead => "drop-head",
            Overflow::RejectPublish => "reject-publish",
            Overflow::RejectPublishDlx => "reject-publish-dlx",
        }
    }
}

/// `x-queue-master-locator` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterLocator {
    /// Node hosting the fewest masters
    MinMasters,
    /// Node the declaring client is connected to
    ClientLocal,
    /// Random node
    Random,
}

impl MasterLocator {
    fn as_str(self) -> &'static str {
        match self {
            MasterLocator::MinMasters => "min-masters",
            MasterLocator::ClientLocal => "client-local",
            MasterLocator::Random => "random",
        }
    }
}

/// Typed broker extensions for `queue.declare`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueArguments {
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
    /// `x-expires`, sent in milliseconds
    pub expires: Option<Duration>,
    /// `x-queue-mode`
    pub queue_mode: Option<QueueMode>,
    /// `x-max-length`
    pub max_length: Option<u64>,
    /// `x-max-length-bytes`
    pub max_length_bytes: Option<u64>,
    /// `x-max-priority`
    pub max_priority: Option<u8>,
    /// `x-message-ttl`, sent in milliseconds
    pub message_ttl: Option<Duration>,
    /// `x-overflow`
    pub overflow: Option<Overflow>,
    /// `x-queue-master-locator`
    pub master_locator: Option<MasterLocator>,
}

impl QueueArguments {
    /// Field table with only the arguments that are set
    pub fn to_table(&self) -> FieldTable {
        let millis = |d: &Duration| FieldValue::unsigned(d.as_millis().min(u64::MAX as u128) as u64);

        let mut table = FieldTable::new();
        if let Some(v) = &self.dead_letter_exchange {
            table.insert("x-dead-letter-exchange", v.as_str());
        }
        if let Some(v) = &self.dead_letter_routing_key {
            table.insert("x-dead-letter-routing-key", v.as_str());
        }
        if let Some(v) = &self.expires {
            table.insert("x-expires", millis(v));
        }
        if let Some(mode) = self.queue_mode {
            let mode = match mode {
                QueueMode::Default => "default",
                QueueMode::Lazy => "lazy",
            };
            table.insert("x-queue-mode", mode);
        }
        if let Some(v) = self.max_length {
            table.insert("x-max-length", FieldValue::unsigned(v));
        }
        if let Some(v) = self.max_length_bytes {
            table.insert("x-max-length-bytes", FieldValue::unsigned(v));
        }
        if let Some(v) = self.max_priority {
            table.insert("x-max-priority", FieldValue::unsigned(v as u64));
        }
        if let Some(v) = &self.message_ttl {
            table.insert("x-message-ttl", millis(v));
        }
        if let Some(v) = self.overflow {
            table.insert("x-overflow", v.as_str());
        }
        if let Some(v) = self.master_locator {
            table.insert("x-queue-master-locator", v.as_str());
        }
        table
    }
}

/// `queue.declare` flags and arguments
#[derive(Debug, Clone, Default)]
pub struct QueueDeclareOptions {
    /// Only check that the queue exists
    pub passive: bool,
    /// Survive broker restarts
    pub durable: bool,
    /// Private to this connection
    pub exclusive: bool,
    /// Delete once the last consumer goes away
    pub auto_delete: bool,
    /// Do not wait for `declare-ok`
    pub no_wait: bool,
    /// Typed broker extensions
    pub arguments: QueueArguments,
    /// Untyped arguments, merged over the typed ones
    pub extra: FieldTable,
}

impl QueueDeclareOptions {
    pub(crate) fn to_method(&self, name: &str) -> Method {
        let mut arguments = self.arguments.to_table();
        for (k, v) in self.extra.iter() {
            arguments.insert(k.clone(), v.clone());
        }
        Method::new(amqp_wire::queue::CLASS, amqp_wire::queue::DECLARE)
            .arg("reserved1", 0u16)
            .short_str("queue", name)
            .arg("passive", self.passive)
            .arg("durable", self.durable)
            .arg("exclusive", self.exclusive)
            .arg("auto_delete", self.auto_delete)
            .arg("no_wait", self.no_wait)
            .arg("arguments", arguments)
    }
}

/// Result of `queue.declare`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    /// Queue name, generated by the broker when declared with an empty name
    pub queue: String,
    /// Messages ready in the queue
    pub message_count: u32,
    /// Active consumers
    pub consumer_count: u32,
}

impl QueueDeclareOk {
    pub(crate) fn from_method(method: &Method) -> Self {
        Self {
            queue: method.get_str("queue").to_string(),
            message_count: method.get_u32("message_count"),
            consumer_count: method.get_u32("consumer_count"),
        }
    }
}

/// `basic.consume` flags and arguments
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Consumer tag; empty lets the broker pick one
    pub consumer_tag: String,
    /// Do not deliver messages published on this connection
    pub no_local: bool,
    /// Deliveries need no acknowledgement
    pub no_ack: bool,
    /// Sole consumer of the queue
    pub exclusive: bool,
    /// Extra arguments
    pub arguments: FieldTable,
}

/// `basic.publish` routing and properties
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Target exchange; empty is the default exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Return the message if it cannot be routed
    pub mandatory: bool,
    /// Return the message if it cannot be delivered right away
    pub immediate: bool,
    /// Message properties
    pub properties: BasicProperties,
}

impl PublishOptions {
    /// Publish to `exchange` with `routing_key`
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            ..Default::default()
        }
    }

    /// Set the message properties
    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Set the mandatory flag
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}
