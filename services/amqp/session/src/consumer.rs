//! Messages handed to the application and the consumer stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use amqp_wire::{BasicProperties, Command};
use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::channel::Channel;
use crate::error::Result;

/// A message pushed to a consumer by `basic.deliver`
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel the message arrived on
    pub channel: u16,
    /// Consumer it was delivered to
    pub consumer_tag: String,
    /// Tag to acknowledge with
    pub delivery_tag: u64,
    /// Delivered before and not acknowledged
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Message properties
    pub properties: BasicProperties,
    /// Message body
    pub body: Bytes,
}

impl Delivery {
    pub(crate) fn from_command(command: Command) -> Self {
        let properties = command.properties();
        let m = &command.method;
        Self {
            channel: command.channel,
            consumer_tag: m.get_str("consumer_tag").to_string(),
            delivery_tag: m.get_u64("delivery_tag"),
            redelivered: m.get_bool("redelivered"),
            exchange: m.get_str("exchange").to_string(),
            routing_key: m.get_str("routing_key").to_string(),
            properties,
            body: command.body.unwrap_or_default(),
        }
    }

    /// Decode the body as JSON
    pub fn body_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// A message fetched with `basic.get`
#[derive(Debug, Clone, PartialEq)]
pub struct GetMessage {
    /// Tag to acknowledge with
    pub delivery_tag: u64,
    /// Delivered before and not acknowledged
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Messages left in the queue
    pub message_count: u32,
    /// Message properties
    pub properties: BasicProperties,
    /// Message body
    pub body: Bytes,
}

impl GetMessage {
    pub(crate) fn from_command(command: Command) -> Self {
        let properties = command.properties();
        let m = &command.method;
        Self {
            delivery_tag: m.get_u64("delivery_tag"),
            redelivered: m.get_bool("redelivered"),
            exchange: m.get_str("exchange").to_string(),
            routing_key: m.get_str("routing_key").to_string(),
            message_count: m.get_u32("message_count"),
            properties,
            body: command.body.unwrap_or_default(),
        }
    }

    /// Decode the body as JSON
    pub fn body_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// A mandatory or immediate message the broker could not route
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    /// Why it came back, e.g. 312 NO_ROUTE
    pub reply_code: u16,
    /// Broker's explanation
    pub reply_text: String,
    /// Exchange it was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Message properties
    pub properties: BasicProperties,
    /// Message body
    pub body: Bytes,
}

impl ReturnedMessage {
    pub(crate) fn from_command(command: Command) -> Self {
        let properties = command.properties();
        let m = &command.method;
        Self {
            reply_code: m.get_u16("reply_code"),
            reply_text: m.get_str("reply_text").to_string(),
            exchange: m.get_str("exchange").to_string(),
            routing_key: m.get_str("routing_key").to_string(),
            properties,
            body: command.body.unwrap_or_default(),
        }
    }
}

/// Publisher confirm from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    /// Message(s) accepted
    Ack {
        /// Publish sequence number
        delivery_tag: u64,
        /// Covers every number up to and including `delivery_tag`
        multiple: bool,
    },
    /// Message(s) lost by the broker
    Nack {
        /// Publish sequence number
        delivery_tag: u64,
        /// Covers every number up to and including `delivery_tag`
        multiple: bool,
        /// Requeue hint; always false for confirms
        requeue: bool,
    },
}

impl Confirm {
    /// Sequence number the confirm refers to
    pub fn delivery_tag(&self) -> u64 {
        match self {
            Confirm::Ack { delivery_tag, .. } | Confirm::Nack { delivery_tag, .. } => *delivery_tag,
        }
    }

    /// Whether `seq` is covered by this confirm
    pub fn covers(&self, seq: u64) -> bool {
        let (tag, multiple) = match *self {
            Confirm::Ack { delivery_tag, multiple } | Confirm::Nack { delivery_tag, multiple, .. } => {
                (delivery_tag, multiple)
            }
        };
        seq == tag || (multiple && seq <= tag)
    }
}

/// Stream of deliveries for one consumer tag.
///
/// Ends when the consumer is cancelled by either side or its channel closes.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    channel: Channel,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub(crate) fn new(tag: String, channel: Channel, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { tag, channel, rx }
    }

    /// Consumer tag assigned at `consume-ok`
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Channel the consumer lives on
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Next delivery, `None` once the consumer has ended
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Cancel with `basic.cancel`; deliveries already buffered are dropped
    pub async fn cancel(self) -> Result<()> {
        self.channel.basic_cancel(&self.tag).await
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_wire::{basic, Method};

    #[test]
    fn test_delivery_from_command() {
        let method = Method::new(basic::CLASS, basic::DELIVER)
            .short_str("consumer_tag", "ctag-1")
            .arg("delivery_tag", 42u64)
            .arg("redelivered", true)
            .short_str("exchange", "films")
            .short_str("routing_key", "movies");
        let command = Command::with_content(
            3,
            method,
            BasicProperties::default().with_content_type("application/json"),
            Bytes::from_static(br#"{"title":"Alien","year":1979}"#),
        );

        let delivery = Delivery::from_command(command);
        assert_eq!(delivery.channel, 3);
        assert_eq!(delivery.consumer_tag, "ctag-1");
        assert_eq!(delivery.delivery_tag, 42);
        assert!(delivery.redelivered);
        assert_eq!(delivery.routing_key, "movies");
        assert_eq!(delivery.properties.content_type.as_deref(), Some("application/json"));

        let value: serde_json::Value = delivery.body_json().unwrap();
        assert_eq!(value["year"], 1979);
    }

    #[test]
    fn test_confirm_covers() {
        let single = Confirm::Ack { delivery_tag: 5, multiple: false };
        assert!(single.covers(5));
        assert!(!single.covers(4));

        let batch = Confirm::Nack { delivery_tag: 5, multiple: true, requeue: false };
        assert!(batch.covers(1));
        assert!(batch.covers(5));
        assert!(!batch.covers(6));
        assert_eq!(batch.delivery_tag(), 5);
    }
}
