//! AMQP 0-9-1 session layer: connection, channels, RPC correlation and pooling.
//!
//! Built on the `amqp-wire` codec. A [`Connection`] owns one TCP socket with a single
//! reader task and a single writer task; [`Channel`]s multiplex over it, each with
//! its own [`RpcCorrelator`] that pairs requests with responses.
//!
//! ## Features
//!
//! - **Handshake**: PLAIN login, tuning negotiation, version-mismatch detection
//! - **Reconnect Policy**: connection-refused retries with a fixed delay and an overall timeout
//! - **RPC Correlation**: per-class FIFO, timeouts, close interception, late-response swallowing
//! - **Channel Verbs**: exchange, queue and basic classes plus publisher confirms and flow
//! - **Consumers**: deliveries as a `Stream`, server cancel ends the stream
//! - **Heartbeats**: emitter on the outbound queue, inbound liveness deadline
//! - **Channel Pool**: fixed-size leases with transparent replacement of broker-closed channels
//!
//! ## Example
//!
//! ```rust,no_run
//! use amqp_session::{Connection, ConnectionConfig, ConsumeOptions, PublishOptions};
//!
//! # async fn run() -> amqp_session::Result<()> {
//! let conn = Connection::connect(&ConnectionConfig::default()).await?;
//! let channel = conn.open_channel().await?;
//! channel.queue_declare("films", Default::default()).await?;
//! channel.basic_publish(PublishOptions::new("", "films"), "Metropolis").await?;
//!
//! let mut consumer = channel.basic_consume("films", ConsumeOptions::default()).await?;
//! if let Some(delivery) = consumer.recv().await {
//!     channel.basic_ack(delivery.delivery_tag, false).await?;
//! }
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod channel;
pub mod channel0;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod options;
pub mod pool;
pub mod rpc;
pub mod sink;
pub mod transport;

#[cfg(test)]
mod test_broker;

// Re-export main types
pub use allocator::ChannelAllocator;
pub use channel::{Channel, ChannelState, CloseCause};
pub use channel0::{Channel0, Channel0Action, Channel0State, HandshakeParams, Tuning};
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use consumer::{Confirm, Consumer, Delivery, GetMessage, ReturnedMessage};
pub use error::{AmqpError, CloseReason, ReplyCode, Result};
pub use manager::ChannelManager;
pub use options::{
    ConsumeOptions, ExchangeDeclareOptions, ExchangeKind, MasterLocator, Overflow,
    PublishOptions, QueueArguments, QueueDeclareOk, QueueDeclareOptions, QueueMode,
    RESERVED_PREFIX,
};
pub use pool::{ChannelPool, PoolLease};
pub use rpc::{Expectation, RpcCorrelator};
pub use sink::{CommandSink, Outbound, OutboundSink};
