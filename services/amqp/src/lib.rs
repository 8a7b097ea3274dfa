//! AMQP 0-9-1 client.
//!
//! Re-exports the [`wire`] codec and the [`session`] layer, and adds file/env
//! configuration ([`config`]) and an optional log formatter ([`logging`]).
//!
//! ## Example
//!
//! ```rust,no_run
//! use amqp_client::config::ClientConfig;
//! use amqp_client::PublishOptions;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ClientConfig::load_from_file("amqp.yaml")?;
//! let (conn, pool) = amqp_client::connect_pool(&config).await?;
//! let channel = pool.acquire().await?;
//! channel.basic_publish(PublishOptions::new("", "films"), "Nosferatu").await?;
//! drop(channel);
//! pool.close().await;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod logging;

pub use amqp_session as session;
pub use amqp_wire as wire;

pub use amqp_session::{
    AmqpError, Channel, ChannelPool, CloseReason, Connection, ConnectionConfig, ConsumeOptions,
    Consumer, Delivery, ExchangeDeclareOptions, ExchangeKind, PoolLease, PublishOptions,
    QueueArguments, QueueDeclareOptions, ReplyCode, Result,
};
pub use amqp_wire::{BasicProperties, FieldTable, FieldValue};

use config::ClientConfig;

/// Connect with `config.amqp` and open a pool sized by `config.pool`
pub async fn connect_pool(config: &ClientConfig) -> Result<(Connection, ChannelPool)> {
    let conn = Connection::connect(&config.to_connection_config()).await?;
    match ChannelPool::open(&conn, config.pool.size, config.pool.prefetch).await {
        Ok(pool) => Ok((conn, pool)),
        Err(e) => {
            let _ = conn.close().await;
            Err(e)
        }
    }
}
