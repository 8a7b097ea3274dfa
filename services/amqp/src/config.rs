//! Client configuration.
//!
//! Reads an `amqp:` and a `pool:` section from a YAML file and applies `AMQP_*`
//! environment overrides on top. A missing or unparsable file falls back to the
//! defaults.

use std::path::Path;
use std::time::Duration;

use amqp_session::ConnectionConfig;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Humantime strings ("500ms", "30s") for `Duration` fields
mod duration_str {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Like `duration_str`; `null`, empty or "0s" means no limit
mod opt_duration_str {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => {
                let parsed = humantime::parse_duration(s).map_err(serde::de::Error::custom)?;
                Ok((!parsed.is_zero()).then_some(parsed))
            }
        }
    }
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpSection {
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
    /// Locale
    pub locale: String,
    /// Connection name shown by the broker
    pub connection_name: String,
    /// Total connect attempts
    pub max_retries: u32,
    /// Pause between connect attempts
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
    /// Limit on connect plus handshake
    #[serde(with = "opt_duration_str")]
    pub connect_timeout: Option<Duration>,
    /// Preferred highest channel number
    pub channel_max: u16,
    /// Preferred frame size limit
    pub frame_max: u32,
    /// Preferred heartbeat interval in seconds
    pub heartbeat: u16,
    /// Channel RPC timeout
    #[serde(with = "duration_str")]
    pub rpc_timeout: Duration,
}

impl From<ConnectionConfig> for AmqpSection {
    fn from(c: ConnectionConfig) -> Self {
        Self {
            host: c.host,
            port: c.port,
            username: c.username,
            password: c.password,
            vhost: c.vhost,
            locale: c.locale,
            connection_name: c.connection_name,
            max_retries: c.max_retries,
            retry_delay: c.retry_delay,
            connect_timeout: c.connect_timeout,
            channel_max: c.channel_max,
            frame_max: c.frame_max,
            heartbeat: c.heartbeat,
            rpc_timeout: c.rpc_timeout,
        }
    }
}

impl Default for AmqpSection {
    fn default() -> Self {
        ConnectionConfig::default().into()
    }
}

/// Channel pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Channels kept open
    pub size: usize,
    /// Per-consumer prefetch applied to every pooled channel
    pub prefetch: Option<u16>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            size: 4,
            prefetch: None,
        }
    }
}

/// Root of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection settings
    pub amqp: AmqpSection,
    /// Pool settings
    pub pool: PoolSection,
}

impl ClientConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<ClientConfig>(&content) {
                Ok(parsed) => {
                    info!("Loaded configuration from {:?}", path);
                    parsed
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            "Final amqp configuration: addr={}:{}, vhost={}, heartbeat={}, pool_size={}",
            config.amqp.host, config.amqp.port, config.amqp.vhost, config.amqp.heartbeat, config.pool.size
        );
        Ok(config)
    }

    /// Apply `AMQP_*` overrides; values that do not parse are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("AMQP_HOST") {
            self.amqp.host = host;
            info!("Host overridden by environment: {}", self.amqp.host);
        }
        if let Some(port) = lookup("AMQP_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.amqp.port = port;
            info!("Port overridden by environment: {}", port);
        }
        if let Some(username) = lookup("AMQP_USERNAME") {
            self.amqp.username = username;
        }
        if let Some(password) = lookup("AMQP_PASSWORD") {
            self.amqp.password = password;
        }
        if let Some(vhost) = lookup("AMQP_VHOST") {
            self.amqp.vhost = vhost;
            info!("Vhost overridden by environment: {}", self.amqp.vhost);
        }
        if let Some(heartbeat) = lookup("AMQP_HEARTBEAT").and_then(|v| v.parse::<u16>().ok()) {
            self.amqp.heartbeat = heartbeat;
            info!("Heartbeat overridden by environment: {}", heartbeat);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            bail!("pool.size must be at least 1");
        }
        if self.amqp.host.is_empty() {
            bail!("amqp.host must not be empty");
        }
        Ok(())
    }

    /// Settings for [`Connection::connect`](amqp_session::Connection::connect)
    pub fn to_connection_config(&self) -> ConnectionConfig {
        let a = &self.amqp;
        ConnectionConfig {
            host: a.host.clone(),
            port: a.port,
            username: a.username.clone(),
            password: a.password.clone(),
            vhost: a.vhost.clone(),
            locale: a.locale.clone(),
            connection_name: a.connection_name.clone(),
            max_retries: a.max_retries,
            retry_delay: a.retry_delay,
            connect_timeout: a.connect_timeout,
            channel_max: a.channel_max,
            frame_max: a.frame_max,
            heartbeat: a.heartbeat,
            rpc_timeout: a.rpc_timeout,
        }
    }
}
