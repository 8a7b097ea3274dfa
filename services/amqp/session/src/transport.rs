//! TCP transport with the connection-refused retry policy.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{AmqpError, Result};

/// Connect to `addr`.
///
/// Only "connection refused" is retried, up to `max_attempts` attempts in total
/// with `retry_delay` between them; any other socket error fails immediately.
/// At least one attempt is always made.
pub async fn connect_tcp(addr: &str, max_attempts: u32, retry_delay: Duration) -> Result<TcpStream> {
    let max_attempts = max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(addr, attempts, "tcp connected");
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::ConnectionRefused && attempts < max_attempts => {
                warn!(addr, attempts, max_attempts, delay = ?retry_delay, "connection refused, retrying");
                tokio::time::sleep(retry_delay).await;
            }
            Err(source) => {
                return Err(AmqpError::Connect {
                    addr: addr.to_string(),
                    attempts,
                    source,
                })
            }
        }
    }
}
