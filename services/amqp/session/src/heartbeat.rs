//! Heartbeat emitter and the inbound liveness deadline.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::sink::Outbound;

/// Missed intervals tolerated on the inbound side before the peer is considered gone
pub const MISSED_HEARTBEATS: u32 = 2;

/// Writes heartbeat frames into the outbound queue at a fixed rate.
///
/// The task stops when the handle is dropped, [`stop`](Self::stop) is called or
/// the queue closes.
#[derive(Debug)]
pub struct Heartbeat {
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Start emitting every `interval`; the first beat goes out one interval from now
    pub fn spawn(interval: Duration, queue: mpsc::Sender<Outbound>) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if queue.send(Outbound::Heartbeat).await.is_err() {
                    debug!("outbound queue closed, heartbeat stopped");
                    return;
                }
                trace!("heartbeat queued");
            }
        });
        Self { task }
    }

    /// Stop emitting
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// How long the reader waits for any inbound frame before declaring the peer lost
pub fn idle_timeout(heartbeat_secs: u16) -> Option<Duration> {
    (heartbeat_secs > 0).then(|| Duration::from_secs(heartbeat_secs as u64) * MISSED_HEARTBEATS)
}
