//! Channel manager: number allocation and inbound demultiplexing.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use amqp_wire::{channel, Command, Method};
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::allocator::ChannelAllocator;
use crate::channel::{Channel, CloseCause};
use crate::error::{AmqpError, CloseReason, Result};
use crate::sink::CommandSink;

/// What becomes of a finished channel's number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Free it now
    Free,
    /// Our `channel.close` timed out; hold the number until `close-ok`
    AwaitCloseOk,
    /// Our `channel.open` timed out; the broker may still open the channel
    AwaitOpenOk,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Channels by number plus the numbers they hold
#[derive(Debug)]
pub(crate) struct Registry {
    allocator: Mutex<ChannelAllocator>,
    channels: DashMap<u16, Channel>,
    /// Numbers of channels given up locally that the broker may still hold,
    /// with whether our `channel.close` is outstanding
    abandoned: DashMap<u16, bool>,
    /// Freed numbers the reader has not yet seen
    released: Mutex<Vec<u16>>,
}

impl Registry {
    fn allocator(&self) -> MutexGuard<'_, ChannelAllocator> {
        lock(&self.allocator)
    }

    /// Forget a finished channel; its number is freed or held per `release`
    pub(crate) fn release(&self, number: u16, release: Release) {
        if self.channels.remove(&number).is_none() {
            return;
        }
        match release {
            Release::Free => self.free(number),
            Release::AwaitCloseOk | Release::AwaitOpenOk => {
                self.abandoned.insert(number, release == Release::AwaitCloseOk);
                debug!(channel = number, ?release, "channel number held until the broker settles it");
            }
        }
    }

    fn free(&self, number: u16) {
        self.allocator().free(number);
        lock(&self.released).push(number);
        debug!(channel = number, "channel number released");
    }

    fn settle(&self, number: u16) {
        if self.abandoned.remove(&number).is_some() {
            self.free(number);
        }
    }
}

/// Owns every open channel of a connection
#[derive(Debug, Clone)]
pub struct ChannelManager {
    registry: Arc<Registry>,
    sink: Arc<dyn CommandSink>,
    rpc_timeout: Duration,
}

impl ChannelManager {
    /// Manager for the negotiated `channel_max` (0 means the full range)
    pub fn new(channel_max: u16, sink: Arc<dyn CommandSink>, rpc_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Registry {
                allocator: Mutex::new(ChannelAllocator::new(channel_max)),
                channels: DashMap::new(),
                abandoned: DashMap::new(),
                released: Mutex::new(Vec::new()),
            }),
            sink,
            rpc_timeout,
        }
    }

    /// Open a channel, on `number` if given or the next free number otherwise
    pub async fn open(&self, number: Option<u16>) -> Result<Channel> {
        let number = {
            let mut allocator = self.registry.allocator();
            match number {
                Some(n) => {
                    allocator.reserve(n)?;
                    n
                }
                None => allocator.allocate()?,
            }
        };

        let channel = Channel::new(
            number,
            self.sink.clone(),
            self.rpc_timeout,
            Arc::downgrade(&self.registry),
        );
        self.registry.channels.insert(number, channel.clone());

        if let Err(e) = channel.open().await {
            warn!(channel = number, error = %e, "channel open failed");
            let release = match &e {
                AmqpError::RpcTimeout { .. } => Release::AwaitOpenOk,
                _ => Release::Free,
            };
            channel.end(CloseCause::Local, release);
            return Err(e);
        }
        Ok(channel)
    }

    /// Channel by number
    pub fn get(&self, number: u16) -> Option<Channel> {
        self.registry.channels.get(&number).map(|c| c.value().clone())
    }

    /// Number of live channels
    pub fn len(&self) -> usize {
        self.registry.channels.len()
    }

    /// Whether no channel is live
    pub fn is_empty(&self) -> bool {
        self.registry.channels.is_empty()
    }

    /// Whether `number` is allocated, including numbers held for an abandoned channel
    pub fn is_allocated(&self, number: u16) -> bool {
        self.registry.allocator().is_allocated(number)
    }

    /// Numbers freed since the last call
    pub(crate) fn take_released(&self) -> Vec<u16> {
        std::mem::take(&mut *lock(&self.registry.released))
    }

    /// Route an inbound command to its channel.
    ///
    /// A command for a channel this connection does not own is a fatal protocol error.
    pub async fn dispatch(&self, command: Command) -> Result<()> {
        if let Some(channel) = self.get(command.channel) {
            channel.dispatch(command).await;
            return Ok(());
        }
        let Some(close_pending) = self.registry.abandoned.get(&command.channel).map(|e| *e) else {
            return Err(AmqpError::UnknownChannel(command.channel));
        };
        self.settle_abandoned(command, close_pending).await;
        Ok(())
    }

    /// Late traffic for a channel whose open or close timed out
    async fn settle_abandoned(&self, command: Command, close_pending: bool) {
        let number = command.channel;
        match (command.method.class_id, command.method.method_id) {
            (channel::CLASS, channel::CLOSE_OK) => self.registry.settle(number),
            (channel::CLASS, channel::CLOSE) => {
                let ok = Method::new(channel::CLASS, channel::CLOSE_OK);
                if let Err(e) = self.sink.send(Command::method(number, ok)).await {
                    warn!(channel = number, error = %e, "failed to send close-ok");
                }
                if !close_pending {
                    self.registry.settle(number);
                }
            }
            (channel::CLASS, channel::OPEN_OK) => {
                let close = CloseReason::normal().to_method(channel::CLASS, channel::CLOSE);
                match self.sink.send(Command::method(number, close)).await {
                    Ok(()) => {
                        if let Some(mut pending) = self.registry.abandoned.get_mut(&number) {
                            *pending = true;
                        }
                    }
                    Err(e) => warn!(channel = number, error = %e, "failed to close late-opened channel"),
                }
            }
            (class_id, method_id) => {
                debug!(channel = number, class_id, method_id, "dropped method for abandoned channel")
            }
        }
    }

    fn snapshot(&self) -> Vec<Channel> {
        self.registry
            .channels
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// Close every channel concurrently
    pub async fn close_all(&self) {
        let channels = self.snapshot();
        let results = join_all(channels.iter().map(|c| c.close())).await;
        for (channel, result) in channels.iter().zip(results) {
            if let Err(e) = result {
                debug!(channel = channel.number(), error = %e, "channel close failed");
                channel.finish(CloseCause::Local);
            }
        }
    }

    /// End every channel because the connection is gone
    pub fn fail_all(&self, reason: Option<CloseReason>) {
        for channel in self.snapshot() {
            channel.finish(CloseCause::Connection(reason.clone()));
        }
        let abandoned: Vec<u16> = self.registry.abandoned.iter().map(|e| *e.key()).collect();
        for number in abandoned {
            self.registry.settle(number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::sink::recording::RecordingSink;
    use amqp_wire::basic;

    async fn until(cond: impl Fn() -> bool) {
        while !cond() {
            tokio::task::yield_now().await;
        }
    }

    async fn open(manager: &ChannelManager, sink: &RecordingSink, number: Option<u16>) -> Channel {
        let before = sink.sent().len();
        let opening = tokio::spawn({
            let manager = manager.clone();
            async move { manager.open(number).await }
        });
        until(|| sink.sent().len() > before).await;
        let n = sink.last().unwrap().channel;
        manager
            .dispatch(Command::method(n, Method::new(channel::CLASS, channel::OPEN_OK)))
            .await
            .unwrap();
        opening.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_open_and_dispatch() {
        let sink = Arc::new(RecordingSink::default());
        let manager = ChannelManager::new(10, sink.clone(), Duration::from_secs(5));

        let a = open(&manager, &sink, None).await;
        let b = open(&manager, &sink, Some(7)).await;
        assert_eq!(a.number(), 1);
        assert_eq!(b.number(), 7);
        assert_eq!(manager.len(), 2);
        assert!(manager.get(7).unwrap().same_channel(&b));

        let err = manager.open(Some(7)).await.unwrap_err();
        assert!(matches!(err, AmqpError::ChannelInUse(7)));
    }

    #[tokio::test]
    async fn test_unknown_channel_is_fatal() {
        let sink = Arc::new(RecordingSink::default());
        let manager = ChannelManager::new(10, sink, Duration::from_secs(5));
        let err = manager
            .dispatch(Command::method(3, Method::new(channel::CLASS, channel::OPEN_OK)))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::UnknownChannel(3)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_peer_close_releases_number_once() {
        let sink = Arc::new(RecordingSink::default());
        let manager = ChannelManager::new(2, sink.clone(), Duration::from_secs(5));
        let ch = open(&manager, &sink, None).await;
        assert!(manager.is_allocated(1));

        let reason = CloseReason::new(406, "PRECONDITION_FAILED", 50, 10);
        manager
            .dispatch(Command::method(1, reason.to_method(channel::CLASS, channel::CLOSE)))
            .await
            .unwrap();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(!manager.is_allocated(1));
        assert!(manager.is_empty());

        ch.finish(CloseCause::Local);
        assert!(!manager.is_allocated(1));

        // The number is available again
        let next = open(&manager, &sink, None).await;
        let again = open(&manager, &sink, None).await;
        assert_eq!((next.number(), again.number()), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_timeout_holds_number_until_close_ok() {
        let sink = Arc::new(RecordingSink::default());
        let manager = ChannelManager::new(2, sink.clone(), Duration::from_millis(50));
        let ch = open(&manager, &sink, None).await;
        manager.take_released();

        let err = ch.close().await.unwrap_err();
        assert!(matches!(err, AmqpError::RpcTimeout { class_id: 20, method_id: 40, .. }));
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(manager.get(1).is_none());
        assert!(manager.is_allocated(1));
        assert!(manager.take_released().is_empty());

        // Not reused while the broker may still hold it
        let other = open(&manager, &sink, None).await;
        assert_eq!(other.number(), 2);
        assert!(matches!(manager.open(None).await, Err(AmqpError::ChannelsExhausted)));

        manager
            .dispatch(Command::method(1, Method::new(channel::CLASS, channel::CLOSE_OK)))
            .await
            .unwrap();
        assert!(!manager.is_allocated(1));
        assert_eq!(manager.take_released(), vec![1]);
        assert!(other.is_open());

        // Once settled, the number is unknown again
        let err = manager
            .dispatch(Command::method(1, Method::new(channel::CLASS, channel::CLOSE_OK)))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::UnknownChannel(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crossing_close_after_close_timeout() {
        let sink = Arc::new(RecordingSink::default());
        let manager = ChannelManager::new(0, sink.clone(), Duration::from_millis(50));
        let ch = open(&manager, &sink, None).await;
        assert!(ch.close().await.is_err());

        let reason = CloseReason::new(406, "PRECONDITION_FAILED", 0, 0);
        manager
            .dispatch(Command::method(1, reason.to_method(channel::CLASS, channel::CLOSE)))
            .await
            .unwrap();
        assert!(sink.last().unwrap().is(channel::CLASS, channel::CLOSE_OK));
        assert!(manager.is_allocated(1));

        manager
            .dispatch(Command::method(1, Method::new(channel::CLASS, channel::CLOSE_OK)))
            .await
            .unwrap();
        assert!(!manager.is_allocated(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_closes_late_channel() {
        let sink = Arc::new(RecordingSink::default());
        let manager = ChannelManager::new(0, sink.clone(), Duration::from_millis(50));

        let err = manager.open(None).await.unwrap_err();
        assert!(matches!(err, AmqpError::RpcTimeout { class_id: 20, method_id: 10, .. }));
        assert!(manager.is_empty());
        assert!(manager.is_allocated(1));

        // Deliveries racing the late open-ok are dropped, not fatal
        manager
            .dispatch(Command::method(1, Method::new(basic::CLASS, basic::QOS_OK)))
            .await
            .unwrap();
        manager
            .dispatch(Command::method(1, Method::new(channel::CLASS, channel::OPEN_OK)))
            .await
            .unwrap();
        let close = sink.last().unwrap();
        assert_eq!(close.channel, 1);
        assert!(close.is(channel::CLASS, channel::CLOSE));
        assert!(manager.is_allocated(1));

        manager
            .dispatch(Command::method(1, Method::new(channel::CLASS, channel::CLOSE_OK)))
            .await
            .unwrap();
        assert!(!manager.is_allocated(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_open_after_timeout_frees_number() {
        let sink = Arc::new(RecordingSink::default());
        let manager = ChannelManager::new(0, sink.clone(), Duration::from_millis(50));
        assert!(manager.open(Some(5)).await.is_err());

        let reason = CloseReason::new(530, "NOT_ALLOWED", 20, 10);
        manager
            .dispatch(Command::method(5, reason.to_method(channel::CLASS, channel::CLOSE)))
            .await
            .unwrap();
        assert!(sink.last().unwrap().is(channel::CLASS, channel::CLOSE_OK));
        assert!(!manager.is_allocated(5));
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let sink = Arc::new(RecordingSink::default());
        let manager = ChannelManager::new(1, sink.clone(), Duration::from_secs(5));
        open(&manager, &sink, None).await;
        assert!(matches!(manager.open(None).await, Err(AmqpError::ChannelsExhausted)));
    }

    #[tokio::test]
    async fn test_fail_all_ends_channels() {
        let sink = Arc::new(RecordingSink::default());
        let manager = ChannelManager::new(0, sink.clone(), Duration::from_secs(5));
        let a = open(&manager, &sink, None).await;
        let b = open(&manager, &sink, None).await;

        let reason = CloseReason::new(320, "CONNECTION_FORCED", 0, 0);
        manager.fail_all(Some(reason.clone()));
        assert_eq!(a.closed().await, CloseCause::Connection(Some(reason.clone())));
        assert_eq!(b.close_cause(), Some(CloseCause::Connection(Some(reason))));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_close_all() {
        let sink = Arc::new(RecordingSink::default());
        let manager = ChannelManager::new(0, sink.clone(), Duration::from_secs(5));
        let a = open(&manager, &sink, None).await;
        let b = open(&manager, &sink, None).await;

        let closing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.close_all().await }
        });
        until(|| {
            sink.sent()
                .iter()
                .filter(|c| c.is(channel::CLASS, channel::CLOSE))
                .count()
                == 2
        })
        .await;
        for n in [a.number(), b.number()] {
            manager
                .dispatch(Command::method(n, Method::new(channel::CLASS, channel::CLOSE_OK)))
                .await
                .unwrap();
        }
        closing.await.unwrap();
        assert!(manager.is_empty());
        assert_eq!(a.close_cause(), Some(CloseCause::Local));
    }
}
