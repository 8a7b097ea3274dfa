//! Fixed-size pool of pre-opened channels handed out as leases.
//!
//! A channel the broker closes while the pool is open is replaced in the same slot.
//! Channels lost with the connection are not replaced; once no slot is left the
//! queued acquires fail.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use futures::stream::{self, Stream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::channel::{Channel, CloseCause};
use crate::connection::Connection;
use crate::error::{AmqpError, Result};

type Waiter = oneshot::Sender<Result<PoolLease>>;

#[derive(Debug)]
struct PoolState {
    open: bool,
    slots: Vec<Option<Channel>>,
    idle: VecDeque<usize>,
    waiters: VecDeque<Waiter>,
    replacing: usize,
}

impl PoolState {
    fn holds(&self, slot: usize, channel: &Channel) -> bool {
        matches!(&self.slots[slot], Some(current) if current.same_channel(channel))
    }

    fn pop_idle(&mut self) -> Option<(usize, Channel)> {
        while let Some(slot) = self.idle.pop_front() {
            if let Some(channel) = self.slots[slot].as_ref().filter(|c| c.is_open()) {
                return Some((slot, channel.clone()));
            }
        }
        None
    }

    fn exhausted(&self) -> bool {
        self.replacing == 0 && self.slots.iter().all(Option::is_none)
    }
}

#[derive(Debug)]
struct PoolShared {
    connection: Connection,
    prefetch: Option<u16>,
    state: Mutex<PoolState>,
    leased: watch::Sender<usize>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lease(self: &Arc<Self>, slot: usize, channel: Channel) -> PoolLease {
        self.leased.send_modify(|n| *n += 1);
        PoolLease {
            channel,
            slot,
            pool: Some(self.clone()),
        }
    }

    /// Give `slot` to the oldest live waiter, or park it as idle
    fn hand_off(self: &Arc<Self>, state: &mut PoolState, slot: usize, channel: &Channel) {
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Ok(self.lease(slot, channel.clone()))) {
                Ok(()) => return,
                Err(Ok(mut lease)) => {
                    // Acquire was abandoned; undo without running release
                    lease.pool = None;
                    self.leased.send_modify(|n| *n -= 1);
                }
                Err(Err(_)) => {}
            }
        }
        state.idle.push_back(slot);
    }

    fn release(self: &Arc<Self>, slot: usize, channel: &Channel) {
        let mut state = self.lock();
        self.leased.send_modify(|n| *n = n.saturating_sub(1));
        if !state.open || !state.holds(slot, channel) || !channel.is_open() {
            return;
        }
        self.hand_off(&mut state, slot, channel);
    }

    fn reject_waiters(&self, state: &mut PoolState, cause: &CloseCause) {
        let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
        if waiters.is_empty() {
            return;
        }
        warn!(waiters = waiters.len(), "no pooled channels left, failing queued acquires");
        for waiter in waiters {
            let err = match cause {
                CloseCause::Connection(Some(reason)) => AmqpError::ConnectionClosed(reason.clone()),
                CloseCause::Connection(None) => {
                    AmqpError::ConnectionLost("connection closed".to_string())
                }
                _ => AmqpError::PoolClosed,
            };
            let _ = waiter.send(Err(err));
        }
    }

    async fn open_slot(self: &Arc<Self>, slot: usize) -> Result<()> {
        let channel = self.connection.open_channel().await?;
        if let Some(prefetch) = self.prefetch {
            if let Err(e) = channel.basic_qos(prefetch, false).await {
                let _ = channel.close().await;
                return Err(e);
            }
        }

        let spliced = {
            let mut state = self.lock();
            if state.open {
                state.slots[slot] = Some(channel.clone());
                self.hand_off(&mut state, slot, &channel);
            }
            state.open
        };
        if !spliced {
            let _ = channel.close().await;
            return Ok(());
        }
        debug!(slot, channel = channel.number(), "pooled channel ready");
        self.watch(slot, channel);
        Ok(())
    }

    /// Follow the channel in `slot` until it closes
    fn watch(self: &Arc<Self>, slot: usize, channel: Channel) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let cause = channel.closed().await;
            if let Some(pool) = weak.upgrade() {
                pool.on_closed(slot, channel, cause).await;
            }
        });
    }

    async fn on_closed(self: Arc<Self>, slot: usize, channel: Channel, cause: CloseCause) {
        {
            let mut state = self.lock();
            if !state.holds(slot, &channel) {
                return;
            }
            state.slots[slot] = None;
            state.idle.retain(|&s| s != slot);
            if !state.open || !matches!(cause, CloseCause::Peer(_)) {
                debug!(slot, channel = channel.number(), ?cause, "pool slot dropped");
                if state.exhausted() {
                    self.reject_waiters(&mut state, &cause);
                }
                return;
            }
            state.replacing += 1;
        }

        warn!(slot, channel = channel.number(), ?cause, "pooled channel closed by server, replacing");
        let replaced = self.open_slot(slot).await;
        let mut state = self.lock();
        state.replacing -= 1;
        if let Err(e) = replaced {
            warn!(slot, error = %e, "could not replace pooled channel");
            if state.exhausted() {
                self.reject_waiters(&mut state, &cause);
            }
        }
    }
}

/// Pool of channels on one connection
#[derive(Debug, Clone)]
pub struct ChannelPool {
    shared: Arc<PoolShared>,
}

impl ChannelPool {
    /// Open `size` channels, applying `prefetch` as per-consumer QoS to each
    pub async fn open(connection: &Connection, size: usize, prefetch: Option<u16>) -> Result<ChannelPool> {
        if size == 0 {
            return Err(AmqpError::Validation("pool size must be at least 1".to_string()));
        }
        let (leased, _) = watch::channel(0);
        let shared = Arc::new(PoolShared {
            connection: connection.clone(),
            prefetch,
            state: Mutex::new(PoolState {
                open: true,
                slots: vec![None; size],
                idle: VecDeque::with_capacity(size),
                waiters: VecDeque::new(),
                replacing: 0,
            }),
            leased,
        });
        let pool = ChannelPool { shared };

        let opened = join_all((0..size).map(|slot| pool.shared.open_slot(slot))).await;
        if let Some(err) = opened.into_iter().find_map(Result::err) {
            pool.close().await;
            return Err(err);
        }
        info!(size, ?prefetch, "channel pool open");
        Ok(pool)
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// Channels ready to hand out right now
    pub fn available(&self) -> usize {
        self.shared.lock().idle.len()
    }

    /// Leases not yet released
    pub fn leased(&self) -> usize {
        *self.shared.leased.borrow()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        !self.shared.lock().open
    }

    /// Lease a channel, waiting in FIFO order while all are in use
    pub async fn acquire(&self) -> Result<PoolLease> {
        let pending = {
            let mut state = self.shared.lock();
            if !state.open {
                return Err(AmqpError::PoolClosed);
            }
            if let Some((slot, channel)) = state.pop_idle() {
                return Ok(self.shared.lease(slot, channel));
            }
            if state.exhausted() {
                return Err(AmqpError::PoolClosed);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        pending.await.map_err(|_| AmqpError::PoolClosed)?
    }

    /// Leases for as long as the pool stays open
    pub fn leases(&self) -> impl Stream<Item = PoolLease> {
        stream::unfold(self.clone(), |pool| async move {
            let lease = pool.acquire().await.ok()?;
            Some((lease, pool))
        })
    }

    /// Stop handing out channels, wait for every lease to come back, then close the
    /// channels.
    ///
    /// Waiting ends early if the connection goes away.
    pub async fn close(&self) {
        let waiters: Vec<Waiter> = {
            let mut state = self.shared.lock();
            if !state.open {
                return;
            }
            state.open = false;
            state.waiters.drain(..).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(AmqpError::PoolClosed));
        }

        let mut leased = self.shared.leased.subscribe();
        if *leased.borrow() > 0 {
            debug!(leased = *leased.borrow(), "pool closing, waiting for leases");
        }
        tokio::select! {
            _ = leased.wait_for(|n| *n == 0) => {}
            _ = self.shared.connection.closed() => {}
        }

        let channels: Vec<Channel> = {
            let mut state = self.shared.lock();
            state.idle.clear();
            state.slots.iter_mut().filter_map(Option::take).collect()
        };
        for (channel, result) in channels.iter().zip(join_all(channels.iter().map(|c| c.close())).await) {
            if let Err(e) = result {
                debug!(channel = channel.number(), error = %e, "pooled channel close failed");
            }
        }
        info!("channel pool closed");
    }
}

/// A leased channel; returns to the pool when dropped
#[derive(Debug)]
pub struct PoolLease {
    channel: Channel,
    slot: usize,
    pool: Option<Arc<PoolShared>>,
}

impl PoolLease {
    /// The leased channel
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Pool slot the channel occupies
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Give the channel back
    pub fn release(self) {}
}

impl Deref for PoolLease {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(self.slot, &self.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::error::CloseReason;
    use crate::test_broker;
    use amqp_wire::{basic, channel, connection};
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let (config, _control, broker) = test_broker::spawn_auto().await;
        let conn = Connection::connect(&config).await.unwrap();
        let pool = ChannelPool::open(&conn, 2, Some(5)).await.unwrap();
        assert_eq!(pool.available(), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.number(), b.number());
        assert_eq!(pool.leased(), 2);

        let third = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());

        let a_number = a.number();
        a.release();
        let c = third.await.unwrap().unwrap();
        assert_eq!(c.number(), a_number);
        drop((b, c));
        assert_eq!(pool.leased(), 0);

        conn.close().await.unwrap();
        let seen = broker.await.unwrap();
        let qos: Vec<_> = seen.iter().filter(|c| c.is(basic::CLASS, basic::QOS)).collect();
        assert_eq!(qos.len(), 2);
        assert_eq!(qos[0].method.get_u16("prefetch_count"), 5);
    }

    #[tokio::test]
    async fn test_server_closed_channel_is_replaced() {
        let (config, control, _broker) = test_broker::spawn_auto().await;
        let conn = Connection::connect(&config).await.unwrap();
        let pool = ChannelPool::open(&conn, 1, None).await.unwrap();

        let lease = pool.acquire().await.unwrap();
        let old = lease.channel().clone();
        let slot = lease.slot();
        drop(lease);

        let reason = CloseReason::new(406, "PRECONDITION_FAILED - unknown delivery tag 7", 60, 80);
        control
            .send((old.number(), reason.to_method(channel::CLASS, channel::CLOSE)))
            .unwrap();
        assert_eq!(old.closed().await, CloseCause::Peer(reason));

        let fresh = pool.acquire().await.unwrap();
        assert!(!fresh.same_channel(&old));
        assert_eq!(fresh.slot(), slot);
        assert_eq!(fresh.state(), ChannelState::Open);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_close_waits_for_outstanding_leases() {
        let (config, _control, broker) = test_broker::spawn_auto().await;
        let conn = Connection::connect(&config).await.unwrap();
        let pool = ChannelPool::open(&conn, 2, None).await.unwrap();

        let held = pool.acquire().await.unwrap();
        let closing = tokio::spawn({
            let pool = pool.clone();
            async move { pool.close().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closing.is_finished());
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(AmqpError::PoolClosed)));
        assert!(held.is_open());

        let channel = held.channel().clone();
        drop(held);
        closing.await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);

        conn.close().await.unwrap();
        let seen = broker.await.unwrap();
        let closes = seen.iter().filter(|c| c.is(channel::CLASS, channel::CLOSE)).count();
        assert_eq!(closes, 2);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_queued_acquires() {
        let (config, control, _broker) = test_broker::spawn_auto().await;
        let conn = Connection::connect(&config).await.unwrap();
        let pool = ChannelPool::open(&conn, 1, None).await.unwrap();

        let _held = pool.acquire().await.unwrap();
        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let forced = CloseReason::new(320, "CONNECTION_FORCED", 0, 0);
        control
            .send((0, forced.to_method(connection::CLASS, connection::CLOSE)))
            .unwrap();
        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.close_reason().map(|r| r.reply_code), Some(320));
    }

    #[tokio::test]
    async fn test_lease_stream_ends_on_close() {
        let (config, _control, _broker) = test_broker::spawn_auto().await;
        let conn = Connection::connect(&config).await.unwrap();
        let pool = ChannelPool::open(&conn, 2, None).await.unwrap();

        let leases: Vec<PoolLease> = pool.leases().take(2).collect().await;
        assert_eq!(leases.len(), 2);
        drop(leases);

        pool.close().await;
        let rest: Vec<PoolLease> = pool.leases().collect().await;
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_zero_size_rejected() {
        let (config, _control, _broker) = test_broker::spawn_auto().await;
        let conn = Connection::connect(&config).await.unwrap();
        assert!(matches!(
            ChannelPool::open(&conn, 0, None).await,
            Err(AmqpError::Validation(_))
        ));
    }
}
