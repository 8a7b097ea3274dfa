//! A numbered channel: open/close handshake, inbound dispatch and the verbs.
//!
//! Inbound commands reach [`Channel::dispatch`] from the connection's reader task.
//! Asynchronous methods (deliveries, returns, confirms, server cancel, flow and
//! close) are handled here; everything else is offered to the RPC correlator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use amqp_wire::{basic, channel, confirm, exchange, queue, Command, FieldTable, Method};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::consumer::{Confirm, Consumer, Delivery, GetMessage, ReturnedMessage};
use crate::error::{AmqpError, CloseReason, Result};
use crate::manager::{Registry, Release};
use crate::options::{
    validate_name, ConsumeOptions, ExchangeDeclareOptions, ExchangeKind, PublishOptions,
    QueueDeclareOk, QueueDeclareOptions,
};
use crate::rpc::{Expectation, ResponseHook, RpcCorrelator};
use crate::sink::CommandSink;

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not usable
    Closed,
    /// `channel.open` sent
    Opening,
    /// Ready for verbs
    Open,
    /// `close()` in progress; new operations are refused
    Closing,
}

/// Why a channel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Closed by this client
    Local,
    /// Closed by the broker
    Peer(CloseReason),
    /// The connection went away, with the broker's reason if it sent one
    Connection(Option<CloseReason>),
}

type Consumers = Arc<DashMap<String, mpsc::UnboundedSender<Delivery>>>;

#[derive(Debug)]
struct ChannelInner {
    number: u16,
    sink: Arc<dyn CommandSink>,
    rpc: RpcCorrelator,
    state: watch::Sender<ChannelState>,
    gate: RwLock<()>,
    close_sent: AtomicBool,
    consumers: Consumers,
    returns: StdMutex<Option<mpsc::UnboundedSender<ReturnedMessage>>>,
    confirms: StdMutex<Option<mpsc::UnboundedSender<Confirm>>>,
    confirm_mode: AtomicBool,
    publish_seq: Mutex<u64>,
    flow: watch::Sender<bool>,
    cause: OnceLock<CloseCause>,
    registry: Weak<Registry>,
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to an AMQP channel; clones share the channel
#[derive(Debug, Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        number: u16,
        sink: Arc<dyn CommandSink>,
        rpc_timeout: Duration,
        registry: Weak<Registry>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Closed);
        let (flow, _) = watch::channel(true);
        Self {
            inner: Arc::new(ChannelInner {
                number,
                rpc: RpcCorrelator::new(number, rpc_timeout, sink.clone()),
                sink,
                state,
                gate: RwLock::new(()),
                close_sent: AtomicBool::new(false),
                consumers: Arc::new(DashMap::new()),
                returns: StdMutex::new(None),
                confirms: StdMutex::new(None),
                confirm_mode: AtomicBool::new(false),
                publish_seq: Mutex::new(0),
                flow,
                cause: OnceLock::new(),
                registry,
            }),
        }
    }

    /// Channel number
    pub fn number(&self) -> u16 {
        self.inner.number
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Whether verbs can be used
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Whether the broker currently allows publishing
    pub fn is_flowing(&self) -> bool {
        *self.inner.flow.borrow()
    }

    /// Whether two handles refer to the same channel
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Why the channel ended, once it has
    pub fn close_cause(&self) -> Option<CloseCause> {
        self.inner.cause.get().cloned()
    }

    /// Wait until the channel is closed and report why
    pub async fn closed(&self) -> CloseCause {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
        self.close_cause().unwrap_or(CloseCause::Local)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ChannelState::Open => Ok(()),
            state => Err(match self.inner.cause.get() {
                Some(CloseCause::Peer(reason)) => AmqpError::ChannelClosed(reason.clone()),
                Some(CloseCause::Connection(Some(reason))) => {
                    AmqpError::ConnectionClosed(reason.clone())
                }
                _ => AmqpError::ChannelState {
                    channel: self.inner.number,
                    state,
                },
            }),
        }
    }

    pub(crate) async fn open(&self) -> Result<()> {
        self.inner.state.send_replace(ChannelState::Opening);
        let open = Method::new(channel::CLASS, channel::OPEN).short_str("reserved1", "");
        self.inner
            .rpc
            .call(
                Command::method(self.inner.number, open),
                Expectation::new(channel::CLASS, channel::OPEN, channel::OPEN_OK),
            )
            .await?;
        self.inner.state.send_if_modified(|s| {
            let opening = *s == ChannelState::Opening;
            if opening {
                *s = ChannelState::Open;
            }
            opening
        });
        self.ensure_open()?;
        debug!(channel = self.inner.number, "channel open");
        Ok(())
    }

    async fn call(&self, method: Method, expect: Expectation) -> Result<Command> {
        self.call_with_hook(method, expect, None).await
    }

    async fn call_with_hook(
        &self,
        method: Method,
        expect: Expectation,
        hook: Option<ResponseHook>,
    ) -> Result<Command> {
        self.ensure_open()?;
        let _settling = self.inner.gate.read().await;
        self.ensure_open()?;
        self.inner
            .rpc
            .call_with_hook(Command::method(self.inner.number, method), expect, hook)
            .await
    }

    async fn send(&self, method: Method) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .sink
            .send(Command::method(self.inner.number, method))
            .await
    }

    /// Close the channel.
    ///
    /// New operations are refused at once; calls already waiting for a response
    /// settle before `channel.close` goes out.
    pub async fn close(&self) -> Result<()> {
        match self.state() {
            ChannelState::Closed => return Ok(()),
            ChannelState::Closing => {
                self.closed().await;
                return Ok(());
            }
            ChannelState::Opening | ChannelState::Open => {}
        }
        self.inner.state.send_replace(ChannelState::Closing);

        let _settled = self.inner.gate.write().await;
        if self.state() == ChannelState::Closed {
            return Ok(());
        }

        self.inner.close_sent.store(true, Ordering::SeqCst);
        let close = CloseReason::normal().to_method(channel::CLASS, channel::CLOSE);
        let result = self
            .inner
            .rpc
            .call(
                Command::method(self.inner.number, close),
                Expectation::new(channel::CLASS, channel::CLOSE, channel::CLOSE_OK),
            )
            .await;
        let release = match &result {
            Err(AmqpError::RpcTimeout { .. }) => Release::AwaitCloseOk,
            _ => Release::Free,
        };
        self.end(CloseCause::Local, release);
        result.map(|_| ())
    }

    /// Tear the channel down locally. Runs once; later calls are ignored.
    pub(crate) fn finish(&self, cause: CloseCause) {
        self.end(cause, Release::Free);
    }

    pub(crate) fn end(&self, cause: CloseCause, release: Release) {
        if self.inner.cause.set(cause.clone()).is_err() {
            return;
        }
        let number = self.inner.number;
        self.inner.state.send_replace(ChannelState::Closed);
        self.inner.flow.send_replace(true);

        self.inner.rpc.fail_all(|| match &cause {
            CloseCause::Peer(reason) => AmqpError::ChannelClosed(reason.clone()),
            CloseCause::Connection(Some(reason)) => AmqpError::ConnectionClosed(reason.clone()),
            CloseCause::Connection(None) => {
                AmqpError::ConnectionLost("connection closed".to_string())
            }
            CloseCause::Local => AmqpError::ChannelState {
                channel: number,
                state: ChannelState::Closed,
            },
        });
        self.inner.consumers.clear();
        lock(&self.inner.returns).take();
        lock(&self.inner.confirms).take();

        if let Some(registry) = self.inner.registry.upgrade() {
            registry.release(number, release);
        }

        match &cause {
            CloseCause::Peer(reason) => warn!(channel = number, %reason, "channel closed by server"),
            _ => debug!(channel = number, ?cause, "channel closed"),
        }
    }

    /// Route one inbound command
    pub(crate) async fn dispatch(&self, command: Command) {
        let number = self.inner.number;
        match (command.method.class_id, command.method.method_id) {
            (basic::CLASS, basic::DELIVER) => self.on_deliver(command),
            (basic::CLASS, basic::CANCEL) => self.on_server_cancel(command).await,
            (basic::CLASS, basic::RETURN) => {
                let returned = ReturnedMessage::from_command(command);
                let listener = lock(&self.inner.returns).clone();
                match listener {
                    Some(tx) => {
                        let _ = tx.send(returned);
                    }
                    None => debug!(
                        channel = number,
                        reply_code = returned.reply_code,
                        "returned message dropped, no listener"
                    ),
                }
            }
            (basic::CLASS, basic::ACK) | (basic::CLASS, basic::NACK) => {
                let m = &command.method;
                let confirm = if m.method_id == basic::ACK {
                    Confirm::Ack {
                        delivery_tag: m.get_u64("delivery_tag"),
                        multiple: m.get_bool("multiple"),
                    }
                } else {
                    Confirm::Nack {
                        delivery_tag: m.get_u64("delivery_tag"),
                        multiple: m.get_bool("multiple"),
                        requeue: m.get_bool("requeue"),
                    }
                };
                let listener = lock(&self.inner.confirms).clone();
                if let Some(tx) = listener {
                    let _ = tx.send(confirm);
                }
            }
            (channel::CLASS, channel::FLOW) => {
                let active = command.method.get_bool("active");
                self.inner.flow.send_replace(active);
                info!(channel = number, active, "flow changed by server");
                let ok = Method::new(channel::CLASS, channel::FLOW_OK).arg("active", active);
                if let Err(e) = self.inner.sink.send(Command::method(number, ok)).await {
                    warn!(channel = number, error = %e, "failed to send flow-ok");
                }
            }
            (channel::CLASS, channel::CLOSE) => self.on_close(command).await,
            _ => {
                if let Some(unmatched) = self.inner.rpc.dispatch(command) {
                    warn!(
                        channel = number,
                        class_id = unmatched.method.class_id,
                        method_id = unmatched.method.method_id,
                        "unexpected method"
                    );
                }
            }
        }
    }

    fn on_deliver(&self, command: Command) {
        let delivery = Delivery::from_command(command);
        match self.inner.consumers.get(&delivery.consumer_tag) {
            Some(tx) => {
                if tx.send(delivery).is_err() {
                    debug!(channel = self.inner.number, "consumer dropped, delivery discarded");
                }
            }
            None => warn!(
                channel = self.inner.number,
                consumer_tag = %delivery.consumer_tag,
                delivery_tag = delivery.delivery_tag,
                "delivery for unknown consumer"
            ),
        }
    }

    async fn on_server_cancel(&self, command: Command) {
        let tag = command.method.get_str("consumer_tag").to_string();
        self.inner.consumers.remove(&tag);
        info!(channel = self.inner.number, consumer_tag = %tag, "consumer cancelled by server");
        if !command.method.get_bool("no_wait") {
            let ok = Method::new(basic::CLASS, basic::CANCEL_OK).short_str("consumer_tag", tag);
            if let Err(e) = self.inner.sink.send(Command::method(self.inner.number, ok)).await {
                warn!(channel = self.inner.number, error = %e, "failed to send cancel-ok");
            }
        }
    }

    async fn on_close(&self, command: Command) {
        let number = self.inner.number;
        let reason = CloseReason::from_method(&command.method);
        let ok = Method::new(channel::CLASS, channel::CLOSE_OK);
        if let Err(e) = self.inner.sink.send(Command::method(number, ok)).await {
            warn!(channel = number, error = %e, "failed to send close-ok");
        }

        // Our own close is already on the wire; its close-ok finishes the channel
        if self.state() == ChannelState::Closing && self.inner.close_sent.load(Ordering::SeqCst) {
            debug!(channel = number, %reason, "close crossed with server close");
            return;
        }
        self.inner.rpc.reject_matching(&reason);
        self.finish(CloseCause::Peer(reason));
    }

    // ---- exchange ----

    /// Declare an exchange
    pub async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        if !options.passive {
            validate_name("exchange", name)?;
        }
        let method = options.to_method(name, &kind);
        if options.no_wait {
            return self.send(method).await;
        }
        self.call(
            method,
            Expectation::new(exchange::CLASS, exchange::DECLARE, exchange::DECLARE_OK),
        )
        .await?;
        Ok(())
    }

    /// Delete an exchange
    pub async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<()> {
        let method = Method::new(exchange::CLASS, exchange::DELETE)
            .arg("reserved1", 0u16)
            .short_str("exchange", name)
            .arg("if_unused", if_unused)
            .arg("no_wait", false);
        self.call(
            method,
            Expectation::new(exchange::CLASS, exchange::DELETE, exchange::DELETE_OK),
        )
        .await?;
        Ok(())
    }

    // ---- queue ----

    /// Declare a queue; an empty name asks the broker to generate one
    pub async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueDeclareOk> {
        if !options.passive {
            validate_name("queue", name)?;
        }
        let method = options.to_method(name);
        if options.no_wait {
            self.send(method).await?;
            return Ok(QueueDeclareOk {
                queue: name.to_string(),
                message_count: 0,
                consumer_count: 0,
            });
        }
        let reply = self
            .call(
                method,
                Expectation::new(queue::CLASS, queue::DECLARE, queue::DECLARE_OK),
            )
            .await?;
        Ok(QueueDeclareOk::from_method(&reply.method))
    }

    /// Bind a queue to an exchange
    pub async fn queue_bind(
        &self,
        queue_name: &str,
        exchange_name: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        let method = Method::new(queue::CLASS, queue::BIND)
            .arg("reserved1", 0u16)
            .short_str("queue", queue_name)
            .short_str("exchange", exchange_name)
            .short_str("routing_key", routing_key)
            .arg("no_wait", false)
            .arg("arguments", arguments);
        self.call(method, Expectation::new(queue::CLASS, queue::BIND, queue::BIND_OK))
            .await?;
        Ok(())
    }

    /// Remove a binding
    pub async fn queue_unbind(
        &self,
        queue_name: &str,
        exchange_name: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        let method = Method::new(queue::CLASS, queue::UNBIND)
            .arg("reserved1", 0u16)
            .short_str("queue", queue_name)
            .short_str("exchange", exchange_name)
            .short_str("routing_key", routing_key)
            .arg("arguments", arguments);
        self.call(method, Expectation::new(queue::CLASS, queue::UNBIND, queue::UNBIND_OK))
            .await?;
        Ok(())
    }

    /// Drop every ready message; returns how many were purged
    pub async fn queue_purge(&self, queue_name: &str) -> Result<u32> {
        let method = Method::new(queue::CLASS, queue::PURGE)
            .arg("reserved1", 0u16)
            .short_str("queue", queue_name)
            .arg("no_wait", false);
        let reply = self
            .call(method, Expectation::new(queue::CLASS, queue::PURGE, queue::PURGE_OK))
            .await?;
        Ok(reply.method.get_u32("message_count"))
    }

    /// Delete a queue; returns how many messages it held
    pub async fn queue_delete(&self, queue_name: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let method = Method::new(queue::CLASS, queue::DELETE)
            .arg("reserved1", 0u16)
            .short_str("queue", queue_name)
            .arg("if_unused", if_unused)
            .arg("if_empty", if_empty)
            .arg("no_wait", false);
        let reply = self
            .call(method, Expectation::new(queue::CLASS, queue::DELETE, queue::DELETE_OK))
            .await?;
        Ok(reply.method.get_u32("message_count"))
    }

    // ---- basic ----

    /// Limit unacknowledged deliveries
    pub async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<()> {
        let method = Method::new(basic::CLASS, basic::QOS)
            .arg("prefetch_size", 0u32)
            .arg("prefetch_count", prefetch_count)
            .arg("global", global);
        self.call(method, Expectation::new(basic::CLASS, basic::QOS, basic::QOS_OK))
            .await?;
        Ok(())
    }

    /// Start a consumer.
    ///
    /// The consumer is registered while `consume-ok` is dispatched, so deliveries
    /// right behind it are never orphaned.
    pub async fn basic_consume(&self, queue_name: &str, options: ConsumeOptions) -> Result<Consumer> {
        let method = Method::new(basic::CLASS, basic::CONSUME)
            .arg("reserved1", 0u16)
            .short_str("queue", queue_name)
            .short_str("consumer_tag", options.consumer_tag.clone())
            .arg("no_local", options.no_local)
            .arg("no_ack", options.no_ack)
            .arg("exclusive", options.exclusive)
            .arg("no_wait", false)
            .arg("arguments", options.arguments);

        let (tx, rx) = mpsc::unbounded_channel();
        let consumers = self.inner.consumers.clone();
        let hook: ResponseHook = Box::new(move |reply: &Command| {
            consumers.insert(reply.method.get_str("consumer_tag").to_string(), tx);
        });

        let mut expect = Expectation::new(basic::CLASS, basic::CONSUME, basic::CONSUME_OK);
        if !options.consumer_tag.is_empty() {
            let tag = options.consumer_tag.clone();
            expect = expect.with_predicate(move |m| m.get_str("consumer_tag") == tag);
        }
        let reply = self.call_with_hook(method, expect, Some(hook)).await?;
        let tag = reply.method.get_str("consumer_tag").to_string();
        debug!(channel = self.inner.number, consumer_tag = %tag, queue = queue_name, "consumer started");
        Ok(Consumer::new(tag, self.clone(), rx))
    }

    /// Cancel a consumer; its stream ends
    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let method = Method::new(basic::CLASS, basic::CANCEL)
            .short_str("consumer_tag", consumer_tag)
            .arg("no_wait", false);
        let consumers = self.inner.consumers.clone();
        let hook: ResponseHook = Box::new(move |reply: &Command| {
            consumers.remove(reply.method.get_str("consumer_tag"));
        });
        let tag = consumer_tag.to_string();
        let expect = Expectation::new(basic::CLASS, basic::CANCEL, basic::CANCEL_OK)
            .with_predicate(move |m| m.get_str("consumer_tag") == tag);
        self.call_with_hook(method, expect, Some(hook)).await?;
        Ok(())
    }

    /// Publish a message.
    ///
    /// Waits while the broker has paused the channel with `channel.flow`. In
    /// confirm mode returns the publish sequence number the broker will confirm.
    pub async fn basic_publish(&self, options: PublishOptions, body: impl Into<Bytes>) -> Result<Option<u64>> {
        self.ensure_open()?;
        let mut flow = self.inner.flow.subscribe();
        let _ = flow.wait_for(|active| *active).await;
        self.ensure_open()?;

        let method = Method::new(basic::CLASS, basic::PUBLISH)
            .arg("reserved1", 0u16)
            .short_str("exchange", options.exchange)
            .short_str("routing_key", options.routing_key)
            .arg("mandatory", options.mandatory)
            .arg("immediate", options.immediate);
        let command = Command::with_content(self.inner.number, method, options.properties, body.into());

        let mut seq = self.inner.publish_seq.lock().await;
        self.inner.sink.send(command).await?;
        if self.inner.confirm_mode.load(Ordering::SeqCst) {
            *seq += 1;
            Ok(Some(*seq))
        } else {
            Ok(None)
        }
    }

    /// Publish `value` serialized as JSON, defaulting content-type to `application/json`
    pub async fn basic_publish_json<T: Serialize + ?Sized>(
        &self,
        mut options: PublishOptions,
        value: &T,
    ) -> Result<Option<u64>> {
        let body = serde_json::to_vec(value)
            .map_err(|e| AmqpError::Validation(format!("message body is not serializable: {e}")))?;
        if options.properties.content_type.is_none() {
            options.properties.content_type = Some("application/json".to_string());
        }
        self.basic_publish(options, body).await
    }

    /// Fetch one message; `None` when the queue is empty
    pub async fn basic_get(&self, queue_name: &str, no_ack: bool) -> Result<Option<GetMessage>> {
        let method = Method::new(basic::CLASS, basic::GET)
            .arg("reserved1", 0u16)
            .short_str("queue", queue_name)
            .arg("no_ack", no_ack);
        let reply = self
            .call(
                method,
                Expectation::new(basic::CLASS, basic::GET, basic::GET_OK).or_response(basic::GET_EMPTY),
            )
            .await?;
        if reply.is(basic::CLASS, basic::GET_EMPTY) {
            return Ok(None);
        }
        Ok(Some(GetMessage::from_command(reply)))
    }

    /// Acknowledge a delivery
    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.send(
            Method::new(basic::CLASS, basic::ACK)
                .arg("delivery_tag", delivery_tag)
                .arg("multiple", multiple),
        )
        .await
    }

    /// Negatively acknowledge one or more deliveries
    pub async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.send(
            Method::new(basic::CLASS, basic::NACK)
                .arg("delivery_tag", delivery_tag)
                .arg("multiple", multiple)
                .arg("requeue", requeue),
        )
        .await
    }

    /// Reject a single delivery
    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.send(
            Method::new(basic::CLASS, basic::REJECT)
                .arg("delivery_tag", delivery_tag)
                .arg("requeue", requeue),
        )
        .await
    }

    /// Redeliver unacknowledged messages
    pub async fn basic_recover(&self, requeue: bool) -> Result<()> {
        let method = Method::new(basic::CLASS, basic::RECOVER).arg("requeue", requeue);
        self.call(method, Expectation::new(basic::CLASS, basic::RECOVER, basic::RECOVER_OK))
            .await?;
        Ok(())
    }

    /// Receive messages the broker returns as unroutable.
    ///
    /// Replaces any earlier receiver.
    pub fn returns(&self) -> mpsc::UnboundedReceiver<ReturnedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.state() != ChannelState::Closed {
            *lock(&self.inner.returns) = Some(tx);
        }
        rx
    }

    /// Put the channel in publisher-confirm mode and receive the confirms
    pub async fn confirm_select(&self) -> Result<mpsc::UnboundedReceiver<Confirm>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.confirms) = Some(tx);
        let method = Method::new(confirm::CLASS, confirm::SELECT).arg("no_wait", false);
        if let Err(e) = self
            .call(method, Expectation::new(confirm::CLASS, confirm::SELECT, confirm::SELECT_OK))
            .await
        {
            lock(&self.inner.confirms).take();
            return Err(e);
        }
        self.inner.confirm_mode.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    /// Ask the broker to pause (`false`) or resume (`true`) deliveries
    pub async fn flow(&self, active: bool) -> Result<bool> {
        let method = Method::new(channel::CLASS, channel::FLOW).arg("active", active);
        let reply = self
            .call(method, Expectation::new(channel::CLASS, channel::FLOW, channel::FLOW_OK))
            .await?;
        Ok(reply.method.get_bool("active"))
    }
}
