//! Request/response correlation over a channel's inbound command stream.
//!
//! At most one call per protocol class is in flight on a channel. Callers queue
//! on a per-class FIFO lock; the holder registers what it expects, sends the
//! request and waits for the channel's dispatch loop to hand over the matching
//! response. A call that times out leaves a stale expectation behind so its late
//! response is discarded instead of resolving the next call of the same class.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amqp_wire::{Command, Method};
use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, debug_span, warn, Instrument};

use crate::error::{AmqpError, CloseReason, Result};
use crate::sink::CommandSink;

/// Runs against the response inside the dispatch loop, before the caller wakes
pub type ResponseHook = Box<dyn FnOnce(&Command) + Send + Sync>;

type Predicate = Arc<dyn Fn(&Method) -> bool + Send + Sync>;

/// What a pending call accepts as its response
#[derive(Clone)]
pub struct Expectation {
    /// Protocol class of the request and response
    pub class_id: u16,
    /// Method id of the request
    pub request_method_id: u16,
    /// Acceptable response method ids
    pub responses: Vec<u16>,
    predicate: Option<Predicate>,
}

impl Expectation {
    /// Expect `response` to answer `request` within `class_id`
    pub fn new(class_id: u16, request: u16, response: u16) -> Self {
        Self {
            class_id,
            request_method_id: request,
            responses: vec![response],
            predicate: None,
        }
    }

    /// Accept another response method id as well
    pub fn or_response(mut self, response: u16) -> Self {
        self.responses.push(response);
        self
    }

    /// Only accept responses that also satisfy `predicate`
    pub fn with_predicate(mut self, predicate: impl Fn(&Method) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether `method` answers this expectation
    pub fn accepts(&self, method: &Method) -> bool {
        method.class_id == self.class_id
            && self.responses.contains(&method.method_id)
            && self.predicate.as_ref().map_or(true, |p| p(method))
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("class_id", &self.class_id)
            .field("request_method_id", &self.request_method_id)
            .field("responses", &self.responses)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

struct Pending {
    rpc_id: u64,
    expect: Expectation,
    tx: oneshot::Sender<Result<Command>>,
    hook: Option<ResponseHook>,
}

/// Per-channel RPC correlator
pub struct RpcCorrelator {
    channel: u16,
    timeout: Duration,
    sink: Arc<dyn CommandSink>,
    locks: DashMap<u16, Arc<Mutex<()>>>,
    pending: DashMap<u16, Pending>,
    stale: DashMap<u16, VecDeque<Expectation>>,
    next_id: AtomicU64,
}

impl fmt::Debug for RpcCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCorrelator")
            .field("channel", &self.channel)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl RpcCorrelator {
    /// Correlator for `channel`, sending through `sink`
    pub fn new(channel: u16, timeout: Duration, sink: Arc<dyn CommandSink>) -> Self {
        Self {
            channel,
            timeout,
            sink,
            locks: DashMap::new(),
            pending: DashMap::new(),
            stale: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of calls currently awaiting a response
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Send `request` and wait for the response `expect` accepts
    pub async fn call(&self, request: Command, expect: Expectation) -> Result<Command> {
        self.call_with_hook(request, expect, None).await
    }

    /// Like [`call`](Self::call), running `hook` on the response inside the dispatch loop
    pub async fn call_with_hook(
        &self,
        request: Command,
        expect: Expectation,
        hook: Option<ResponseHook>,
    ) -> Result<Command> {
        let class_id = expect.class_id;
        let lock = self
            .locks
            .entry(class_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _turn = lock.lock().await;

        let rpc_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = debug_span!(
            "rpc",
            rpc_id,
            channel = self.channel,
            class_id,
            method_id = expect.request_method_id
        );

        async move {
            let (tx, rx) = oneshot::channel();
            self.pending.insert(
                class_id,
                Pending {
                    rpc_id,
                    expect: expect.clone(),
                    tx,
                    hook,
                },
            );

            if let Err(e) = self.sink.send(request).await {
                self.pending.remove_if(&class_id, |_, p| p.rpc_id == rpc_id);
                return Err(e);
            }
            debug!("request sent");

            match tokio::time::timeout(self.timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AmqpError::ConnectionLost(
                    "rpc abandoned before a response arrived".to_string(),
                )),
                Err(_) => {
                    if self
                        .pending
                        .remove_if(&class_id, |_, p| p.rpc_id == rpc_id)
                        .is_some()
                    {
                        self.stale.entry(class_id).or_default().push_back(expect.clone());
                    }
                    warn!(after = ?self.timeout, "rpc timed out");
                    Err(AmqpError::RpcTimeout {
                        class_id,
                        method_id: expect.request_method_id,
                        after: self.timeout,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Offer an inbound command. Returns it back when no call wanted it.
    pub fn dispatch(&self, command: Command) -> Option<Command> {
        let class_id = command.method.class_id;

        let swallowed = self.stale.get_mut(&class_id).is_some_and(|mut late| {
            let hit = late.front().is_some_and(|e| e.accepts(&command.method));
            if hit {
                late.pop_front();
            }
            hit
        });
        if swallowed {
            debug!(
                channel = self.channel,
                class_id,
                method_id = command.method.method_id,
                "discarding response to timed-out rpc"
            );
            return None;
        }

        match self
            .pending
            .remove_if(&class_id, |_, p| p.expect.accepts(&command.method))
        {
            Some((_, pending)) => {
                if let Some(hook) = pending.hook {
                    hook(&command);
                }
                let _ = pending.tx.send(Ok(command));
                None
            }
            None => Some(command),
        }
    }

    /// Fail the pending call that `reason` names. Returns whether one was failed.
    pub fn reject_matching(&self, reason: &CloseReason) -> bool {
        let removed = self.pending.remove_if(&reason.class_id, |_, p| {
            reason.rejects(p.expect.class_id, p.expect.request_method_id)
        });
        match removed {
            Some((_, pending)) => {
                debug!(
                    channel = self.channel,
                    rpc_id = pending.rpc_id,
                    reply_code = reason.reply_code,
                    "rpc rejected by close"
                );
                let _ = pending.tx.send(Err(AmqpError::ChannelClosed(reason.clone())));
                true
            }
            None => false,
        }
    }

    /// Fail every pending call
    pub fn fail_all(&self, make_err: impl Fn() -> AmqpError) {
        let classes: Vec<u16> = self.pending.iter().map(|e| *e.key()).collect();
        for class_id in classes {
            if let Some((_, pending)) = self.pending.remove(&class_id) {
                let _ = pending.tx.send(Err(make_err()));
            }
        }
        self.stale.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::recording::RecordingSink;
    use amqp_wire::{basic, channel, exchange, queue};
    use std::sync::atomic::AtomicBool;

    fn correlator(timeout: Duration) -> (Arc<RpcCorrelator>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let rpc = Arc::new(RpcCorrelator::new(1, timeout, sink.clone()));
        (rpc, sink)
    }

    fn declare(name: &str) -> Command {
        Command::method(
            1,
            Method::new(queue::CLASS, queue::DECLARE).short_str("queue", name),
        )
    }

    fn declare_ok(name: &str) -> Command {
        Command::method(
            1,
            Method::new(queue::CLASS, queue::DECLARE_OK)
                .short_str("queue", name)
                .arg("message_count", 0u32)
                .arg("consumer_count", 0u32),
        )
    }

    async fn until(cond: impl Fn() -> bool) {
        while !cond() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_call_resolves_on_matching_response() {
        let (rpc, sink) = correlator(Duration::from_secs(5));
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc.call(declare("movies"), Expectation::new(queue::CLASS, queue::DECLARE, queue::DECLARE_OK))
                    .await
            }
        });
        until(|| rpc.in_flight() == 1).await;

        // Unrelated traffic is handed back
        let other = Command::method(1, Method::new(exchange::CLASS, exchange::DECLARE_OK));
        assert!(rpc.dispatch(other).is_some());

        assert!(rpc.dispatch(declare_ok("movies")).is_none());
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.method.get_str("queue"), "movies");
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_matching_close_rejects_call() {
        let (rpc, _sink) = correlator(Duration::from_secs(5));
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc.call(declare("missing"), Expectation::new(queue::CLASS, queue::DECLARE, queue::DECLARE_OK))
                    .await
            }
        });
        until(|| rpc.in_flight() == 1).await;

        let reason = CloseReason::new(404, "NOT_FOUND", queue::CLASS, queue::DECLARE);
        assert!(rpc.reject_matching(&reason));
        match call.await.unwrap() {
            Err(AmqpError::ChannelClosed(r)) => assert_eq!(r, reason),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_matching_close_keeps_waiting() {
        let (rpc, _sink) = correlator(Duration::from_secs(5));
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc.call(declare("movies"), Expectation::new(queue::CLASS, queue::DECLARE, queue::DECLARE_OK))
                    .await
            }
        });
        until(|| rpc.in_flight() == 1).await;

        assert!(!rpc.reject_matching(&CloseReason::new(404, "NOT_FOUND", queue::CLASS, queue::BIND)));
        assert!(!rpc.reject_matching(&CloseReason::new(200, "OK", queue::CLASS, queue::DECLARE)));
        assert_eq!(rpc.in_flight(), 1);

        rpc.dispatch(declare_ok("movies"));
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_swallowed() {
        let (rpc, sink) = correlator(Duration::from_millis(100));
        let expect = Expectation::new(queue::CLASS, queue::DECLARE, queue::DECLARE_OK);

        let err = rpc.call(declare("slow"), expect.clone()).await.unwrap_err();
        assert!(matches!(err, AmqpError::RpcTimeout { class_id: 50, method_id: 10, .. }));

        let second = tokio::spawn({
            let rpc = rpc.clone();
            let expect = expect.clone();
            async move { rpc.call(declare("fast"), expect).await }
        });
        until(|| rpc.in_flight() == 1).await;

        // The answer to the timed-out call arrives first and must not resolve the second
        assert!(rpc.dispatch(declare_ok("slow")).is_none());
        assert_eq!(rpc.in_flight(), 1);

        rpc.dispatch(declare_ok("fast"));
        let reply = second.await.unwrap().unwrap();
        assert_eq!(reply.method.get_str("queue"), "fast");
        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_same_class_calls_queue_in_order() {
        let (rpc, sink) = correlator(Duration::from_secs(5));
        let expect = Expectation::new(queue::CLASS, queue::DECLARE, queue::DECLARE_OK);

        let first = tokio::spawn({
            let (rpc, expect) = (rpc.clone(), expect.clone());
            async move { rpc.call(declare("a"), expect).await }
        });
        until(|| sink.sent().len() == 1).await;
        let second = tokio::spawn({
            let (rpc, expect) = (rpc.clone(), expect.clone());
            async move { rpc.call(declare("b"), expect).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.sent().len(), 1, "second call must wait for the first");

        rpc.dispatch(declare_ok("a"));
        assert_eq!(first.await.unwrap().unwrap().method.get_str("queue"), "a");
        until(|| sink.sent().len() == 2).await;
        assert_eq!(sink.last().unwrap().method.get_str("queue"), "b");

        rpc.dispatch(declare_ok("b"));
        assert_eq!(second.await.unwrap().unwrap().method.get_str("queue"), "b");
    }

    #[tokio::test]
    async fn test_different_classes_run_concurrently() {
        let (rpc, sink) = correlator(Duration::from_secs(5));
        let q = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc.call(declare("a"), Expectation::new(queue::CLASS, queue::DECLARE, queue::DECLARE_OK))
                    .await
            }
        });
        let b = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc.call(
                    Command::method(1, Method::new(basic::CLASS, basic::QOS)),
                    Expectation::new(basic::CLASS, basic::QOS, basic::QOS_OK),
                )
                .await
            }
        });
        until(|| sink.sent().len() == 2).await;

        rpc.dispatch(Command::method(1, Method::new(basic::CLASS, basic::QOS_OK)));
        rpc.dispatch(declare_ok("a"));
        assert!(b.await.unwrap().is_ok());
        assert!(q.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_multi_response_and_predicate() {
        let (rpc, _sink) = correlator(Duration::from_secs(5));
        let get = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc.call(
                    Command::method(1, Method::new(basic::CLASS, basic::GET)),
                    Expectation::new(basic::CLASS, basic::GET, basic::GET_OK).or_response(basic::GET_EMPTY),
                )
                .await
            }
        });
        until(|| rpc.in_flight() == 1).await;
        rpc.dispatch(Command::method(1, Method::new(basic::CLASS, basic::GET_EMPTY)));
        assert!(get.await.unwrap().unwrap().is(basic::CLASS, basic::GET_EMPTY));

        let cancel = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc.call(
                    Command::method(1, Method::new(basic::CLASS, basic::CANCEL).short_str("consumer_tag", "c1")),
                    Expectation::new(basic::CLASS, basic::CANCEL, basic::CANCEL_OK)
                        .with_predicate(|m| m.get_str("consumer_tag") == "c1"),
                )
                .await
            }
        });
        until(|| rpc.in_flight() == 1).await;
        let wrong = Command::method(1, Method::new(basic::CLASS, basic::CANCEL_OK).short_str("consumer_tag", "c2"));
        assert!(rpc.dispatch(wrong).is_some());
        let right = Command::method(1, Method::new(basic::CLASS, basic::CANCEL_OK).short_str("consumer_tag", "c1"));
        assert!(rpc.dispatch(right).is_none());
        assert!(cancel.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_hook_runs_before_caller_wakes() {
        let (rpc, _sink) = correlator(Duration::from_secs(5));
        let ran = Arc::new(AtomicBool::new(false));
        let call = tokio::spawn({
            let rpc = rpc.clone();
            let ran = ran.clone();
            async move {
                let hook: ResponseHook = Box::new(move |_| ran.store(true, Ordering::SeqCst));
                rpc.call_with_hook(
                    Command::method(1, Method::new(channel::CLASS, channel::FLOW).arg("active", true)),
                    Expectation::new(channel::CLASS, channel::FLOW, channel::FLOW_OK),
                    Some(hook),
                )
                .await
            }
        });
        until(|| rpc.in_flight() == 1).await;
        rpc.dispatch(Command::method(1, Method::new(channel::CLASS, channel::FLOW_OK).arg("active", true)));
        assert!(ran.load(Ordering::SeqCst));
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_and_send_failure() {
        let (rpc, sink) = correlator(Duration::from_secs(5));
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc.call(declare("a"), Expectation::new(queue::CLASS, queue::DECLARE, queue::DECLARE_OK))
                    .await
            }
        });
        until(|| rpc.in_flight() == 1).await;
        rpc.fail_all(|| AmqpError::ConnectionLost("socket closed".to_string()));
        assert!(matches!(call.await.unwrap(), Err(AmqpError::ConnectionLost(_))));

        sink.fail_sends();
        let err = rpc
            .call(declare("b"), Expectation::new(queue::CLASS, queue::DECLARE, queue::DECLARE_OK))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::ConnectionState(_)));
        assert_eq!(rpc.in_flight(), 0);
    }
}
