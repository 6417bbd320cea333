//! In-process broker for tests.
//!
//! Publishes go to the open subscription for their routing key, or wait in a
//! per-key backlog until one opens. Retried deliveries and anything still
//! queued when a subscription closes return to the backlog, flagged as
//! redelivered. Every settlement is recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::subscription::{Broker, Delivery, DeliveryHandler, Outcome, Subscription};

/// A settled delivery.
#[derive(Clone, Debug)]
pub struct Settlement {
    pub routing_key: String,
    pub tag: u64,
    pub outcome: Outcome,
    pub body: Bytes,
}

struct Live {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    fault: CancellationToken,
}

#[derive(Default)]
struct State {
    live: HashMap<String, Live>,
    parked: HashMap<String, VecDeque<Delivery>>,
    settlements: Vec<Settlement>,
    subscribes: HashMap<String, usize>,
    fail_next_subscribe: bool,
    next_tag: u64,
    next_subscription: u64,
}

impl State {
    fn enqueue(&mut self, delivery: Delivery) {
        let delivery = match self.live.get(&delivery.routing_key) {
            Some(live) => match live.tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(delivery)) => delivery,
            },
            None => delivery,
        };
        self.parked
            .entry(delivery.routing_key.clone())
            .or_default()
            .push_back(delivery);
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    settled: Notify,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `subscribe` call fail.
    pub fn fail_next_subscribe(&self) {
        self.shared.state.lock().fail_next_subscribe = true;
    }

    /// Successful subscribe calls for `routing_key`.
    pub fn subscribe_count(&self, routing_key: &str) -> usize {
        self.shared
            .state
            .lock()
            .subscribes
            .get(routing_key)
            .copied()
            .unwrap_or(0)
    }

    /// Make the open subscription for `routing_key` fail as if the broker
    /// connection dropped. Returns false when nothing is subscribed.
    pub fn break_subscription(&self, routing_key: &str) -> bool {
        match self.shared.state.lock().live.get(routing_key) {
            Some(live) => {
                live.fault.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, routing_key: &str) -> bool {
        self.shared.state.lock().live.contains_key(routing_key)
    }

    /// Deliveries waiting for a subscription on `routing_key`.
    pub fn parked(&self, routing_key: &str) -> usize {
        self.shared
            .state
            .lock()
            .parked
            .get(routing_key)
            .map_or(0, VecDeque::len)
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.state.lock().settlements.clone()
    }

    /// Wait until at least `count` settlements have been recorded.
    pub async fn wait_for_settlements(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Option<Vec<Settlement>> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.shared.settled.notified();
                if let Some(settled) = self.settled_at_least(count) {
                    return settled;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    fn settled_at_least(&self, count: usize) -> Option<Vec<Settlement>> {
        let state = self.shared.state.lock();
        (state.settlements.len() >= count).then(|| state.settlements.clone())
    }

    fn open(&self, routing_key: &str) -> Result<MemorySubscription, BrokerError> {
        let mut state = self.shared.state.lock();
        if std::mem::take(&mut state.fail_next_subscribe) {
            return Err(BrokerError::Channel("injected subscribe failure".into()));
        }
        *state.subscribes.entry(routing_key.to_string()).or_default() += 1;
        state.next_subscription += 1;
        let id = state.next_subscription;

        let (tx, rx) = mpsc::unbounded_channel();
        for delivery in state.parked.remove(routing_key).unwrap_or_default() {
            let _ = tx.send(delivery);
        }
        let fault = CancellationToken::new();
        let _ = state.live.insert(
            routing_key.to_string(),
            Live {
                id,
                tx,
                fault: fault.clone(),
            },
        );

        Ok(MemorySubscription {
            id,
            routing_key: routing_key.to_string(),
            shared: Arc::clone(&self.shared),
            inbox: tokio::sync::Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            fault,
            closed: AtomicBool::new(false),
        })
    }

    fn route(&self, routing_key: &str, payload: &[u8]) {
        let mut state = self.shared.state.lock();
        state.next_tag += 1;
        let delivery = Delivery {
            tag: state.next_tag,
            routing_key: routing_key.to_string(),
            redelivered: false,
            body: Bytes::copy_from_slice(payload),
        };
        state.enqueue(delivery);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, routing_key: &str) -> Result<Arc<dyn Subscription>, BrokerError> {
        Ok(Arc::new(self.open(routing_key)?))
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.route(routing_key, payload);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

pub struct MemorySubscription {
    id: u64,
    routing_key: String,
    shared: Arc<Shared>,
    inbox: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    cancel: CancellationToken,
    fault: CancellationToken,
    closed: AtomicBool,
}

impl MemorySubscription {
    fn record(&self, delivery: Delivery, outcome: Outcome) {
        {
            let mut state = self.shared.state.lock();
            state.settlements.push(Settlement {
                routing_key: delivery.routing_key.clone(),
                tag: delivery.tag,
                outcome,
                body: delivery.body.clone(),
            });
            if outcome == Outcome::Retry {
                state.enqueue(Delivery {
                    redelivered: true,
                    ..delivery
                });
            }
        }
        self.shared.settled.notify_waiters();
    }

    /// Unbind and hand unsettled deliveries back to the broker.
    fn detach(&self, mut inbox: mpsc::UnboundedReceiver<Delivery>) {
        let mut state = self.shared.state.lock();
        if state.live.get(&self.routing_key).map(|l| l.id) == Some(self.id) {
            let _ = state.live.remove(&self.routing_key);
        }
        inbox.close();
        while let Ok(delivery) = inbox.try_recv() {
            state.enqueue(Delivery {
                redelivered: true,
                ..delivery
            });
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    async fn run(&self, handler: &dyn DeliveryHandler) -> Result<(), BrokerError> {
        let Some(mut inbox) = self.inbox.lock().await.take() else {
            return if self.closed.load(Ordering::Acquire) {
                Ok(())
            } else {
                Err(BrokerError::AlreadyRunning)
            };
        };

        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.fault.cancelled() => {
                    self.detach(inbox);
                    return Err(BrokerError::Consume("connection lost".into()));
                }
                next = inbox.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            let outcome = handler.handle(&delivery).await;
            self.record(delivery, outcome);
        }

        self.detach(inbox);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        let idle = self.inbox.lock().await.take();
        if let Some(inbox) = idle {
            self.detach(inbox);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixed(Outcome);

    #[async_trait]
    impl DeliveryHandler for Fixed {
        async fn handle(&self, _delivery: &Delivery) -> Outcome {
            self.0
        }
    }

    /// Returns `Retry` and closes its own subscription, like a retiring consumer.
    struct RetryAndClose {
        sub: Arc<dyn Subscription>,
    }

    #[async_trait]
    impl DeliveryHandler for RetryAndClose {
        async fn handle(&self, _delivery: &Delivery) -> Outcome {
            self.sub.close().await.unwrap();
            Outcome::Retry
        }
    }

    fn spawn_run(
        sub: &Arc<dyn Subscription>,
        handler: impl DeliveryHandler + 'static,
    ) -> tokio::task::JoinHandle<Result<(), BrokerError>> {
        let sub = Arc::clone(sub);
        tokio::spawn(async move { sub.run(&handler).await })
    }

    #[tokio::test]
    async fn publish_before_subscribe_is_parked() {
        let broker = MemoryBroker::new();
        broker.publish("u1", b"one").await.unwrap();
        assert_eq!(broker.parked("u1"), 1);

        let sub = broker.subscribe("u1").await.unwrap();
        assert_eq!(broker.parked("u1"), 0);
        let runner = spawn_run(&sub, Fixed(Outcome::Accept));

        let settled = broker.wait_for_settlements(1, WAIT).await.unwrap();
        assert_eq!(settled[0].outcome, Outcome::Accept);
        assert_eq!(&settled[0].body[..], b"one");

        sub.close().await.unwrap();
        runner.await.unwrap().unwrap();
        assert!(!broker.is_subscribed("u1"));
    }

    #[tokio::test]
    async fn routing_is_per_key() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("u1").await.unwrap();
        let runner = spawn_run(&sub, Fixed(Outcome::Discard));

        broker.publish("u2", b"other").await.unwrap();
        broker.publish("u1", b"mine").await.unwrap();

        let settled = broker.wait_for_settlements(1, WAIT).await.unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].routing_key, "u1");
        assert_eq!(broker.parked("u2"), 1);

        sub.close().await.unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn retried_delivery_goes_to_next_subscription() {
        let broker = MemoryBroker::new();
        let first = broker.subscribe("u2").await.unwrap();
        let runner = spawn_run(
            &first,
            RetryAndClose {
                sub: Arc::clone(&first),
            },
        );

        broker.publish("u2", b"later").await.unwrap();
        runner.await.unwrap().unwrap();

        let settled = broker.settlements();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].outcome, Outcome::Retry);
        assert_eq!(broker.parked("u2"), 1);

        let second = broker.subscribe("u2").await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        struct Capture(Arc<Mutex<Vec<Delivery>>>);
        #[async_trait]
        impl DeliveryHandler for Capture {
            async fn handle(&self, delivery: &Delivery) -> Outcome {
                self.0.lock().push(delivery.clone());
                Outcome::Accept
            }
        }

        let runner = spawn_run(&second, Capture(Arc::clone(&seen)));
        broker.wait_for_settlements(2, WAIT).await.unwrap();
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert!(seen[0].redelivered);
            assert_eq!(&seen[0].body[..], b"later");
        }

        second.close().await.unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(broker.subscribe_count("u2"), 2);
    }

    #[tokio::test]
    async fn injected_subscribe_failure_is_one_shot() {
        let broker = MemoryBroker::new();
        broker.fail_next_subscribe();
        assert!(broker.subscribe("u1").await.is_err());
        assert_eq!(broker.subscribe_count("u1"), 0);
        assert!(broker.subscribe("u1").await.is_ok());
        assert_eq!(broker.subscribe_count("u1"), 1);
    }

    #[tokio::test]
    async fn closing_idle_subscription_keeps_backlog() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("u1").await.unwrap();
        broker.publish("u1", b"queued").await.unwrap();

        sub.close().await.unwrap();
        sub.close().await.unwrap();
        assert_eq!(broker.parked("u1"), 1);
        sub.run(&Fixed(Outcome::Accept)).await.unwrap();
        assert!(broker.settlements().is_empty());
    }

    #[tokio::test]
    async fn broken_subscription_fails_run_and_keeps_backlog() {
        let broker = MemoryBroker::new();
        assert!(!broker.break_subscription("u1"));

        let sub = broker.subscribe("u1").await.unwrap();
        broker.publish("u1", b"queued").await.unwrap();
        assert!(broker.break_subscription("u1"));

        let err = sub.run(&Fixed(Outcome::Accept)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Consume(_)));
        assert!(!broker.is_subscribed("u1"));
        assert_eq!(broker.parked("u1"), 1);
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("u1").await.unwrap();
        let runner = spawn_run(&sub, Fixed(Outcome::Accept));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = sub.run(&Fixed(Outcome::Accept)).await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyRunning));

        sub.close().await.unwrap();
        runner.await.unwrap().unwrap();
    }
}
