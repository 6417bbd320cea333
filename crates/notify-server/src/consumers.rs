//! Per-user broker consumers and the fan-out they perform.
//!
//! A consumer is started lazily by the first session of a user and retires
//! itself when a delivery finds that user with no live connections. The
//! retiring delivery is handed back to the broker so the next session sees it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use notify_broker::{Broker, Delivery, DeliveryHandler, Outcome, Subscription};
use notify_core::{GatewayError, Message, UserId};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connections::ConnectionRegistry;

struct ConsumerHandle {
    generation: u64,
    subscription: Arc<dyn Subscription>,
    task: JoinHandle<()>,
}

enum Slot {
    /// A subscription is being opened. The opener holds the sender and drops
    /// it when done, which wakes every caller waiting on `done`.
    Opening {
        generation: u64,
        done: watch::Receiver<()>,
    },
    Running(ConsumerHandle),
}

struct Inner {
    broker: Arc<dyn Broker>,
    connections: Arc<ConnectionRegistry>,
    slots: Mutex<HashMap<UserId, Slot>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn is_current(slot: Option<&Slot>, generation: u64) -> bool {
        match slot {
            Some(Slot::Opening { generation: g, .. }) => *g == generation,
            Some(Slot::Running(handle)) => handle.generation == generation,
            None => false,
        }
    }

    /// Remove the user's slot if it still belongs to `generation`.
    fn remove_own(&self, user: &UserId, generation: u64) -> bool {
        let mut slots = self.slots.lock();
        if Self::is_current(slots.get(user), generation) {
            let _ = slots.remove(user);
            true
        } else {
            false
        }
    }
}

/// User identity to the running consumer for that user. At most one per user.
///
/// The slot map lock only guards lookups and inserts. Opening a subscription
/// happens outside it, behind a per-user `Opening` slot that concurrent
/// callers for the same user wait on.
#[derive(Clone)]
pub struct ConsumerRegistry {
    inner: Arc<Inner>,
}

impl ConsumerRegistry {
    pub fn new(broker: Arc<dyn Broker>, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                connections,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Ensure a consumer is running for `user`.
    ///
    /// No-op if one is already running. Returns once the subscription is open
    /// and the consumer task is spawned, without waiting for deliveries.
    pub async fn add_consumer(&self, user: &UserId) -> Result<(), GatewayError> {
        let (generation, opening) = loop {
            let mut done = {
                let mut slots = self.inner.slots.lock();
                if self.inner.closed.load(Ordering::Acquire) {
                    return Err(GatewayError::internal("consumer registry is closed"));
                }
                let waiting = match slots.get(user) {
                    Some(Slot::Running(handle)) if !handle.task.is_finished() => return Ok(()),
                    // An opener that went away without resolving its slot has
                    // dropped the sender; treat the slot as vacant.
                    Some(Slot::Opening { done, .. }) if done.has_changed().is_ok() => Some(done.clone()),
                    Some(Slot::Running(handle)) => {
                        debug!(user_id = %user, generation = handle.generation, "replacing finished consumer");
                        None
                    }
                    _ => None,
                };
                match waiting {
                    Some(done) => done,
                    None => {
                        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(());
                        let _ = slots.insert(user.clone(), Slot::Opening { generation, done: rx });
                        break (generation, tx);
                    }
                }
            };
            // Resolves with an error once the opener drops its sender.
            let _ = done.changed().await;
        };

        let subscription = match self.inner.broker.subscribe(user.as_str()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(user_id = %user, error = %e, kind = e.error_kind(), "failed to open subscription");
                let _ = self.inner.remove_own(user, generation);
                drop(opening);
                return Err(GatewayError::internal(format!("open subscription for {user}: {e}")));
            }
        };

        let installed = {
            let mut slots = self.inner.slots.lock();
            let current = Inner::is_current(slots.get(user), generation);
            if current && !self.inner.closed.load(Ordering::Acquire) {
                let fan_out = FanOut {
                    user: user.clone(),
                    generation,
                    subscription: Arc::clone(&subscription),
                    inner: Arc::clone(&self.inner),
                };
                // Spawned under the lock so the task never sees the map
                // without its own handle.
                let task = tokio::spawn(run_consumer(fan_out));
                let _ = slots.insert(
                    user.clone(),
                    Slot::Running(ConsumerHandle {
                        generation,
                        subscription: Arc::clone(&subscription),
                        task,
                    }),
                );
                true
            } else {
                if current {
                    let _ = slots.remove(user);
                }
                false
            }
        };
        drop(opening);

        if !installed {
            debug!(user_id = %user, generation, "consumer closed while opening");
            close_subscription(user, subscription.as_ref()).await;
            return Err(GatewayError::internal(format!("consumer for {user} closed while opening")));
        }
        info!(user_id = %user, generation, "consumer started");
        Ok(())
    }

    /// Stop the user's consumer, if any.
    pub async fn close(&self, user: &UserId) {
        let slot = self.inner.slots.lock().remove(user);
        if let Some(Slot::Running(handle)) = slot {
            close_subscription(user, handle.subscription.as_ref()).await;
        }
    }

    /// Stop every consumer and refuse new ones. Returns the task handles so
    /// callers can wait for them to drain.
    pub async fn close_all(&self) -> Vec<JoinHandle<()>> {
        let slots: Vec<_> = {
            let mut slots = self.inner.slots.lock();
            self.inner.closed.store(true, Ordering::Release);
            slots.drain().collect()
        };
        let mut tasks = Vec::with_capacity(slots.len());
        for (user, slot) in slots {
            if let Slot::Running(handle) = slot {
                close_subscription(&user, handle.subscription.as_ref()).await;
                tasks.push(handle.task);
            }
        }
        tasks
    }

    /// Running consumers. Subscriptions still being opened are not counted.
    pub fn len(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Running(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, user: &UserId) -> bool {
        matches!(self.inner.slots.lock().get(user), Some(Slot::Running(_)))
    }
}

async fn close_subscription(user: &UserId, subscription: &dyn Subscription) {
    if let Err(e) = subscription.close().await {
        debug!(user_id = %user, error = %e, "closing subscription failed");
    }
}

async fn run_consumer(fan_out: FanOut) {
    let reason = match fan_out.subscription.run(&fan_out).await {
        Ok(()) => "closed",
        Err(e) => {
            warn!(user_id = %fan_out.user, error = %e, kind = e.error_kind(), "subscription failed");
            "subscription error"
        }
    };
    fan_out.release().await;
    info!(user_id = %fan_out.user, generation = fan_out.generation, reason, "consumer stopped");
}

/// Delivers one user's broker messages to all of that user's connections.
struct FanOut {
    user: UserId,
    generation: u64,
    subscription: Arc<dyn Subscription>,
    inner: Arc<Inner>,
}

impl FanOut {
    /// Drop our slot (unless a newer consumer replaced it) and close the
    /// subscription.
    async fn release(&self) {
        let _ = self.inner.remove_own(&self.user, self.generation);
        close_subscription(&self.user, self.subscription.as_ref()).await;
    }

    /// Stop consuming because the user had no live connections.
    ///
    /// A session that registered after the empty snapshot may have found this
    /// consumer still running and skipped starting one, so the connection set
    /// is checked again once the slot is gone. Empty entries are pruned.
    async fn retire(&self) {
        self.release().await;
        if self.inner.connections.prune_if_empty(&self.user)
            || self.inner.closed.load(Ordering::Acquire)
        {
            return;
        }
        info!(user_id = %self.user, "connection registered while retiring, restarting consumer");
        let registry = ConsumerRegistry {
            inner: Arc::clone(&self.inner),
        };
        if let Err(e) = registry.add_consumer(&self.user).await {
            warn!(user_id = %self.user, error = %e, kind = e.error_kind(), "failed to restart consumer");
        }
    }
}

#[async_trait]
impl DeliveryHandler for FanOut {
    async fn handle(&self, delivery: &Delivery) -> Outcome {
        if let Err(e) = Message::decode(&delivery.body) {
            warn!(user_id = %self.user, tag = delivery.tag, error = %e, "undecodable delivery");
            return Outcome::Discard;
        }

        let connections = match self.inner.connections.get_user_connections(&self.user) {
            Ok(connections) => connections,
            Err(e) => {
                debug!(user_id = %self.user, tag = delivery.tag, error = %e, "no connection entry");
                return Outcome::Discard;
            }
        };

        if connections.is_empty() {
            info!(user_id = %self.user, tag = delivery.tag, "no live connections, retiring consumer");
            self.retire().await;
            return Outcome::Retry;
        }

        // A failed write drops that connection and this delivery; connections
        // after it in the snapshot do not receive it.
        for connection in &connections {
            if let Err(e) = connection.write_text(&delivery.body).await {
                let endpoint = connection.endpoint();
                warn!(user_id = %self.user, %endpoint, error = %e, "write failed, dropping connection");
                if let Err(e) = self
                    .inner
                    .connections
                    .delete_connection(&self.user, connection.as_ref())
                {
                    debug!(user_id = %self.user, %endpoint, error = %e, "connection already gone");
                }
                connection.close().await;
                return Outcome::Discard;
            }
        }

        debug!(user_id = %self.user, tag = delivery.tag, fan_out = connections.len(), "delivered");
        Outcome::Accept
    }
}
