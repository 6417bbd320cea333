use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BrokerError;

/// How a delivery is settled with the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; acknowledge and drop.
    Accept,
    /// Unprocessable or only partially delivered; reject without requeue.
    Discard,
    /// Could not be delivered now; reject with requeue.
    Retry,
}

/// One message handed to a subscription's handler.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Bytes,
}

/// Decides the outcome of each delivery. Never fails: every error a handler
/// can hit is expressed as an [`Outcome`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Outcome;
}

/// A live binding to one routing key.
///
/// `run` feeds deliveries to the handler one at a time and settles each before
/// receiving the next. It returns `Ok` once [`Subscription::close`] has been
/// called, or an error if the broker side fails. `close` may be called from
/// inside the handler and any number of times.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn routing_key(&self) -> &str;

    async fn run(&self, handler: &dyn DeliveryHandler) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a subscription for `routing_key`. Returns once the binding exists;
    /// consumption starts when the subscription is run.
    async fn subscribe(&self, routing_key: &str) -> Result<Arc<dyn Subscription>, BrokerError>;

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Backend name for logs and health output.
    fn kind(&self) -> &'static str;
}
