use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::BrokerError;
use crate::subscription::{Broker, DeliveryHandler, Subscription};

/// Broker used when messaging is disabled. Subscriptions never deliver;
/// publishes are dropped.
pub struct NoopBroker;

#[async_trait]
impl Broker for NoopBroker {
    async fn subscribe(&self, routing_key: &str) -> Result<Arc<dyn Subscription>, BrokerError> {
        info!(routing_key, "broker disabled, subscription is a no-op");
        Ok(Arc::new(NoopSubscription {
            routing_key: routing_key.to_string(),
            cancel: CancellationToken::new(),
        }))
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        debug!(routing_key, bytes = payload.len(), "broker disabled, dropping publish");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "noop"
    }
}

pub struct NoopSubscription {
    routing_key: String,
    cancel: CancellationToken,
}

#[async_trait]
impl Subscription for NoopSubscription {
    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    async fn run(&self, _handler: &dyn DeliveryHandler) -> Result<(), BrokerError> {
        self.cancel.cancelled().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        Ok(())
    }
}
