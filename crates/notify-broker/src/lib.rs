//! Broker plumbing for the notification gateway.
//!
//! A [`Broker`] hands out per-user [`Subscription`]s and publishes payloads
//! keyed by user identity. The live implementation speaks AMQP 0-9-1; the
//! no-op implementation keeps the rest of the pipeline running without a
//! broker; the in-memory implementation is a test double.

#![deny(unsafe_code)]

pub mod amqp;
pub mod error;
pub mod memory;
pub mod noop;
pub mod publisher;
pub mod subscription;

use std::sync::Arc;

use notify_settings::BrokerSettings;
use tracing::info;

pub use error::BrokerError;
pub use publisher::{PublishError, Publisher};
pub use subscription::{Broker, Delivery, DeliveryHandler, Outcome, Subscription};

/// Select the live or no-op broker once, from configuration.
pub async fn connect(
    settings: &BrokerSettings,
    connection_name: &str,
) -> Result<Arc<dyn Broker>, BrokerError> {
    if settings.enable {
        let broker = amqp::AmqpBroker::connect(settings, connection_name).await?;
        info!(
            exchange = %settings.exchange_name,
            queue_prefix = %settings.queue_name,
            "connected to message broker"
        );
        Ok(Arc::new(broker))
    } else {
        info!("message broker disabled, deliveries will never arrive");
        Ok(Arc::new(noop::NoopBroker))
    }
}
