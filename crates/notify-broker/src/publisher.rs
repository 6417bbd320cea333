use std::sync::Arc;

use notify_core::{CodecError, Message, UserId, ValidationError};
use tracing::debug;

use crate::error::BrokerError;
use crate::subscription::Broker;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid message: {0}")]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Encode(#[from] CodecError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Publishes feed messages to a user's routing key.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Rejects incomplete messages before anything reaches the broker.
    pub async fn publish(&self, user: &UserId, message: &Message) -> Result<(), PublishError> {
        message.validate()?;
        let payload = message.encode()?;
        self.broker.publish(user.as_str(), &payload).await?;
        debug!(user_id = %user, message_id = %message.id, "message published");
        Ok(())
    }
}
