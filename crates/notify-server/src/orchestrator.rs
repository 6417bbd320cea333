use std::sync::Arc;

use async_trait::async_trait;
use notify_broker::Broker;
use notify_core::UserId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connections::{Connection, ConnectionRegistry};
use crate::consumers::ConsumerRegistry;
use crate::error::SessionError;

/// Entry points the transport layer calls around a client session.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Register `connection` for `user` and make sure that user's broker
    /// consumer is running. Returns as soon as both are in place.
    async fn handle_session(
        &self,
        cancel: &CancellationToken,
        connection: Arc<dyn Connection>,
        user: &UserId,
    ) -> Result<(), SessionError>;

    /// The client went away: deregister and close its connection.
    async fn end_session(&self, user: &UserId, connection: &Arc<dyn Connection>);
}

/// Wires the connection registry to the consumer registry.
pub struct FanoutOrchestrator {
    connections: Arc<ConnectionRegistry>,
    consumers: ConsumerRegistry,
}

impl FanoutOrchestrator {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let consumers = ConsumerRegistry::new(broker, Arc::clone(&connections));
        Self {
            connections,
            consumers,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    /// Stop every consumer, then close every connection. Returns the consumer
    /// tasks so the caller can bound how long it waits for them.
    pub async fn shutdown(&self) -> Vec<JoinHandle<()>> {
        let tasks = self.consumers.close_all().await;
        self.connections.flush_all_connections().await;
        info!(consumers = tasks.len(), "fan-out stopped");
        tasks
    }
}

#[async_trait]
impl SessionHandler for FanoutOrchestrator {
    async fn handle_session(
        &self,
        cancel: &CancellationToken,
        connection: Arc<dyn Connection>,
        user: &UserId,
    ) -> Result<(), SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        self.connections.add_connection(user, connection);
        self.consumers
            .add_consumer(user)
            .await
            .map_err(SessionError::Consumer)
    }

    async fn end_session(&self, user: &UserId, connection: &Arc<dyn Connection>) {
        if let Err(e) = self.connections.delete_connection(user, connection.as_ref()) {
            debug!(user_id = %user, endpoint = %connection.endpoint(), error = %e, "connection already removed");
        }
        connection.close().await;
    }
}
