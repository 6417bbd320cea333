//! Live connections per user.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use notify_core::{GatewayError, UserId};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::ConnectionError;

/// A bidirectional stream to one client, keyed by its remote endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    fn endpoint(&self) -> SocketAddr;

    /// Send `payload` as a single text frame.
    async fn write_text(&self, payload: &[u8]) -> Result<(), ConnectionError>;

    /// Close the stream. Calling it again is a no-op.
    async fn close(&self);
}

type ConnectionSet = HashMap<SocketAddr, Arc<dyn Connection>>;

/// User identity to the set of that user's live connections.
///
/// A user's entry is created by the first `add_connection`. Deleting the last
/// connection leaves an empty set behind; the entry goes away on a flush or
/// when the user's consumer retires and prunes it. The lock is never held
/// across an await.
#[derive(Default)]
pub struct ConnectionRegistry {
    users: Mutex<HashMap<UserId, ConnectionSet>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` for `user`. An existing connection with the same
    /// endpoint is replaced without being closed.
    pub fn add_connection(&self, user: &UserId, connection: Arc<dyn Connection>) {
        let endpoint = connection.endpoint();
        let replaced = self
            .users
            .lock()
            .entry(user.clone())
            .or_default()
            .insert(endpoint, connection)
            .is_some();
        debug!(user_id = %user, %endpoint, replaced, "connection registered");
    }

    /// Deregister by endpoint. Does not close the connection.
    pub fn delete_connection(
        &self,
        user: &UserId,
        connection: &dyn Connection,
    ) -> Result<(), GatewayError> {
        let endpoint = connection.endpoint();
        let mut users = self.users.lock();
        let set = users
            .get_mut(user)
            .ok_or_else(|| GatewayError::not_found(format!("connections for user {user}")))?;
        if set.remove(&endpoint).is_none() {
            return Err(GatewayError::not_found(format!(
                "connection {endpoint} for user {user}"
            )));
        }
        debug!(user_id = %user, %endpoint, remaining = set.len(), "connection deregistered");
        Ok(())
    }

    /// Snapshot of the user's live connections, in no particular order.
    pub fn get_user_connections(
        &self,
        user: &UserId,
    ) -> Result<Vec<Arc<dyn Connection>>, GatewayError> {
        self.users
            .lock()
            .get(user)
            .map(|set| set.values().cloned().collect())
            .ok_or_else(|| GatewayError::not_found(format!("connections for user {user}")))
    }

    /// Drop the user's entry if it holds no connections. Returns false when a
    /// live connection is registered, true when the user has none (whether or
    /// not an entry was removed).
    pub fn prune_if_empty(&self, user: &UserId) -> bool {
        let mut users = self.users.lock();
        match users.get(user) {
            Some(set) if !set.is_empty() => false,
            Some(_) => {
                let _ = users.remove(user);
                debug!(user_id = %user, "pruned empty connection entry");
                true
            }
            None => true,
        }
    }

    /// Remove the user's entry and close every connection in it.
    pub async fn flush_all_user_connections(&self, user: &UserId) -> Result<(), GatewayError> {
        let set = self
            .users
            .lock()
            .remove(user)
            .ok_or_else(|| GatewayError::not_found(format!("connections for user {user}")))?;
        debug!(user_id = %user, count = set.len(), "flushing user connections");
        for connection in set.into_values() {
            connection.close().await;
        }
        Ok(())
    }

    /// Close every connection and clear the registry.
    pub async fn flush_all_connections(&self) {
        let users = std::mem::take(&mut *self.users.lock());
        let count: usize = users.values().map(HashMap::len).sum();
        debug!(users = users.len(), connections = count, "flushing all connections");
        for connection in users.into_values().flat_map(HashMap::into_values) {
            connection.close().await;
        }
    }

    /// Users with an entry, including those whose set is currently empty.
    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.users.lock().values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;

    fn user(id: &str) -> UserId {
        UserId::from_raw(id)
    }

    fn endpoints(conns: &[Arc<dyn Connection>]) -> Vec<SocketAddr> {
        let mut out: Vec<_> = conns.iter().map(|c| c.endpoint()).collect();
        out.sort();
        out
    }

    #[test]
    fn add_then_get_returns_all() {
        let registry = ConnectionRegistry::new();
        let c1 = MockConnection::at(1001);
        let c2 = MockConnection::at(1002);
        registry.add_connection(&user("u1"), c1.clone());
        registry.add_connection(&user("u1"), c2.clone());

        let got = registry.get_user_connections(&user("u1")).unwrap();
        assert_eq!(endpoints(&got), vec![c1.endpoint(), c2.endpoint()]);
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.user_count(), 1);
    }

    #[test]
    fn same_endpoint_replaces_without_closing() {
        let registry = ConnectionRegistry::new();
        let old = MockConnection::at(1001);
        let new = MockConnection::at(1001);
        registry.add_connection(&user("u1"), old.clone());
        registry.add_connection(&user("u1"), new.clone());

        assert_eq!(registry.connection_count(), 1);
        assert!(!old.is_closed());
    }

    #[test]
    fn get_unknown_user_is_not_found() {
        let registry = ConnectionRegistry::new();
        let err = registry.get_user_connections(&user("ghost")).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_on_absent_user_or_key_is_not_found() {
        let registry = ConnectionRegistry::new();
        let c1 = MockConnection::at(1001);
        let stranger = MockConnection::at(2002);

        assert!(registry
            .delete_connection(&user("u1"), c1.as_ref())
            .unwrap_err()
            .is_not_found());

        registry.add_connection(&user("u1"), c1.clone());
        assert!(registry
            .delete_connection(&user("u1"), stranger.as_ref())
            .unwrap_err()
            .is_not_found());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn delete_does_not_close_and_keeps_empty_entry() {
        let registry = ConnectionRegistry::new();
        let c1 = MockConnection::at(1001);
        registry.add_connection(&user("u1"), c1.clone());

        registry.delete_connection(&user("u1"), c1.as_ref()).unwrap();
        assert!(!c1.is_closed());
        assert!(registry.get_user_connections(&user("u1")).unwrap().is_empty());
        assert_eq!(registry.user_count(), 1);
    }

    #[test]
    fn prune_removes_only_empty_entries() {
        let registry = ConnectionRegistry::new();
        let c1 = MockConnection::at(1001);
        let c2 = MockConnection::at(1002);
        registry.add_connection(&user("u1"), c1.clone());
        registry.add_connection(&user("u2"), c2.clone());
        registry.delete_connection(&user("u1"), c1.as_ref()).unwrap();

        assert!(registry.prune_if_empty(&user("u1")));
        assert!(registry
            .get_user_connections(&user("u1"))
            .err()
            .unwrap()
            .is_not_found());

        assert!(!registry.prune_if_empty(&user("u2")));
        assert_eq!(registry.get_user_connections(&user("u2")).unwrap().len(), 1);

        assert!(registry.prune_if_empty(&user("ghost")));
        assert_eq!(registry.user_count(), 1);
    }

    #[tokio::test]
    async fn flush_user_closes_and_removes_entry() {
        let registry = ConnectionRegistry::new();
        let c1 = MockConnection::at(1001);
        let c2 = MockConnection::at(1002);
        let other = MockConnection::at(3003);
        registry.add_connection(&user("u1"), c1.clone());
        registry.add_connection(&user("u1"), c2.clone());
        registry.add_connection(&user("u2"), other.clone());

        registry.flush_all_user_connections(&user("u1")).await.unwrap();
        assert!(c1.is_closed());
        assert!(c2.is_closed());
        assert!(!other.is_closed());
        assert!(registry
            .get_user_connections(&user("u1"))
            .err()
            .unwrap()
            .is_not_found());

        assert!(registry
            .flush_all_user_connections(&user("u1"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn flush_all_clears_everything() {
        let registry = ConnectionRegistry::new();
        let c1 = MockConnection::at(1001);
        let c2 = MockConnection::at(1002);
        registry.add_connection(&user("u1"), c1.clone());
        registry.add_connection(&user("u2"), c2.clone());

        registry.flush_all_connections().await;
        assert!(c1.is_closed());
        assert!(c2.is_closed());
        assert_eq!(registry.user_count(), 0);
        assert_eq!(registry.connection_count(), 0);
    }
}
