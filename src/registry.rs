//! Per-user connection bookkeeping: maps user id to the set of live connection ids.

use dashmap::DashMap;
use uuid::Uuid;

/// Registry of live connection ids per user id. Thread-safe; shared via Arc.
///
/// Holds no transport state (outbound senders live in the gateway). A user id
/// is present as a key exactly while it has at least one live connection;
/// entries are pruned as soon as the last connection goes away.
pub struct ConnectionRegistry {
    /// user id -> connection ids (multiple tabs/devices per user).
    inner: DashMap<String, Vec<Uuid>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Register a connection for the given user. Idempotent: adding the same
    /// (user, connection) pair twice has no further effect.
    pub fn add(&self, user_id: &str, conn_id: Uuid) {
        let mut conns = self.inner.entry(user_id.to_string()).or_default();
        if !conns.contains(&conn_id) {
            conns.push(conn_id);
        }
    }

    /// Remove a single connection. Silent no-op if the pair was never
    /// registered (disconnect races are expected). The user key is pruned
    /// once its last connection is gone.
    pub fn remove(&self, user_id: &str, conn_id: Uuid) {
        if let Some(mut conns) = self.inner.get_mut(user_id) {
            conns.retain(|c| *c != conn_id);
        }
        self.inner.remove_if(user_id, |_, conns| conns.is_empty());
    }

    /// Snapshot of all user ids with at least one live connection.
    pub fn user_ids(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of the connection ids registered for a user. Empty (not an
    /// error) for unknown users.
    pub fn connections_for(&self, user_id: &str) -> Vec<Uuid> {
        self.inner
            .get(user_id)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
