//! Presence and messaging gateway: owns the live connections, keeps the
//! per-user registry in sync, and fans server events out to them.
//!
//! All fan-out is fire-and-forget through each connection's bounded outbound
//! queue, so a slow socket never stalls delivery to its siblings. A send that
//! finds the queue closed means the socket task is gone; that connection is
//! reaped as if a disconnect had been observed.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error};
use uuid::Uuid;

use crate::auth::Identity;
use crate::events;
use crate::metrics::GatewayMetrics;
use crate::registry::ConnectionRegistry;

/// Outbound queue depth per connection; frames beyond this are dropped.
const OUTBOUND_BUFFER: usize = 64;

/// One live connection's send side, plus the identity it attached with.
struct ConnectionEntry {
    tx: mpsc::Sender<String>,
    user_id: Option<String>,
}

/// Handle returned by [`PresenceGateway::attach`]; the socket task hands it
/// back to `detach` when the connection closes.
pub struct SessionHandle {
    pub conn_id: Uuid,
    pub user_id: Option<String>,
}

pub struct PresenceGateway {
    /// Every open connection, registered or not.
    connections: DashMap<Uuid, ConnectionEntry>,
    registry: ConnectionRegistry,
    metrics: Arc<GatewayMetrics>,
}

impl PresenceGateway {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            connections: DashMap::new(),
            registry: ConnectionRegistry::new(),
            metrics,
        }
    }

    /// Register a new live connection. Returns the session handle and the
    /// receiver the socket task drains.
    ///
    /// A connection with a resolved user id is added to the registry before
    /// the online list announcing it goes out, so every broadcast a client
    /// sees reflects a registry state that already includes the newcomer.
    /// Anonymous connections are not registered; they get the current online
    /// list pushed once as initial state instead.
    pub fn attach(&self, identity: &Identity) -> (SessionHandle, mpsc::Receiver<String>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let user_id = identity.user_id().map(str::to_string);
        self.connections.insert(
            conn_id,
            ConnectionEntry {
                tx: tx.clone(),
                user_id: user_id.clone(),
            },
        );
        self.metrics.open_connections.inc();

        match &user_id {
            Some(uid) => {
                self.registry.add(uid, conn_id);
                self.broadcast_online_users();
            }
            None => {
                if let Ok(frame) = events::frame(events::ONLINE_USERS, &self.registry.user_ids()) {
                    let _ = tx.try_send(frame);
                }
            }
        }
        (SessionHandle { conn_id, user_id }, rx)
    }

    /// Drop a connection. Re-broadcasts the online list if the user's
    /// presence changed. Safe to call more than once for the same handle.
    pub fn detach(&self, handle: &SessionHandle) {
        self.remove_connection(handle.conn_id);
    }

    fn remove_connection(&self, conn_id: Uuid) {
        let Some((_, entry)) = self.connections.remove(&conn_id) else {
            return;
        };
        self.metrics.open_connections.dec();
        if let Some(uid) = entry.user_id {
            self.registry.remove(&uid, conn_id);
            self.broadcast_online_users();
        }
    }

    /// Current online user ids, straight from the registry.
    pub fn online_user_ids(&self) -> Vec<String> {
        self.registry.user_ids()
    }

    /// Fire-and-forget fan-out of one event to every open connection,
    /// registered or not. A failed send to one connection never aborts the
    /// loop over the rest.
    pub fn broadcast<T: Serialize>(&self, event: &str, payload: &T) {
        let frame = match events::frame(event, payload) {
            Ok(f) => f,
            Err(err) => {
                error!("encode {event} broadcast: {err}");
                return;
            }
        };
        let mut stale = Vec::new();
        for entry in self.connections.iter() {
            match entry.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.metrics.dropped_frames.inc();
                    debug!(conn_id = %entry.key(), "broadcast queue full, frame dropped");
                }
                Err(TrySendError::Closed(_)) => stale.push(*entry.key()),
            }
        }
        self.metrics.broadcasts.inc();
        self.reap(stale);
    }

    /// Push an event to every live connection of one user. Returns the number
    /// of connections the frame was queued for; zero for unknown or offline
    /// users (the durable store is the source of truth, so an offline
    /// receiver catches up on reconnect and this is a silent no-op).
    pub fn deliver_to_user<T: Serialize>(&self, user_id: &str, event: &str, payload: &T) -> usize {
        let conn_ids = self.registry.connections_for(user_id);
        if conn_ids.is_empty() {
            return 0;
        }
        let frame = match events::frame(event, payload) {
            Ok(f) => f,
            Err(err) => {
                error!("encode {event} delivery: {err}");
                return 0;
            }
        };
        let mut sent = 0;
        let mut stale = Vec::new();
        for conn_id in conn_ids {
            let Some(entry) = self.connections.get(&conn_id) else {
                continue;
            };
            match entry.tx.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    self.metrics.dropped_frames.inc();
                    debug!(%conn_id, user_id, "delivery queue full, frame dropped");
                }
                Err(TrySendError::Closed(_)) => stale.push(conn_id),
            }
        }
        self.metrics.deliveries.inc_by(sent as u64);
        self.reap(stale);
        sent
    }

    fn broadcast_online_users(&self) {
        let users = self.registry.user_ids();
        self.metrics.online_users.set(users.len() as i64);
        self.broadcast(events::ONLINE_USERS, &users);
    }

    /// Remove connections whose outbound channel has closed, exactly as if a
    /// disconnect had been observed for each.
    fn reap(&self, stale: Vec<Uuid>) {
        for conn_id in stale {
            debug!(%conn_id, "reaping stale connection");
            self.metrics.stale_reaped.inc();
            self.remove_connection(conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn gw() -> PresenceGateway {
        PresenceGateway::new(Arc::new(GatewayMetrics::new().unwrap()))
    }

    fn recv_all(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(s) = rx.try_recv() {
            out.push(serde_json::from_str(&s).unwrap());
        }
        out
    }

    fn online_set(frame: &serde_json::Value) -> HashSet<String> {
        assert_eq!(frame["type"], events::ONLINE_USERS);
        frame["payload"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn connect_broadcasts_online_list_to_everyone() {
        let gw = gw();
        let (_h1, mut rx1) = gw.attach(&Identity::Verified("u1".into()));
        recv_all(&mut rx1);

        let (_h2, mut rx2) = gw.attach(&Identity::Verified("u2".into()));

        let frames1 = recv_all(&mut rx1);
        assert_eq!(frames1.len(), 1);
        assert_eq!(online_set(&frames1[0]), set(&["u1", "u2"]));

        // The newcomer sees a state that already includes itself.
        let frames2 = recv_all(&mut rx2);
        assert_eq!(frames2.len(), 1);
        assert_eq!(online_set(&frames2[0]), set(&["u1", "u2"]));
    }

    #[test]
    fn anonymous_observes_presence_but_gets_no_deliveries() {
        let gw = gw();
        let (_anon, mut anon_rx) = gw.attach(&Identity::Anonymous);

        // Initial snapshot pushed directly, no broadcast fired.
        let frames = recv_all(&mut anon_rx);
        assert_eq!(frames.len(), 1);
        assert!(online_set(&frames[0]).is_empty());
        assert!(gw.online_user_ids().is_empty());

        let (_h1, mut rx1) = gw.attach(&Identity::Claimed("u1".into()));
        recv_all(&mut rx1);
        let frames = recv_all(&mut anon_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(online_set(&frames[0]), set(&["u1"]));

        gw.deliver_to_user("u1", events::MESSAGE_RECEIVED, &serde_json::json!({"text": "hi"}));
        assert!(recv_all(&mut anon_rx).is_empty());
        assert_eq!(recv_all(&mut rx1).len(), 1);
    }

    #[test]
    fn delivery_reaches_only_the_target_user() {
        let gw = gw();
        let (_ha, mut rx_a) = gw.attach(&Identity::Verified("a".into()));
        let (_hb, mut rx_b) = gw.attach(&Identity::Verified("b".into()));
        recv_all(&mut rx_a);
        recv_all(&mut rx_b);

        let sent = gw.deliver_to_user("a", events::MESSAGE_RECEIVED, &serde_json::json!({"text": "hi"}));
        assert_eq!(sent, 1);

        let frames = recv_all(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], events::MESSAGE_RECEIVED);
        assert_eq!(frames[0]["payload"]["text"], "hi");
        assert!(recv_all(&mut rx_b).is_empty());
    }

    #[test]
    fn delivery_to_unknown_user_is_a_noop() {
        let gw = gw();
        let (_h1, mut rx1) = gw.attach(&Identity::Verified("u1".into()));
        recv_all(&mut rx1);

        let sent = gw.deliver_to_user("nonexistent-user", events::MESSAGE_RECEIVED, &serde_json::json!({}));
        assert_eq!(sent, 0);
        assert!(recv_all(&mut rx1).is_empty());
    }

    #[test]
    fn two_tabs_both_receive_targeted_delivery() {
        let gw = gw();
        let (h1a, mut rx_a) = gw.attach(&Identity::Verified("u1".into()));
        let (_h1b, mut rx_b) = gw.attach(&Identity::Verified("u1".into()));
        recv_all(&mut rx_a);
        recv_all(&mut rx_b);

        let sent = gw.deliver_to_user("u1", events::MESSAGE_RECEIVED, &serde_json::json!({"text": "hi"}));
        assert_eq!(sent, 2);
        assert_eq!(recv_all(&mut rx_a).len(), 1);
        assert_eq!(recv_all(&mut rx_b).len(), 1);

        // Closing one tab keeps the user online.
        gw.detach(&h1a);
        assert_eq!(gw.online_user_ids(), vec!["u1".to_string()]);
        let frames = recv_all(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert_eq!(online_set(&frames[0]), set(&["u1"]));
    }

    #[test]
    fn detach_is_idempotent() {
        let gw = gw();
        let (h1, mut rx1) = gw.attach(&Identity::Verified("u1".into()));
        recv_all(&mut rx1);
        gw.detach(&h1);
        gw.detach(&h1);
        assert!(gw.online_user_ids().is_empty());
    }

    #[test]
    fn stale_connection_is_reaped_on_failed_send() {
        let gw = gw();
        let (_h1, rx1) = gw.attach(&Identity::Verified("u1".into()));
        drop(rx1); // socket task gone without a clean detach

        let (_h2, mut rx2) = gw.attach(&Identity::Verified("u2".into()));

        // The broadcast announcing u2 hits u1's closed channel, which reaps
        // it and re-broadcasts a list without u1.
        assert_eq!(gw.online_user_ids(), vec!["u2".to_string()]);
        let frames = recv_all(&mut rx2);
        assert_eq!(online_set(frames.last().unwrap()), set(&["u2"]));
    }

    #[test]
    fn broadcast_generalizes_to_any_event() {
        let gw = gw();
        let (_h1, mut rx1) = gw.attach(&Identity::Verified("u1".into()));
        let (_anon, mut anon_rx) = gw.attach(&Identity::Anonymous);
        recv_all(&mut rx1);
        recv_all(&mut anon_rx);

        gw.broadcast("system:notice", &serde_json::json!({"text": "maintenance at noon"}));
        for rx in [&mut rx1, &mut anon_rx] {
            let frames = recv_all(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "system:notice");
        }
    }

    #[test]
    fn end_to_end_presence_and_delivery() {
        let gw = gw();
        let (h1, mut rx1) = gw.attach(&Identity::Verified("u1".into()));
        assert_eq!(gw.online_user_ids(), vec!["u1".to_string()]);
        recv_all(&mut rx1);

        let (_h2, mut rx2) = gw.attach(&Identity::Verified("u2".into()));
        let frames1 = recv_all(&mut rx1);
        assert_eq!(online_set(frames1.last().unwrap()), set(&["u1", "u2"]));
        recv_all(&mut rx2);

        gw.detach(&h1);
        let frames2 = recv_all(&mut rx2);
        assert_eq!(frames2.len(), 1);
        assert_eq!(online_set(&frames2[0]), set(&["u2"]));

        let sent = gw.deliver_to_user("u2", events::MESSAGE_RECEIVED, &serde_json::json!({"text": "hi"}));
        assert_eq!(sent, 1);
        let frames2 = recv_all(&mut rx2);
        assert_eq!(frames2[0]["payload"]["text"], "hi");
        // u1 has no connections left; nothing to observe it on.
        assert_eq!(gw.deliver_to_user("u1", events::MESSAGE_RECEIVED, &serde_json::json!({})), 0);
    }
}
