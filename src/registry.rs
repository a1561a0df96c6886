//! Connection registry — every live WebSocket connection, keyed by
//! connection id, with a secondary index from user id to that user's
//! connection ids (multi-tab support).
//!
//! DESIGN
//! ======
//! Both maps are owned by a single actor task and mutated only by the
//! commands it drains from its intake queue, so register/unregister can never
//! interleave and no lock is taken on the maps at all. Lookups go through the
//! same queue and reply over oneshot channels, which also means a lookup can
//! never observe a half-applied registration.

use std::collections::HashMap;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

/// Per-connection outbound queue. Bounded; senders use `try_send` and drop
/// on overflow rather than block.
pub type OutboundSender = mpsc::Sender<Utf8Bytes>;

/// One live connection. Multiple connections may share a `user_id`.
#[derive(Debug, Clone)]
pub struct Connection {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub tx: OutboundSender,
}

enum Command {
    Register(Box<Connection>),
    Unregister { conn_id: Uuid },
    UserConnections { user_id: Uuid, reply: oneshot::Sender<Vec<Uuid>> },
    Count { reply: oneshot::Sender<usize> },
}

/// Cheap-clone handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    pub async fn register(&self, conn: Connection) {
        let _ = self.tx.send(Command::Register(Box::new(conn))).await;
    }

    /// Remove the connection from both maps and drop the registry's clone of
    /// its outbound sender. Once room membership is gone too, the queue
    /// closes and the write loop ends.
    pub async fn unregister(&self, conn_id: Uuid) {
        let _ = self.tx.send(Command::Unregister { conn_id }).await;
    }

    /// All connection ids currently registered for a user.
    pub async fn user_connections(&self, user_id: Uuid) -> Vec<Uuid> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::UserConnections { user_id, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn connection_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Count { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Start the registry actor. The returned handle is the only way in.
#[must_use]
pub fn spawn_registry() -> RegistryHandle {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(run(rx));
    RegistryHandle { tx }
}

async fn run(mut rx: mpsc::Receiver<Command>) {
    let mut connections: HashMap<Uuid, Connection> = HashMap::new();
    let mut by_user: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Register(conn) => {
                by_user.entry(conn.user_id).or_default().push(conn.conn_id);
                info!(conn_id = %conn.conn_id, user_id = %conn.user_id, "registry: connection registered");
                connections.insert(conn.conn_id, *conn);
            }
            Command::Unregister { conn_id } => {
                let Some(conn) = connections.remove(&conn_id) else {
                    continue;
                };
                if let Some(ids) = by_user.get_mut(&conn.user_id) {
                    ids.retain(|id| *id != conn_id);
                    if ids.is_empty() {
                        by_user.remove(&conn.user_id);
                    }
                }
                info!(%conn_id, user_id = %conn.user_id, "registry: connection unregistered");
            }
            Command::UserConnections { user_id, reply } => {
                let ids = by_user.get(&user_id).cloned().unwrap_or_default();
                let _ = reply.send(ids);
            }
            Command::Count { reply } => {
                let _ = reply.send(connections.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_conn(user_id: Uuid) -> (Connection, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = Connection {
            conn_id: Uuid::new_v4(),
            user_id,
            display_name: "Ada".into(),
            tx,
        };
        (conn, rx)
    }

    #[tokio::test]
    async fn register_tracks_multiple_tabs_per_user() {
        let registry = spawn_registry();
        let user = Uuid::new_v4();
        let (a, _rx_a) = test_conn(user);
        let (b, _rx_b) = test_conn(user);
        let a_id = a.conn_id;

        registry.register(a).await;
        registry.register(b).await;
        assert_eq!(registry.user_connections(user).await.len(), 2);
        assert_eq!(registry.connection_count().await, 2);

        registry.unregister(a_id).await;
        let remaining = registry.user_connections(user).await;
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0], a_id);
    }

    #[tokio::test]
    async fn last_unregister_removes_user_entry_and_closes_queue() {
        let registry = spawn_registry();
        let user = Uuid::new_v4();
        let (conn, mut rx) = test_conn(user);
        let conn_id = conn.conn_id;

        registry.register(conn).await;
        registry.unregister(conn_id).await;

        assert!(registry.user_connections(user).await.is_empty());
        assert_eq!(registry.connection_count().await, 0);
        // The registry held the last sender clone; the queue is now closed.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unregister_of_unknown_connection_is_a_no_op() {
        let registry = spawn_registry();
        registry.unregister(Uuid::new_v4()).await;
        assert_eq!(registry.connection_count().await, 0);
    }
}
