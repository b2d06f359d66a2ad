//! Connection registry: who is connected, and one session per user.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use oddsbook_common::Role;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Unique connection id, assigned at registration.
pub type ConnId = u64;

/// Handle to one registered live session.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub conn_id: ConnId,
    pub user_id: String,
    pub role: Role,
    sender: mpsc::UnboundedSender<Message>,
}

impl ClientSession {
    /// Queues a frame for this session. Returns false when the session's
    /// task is gone.
    pub fn send(&self, message: Message) -> bool {
        self.sender.send(message).is_ok()
    }
}

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<ConnId, ClientSession>,
    by_user: HashMap<(Role, String), ConnId>,
}

/// Live sessions, indexed by connection id and by user.
///
/// User ids are role-scoped; "one session per user" means one per
/// `(role, user_id)` pair.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session. Any existing session for the same user is
    /// removed from the registry and returned so the caller can supersede
    /// it; it no longer receives broadcasts.
    pub async fn register(
        &self,
        user_id: impl Into<String>,
        role: Role,
        sender: mpsc::UnboundedSender<Message>,
    ) -> (ClientSession, Option<ClientSession>) {
        let session = ClientSession {
            conn_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            user_id: user_id.into(),
            role,
            sender,
        };
        let key = (role, session.user_id.clone());

        let mut inner = self.inner.write().await;
        let superseded = match inner.by_user.remove(&key) {
            Some(old_id) => inner.clients.remove(&old_id),
            None => None,
        };
        inner.by_user.insert(key, session.conn_id);
        inner.clients.insert(session.conn_id, session.clone());
        (session, superseded)
    }

    /// Drops a session. The user index is only cleared when it still
    /// points at this connection, so a superseded session's late removal
    /// cannot evict its successor.
    pub async fn remove(&self, conn_id: ConnId) -> Option<ClientSession> {
        let mut inner = self.inner.write().await;
        let session = inner.clients.remove(&conn_id)?;
        let key = (session.role, session.user_id.clone());
        if inner.by_user.get(&key) == Some(&conn_id) {
            inner.by_user.remove(&key);
        }
        Some(session)
    }

    /// The registered session for one user, if any.
    pub async fn session_for(&self, role: Role, user_id: &str) -> Option<ClientSession> {
        let inner = self.inner.read().await;
        let conn_id = inner.by_user.get(&(role, user_id.to_string()))?;
        inner.clients.get(conn_id).cloned()
    }

    /// Snapshot of every live session.
    pub async fn sessions(&self) -> Vec<ClientSession> {
        let inner = self.inner.read().await;
        inner.clients.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sends one frame to every session. Returns (delivered, failed).
    /// Sends queue into per-session channels, so one slow client never
    /// blocks the rest.
    pub async fn broadcast(&self, message: &Message) -> (usize, usize) {
        let inner = self.inner.read().await;
        let mut failed = 0;
        for session in inner.clients.values() {
            if !session.send(message.clone()) {
                failed += 1;
            }
        }
        (inner.clients.len() - failed, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_register_and_remove() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();

        let (session, superseded) = registry.register("u1", Role::Player, tx).await;
        assert!(superseded.is_none());
        assert_eq!(registry.len().await, 1);

        let removed = registry.remove(session.conn_id).await.unwrap();
        assert_eq!(removed.user_id, "u1");
        assert!(registry.is_empty().await);
        assert!(registry.session_for(Role::Player, "u1").await.is_none());
    }

    #[tokio::test]
    async fn test_second_session_supersedes_first() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let (first, _) = registry.register("u1", Role::Player, tx1).await;
        let (second, superseded) = registry.register("u1", Role::Player, tx2).await;

        let superseded = superseded.unwrap();
        assert_eq!(superseded.conn_id, first.conn_id);
        // Exactly one live session for the user remains.
        assert_eq!(registry.len().await, 1);
        assert_eq!(
            registry
                .session_for(Role::Player, "u1")
                .await
                .unwrap()
                .conn_id,
            second.conn_id
        );
    }

    #[tokio::test]
    async fn test_stale_removal_keeps_successor() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let (first, _) = registry.register("u1", Role::Player, tx1).await;
        let (second, _) = registry.register("u1", Role::Player, tx2).await;

        // The superseded task cleans up late; the successor stays indexed.
        assert!(registry.remove(first.conn_id).await.is_none());
        assert_eq!(
            registry
                .session_for(Role::Player, "u1")
                .await
                .unwrap()
                .conn_id,
            second.conn_id
        );
    }

    #[tokio::test]
    async fn test_same_id_different_roles_coexist() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        registry.register("u1", Role::Player, tx1).await;
        let (_, superseded) = registry.register("u1", Role::Agent, tx2).await;
        assert!(superseded.is_none());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_live_sessions() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        let (tx3, rx3) = channel();

        registry.register("u1", Role::Player, tx1).await;
        registry.register("u2", Role::Player, tx2).await;
        registry.register("u3", Role::Player, tx3).await;
        drop(rx3);

        let (delivered, failed) = registry
            .broadcast(&Message::Text("snapshot".to_string()))
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(failed, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
