//! Per-row async locks for user accounts and wagers.
//!
//! Placement and settlement both mutate one user row plus one wager row and
//! must not interleave for the same user. The Postgres ledgers additionally
//! take `SELECT ... FOR UPDATE` row locks inside their transactions; these
//! in-process locks give the memory ledgers the same exclusion and keep the
//! critical sections short either way.
//!
//! Lock order is fixed process-wide: wager first, then user. Placement
//! takes only the user lock; settlement takes wager then user.

use std::sync::Arc;

use dashmap::DashMap;
use oddsbook_common::{Role, UserId, WagerId};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard for one locked row. Dropping it releases the row.
pub type RowGuard = OwnedMutexGuard<()>;

/// Shared handle to the row locks.
pub type SharedRowLocks = Arc<RowLocks>;

/// Lazily-created mutex per user row and per wager row.
#[derive(Debug, Default)]
pub struct RowLocks {
    users: DashMap<(Role, UserId), Arc<Mutex<()>>>,
    wagers: DashMap<WagerId, Arc<Mutex<()>>>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> SharedRowLocks {
        Arc::new(Self::new())
    }

    /// Exclusive lock on one user row. User ids are scoped per role.
    pub async fn lock_user(&self, role: Role, user_id: &str) -> RowGuard {
        let lock = {
            let entry = self
                .users
                .entry((role, user_id.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        lock.lock_owned().await
    }

    /// Exclusive lock on one wager row.
    pub async fn lock_wager(&self, wager_id: WagerId) -> RowGuard {
        let lock = {
            let entry = self
                .wagers
                .entry(wager_id)
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_same_user_is_exclusive() {
        let locks = RowLocks::new();
        let guard = locks.lock_user(Role::Player, "u1").await;

        let blocked = timeout(
            Duration::from_millis(50),
            locks.lock_user(Role::Player, "u1"),
        )
        .await;
        assert!(blocked.is_err(), "second lock should block while held");

        drop(guard);
        let acquired = timeout(
            Duration::from_millis(50),
            locks.lock_user(Role::Player, "u1"),
        )
        .await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_roles_do_not_share_locks() {
        let locks = RowLocks::new();
        let _player = locks.lock_user(Role::Player, "u1").await;

        let agent = timeout(Duration::from_millis(50), locks.lock_user(Role::Agent, "u1")).await;
        assert!(agent.is_ok(), "same id under another role is a separate row");
    }

    #[tokio::test]
    async fn test_distinct_wagers_do_not_block() {
        let locks = RowLocks::new();
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();

        let _guard_a = locks.lock_wager(a).await;
        let guard_b = timeout(Duration::from_millis(50), locks.lock_wager(b)).await;
        assert!(guard_b.is_ok());
    }

    #[tokio::test]
    async fn test_serialized_critical_sections() {
        let locks = Arc::new(RowLocks::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let locks = Arc::clone(&locks);
            let seen = Arc::clone(&seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock_user(Role::Player, "u1").await;
                seen.lock().await.push((i, "enter"));
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.lock().await.push((i, "exit"));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Every enter is followed by its own exit before the next enter.
        let seen = seen.lock().await;
        for pair in seen.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "enter");
            assert_eq!(pair[1].1, "exit");
        }
    }
}
