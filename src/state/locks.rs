//! Pending-op locks: suppress sync-driven mutations to rooms whose local
//! subscribe/unsubscribe decision has not committed yet (spec.md §3, §4.6).

use std::collections::HashSet;
use tokio::sync::RwLock;

/// The two local sets `locks.create` and `locks.delete`.
pub struct PendingLocks {
    create: RwLock<HashSet<String>>,
    delete: RwLock<HashSet<String>>,
}

impl PendingLocks {
    pub fn new() -> Self {
        Self {
            create: RwLock::new(HashSet::new()),
            delete: RwLock::new(HashSet::new()),
        }
    }

    pub async fn lock_create(&self, room_id: &str) {
        self.create.write().await.insert(room_id.to_string());
    }

    pub async fn release_create(&self, room_id: &str) {
        self.create.write().await.remove(room_id);
    }

    pub async fn lock_delete(&self, room_id: &str) {
        self.delete.write().await.insert(room_id.to_string());
    }

    pub async fn release_delete(&self, room_id: &str) {
        self.delete.write().await.remove(room_id);
    }

    pub async fn is_locked(&self, room_id: &str) -> bool {
        self.create.read().await.contains(room_id) || self.delete.read().await.contains(room_id)
    }
}

impl Default for PendingLocks {
    fn default() -> Self {
        Self::new()
    }
}
