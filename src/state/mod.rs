//! In-memory replica of the fleet's realtime subscription-room state.
//!
//! Mirrors `flat` (`roomId -> {index, collection, count}`) and `tree`
//! (`index -> collection -> set<roomId>`) as described in spec.md §3/§4.4,
//! plus the per-tag version counters that guard against applying stale
//! sync updates out of order.

mod locks;

pub use locks::PendingLocks;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A co-location key of the form `{index/collection}`. Every coordinator
/// key derived from a `Tag` is hash-tagged so a single atomic script can
/// touch all of them (spec.md §3, glossary "Tag").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(pub(crate) String);

impl Tag {
    pub fn new(index: &str, collection: &str) -> Self {
        Tag(format!("{{{}/{}}}", index, collection))
    }

    /// The `(index, collection)` pair this tag was built from.
    pub fn split(&self) -> (String, String) {
        let inner = self.0.trim_start_matches('{').trim_end_matches('}');
        match inner.split_once('/') {
            Some((index, collection)) => (index.to_string(), collection.to_string()),
            None => (inner.to_string(), String::new()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type RoomId = String;

/// A realtime subscription room: `{roomId, index, collection, count}`
/// (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: RoomId,
    pub index: String,
    pub collection: String,
    pub count: u64,
}

/// The node's local replica: `flat` + `tree` + per-tag versions, guarded
/// by per-tag serialization so a version-checked update never races a
/// `state:all` refresh (spec.md §4.4, §5).
pub struct StateReplica {
    flat: RwLock<HashMap<RoomId, Room>>,
    tree: RwLock<HashMap<String, HashMap<String, HashSet<RoomId>>>>,
    versions: RwLock<HashMap<Tag, u64>>,
    tag_locks: Mutex<HashMap<Tag, Arc<Mutex<()>>>>,
}

impl StateReplica {
    pub fn new() -> Self {
        Self {
            flat: RwLock::new(HashMap::new()),
            tree: RwLock::new(HashMap::new()),
            versions: RwLock::new(HashMap::new()),
            tag_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the serialization lock for one `(index, collection)` tag.
    /// Every mutation that must be ordered with respect to a version
    /// check goes through this guard.
    pub async fn lock_tag(&self, tag: &Tag) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.tag_locks.lock().await;
            locks
                .entry(tag.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Upsert or delete a room's count. `count == 0` deletes the room and
    /// prunes any now-empty parent sets (spec.md §4.4, invariant 1 & 2).
    pub async fn set_room_count(&self, index: &str, collection: &str, room_id: &str, count: u64) {
        if count == 0 {
            self.delete_room_count(room_id).await;
            return;
        }

        let mut flat = self.flat.write().await;
        flat.insert(
            room_id.to_string(),
            Room {
                room_id: room_id.to_string(),
                index: index.to_string(),
                collection: collection.to_string(),
                count,
            },
        );
        drop(flat);

        let mut tree = self.tree.write().await;
        tree.entry(index.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .insert(room_id.to_string());
    }

    /// Remove a room from both `flat` and `tree`, pruning empty inner
    /// maps/sets (spec.md §4.4, invariant 1).
    pub async fn delete_room_count(&self, room_id: &str) {
        let removed = {
            let mut flat = self.flat.write().await;
            flat.remove(room_id)
        };

        let Some(room) = removed else { return };

        let mut tree = self.tree.write().await;
        if let Some(collections) = tree.get_mut(&room.index) {
            if let Some(rooms) = collections.get_mut(&room.collection) {
                rooms.remove(room_id);
                if rooms.is_empty() {
                    collections.remove(&room.collection);
                }
            }
            if collections.is_empty() {
                tree.remove(&room.index);
            }
        }
    }

    pub async fn get_room(&self, room_id: &str) -> Option<Room> {
        self.flat.read().await.get(room_id).cloned()
    }

    pub async fn rooms_in(&self, index: &str, collection: &str) -> Vec<RoomId> {
        self.tree
            .read()
            .await
            .get(index)
            .and_then(|c| c.get(collection))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn all_rooms(&self) -> Vec<Room> {
        self.flat.read().await.values().cloned().collect()
    }

    /// Replace every room under one tag with a fresh snapshot (used by
    /// the sync engine's `state` handler, spec.md §4.5).
    pub async fn replace_tag_snapshot(&self, index: &str, collection: &str, rooms: &[Room]) {
        let stale: Vec<RoomId> = self.rooms_in(index, collection).await;
        for room_id in stale {
            if !rooms.iter().any(|r| r.room_id == room_id) {
                self.delete_room_count(&room_id).await;
            }
        }
        for room in rooms {
            self.set_room_count(index, collection, &room.room_id, room.count)
                .await;
        }
    }

    pub async fn get_version(&self, tag: &Tag) -> u64 {
        *self.versions.read().await.get(tag).unwrap_or(&0)
    }

    /// Monotonic set: ignores values that are not strictly newer
    /// (spec.md §3, state version invariant).
    pub async fn set_version(&self, tag: &Tag, version: u64) -> bool {
        let mut versions = self.versions.write().await;
        let current = versions.entry(tag.clone()).or_insert(0);
        if version > *current {
            *current = version;
            true
        } else {
            false
        }
    }

    /// Wipe the replica entirely (used by the shutdown supervisor's
    /// last-node-out path and by `reset()`, spec.md §4.4, §4.8).
    pub async fn clear(&self) {
        self.flat.write().await.clear();
        self.tree.write().await.clear();
        self.versions.write().await.clear();
    }
}

impl Default for StateReplica {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_room_count() {
        let replica = StateReplica::new();
        replica.set_room_count("idx", "col", "room-1", 3).await;

        let room = replica.get_room("room-1").await.unwrap();
        assert_eq!(room.count, 3);
        assert_eq!(replica.rooms_in("idx", "col").await, vec!["room-1"]);
    }

    #[tokio::test]
    async fn zero_count_deletes_room_and_prunes_tree() {
        let replica = StateReplica::new();
        replica.set_room_count("idx", "col", "room-1", 1).await;
        replica.set_room_count("idx", "col", "room-1", 0).await;

        assert!(replica.get_room("room-1").await.is_none());
        assert!(replica.rooms_in("idx", "col").await.is_empty());
    }

    #[tokio::test]
    async fn delete_prunes_empty_collection_and_index() {
        let replica = StateReplica::new();
        replica.set_room_count("idx", "col", "room-1", 2).await;
        replica.delete_room_count("room-1").await;

        assert!(replica.rooms_in("idx", "col").await.is_empty());
    }

    #[tokio::test]
    async fn version_is_monotonic() {
        let replica = StateReplica::new();
        let tag = Tag::new("idx", "col");

        assert!(replica.set_version(&tag, 5).await);
        assert_eq!(replica.get_version(&tag).await, 5);

        assert!(!replica.set_version(&tag, 3).await);
        assert_eq!(replica.get_version(&tag).await, 5);

        assert!(replica.set_version(&tag, 6).await);
        assert_eq!(replica.get_version(&tag).await, 6);
    }

    #[tokio::test]
    async fn replace_tag_snapshot_drops_stale_rooms() {
        let replica = StateReplica::new();
        replica.set_room_count("idx", "col", "room-1", 1).await;
        replica.set_room_count("idx", "col", "room-2", 2).await;

        replica
            .replace_tag_snapshot(
                "idx",
                "col",
                &[Room {
                    room_id: "room-2".to_string(),
                    index: "idx".to_string(),
                    collection: "col".to_string(),
                    count: 5,
                }],
            )
            .await;

        assert!(replica.get_room("room-1").await.is_none());
        assert_eq!(replica.get_room("room-2").await.unwrap().count, 5);
    }

    #[test]
    fn tag_round_trips_index_and_collection() {
        let tag = Tag::new("idx", "col");
        assert_eq!(tag.as_str(), "{idx/col}");
        assert_eq!(tag.split(), ("idx".to_string(), "col".to_string()));
    }
}
