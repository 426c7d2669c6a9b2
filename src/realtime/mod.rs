//! Cluster-aware overrides of two realtime API operations plus room
//! teardown, injected as pluggable strategies rather than monkey-patched
//! at runtime (spec.md §4.7; Design Notes §9).

use crate::error::ClusterError;
use crate::platform::AuthCollaborator;
use crate::state::StateReplica;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// `realtime.count(request)` (spec.md §4.7).
#[async_trait]
pub trait RealtimeCountStrategy: Send + Sync {
    async fn count(&self, room_id: &str) -> Result<Value, ClusterError>;
}

/// `realtime.list(request)` (spec.md §4.7).
#[async_trait]
pub trait RealtimeListStrategy: Send + Sync {
    async fn list(&self, token: &str, sorted: bool) -> Result<Value, ClusterError>;
}

/// Wraps local room teardown so a room is removed from local realtime
/// structures only once the fleet-wide count drops to at most one
/// (spec.md §4.7).
pub trait RoomTeardownStrategy: Send + Sync {
    fn should_remove_locally(&self, fleet_count: u64) -> bool {
        fleet_count <= 1
    }
}

/// Production `realtime.count`/`realtime.list` override, backed by the
/// node's own state replica (spec.md §4.7).
pub struct ClusterRealtime {
    pub state: Arc<StateReplica>,
    pub auth: Arc<dyn AuthCollaborator>,
    pub wait_for_missing_rooms: Duration,
}

#[async_trait]
impl RealtimeCountStrategy for ClusterRealtime {
    async fn count(&self, room_id: &str) -> Result<Value, ClusterError> {
        if room_id.is_empty() {
            return Err(ClusterError::InvalidInput("missing roomId".to_string()));
        }

        if let Some(room) = self.state.get_room(room_id).await {
            return Ok(json!({ "count": room.count }));
        }

        sleep(self.wait_for_missing_rooms).await;

        match self.state.get_room(room_id).await {
            Some(room) => Ok(json!({ "count": room.count })),
            None => Err(ClusterError::InvalidInput(format!(
                "room {room_id} not found"
            ))),
        }
    }
}

#[async_trait]
impl RealtimeListStrategy for ClusterRealtime {
    async fn list(&self, token: &str, sorted: bool) -> Result<Value, ClusterError> {
        let rooms = self.state.all_rooms().await;
        let mut tree: HashMap<String, HashMap<String, HashMap<String, u64>>> = HashMap::new();

        for room in rooms {
            if !self
                .auth
                .is_allowed(token, "document:search", &room.index, &room.collection)
                .await
            {
                continue;
            }
            tree.entry(room.index.clone())
                .or_default()
                .entry(room.collection.clone())
                .or_default()
                .insert(room.room_id.clone(), room.count);
        }

        if !sorted {
            return Ok(serde_json::to_value(&tree).unwrap_or(Value::Null));
        }

        let sorted_tree: BTreeMap<String, BTreeMap<String, BTreeMap<String, u64>>> = tree
            .into_iter()
            .map(|(index, collections)| {
                let collections = collections
                    .into_iter()
                    .map(|(collection, rooms)| (collection, rooms.into_iter().collect()))
                    .collect();
                (index, collections)
            })
            .collect();

        Ok(serde_json::to_value(&sorted_tree).unwrap_or(Value::Null))
    }
}

impl RoomTeardownStrategy for ClusterRealtime {}

/// A teardown strategy with no overridden behavior, for call sites that
/// need the spec.md §4.7 default (`fleet_count <= 1`) without a full
/// `ClusterRealtime` (its count/list overrides depend on auth and state
/// that a teardown-only caller may not have on hand).
pub struct DefaultRoomTeardown;

impl RoomTeardownStrategy for DefaultRoomTeardown {}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllowAll;

    #[async_trait]
    impl AuthCollaborator for AllowAll {
        async fn is_allowed(&self, _token: &str, _action: &str, _index: &str, _collection: &str) -> bool {
            true
        }
    }

    struct DenyCollection(&'static str);

    #[async_trait]
    impl AuthCollaborator for DenyCollection {
        async fn is_allowed(&self, _token: &str, _action: &str, _index: &str, collection: &str) -> bool {
            collection != self.0
        }
    }

    #[tokio::test]
    async fn count_returns_immediately_when_room_present() {
        let state = Arc::new(StateReplica::new());
        state.set_room_count("idx", "col", "room-1", 4).await;
        let realtime = ClusterRealtime {
            state,
            auth: Arc::new(AllowAll),
            wait_for_missing_rooms: Duration::from_millis(50),
        };

        let result = realtime.count("room-1").await.unwrap();
        assert_eq!(result["count"], 4);
    }

    #[tokio::test]
    async fn count_retries_once_then_fails_if_still_missing() {
        let state = Arc::new(StateReplica::new());
        let realtime = ClusterRealtime {
            state,
            auth: Arc::new(AllowAll),
            wait_for_missing_rooms: Duration::from_millis(10),
        };

        let err = realtime.count("missing-room").await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn count_picks_up_room_that_appears_during_the_wait() {
        let state = Arc::new(StateReplica::new());
        let realtime = ClusterRealtime {
            state: state.clone(),
            auth: Arc::new(AllowAll),
            wait_for_missing_rooms: Duration::from_millis(30),
        };

        let state_for_writer = state.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            state_for_writer
                .set_room_count("idx", "col", "late-room", 1)
                .await;
        });

        let result = realtime.count("late-room").await.unwrap();
        assert_eq!(result["count"], 1);
    }

    #[tokio::test]
    async fn list_shapes_by_index_and_collection_sorted_lexicographically() {
        let state = Arc::new(StateReplica::new());
        state.set_room_count("i2", "c2", "R1", 4).await;
        state.set_room_count("i1", "c1", "R2", 2).await;
        state.set_room_count("i1", "c2", "R3", 3).await;

        let realtime = ClusterRealtime {
            state,
            auth: Arc::new(AllowAll),
            wait_for_missing_rooms: Duration::from_millis(10),
        };

        let result = realtime.list("token", true).await.unwrap();
        let keys: Vec<&str> = result.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["i1", "i2"]);
        assert_eq!(result["i1"]["c1"]["R2"], 2);
        assert_eq!(result["i1"]["c2"]["R3"], 3);
        assert_eq!(result["i2"]["c2"]["R1"], 4);
    }

    #[tokio::test]
    async fn list_excludes_rooms_the_caller_cannot_search() {
        let state = Arc::new(StateReplica::new());
        state.set_room_count("idx", "allowed", "R1", 1).await;
        state.set_room_count("idx", "denied", "R2", 1).await;

        let realtime = ClusterRealtime {
            state,
            auth: Arc::new(DenyCollection("denied")),
            wait_for_missing_rooms: Duration::from_millis(10),
        };

        let result = realtime.list("token", true).await.unwrap();
        assert!(result["idx"].get("denied").is_none());
        assert_eq!(result["idx"]["allowed"]["R1"], 1);
    }

    #[test]
    fn default_teardown_removes_locally_once_fleet_count_drops_to_one_or_zero() {
        let teardown = DefaultRoomTeardown;
        assert!(teardown.should_remove_locally(0));
        assert!(teardown.should_remove_locally(1));
        assert!(!teardown.should_remove_locally(2));
    }
}
