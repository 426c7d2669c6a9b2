//! In-memory fake of [`super::CoordinatorClient`], implementing the same
//! script semantics as the Redis Lua scripts so integration tests can
//! exercise end-to-end scenarios without a real coordinator store.

use super::{CoordinatorClient, PeerBinding, StrategyEntry, SubResult};
use crate::error::CoordinatorError;
use crate::state::{Room, Tag};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Default)]
struct TagState {
    version: u64,
    /// roomId -> total connection count across all nodes.
    counts: HashMap<String, u64>,
    /// roomId -> filter json, if any.
    filters: HashMap<String, String>,
    /// roomId -> nodeUuid -> set of connectionIds.
    members: HashMap<String, HashMap<String, HashSet<String>>>,
}

#[derive(Default)]
struct Inner {
    tags: HashMap<Tag, TagState>,
    discovery: HashSet<String>,
    strategies: HashMap<String, StrategyEntry>,
    collections: HashSet<Tag>,
}

/// An in-process stand-in for a Redis-backed coordinator store.
pub struct InMemoryCoordinator {
    inner: Mutex<Inner>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinatorClient for InMemoryCoordinator {
    async fn sub_on(
        &self,
        tag: &Tag,
        node_uuid: &str,
        room_id: &str,
        connection_id: &str,
        filter: Option<&str>,
    ) -> Result<SubResult, CoordinatorError> {
        let mut inner = self.inner.lock().await;
        let state = inner.tags.entry(tag.clone()).or_default();
        state.version += 1;

        state
            .members
            .entry(room_id.to_string())
            .or_default()
            .entry(node_uuid.to_string())
            .or_default()
            .insert(connection_id.to_string());

        if let Some(f) = filter {
            if f != "none" {
                state.filters.insert(room_id.to_string(), f.to_string());
            }
        }

        let total = state.counts.entry(room_id.to_string()).or_insert(0);
        *total += 1;

        Ok(SubResult {
            version: state.version,
            total_count: *total,
        })
    }

    async fn sub_off(
        &self,
        tag: &Tag,
        node_uuid: &str,
        room_id: &str,
        connection_id: &str,
    ) -> Result<SubResult, CoordinatorError> {
        let mut inner = self.inner.lock().await;
        let state = inner.tags.entry(tag.clone()).or_default();
        state.version += 1;

        if let Some(room_members) = state.members.get_mut(room_id) {
            if let Some(conns) = room_members.get_mut(node_uuid) {
                conns.remove(connection_id);
                if conns.is_empty() {
                    room_members.remove(node_uuid);
                }
            }
        }

        let total = {
            let entry = state.counts.entry(room_id.to_string()).or_insert(0);
            *entry = entry.saturating_sub(1);
            *entry
        };

        if total == 0 {
            state.counts.remove(room_id);
            state.members.remove(room_id);
            state.filters.remove(room_id);
        }

        Ok(SubResult {
            version: state.version,
            total_count: total,
        })
    }

    async fn clean_node(&self, tag: &Tag, node_uuid: &str) -> Result<u64, CoordinatorError> {
        let mut inner = self.inner.lock().await;
        let state = inner.tags.entry(tag.clone()).or_default();
        state.version += 1;

        let room_ids: Vec<String> = state.counts.keys().cloned().collect();
        for room_id in room_ids {
            let owned = state
                .members
                .get(&room_id)
                .and_then(|m| m.get(node_uuid))
                .map(|conns| conns.len() as u64)
                .unwrap_or(0);

            if owned == 0 {
                continue;
            }

            if let Some(room_members) = state.members.get_mut(&room_id) {
                room_members.remove(node_uuid);
            }

            let total = {
                let entry = state.counts.entry(room_id.clone()).or_insert(0);
                *entry = entry.saturating_sub(owned);
                *entry
            };

            if total == 0 {
                state.counts.remove(&room_id);
                state.members.remove(&room_id);
                state.filters.remove(&room_id);
            }
        }

        Ok(state.version)
    }

    async fn get_state(&self, tag: &Tag) -> Result<(u64, Vec<Room>), CoordinatorError> {
        let inner = self.inner.lock().await;
        let Some(state) = inner.tags.get(tag) else {
            return Ok((0, Vec::new()));
        };

        let (index, collection) = tag.split();
        let rooms = state
            .counts
            .iter()
            .map(|(room_id, count)| Room {
                room_id: room_id.clone(),
                index: index.clone(),
                collection: collection.clone(),
                count: *count,
            })
            .collect();

        Ok((state.version, rooms))
    }

    async fn discovery_add(&self, peer: &PeerBinding) -> Result<(), CoordinatorError> {
        let encoded = serde_json::to_string(peer)
            .map_err(|e| CoordinatorError::MalformedReply(e.to_string()))?;
        self.inner.lock().await.discovery.insert(encoded);
        Ok(())
    }

    async fn discovery_remove(&self, peer: &PeerBinding) -> Result<(), CoordinatorError> {
        let encoded = serde_json::to_string(peer)
            .map_err(|e| CoordinatorError::MalformedReply(e.to_string()))?;
        self.inner.lock().await.discovery.remove(&encoded);
        Ok(())
    }

    async fn discovery_members(&self) -> Result<Vec<PeerBinding>, CoordinatorError> {
        let inner = self.inner.lock().await;
        inner
            .discovery
            .iter()
            .map(|s| {
                serde_json::from_str(s).map_err(|e| CoordinatorError::MalformedReply(e.to_string()))
            })
            .collect()
    }

    async fn strategies_set(
        &self,
        name: &str,
        entry: &StrategyEntry,
    ) -> Result<(), CoordinatorError> {
        self.inner
            .lock()
            .await
            .strategies
            .insert(name.to_string(), entry.clone());
        Ok(())
    }

    async fn strategies_remove(&self, name: &str) -> Result<(), CoordinatorError> {
        self.inner.lock().await.strategies.remove(name);
        Ok(())
    }

    async fn strategies_all(&self) -> Result<HashMap<String, StrategyEntry>, CoordinatorError> {
        Ok(self.inner.lock().await.strategies.clone())
    }

    async fn collections_add(&self, tag: &Tag) -> Result<(), CoordinatorError> {
        self.inner.lock().await.collections.insert(tag.clone());
        Ok(())
    }

    async fn collections_all(&self) -> Result<Vec<Tag>, CoordinatorError> {
        Ok(self.inner.lock().await.collections.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sub_on_then_sub_off_restores_count_and_bumps_version_by_two() {
        let coordinator = InMemoryCoordinator::new();
        let tag = Tag::new("idx", "col");

        let before = coordinator.get_state(&tag).await.unwrap();

        let on = coordinator
            .sub_on(&tag, "node-a", "room-1", "conn-1", Some("filter"))
            .await
            .unwrap();
        let off = coordinator
            .sub_off(&tag, "node-a", "room-1", "conn-1")
            .await
            .unwrap();

        assert_eq!(off.version, before.0 + 2);
        assert_eq!(on.total_count, 1);
        assert_eq!(off.total_count, 0);
    }

    #[tokio::test]
    async fn two_consecutive_clean_node_calls_are_idempotent() {
        let coordinator = InMemoryCoordinator::new();
        let tag = Tag::new("idx", "col");

        coordinator
            .sub_on(&tag, "node-a", "room-1", "conn-1", None)
            .await
            .unwrap();

        coordinator.clean_node(&tag, "node-a").await.unwrap();
        let (_, rooms_after_first) = coordinator.get_state(&tag).await.unwrap();

        coordinator.clean_node(&tag, "node-a").await.unwrap();
        let (_, rooms_after_second) = coordinator.get_state(&tag).await.unwrap();

        assert_eq!(rooms_after_first, rooms_after_second);
        assert!(rooms_after_first.is_empty());
    }

    #[tokio::test]
    async fn clean_node_only_removes_owned_memberships() {
        let coordinator = InMemoryCoordinator::new();
        let tag = Tag::new("idx", "col");

        coordinator
            .sub_on(&tag, "node-a", "room-1", "conn-1", None)
            .await
            .unwrap();
        coordinator
            .sub_on(&tag, "node-b", "room-1", "conn-2", None)
            .await
            .unwrap();

        coordinator.clean_node(&tag, "node-a").await.unwrap();

        let (_, rooms) = coordinator.get_state(&tag).await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].count, 1);
    }
}
