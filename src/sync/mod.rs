//! Sync engine: consumes `cluster:sync` messages, reconciles local
//! caches, and pulls authoritative room state via `getState` when
//! versions diverge (spec.md §4.5).

pub mod event;

pub use event::SyncEvent;

use crate::coordinator::CoordinatorClient;
use crate::platform::{IndexCacheCollaborator, ProfileRepository, RoleRepository, StrategyRegistry, ValidatorCache};
use crate::state::{PendingLocks, StateReplica, Tag};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Optional platform-side collaborators the sync engine forwards cache
/// invalidations to. Each is `None` until the host attaches one; a
/// missing collaborator just means that event class is dropped (the
/// coordinator remains authoritative, and the next `state:all` or
/// direct platform call repairs it).
#[derive(Default)]
pub struct Collaborators {
    pub index_cache: Option<Arc<dyn IndexCacheCollaborator>>,
    pub roles: Option<Arc<dyn RoleRepository>>,
    pub profiles: Option<Arc<dyn ProfileRepository>>,
    pub validators: Option<Arc<dyn ValidatorCache>>,
    pub strategies: Option<Arc<dyn StrategyRegistry>>,
}

pub struct SyncEngine {
    state: Arc<StateReplica>,
    coordinator: Arc<dyn CoordinatorClient>,
    locks: Arc<PendingLocks>,
    collaborators: Collaborators,
}

impl SyncEngine {
    pub fn new(
        state: Arc<StateReplica>,
        coordinator: Arc<dyn CoordinatorClient>,
        locks: Arc<PendingLocks>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            state,
            coordinator,
            locks,
            collaborators,
        }
    }

    pub async fn handle(&self, event: SyncEvent) {
        match event {
            SyncEvent::State {
                index, collection, ..
            } => self.apply_state(&index, &collection).await,
            SyncEvent::StateAll { .. } => self.apply_state_all().await,
            SyncEvent::IndexCacheAdd { index, collection } => {
                if let Some(cache) = &self.collaborators.index_cache {
                    cache.add(&index, &collection, false);
                }
            }
            SyncEvent::IndexCacheRemove { index, collection } => {
                if let Some(cache) = &self.collaborators.index_cache {
                    cache.remove(&index, &collection, false);
                }
            }
            SyncEvent::Profile { id } => {
                if let Some(profiles) = &self.collaborators.profiles {
                    profiles.invalidate(&id);
                }
            }
            SyncEvent::Role { id } => {
                if let Some(roles) = &self.collaborators.roles {
                    roles.invalidate(&id);
                }
            }
            SyncEvent::Validators => {
                if let Some(validators) = &self.collaborators.validators {
                    validators.reload();
                }
            }
            SyncEvent::Strategies => self.reconcile_strategies().await,
            SyncEvent::Unknown => {
                debug!("ignoring unknown cluster:sync event");
            }
        }
    }

    /// Pull `getState` for one tag and replace the local snapshot if the
    /// coordinator's version is strictly newer, skipping rooms with an
    /// in-flight local decision (spec.md §4.5, `state`).
    async fn apply_state(&self, index: &str, collection: &str) {
        let tag = Tag::new(index, collection);
        let guard = self.state.lock_tag(&tag).await;

        let (version, rooms) = match self.coordinator.get_state(&tag).await {
            Ok(result) => result,
            Err(e) => {
                warn!(%tag, "sync getState failed: {e}");
                drop(guard);
                return;
            }
        };

        if version <= self.state.get_version(&tag).await {
            drop(guard);
            return;
        }

        let remote_ids: HashSet<&str> = rooms.iter().map(|r| r.room_id.as_str()).collect();
        for room_id in self.state.rooms_in(index, collection).await {
            if remote_ids.contains(room_id.as_str()) {
                continue;
            }
            if self.locks.is_locked(&room_id).await {
                continue;
            }
            self.state.delete_room_count(&room_id).await;
        }

        for room in &rooms {
            if self.locks.is_locked(&room.room_id).await {
                continue;
            }
            self.state
                .set_room_count(index, collection, &room.room_id, room.count)
                .await;
        }

        self.state.set_version(&tag, version).await;
        drop(guard);
    }

    async fn apply_state_all(&self) {
        let tags = match self.coordinator.collections_all().await {
            Ok(tags) => tags,
            Err(e) => {
                warn!("sync state:all failed to enumerate collections: {e}");
                return;
            }
        };
        for tag in tags {
            let (index, collection) = tag.split();
            self.apply_state(&index, &collection).await;
        }
    }

    /// Diff the coordinator's strategy hash against the locally
    /// registered strategies, registering additions and unregistering
    /// removals (spec.md §4.5, `strategies`).
    async fn reconcile_strategies(&self) {
        let Some(registry) = &self.collaborators.strategies else {
            return;
        };

        let remote = match self.coordinator.strategies_all().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("sync strategies failed: {e}");
                return;
            }
        };

        let local: HashSet<String> = registry.list().into_iter().collect();
        let remote_names: HashSet<&String> = remote.keys().collect();

        for (name, entry) in &remote {
            if !local.contains(name) {
                registry.register(name, &entry.plugin, &entry.strategy);
            }
        }
        for name in &local {
            if !remote_names.contains(name) {
                registry.unregister(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::fake::InMemoryCoordinator;
    use crate::platform::InMemoryStrategyRegistry;

    fn engine(
        state: Arc<StateReplica>,
        coordinator: Arc<dyn CoordinatorClient>,
        locks: Arc<PendingLocks>,
        strategies: Option<Arc<dyn StrategyRegistry>>,
    ) -> SyncEngine {
        SyncEngine::new(
            state,
            coordinator,
            locks,
            Collaborators {
                strategies,
                ..Collaborators::default()
            },
        )
    }

    #[tokio::test]
    async fn state_event_pulls_newer_version_and_replaces_snapshot() {
        let coordinator: Arc<dyn CoordinatorClient> = Arc::new(InMemoryCoordinator::new());
        let tag = Tag::new("idx", "col");
        coordinator
            .sub_on(&tag, "node-a", "room-1", "conn-1", None)
            .await
            .unwrap();

        let state = Arc::new(StateReplica::new());
        let locks = Arc::new(PendingLocks::new());
        let sync = engine(state.clone(), coordinator, locks, None);

        sync.handle(SyncEvent::State {
            index: "idx".to_string(),
            collection: "col".to_string(),
            post: Some("add".to_string()),
        })
        .await;

        let room = state.get_room("room-1").await.unwrap();
        assert_eq!(room.count, 1);
        assert_eq!(state.get_version(&tag).await, 1);
    }

    #[tokio::test]
    async fn state_event_is_noop_when_version_not_newer() {
        let coordinator: Arc<dyn CoordinatorClient> = Arc::new(InMemoryCoordinator::new());
        let tag = Tag::new("idx", "col");
        coordinator
            .sub_on(&tag, "node-a", "room-1", "conn-1", None)
            .await
            .unwrap();

        let state = Arc::new(StateReplica::new());
        state.set_version(&tag, 99).await;
        let locks = Arc::new(PendingLocks::new());
        let sync = engine(state.clone(), coordinator, locks, None);

        sync.handle(SyncEvent::State {
            index: "idx".to_string(),
            collection: "col".to_string(),
            post: None,
        })
        .await;

        assert!(state.get_room("room-1").await.is_none());
        assert_eq!(state.get_version(&tag).await, 99);
    }

    #[tokio::test]
    async fn state_event_skips_locked_rooms() {
        let coordinator: Arc<dyn CoordinatorClient> = Arc::new(InMemoryCoordinator::new());
        let tag = Tag::new("idx", "col");
        coordinator
            .sub_on(&tag, "node-a", "room-locked", "conn-1", None)
            .await
            .unwrap();

        let state = Arc::new(StateReplica::new());
        let locks = Arc::new(PendingLocks::new());
        locks.lock_create("room-locked").await;
        let sync = engine(state.clone(), coordinator, locks, None);

        sync.handle(SyncEvent::State {
            index: "idx".to_string(),
            collection: "col".to_string(),
            post: None,
        })
        .await;

        assert!(state.get_room("room-locked").await.is_none());
    }

    #[tokio::test]
    async fn strategies_event_registers_additions_and_removes_stale() {
        let coordinator: Arc<dyn CoordinatorClient> = Arc::new(InMemoryCoordinator::new());
        coordinator
            .strategies_set(
                "local",
                &crate::coordinator::StrategyEntry {
                    plugin: "auth-plugin".to_string(),
                    strategy: "local".to_string(),
                },
            )
            .await
            .unwrap();

        let registry = Arc::new(InMemoryStrategyRegistry::new());
        registry.register("stale", "old-plugin", "stale");

        let state = Arc::new(StateReplica::new());
        let locks = Arc::new(PendingLocks::new());
        let sync = engine(state, coordinator, locks, Some(registry.clone() as Arc<dyn StrategyRegistry>));

        sync.handle(SyncEvent::Strategies).await;

        let names: HashSet<String> = registry.list().into_iter().collect();
        assert!(names.contains("local"));
        assert!(!names.contains("stale"));
    }
}
