//! Interceptable event handlers (spec.md §4.6, "Pipes"). Each wraps a
//! coordinator round-trip, a replica update, and a fabric broadcast,
//! returning the original (possibly unchanged) payload to its
//! continuation — matching spec.md §9's "do work, then broadcast, then
//! always release a lock, then return the original diff".

use super::{required_str, HookContext, LockGuard, LockKind};
use crate::error::ClusterError;
use crate::platform::Pipe;
use crate::state::Tag;
use crate::transport::topics;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Materializes a local room shell if the room lives in the replica but
/// not yet in the local realtime engine, absorbing replication delay
/// without blocking indefinitely (spec.md §4.6, `beforeJoin`).
///
/// Retries exactly once then proceeds without materialization even on a
/// second miss; spec.md §9's Open Questions notes this may be a latent
/// bug in the source but directs implementations to reproduce it as-is.
pub struct BeforeJoinPipe {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Pipe for BeforeJoinPipe {
    async fn call(&self, payload: Value) -> Result<Value, ClusterError> {
        let room_id = required_str(&payload, "roomId")?;

        if self.ctx.realtime.has_room(&room_id) {
            return Ok(payload);
        }

        if let Some(room) = self.ctx.node.state.get_room(&room_id).await {
            self.ctx
                .realtime
                .materialize_room_shell(&room_id, &room.index, &room.collection);
            return Ok(payload);
        }

        sleep(self.ctx.config.timers.join_attempt_interval()).await;

        if let Some(room) = self.ctx.node.state.get_room(&room_id).await {
            self.ctx
                .realtime
                .materialize_room_shell(&room_id, &room.index, &room.collection);
        }

        Ok(payload)
    }
}

async fn apply_sub_on(
    ctx: &HookContext,
    index: &str,
    collection: &str,
    room_id: &str,
    connection_id: &str,
    filter: Option<&str>,
    post: &str,
) -> Result<(), ClusterError> {
    let tag = Tag::new(index, collection);
    let guard = ctx.node.state.lock_tag(&tag).await;

    let result = ctx
        .node
        .coordinator
        .sub_on(
            &tag,
            &ctx.node.id.to_string(),
            room_id,
            connection_id,
            filter,
        )
        .await
        .map_err(|source| ClusterError::TransientCoordinator {
            tag: tag.clone(),
            source,
        })?;

    ctx.node
        .state
        .set_room_count(index, collection, room_id, result.total_count)
        .await;
    ctx.node.state.set_version(&tag, result.version).await;
    drop(guard);

    if let Err(e) = ctx.node.coordinator.collections_add(&tag).await {
        tracing::warn!(%tag, "failed to register collection tag: {e}");
    }

    if ctx.node.is_ready() {
        let _ = ctx
            .node
            .transport
            .broadcast(
                topics::SYNC,
                json!({ "event": "state", "index": index, "collection": collection, "post": post }),
            )
            .await;
    } else {
        tracing::warn!("node not ready, dropping state broadcast for {room_id}");
    }

    Ok(())
}

/// A new local subscription: runs `subOn`, updates the replica, tags
/// the collection, broadcasts, and releases `locks.create` (spec.md
/// §4.6).
pub struct SubscriptionAddedPipe {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Pipe for SubscriptionAddedPipe {
    async fn call(&self, payload: Value) -> Result<Value, ClusterError> {
        let room_id = required_str(&payload, "roomId")?;
        let index = required_str(&payload, "index")?;
        let collection = required_str(&payload, "collection")?;
        let connection_id = required_str(&payload, "connectionId")?;
        let filter = payload.get("filter").and_then(Value::as_str);

        let guard = LockGuard::new(self.ctx.node.locks.clone(), room_id.clone(), LockKind::Create);
        let result = apply_sub_on(
            &self.ctx,
            &index,
            &collection,
            &room_id,
            &connection_id,
            filter,
            "add",
        )
        .await;
        guard.release().await;
        result?;

        Ok(payload)
    }
}

/// A local join to an existing subscription. No-op if the engine
/// reports the subscription's filter set was unchanged; otherwise
/// identical to [`SubscriptionAddedPipe`] with `filter = none` and
/// `post = join` (spec.md §4.6).
pub struct SubscriptionJoinedPipe {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Pipe for SubscriptionJoinedPipe {
    async fn call(&self, payload: Value) -> Result<Value, ClusterError> {
        let changed = payload
            .get("changed")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !changed {
            return Ok(payload);
        }

        let room_id = required_str(&payload, "roomId")?;
        let index = required_str(&payload, "index")?;
        let collection = required_str(&payload, "collection")?;
        let connection_id = required_str(&payload, "connectionId")?;

        let guard = LockGuard::new(self.ctx.node.locks.clone(), room_id.clone(), LockKind::Create);
        let result = apply_sub_on(
            &self.ctx,
            &index,
            &collection,
            &room_id,
            &connection_id,
            None,
            "join",
        )
        .await;
        guard.release().await;
        result?;

        Ok(payload)
    }
}

/// A local unsubscribe: runs `subOff`, applies the count if the
/// returned version is newer, broadcasts, releases `locks.delete`
/// (spec.md §4.6).
pub struct SubscriptionOffPipe {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Pipe for SubscriptionOffPipe {
    async fn call(&self, payload: Value) -> Result<Value, ClusterError> {
        let room_id = required_str(&payload, "roomId")?;
        let index = required_str(&payload, "index")?;
        let collection = required_str(&payload, "collection")?;
        let connection_id = required_str(&payload, "connectionId")?;

        let guard = LockGuard::new(self.ctx.node.locks.clone(), room_id.clone(), LockKind::Delete);
        let result = self.apply(&index, &collection, &room_id, &connection_id).await;
        guard.release().await;
        result?;

        Ok(payload)
    }
}

impl SubscriptionOffPipe {
    async fn apply(
        &self,
        index: &str,
        collection: &str,
        room_id: &str,
        connection_id: &str,
    ) -> Result<(), ClusterError> {
        let tag = Tag::new(index, collection);
        let guard = self.ctx.node.state.lock_tag(&tag).await;

        let result = self
            .ctx
            .node
            .coordinator
            .sub_off(&tag, &self.ctx.node.id.to_string(), room_id, connection_id)
            .await
            .map_err(|source| ClusterError::TransientCoordinator {
                tag: tag.clone(),
                source,
            })?;

        if result.version > self.ctx.node.state.get_version(&tag).await {
            self.ctx
                .node
                .state
                .set_room_count(index, collection, room_id, result.total_count)
                .await;
            self.ctx.node.state.set_version(&tag, result.version).await;
        }
        drop(guard);

        if self.ctx.teardown.should_remove_locally(result.total_count) {
            self.ctx.realtime.remove_room(room_id);
        }

        if self.ctx.node.is_ready() {
            let _ = self
                .ctx
                .node
                .transport
                .broadcast(
                    topics::SYNC,
                    json!({ "event": "state", "index": index, "collection": collection, "post": "off" }),
                )
                .await;
        }

        Ok(())
    }
}

/// A local strategy registration: writes the coordinator hash entry and
/// broadcasts `{event: strategies}` (spec.md §4.6).
pub struct StrategyAddedPipe {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Pipe for StrategyAddedPipe {
    async fn call(&self, payload: Value) -> Result<Value, ClusterError> {
        let name = required_str(&payload, "name")?;
        let plugin = required_str(&payload, "plugin")?;
        let strategy = required_str(&payload, "strategy")?;

        self.ctx
            .node
            .coordinator
            .strategies_set(
                &name,
                &crate::coordinator::StrategyEntry {
                    plugin,
                    strategy,
                },
            )
            .await
            .map_err(|source| ClusterError::TransientCoordinator {
                tag: Tag::new("cluster", "strategies"),
                source,
            })?;

        let _ = self
            .ctx
            .node
            .transport
            .broadcast(topics::SYNC, json!({ "event": "strategies" }))
            .await;

        Ok(payload)
    }
}

/// A local strategy removal: deletes the coordinator hash entry and
/// broadcasts `{event: strategies}` (spec.md §4.6).
pub struct StrategyRemovedPipe {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Pipe for StrategyRemovedPipe {
    async fn call(&self, payload: Value) -> Result<Value, ClusterError> {
        let name = required_str(&payload, "name")?;

        self.ctx
            .node
            .coordinator
            .strategies_remove(&name)
            .await
            .map_err(|source| ClusterError::TransientCoordinator {
                tag: Tag::new("cluster", "strategies"),
                source,
            })?;

        let _ = self
            .ctx
            .node
            .transport
            .broadcast(topics::SYNC, json!({ "event": "strategies" }))
            .await;

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::coordinator::fake::InMemoryCoordinator;
    use crate::coordinator::CoordinatorClient;
    use crate::node::{Node, NodeDescriptor, NodeId};
    use crate::platform::{InMemoryStrategyRegistry, RealtimeEngine};
    use crate::transport::loopback::{Hub, LoopbackTransport};
    use std::sync::Mutex;

    struct FakeRealtime {
        rooms: Mutex<std::collections::HashSet<String>>,
    }

    impl RealtimeEngine for FakeRealtime {
        fn has_room(&self, room_id: &str) -> bool {
            self.rooms.lock().unwrap().contains(room_id)
        }
        fn materialize_room_shell(&self, room_id: &str, _index: &str, _collection: &str) {
            self.rooms.lock().unwrap().insert(room_id.to_string());
        }
        fn remove_room(&self, room_id: &str) {
            self.rooms.lock().unwrap().remove(room_id);
        }
    }

    async fn context() -> Arc<HookContext> {
        let coordinator: Arc<dyn CoordinatorClient> = Arc::new(InMemoryCoordinator::new());
        let hub = Hub::new();
        let id = NodeId::new();
        let transport = LoopbackTransport::join(hub, id.as_uuid(), None).await;
        let strategies = InMemoryStrategyRegistry::new();
        let node = Node::join(
            id,
            NodeDescriptor {
                uuid: id,
                pub_addr: "127.0.0.1:7511".to_string(),
                router_addr: "127.0.0.1:7510".to_string(),
                birthdate: 0,
            },
            transport,
            coordinator,
            &strategies,
        )
        .await
        .unwrap();

        Arc::new(HookContext {
            node,
            realtime: Arc::new(FakeRealtime {
                rooms: Mutex::new(std::collections::HashSet::new()),
            }),
            config: Arc::new(ClusterConfig::default()),
            teardown: Arc::new(crate::realtime::DefaultRoomTeardown),
        })
    }

    #[tokio::test]
    async fn subscription_added_then_off_restores_empty_replica() {
        let ctx = context().await;

        let added = SubscriptionAddedPipe { ctx: ctx.clone() };
        added
            .call(json!({"roomId": "room-1", "index": "idx", "collection": "col", "connectionId": "conn-1"}))
            .await
            .unwrap();

        let room = ctx.node.state.get_room("room-1").await.unwrap();
        assert_eq!(room.count, 1);
        assert!(!ctx.node.locks.is_locked("room-1").await);

        let off = SubscriptionOffPipe { ctx: ctx.clone() };
        off.call(json!({"roomId": "room-1", "index": "idx", "collection": "col", "connectionId": "conn-1"}))
            .await
            .unwrap();

        assert!(ctx.node.state.get_room("room-1").await.is_none());
        assert!(!ctx.node.locks.is_locked("room-1").await);
    }

    #[tokio::test]
    async fn subscription_off_tears_down_local_room_once_fleet_count_hits_zero() {
        let ctx = context().await;
        ctx.realtime.materialize_room_shell("room-1", "idx", "col");
        assert!(ctx.realtime.has_room("room-1"));

        let off = SubscriptionOffPipe { ctx: ctx.clone() };
        off.call(json!({"roomId": "room-1", "index": "idx", "collection": "col", "connectionId": "conn-1"}))
            .await
            .unwrap();

        assert!(!ctx.realtime.has_room("room-1"));
    }

    #[tokio::test]
    async fn before_join_materializes_room_present_in_replica() {
        let ctx = context().await;
        ctx.node
            .state
            .set_room_count("idx", "col", "room-1", 2)
            .await;

        let pipe = BeforeJoinPipe { ctx: ctx.clone() };
        pipe.call(json!({"roomId": "room-1"})).await.unwrap();

        assert!(ctx.realtime.has_room("room-1"));
    }

    #[tokio::test]
    async fn strategy_added_writes_coordinator_hash() {
        let ctx = context().await;
        let pipe = StrategyAddedPipe { ctx: ctx.clone() };
        pipe.call(json!({"name": "local", "plugin": "auth", "strategy": "local"}))
            .await
            .unwrap();

        let all = ctx.node.coordinator.strategies_all().await.unwrap();
        assert!(all.contains_key("local"));
    }
}
