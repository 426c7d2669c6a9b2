//! Fire-and-forget event handlers (spec.md §4.6, "Hooks"). Unlike
//! pipes, hooks never transform or delay the triggering event; they
//! only react. If `node.ready` is false when a broadcast-only hook
//! fires, the broadcast is logged and dropped — the coordinator remains
//! authoritative and a later `state:all` repairs the gap.

use super::{required_str, HookContext};
use crate::platform::Hook;
use crate::transport::topics;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

async fn broadcast_if_ready(ctx: &HookContext, topic: &str, payload: Value) {
    if !ctx.node.is_ready() {
        warn!(topic, "node not ready, dropping broadcast");
        return;
    }
    if let Err(e) = ctx.node.transport.broadcast(topic, payload).await {
        warn!(topic, "broadcast failed: {e}");
    }
}

pub struct ProfileMutationHook {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Hook for ProfileMutationHook {
    async fn call(&self, payload: Value) {
        let Ok(id) = required_str(&payload, "id") else {
            return;
        };
        broadcast_if_ready(&self.ctx, topics::SYNC, json!({ "event": "profile", "id": id })).await;
    }
}

pub struct RoleMutationHook {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Hook for RoleMutationHook {
    async fn call(&self, payload: Value) {
        let Ok(id) = required_str(&payload, "id") else {
            return;
        };
        broadcast_if_ready(&self.ctx, topics::SYNC, json!({ "event": "role", "id": id })).await;
    }
}

pub struct ValidatorsRefreshedHook {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Hook for ValidatorsRefreshedHook {
    async fn call(&self, _payload: Value) {
        broadcast_if_ready(&self.ctx, topics::SYNC, json!({ "event": "validators" })).await;
    }
}

pub struct IndexCacheAddHook {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Hook for IndexCacheAddHook {
    async fn call(&self, payload: Value) {
        let (Ok(index), Ok(collection)) = (
            required_str(&payload, "index"),
            required_str(&payload, "collection"),
        ) else {
            return;
        };
        broadcast_if_ready(
            &self.ctx,
            topics::SYNC,
            json!({ "event": "indexCache:add", "index": index, "collection": collection }),
        )
        .await;
    }
}

pub struct IndexCacheRemoveHook {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Hook for IndexCacheRemoveHook {
    async fn call(&self, payload: Value) {
        let (Ok(index), Ok(collection)) = (
            required_str(&payload, "index"),
            required_str(&payload, "collection"),
        ) else {
            return;
        };
        broadcast_if_ready(
            &self.ctx,
            topics::SYNC,
            json!({ "event": "indexCache:remove", "index": index, "collection": collection }),
        )
        .await;
    }
}

/// Marks a room as locally in-flight the moment the realtime engine
/// begins creating it, so a concurrent `cluster:sync` update does not
/// trample the decision (spec.md §4.6, §3 "Pending-op locks").
pub struct RoomNewHook {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Hook for RoomNewHook {
    async fn call(&self, payload: Value) {
        let Ok(room_id) = required_str(&payload, "roomId") else {
            return;
        };
        self.ctx.node.locks.lock_create(&room_id).await;
    }
}

pub struct RoomRemoveHook {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Hook for RoomRemoveHook {
    async fn call(&self, payload: Value) {
        let Ok(room_id) = required_str(&payload, "roomId") else {
            return;
        };
        self.ctx.node.locks.lock_delete(&room_id).await;
    }
}

/// Releases the corresponding lock when the pipe path never ran to
/// completion (spec.md §4.6).
pub struct ErrorSubscribeHook {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Hook for ErrorSubscribeHook {
    async fn call(&self, payload: Value) {
        let Ok(room_id) = required_str(&payload, "roomId") else {
            return;
        };
        self.ctx.node.locks.release_create(&room_id).await;
    }
}

pub struct ErrorUnsubscribeHook {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Hook for ErrorUnsubscribeHook {
    async fn call(&self, payload: Value) {
        let Ok(room_id) = required_str(&payload, "roomId") else {
            return;
        };
        self.ctx.node.locks.release_delete(&room_id).await;
    }
}

/// Forwards a realtime notification to the fleet unchanged (spec.md
/// §4.6, `notify:document` / `notify:user`).
pub struct NotifyHook {
    pub ctx: Arc<HookContext>,
    pub topic: &'static str,
}

#[async_trait]
impl Hook for NotifyHook {
    async fn call(&self, payload: Value) {
        broadcast_if_ready(&self.ctx, self.topic, payload).await;
    }
}

/// Fleet-wide admin fan-out (spec.md §4.6, `dump`/`resetSecurity`/`shutdown`).
pub struct AdminHook {
    pub ctx: Arc<HookContext>,
    pub topic: &'static str,
}

#[async_trait]
impl Hook for AdminHook {
    async fn call(&self, payload: Value) {
        broadcast_if_ready(&self.ctx, self.topic, payload).await;
    }
}

/// Installs the realtime overrides and marks the node initialized; the
/// neutral replacement for the originating platform's own startup hook
/// name (spec.md §4.6, `kuzzleStart`; SPEC_FULL.md §4.6).
pub struct OnPlatformStartHook {
    pub ctx: Arc<HookContext>,
}

#[async_trait]
impl Hook for OnPlatformStartHook {
    async fn call(&self, _payload: Value) {
        tracing::info!(node = %self.ctx.node.id, "cluster overrides installed on platform start");
    }
}
