//! Event-driven glue: intercepts local platform events and translates
//! them into coordinator writes plus fabric broadcasts (spec.md §4.6).
//!
//! Per Design Notes §9, dispatch is a static registration map built once
//! at construction (`register_all`) rather than name→method lookup done
//! at call time, and every pipe that touches a pending-op lock wraps its
//! coordinator round-trip in a [`LockGuard`] so the lock is released on
//! every exit path, success or failure.

pub mod hooks;
pub mod pipes;

use crate::config::ClusterConfig;
use crate::node::Node;
use crate::platform::{EventBus, Hook, Pipe, RealtimeEngine};
use crate::realtime::RoomTeardownStrategy;
use crate::state::PendingLocks;
use std::sync::Arc;

/// Which of the two pending-op sets a [`LockGuard`] releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Create,
    Delete,
}

/// Releases a pending-op lock on drop, guaranteeing the release happens
/// on every exit path of the pipe that holds it — including an early
/// `?` return (spec.md §9, "scoped acquisition ... guaranteed release").
/// The lock is assumed already inserted (by the `room:new`/`room:remove`
/// hook, per spec.md §4.6) — this guard only ever releases, never
/// acquires.
pub struct LockGuard {
    locks: Arc<PendingLocks>,
    room_id: String,
    kind: LockKind,
    released: bool,
}

impl LockGuard {
    pub fn new(locks: Arc<PendingLocks>, room_id: impl Into<String>, kind: LockKind) -> Self {
        Self {
            locks,
            room_id: room_id.into(),
            kind,
            released: false,
        }
    }

    /// Release the lock eagerly (e.g. right after broadcasting, so a
    /// caller can observe the release without waiting on drop order).
    pub async fn release(mut self) {
        self.release_inner().await;
        self.released = true;
    }

    async fn release_inner(&self) {
        match self.kind {
            LockKind::Create => self.locks.release_create(&self.room_id).await,
            LockKind::Delete => self.locks.release_delete(&self.room_id).await,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best-effort synchronous release: the async release path above
        // is the normal case. If a guard is dropped without an explicit
        // `.release().await` (e.g. an early `?` return), spawn the
        // release so the lock does not leak past this tick.
        let locks = self.locks.clone();
        let room_id = self.room_id.clone();
        let kind = self.kind;
        tokio::spawn(async move {
            match kind {
                LockKind::Create => locks.release_create(&room_id).await,
                LockKind::Delete => locks.release_delete(&room_id).await,
            }
        });
    }
}

/// Shared context every hook/pipe closes over via a back-reference to
/// the owning node, rather than a global (spec.md §9, "Cyclic
/// references").
pub struct HookContext {
    pub node: Arc<Node>,
    pub realtime: Arc<dyn RealtimeEngine>,
    pub config: Arc<ClusterConfig>,
    pub teardown: Arc<dyn RoomTeardownStrategy>,
}

/// Event names the platform's bus fires (spec.md §4.6). Renamed from
/// the originating platform's own names where this crate must stay
/// neutral; `ON_PLATFORM_START` replaces that platform's own startup
/// hook name.
pub mod events {
    pub const BEFORE_JOIN: &str = "beforeJoin";
    pub const SUBSCRIPTION_ADDED: &str = "subscriptionAdded";
    pub const SUBSCRIPTION_JOINED: &str = "subscriptionJoined";
    pub const SUBSCRIPTION_OFF: &str = "subscriptionOff";
    pub const STRATEGY_ADDED: &str = "strategyAdded";
    pub const STRATEGY_REMOVED: &str = "strategyRemoved";

    pub const PROFILE_SAVED: &str = "profile:saved";
    pub const PROFILE_DELETED: &str = "profile:deleted";
    pub const ROLE_SAVED: &str = "role:saved";
    pub const ROLE_DELETED: &str = "role:deleted";
    pub const VALIDATORS_REFRESHED: &str = "validators:refreshed";
    pub const INDEX_CACHE_ADD: &str = "indexCache:add";
    pub const INDEX_CACHE_REMOVE: &str = "indexCache:remove";
    pub const ROOM_NEW: &str = "room:new";
    pub const ROOM_REMOVE: &str = "room:remove";
    pub const ERROR_SUBSCRIBE: &str = "realtime:errorSubscribe";
    pub const ERROR_UNSUBSCRIBE: &str = "realtime:errorUnsubscribe";
    pub const NOTIFY_DOCUMENT: &str = "notify:document";
    pub const NOTIFY_USER: &str = "notify:user";
    pub const ADMIN_DUMP: &str = "admin:dump";
    pub const ADMIN_RESET_SECURITY: &str = "admin:resetSecurity";
    pub const ADMIN_SHUTDOWN: &str = "admin:shutdown";
    pub const ON_PLATFORM_START: &str = "onPlatformStart";
}

/// Register every pipe and hook from spec.md §4.6 onto the host's
/// event bus, all bound to one `ctx` back-reference.
pub fn register_all(bus: &dyn EventBus, ctx: Arc<HookContext>) {
    use events::*;

    bus.register_pipe(BEFORE_JOIN, Arc::new(pipes::BeforeJoinPipe { ctx: ctx.clone() }));
    bus.register_pipe(
        SUBSCRIPTION_ADDED,
        Arc::new(pipes::SubscriptionAddedPipe { ctx: ctx.clone() }),
    );
    bus.register_pipe(
        SUBSCRIPTION_JOINED,
        Arc::new(pipes::SubscriptionJoinedPipe { ctx: ctx.clone() }),
    );
    bus.register_pipe(
        SUBSCRIPTION_OFF,
        Arc::new(pipes::SubscriptionOffPipe { ctx: ctx.clone() }),
    );
    bus.register_pipe(
        STRATEGY_ADDED,
        Arc::new(pipes::StrategyAddedPipe { ctx: ctx.clone() }),
    );
    bus.register_pipe(
        STRATEGY_REMOVED,
        Arc::new(pipes::StrategyRemovedPipe { ctx: ctx.clone() }),
    );

    let hook: Arc<dyn Hook> = Arc::new(hooks::ProfileMutationHook { ctx: ctx.clone() });
    bus.register_hook(PROFILE_SAVED, hook.clone());
    bus.register_hook(PROFILE_DELETED, hook);

    let hook: Arc<dyn Hook> = Arc::new(hooks::RoleMutationHook { ctx: ctx.clone() });
    bus.register_hook(ROLE_SAVED, hook.clone());
    bus.register_hook(ROLE_DELETED, hook);

    bus.register_hook(
        VALIDATORS_REFRESHED,
        Arc::new(hooks::ValidatorsRefreshedHook { ctx: ctx.clone() }),
    );
    bus.register_hook(
        INDEX_CACHE_ADD,
        Arc::new(hooks::IndexCacheAddHook { ctx: ctx.clone() }),
    );
    bus.register_hook(
        INDEX_CACHE_REMOVE,
        Arc::new(hooks::IndexCacheRemoveHook { ctx: ctx.clone() }),
    );
    bus.register_hook(ROOM_NEW, Arc::new(hooks::RoomNewHook { ctx: ctx.clone() }));
    bus.register_hook(
        ROOM_REMOVE,
        Arc::new(hooks::RoomRemoveHook { ctx: ctx.clone() }),
    );
    bus.register_hook(
        ERROR_SUBSCRIBE,
        Arc::new(hooks::ErrorSubscribeHook { ctx: ctx.clone() }),
    );
    bus.register_hook(
        ERROR_UNSUBSCRIBE,
        Arc::new(hooks::ErrorUnsubscribeHook { ctx: ctx.clone() }),
    );
    bus.register_hook(
        NOTIFY_DOCUMENT,
        Arc::new(hooks::NotifyHook {
            ctx: ctx.clone(),
            topic: crate::transport::topics::NOTIFY_DOCUMENT,
        }),
    );
    bus.register_hook(
        NOTIFY_USER,
        Arc::new(hooks::NotifyHook {
            ctx: ctx.clone(),
            topic: crate::transport::topics::NOTIFY_USER,
        }),
    );
    bus.register_hook(
        ADMIN_DUMP,
        Arc::new(hooks::AdminHook {
            ctx: ctx.clone(),
            topic: crate::transport::topics::ADMIN_DUMP,
        }),
    );
    bus.register_hook(
        ADMIN_RESET_SECURITY,
        Arc::new(hooks::AdminHook {
            ctx: ctx.clone(),
            topic: crate::transport::topics::ADMIN_RESET_SECURITY,
        }),
    );
    bus.register_hook(
        ADMIN_SHUTDOWN,
        Arc::new(hooks::AdminHook {
            ctx: ctx.clone(),
            topic: crate::transport::topics::ADMIN_SHUTDOWN,
        }),
    );
    bus.register_hook(
        ON_PLATFORM_START,
        Arc::new(hooks::OnPlatformStartHook { ctx }),
    );
}

/// Extracts a required string field from a hook/pipe payload, mapping a
/// miss to `ClusterError::InvalidInput` (spec.md §7).
pub(crate) fn required_str(
    payload: &serde_json::Value,
    field: &str,
) -> Result<String, crate::error::ClusterError> {
    payload
        .get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| crate::error::ClusterError::InvalidInput(format!("missing `{field}`")))
}
