//! Narrow trait boundaries for the host platform's collaborators
//! (spec.md §1's "external collaborators whose contracts appear only in
//! §6"; expanded contracts in SPEC_FULL.md §6a). This crate never
//! implements the platform side — only the seam every hook, pipe, and
//! realtime override calls into.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Log levels used by the dual-sink `log` function below (spec.md §9,
/// Open Questions: "logs to console when the platform has not finished
/// starting, emits via the event bus otherwise").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Routes to the host's event bus once attached; falls back to a
/// `tracing` event (which defaults to stderr) before that. This crate
/// owns only the fallback sink — the bus-side sink is the host's.
pub fn log(bus: Option<&dyn EventBus>, level: LogLevel, msg: &str) {
    if let Some(bus) = bus {
        bus.emit("cluster:log", serde_json::json!({ "level": format!("{level:?}"), "msg": msg }));
        return;
    }
    match level {
        LogLevel::Debug => tracing::debug!("{msg}"),
        LogLevel::Info => info!("{msg}"),
        LogLevel::Warn => warn!("{msg}"),
        LogLevel::Error => error!("{msg}"),
    }
}

/// A handler invoked for a fire-and-forget event on the host's bus.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, payload: serde_json::Value);
}

/// A handler invoked for an interceptable event; may return a
/// transformed payload or reject the operation.
#[async_trait]
pub trait Pipe: Send + Sync {
    async fn call(&self, payload: serde_json::Value) -> Result<serde_json::Value, crate::error::ClusterError>;
}

/// The host's event bus: hook/pipe registration plus fire-and-forget
/// emission (spec.md §6, "platform-facing interface").
pub trait EventBus: Send + Sync {
    fn register_hook(&self, name: &'static str, hook: std::sync::Arc<dyn Hook>);
    fn register_pipe(&self, name: &'static str, pipe: std::sync::Arc<dyn Pipe>);
    fn emit(&self, name: &str, payload: serde_json::Value);
}

/// The host's realtime engine: room materialization and teardown
/// (spec.md §4.6 `beforeJoin`, §4.7 room teardown wrapping).
pub trait RealtimeEngine: Send + Sync {
    fn has_room(&self, room_id: &str) -> bool;
    fn materialize_room_shell(&self, room_id: &str, index: &str, collection: &str);
    fn remove_room(&self, room_id: &str);
}

/// The host's auth collaborator, consulted by `realtime.list` (spec.md
/// §4.7).
#[async_trait]
pub trait AuthCollaborator: Send + Sync {
    async fn is_allowed(&self, token: &str, action: &str, index: &str, collection: &str) -> bool;
}

/// The host's index cache, updated with `propagate = false` when a sync
/// event originates from a peer (spec.md §4.5).
pub trait IndexCacheCollaborator: Send + Sync {
    fn add(&self, index: &str, collection: &str, propagate: bool);
    fn remove(&self, index: &str, collection: &str, propagate: bool);
}

/// Local repository invalidation hooks for roles/profiles (spec.md
/// §4.5).
pub trait RoleRepository: Send + Sync {
    fn invalidate(&self, id: &str);
}

pub trait ProfileRepository: Send + Sync {
    fn invalidate(&self, id: &str);
}

/// Specification/validator cache, reloaded wholesale on a `validators`
/// sync event (spec.md §4.5).
pub trait ValidatorCache: Send + Sync {
    fn reload(&self);
}

/// Local, platform-side mirror of registered auth strategies (spec.md
/// §3, "Strategy registry"; §4.5, `strategies` sync event).
pub trait StrategyRegistry: Send + Sync {
    fn register(&self, name: &str, plugin: &str, strategy: &str);
    fn unregister(&self, name: &str);
    fn list(&self) -> Vec<String>;
}

/// An in-process [`StrategyRegistry`] used by tests and as a default
/// when no platform-side registry is attached.
#[derive(Default)]
pub struct InMemoryStrategyRegistry {
    entries: Mutex<HashMap<String, (String, String)>>,
}

impl InMemoryStrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StrategyRegistry for InMemoryStrategyRegistry {
    fn register(&self, name: &str, plugin: &str, strategy: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_string(), (plugin.to_string(), strategy.to_string()));
    }

    fn unregister(&self, name: &str) {
        self.entries.lock().unwrap().remove(name);
    }

    fn list(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}
