//! At-most-once shutdown supervisor (spec.md §4.8). Registered for
//! fatal process events; runs the five-step cleanup sequence exactly
//! once, then lets the process exit.

use crate::node::Node;
use crate::transport::topics;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Process-wide (per-`ClusterInner`) single-transition shutdown flag,
/// reached by every subsystem through its back-reference rather than a
/// Rust `static` (spec.md §9, "Global shutdown state").
#[derive(Default)]
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent set: returns `true` only for the caller that performed
    /// the first transition.
    pub fn trigger(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs the shutdown sequence exactly once for `node` (spec.md §4.8).
/// Safe to call from multiple signal handlers concurrently: only the
/// first caller whose `flag.trigger()` succeeds does any work.
pub async fn run(node: &Arc<Node>, flag: &ShutdownFlag) {
    if !flag.trigger() {
        return;
    }

    if let Err(e) = crate::node::discovery::withdraw(
        node.coordinator.as_ref(),
        &crate::coordinator::PeerBinding {
            pub_addr: node.descriptor.pub_addr.clone(),
            router_addr: node.descriptor.router_addr.clone(),
        },
    )
    .await
    {
        warn!("failed to withdraw from discovery during shutdown: {e}");
    }

    if node.peers.is_empty().await {
        info!("last node out, resetting replica instead of running cleanNode");
        node.state.clear().await;
        return;
    }

    let tags = match node.coordinator.collections_all().await {
        Ok(tags) => tags,
        Err(e) => {
            warn!("failed to enumerate collections during shutdown: {e}");
            Vec::new()
        }
    };

    for tag in tags {
        if let Err(e) = node
            .coordinator
            .clean_node(&tag, &node.id.to_string())
            .await
        {
            warn!(%tag, "cleanNode failed during shutdown: {e}");
        }
    }

    if let Err(e) = node
        .transport
        .broadcast(topics::SYNC, json!({ "event": "state:all" }))
        .await
    {
        warn!("failed to broadcast state:all during shutdown: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::fake::InMemoryCoordinator;
    use crate::coordinator::CoordinatorClient;
    use crate::node::{NodeDescriptor, NodeId};
    use crate::platform::InMemoryStrategyRegistry;
    use crate::transport::loopback::{Hub, LoopbackTransport};
    use crate::state::Tag;

    async fn joined_node(hub: Arc<Hub>, port: u16) -> Arc<Node> {
        let coordinator: Arc<dyn CoordinatorClient> = Arc::new(InMemoryCoordinator::new());
        let id = NodeId::new();
        let transport = LoopbackTransport::join(hub, id.as_uuid(), None).await;
        let strategies = InMemoryStrategyRegistry::new();
        Node::join(
            id,
            NodeDescriptor {
                uuid: id,
                pub_addr: format!("127.0.0.1:{port}"),
                router_addr: format!("127.0.0.1:{}", port + 1),
                birthdate: 0,
            },
            transport,
            coordinator,
            &strategies,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let flag = ShutdownFlag::new();
        assert!(flag.trigger());
        assert!(!flag.trigger());
        assert!(flag.is_set());
    }

    #[tokio::test]
    async fn last_node_out_resets_state_without_clean_node() {
        let hub = Hub::new();
        let node = joined_node(hub, 7511).await;

        let tag = Tag::new("idx", "col");
        node.state.set_room_count("idx", "col", "room-1", 3).await;
        node.state.set_version(&tag, 5).await;

        let flag = ShutdownFlag::new();
        run(&node, &flag).await;

        assert!(node.state.get_room("room-1").await.is_none());
        assert_eq!(node.state.get_version(&tag).await, 0);
    }

    #[tokio::test]
    async fn withdraws_self_from_discovery() {
        let hub = Hub::new();
        let node = joined_node(hub, 7611).await;
        let coordinator = node.coordinator.clone();

        let flag = ShutdownFlag::new();
        run(&node, &flag).await;

        assert!(coordinator.discovery_members().await.unwrap().is_empty());
    }
}
