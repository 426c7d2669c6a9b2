//! End-to-end two-node fleet scenarios (spec.md §8), driven without any
//! real sockets: a shared [`InMemoryCoordinator`] plus a
//! [`LoopbackTransport`] hub stand in for the coordinator store and the
//! messaging fabric.

use cluster_coordinator::coordinator::fake::InMemoryCoordinator;
use cluster_coordinator::coordinator::CoordinatorClient;
use cluster_coordinator::hooks::pipes::{BeforeJoinPipe, SubscriptionAddedPipe, SubscriptionJoinedPipe};
use cluster_coordinator::hooks::HookContext;
use cluster_coordinator::node::{Node, NodeDescriptor, NodeId};
use cluster_coordinator::platform::{AuthCollaborator, InMemoryStrategyRegistry, RealtimeEngine};
use cluster_coordinator::realtime::{RealtimeCountStrategy, RealtimeListStrategy};
use cluster_coordinator::realtime::ClusterRealtime;
use cluster_coordinator::state::Tag;
use cluster_coordinator::sync::{Collaborators, SyncEngine};
use cluster_coordinator::transport::loopback::{Hub, LoopbackTransport};
use cluster_coordinator::transport::topics;
use cluster_coordinator::ClusterConfig;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct FakeRealtime {
    rooms: Mutex<HashSet<String>>,
}

impl FakeRealtime {
    fn new() -> Self {
        Self {
            rooms: Mutex::new(HashSet::new()),
        }
    }
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

struct AllowAll;

#[async_trait::async_trait]
impl AuthCollaborator for AllowAll {
    async fn is_allowed(&self, _token: &str, _action: &str, _index: &str, _collection: &str) -> bool {
        true
    }
}

async fn joined_node(hub: Arc<Hub>, coordinator: Arc<dyn CoordinatorClient>, port: u16) -> Arc<Node> {
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

fn hook_context(node: Arc<Node>) -> Arc<HookContext> {
    Arc::new(HookContext {
        node,
        realtime: Arc::new(FakeRealtime::new()),
        config: Arc::new(ClusterConfig::default()),
    })
}

/// Drains every pending inbound message on `node` through `sync`,
/// simulating the fabric's dispatch loop for one tick.
async fn drain_sync(node: &Arc<Node>, sync: &SyncEngine) {
    while let Ok(inbound) = tokio::time::timeout(Duration::from_millis(20), node.transport.recv()).await {
        let Some(inbound) = inbound else { break };
        if inbound.topic == topics::SYNC {
            if let Ok(event) = serde_json::from_value(inbound.payload) {
                sync.handle(event).await;
            }
        }
    }
}

#[tokio::test]
async fn two_node_subscribe_fan_out() {
    let hub = Hub::new();
    let coordinator: Arc<dyn CoordinatorClient> = Arc::new(InMemoryCoordinator::new());

    let node_a = joined_node(hub.clone(), coordinator.clone(), 7000).await;
    let node_b = joined_node(hub.clone(), coordinator.clone(), 7100).await;
    node_a.transport.dial(node_b.id.as_uuid(), "", "").await.unwrap();
    node_b.transport.dial(node_a.id.as_uuid(), "", "").await.unwrap();

    let ctx_a = hook_context(node_a.clone());
    let added = SubscriptionAddedPipe { ctx: ctx_a.clone() };
    added
        .call(serde_json::json!({
            "roomId": "R", "index": "idx", "collection": "col",
            "connectionId": "conn-1", "filter": "F",
        }))
        .await
        .unwrap();

    let tag = Tag::new("idx", "col");
    assert_eq!(coordinator.get_state(&tag).await.unwrap().0, 1);
    let room_a = node_a.state.get_room("R").await.unwrap();
    assert_eq!(room_a.count, 1);
    assert!(!node_a.locks.is_locked("R").await);

    let sync_b = SyncEngine::new(
        node_b.state.clone(),
        coordinator.clone(),
        node_b.locks.clone(),
        Collaborators::default(),
    );
    drain_sync(&node_b, &sync_b).await;

    let room_b = node_b.state.get_room("R").await.unwrap();
    assert_eq!(room_b.count, 1);
    assert_eq!(room_b.index, "idx");
    assert!(!node_b.locks.is_locked("R").await);
}

#[tokio::test]
async fn cross_node_join_bumps_version_and_count() {
    let hub = Hub::new();
    let coordinator: Arc<dyn CoordinatorClient> = Arc::new(InMemoryCoordinator::new());

    let node_a = joined_node(hub.clone(), coordinator.clone(), 7200).await;
    let node_b = joined_node(hub.clone(), coordinator.clone(), 7300).await;
    node_a.transport.dial(node_b.id.as_uuid(), "", "").await.unwrap();
    node_b.transport.dial(node_a.id.as_uuid(), "", "").await.unwrap();

    let ctx_a = hook_context(node_a.clone());
    SubscriptionAddedPipe { ctx: ctx_a.clone() }
        .call(serde_json::json!({
            "roomId": "R", "index": "idx", "collection": "col",
            "connectionId": "conn-1", "filter": "F",
        }))
        .await
        .unwrap();

    let sync_b = SyncEngine::new(
        node_b.state.clone(),
        coordinator.clone(),
        node_b.locks.clone(),
        Collaborators::default(),
    );
    drain_sync(&node_b, &sync_b).await;

    let ctx_b = hook_context(node_b.clone());
    BeforeJoinPipe { ctx: ctx_b.clone() }
        .call(serde_json::json!({"roomId": "R"}))
        .await
        .unwrap();
    assert!(ctx_b.realtime.has_room("R"));

    SubscriptionJoinedPipe { ctx: ctx_b.clone() }
        .call(serde_json::json!({
            "roomId": "R", "index": "idx", "collection": "col",
            "connectionId": "conn-2", "changed": true,
        }))
        .await
        .unwrap();

    let tag = Tag::new("idx", "col");
    assert_eq!(coordinator.get_state(&tag).await.unwrap().0, 2);
    assert_eq!(node_b.state.get_room("R").await.unwrap().count, 2);

    drain_sync(&node_a, &SyncEngine::new(
        node_a.state.clone(),
        coordinator.clone(),
        node_a.locks.clone(),
        Collaborators::default(),
    ))
    .await;
    assert_eq!(node_a.state.get_room("R").await.unwrap().count, 2);
}

#[tokio::test]
async fn node_crash_cleanup_via_clean_node() {
    let hub = Hub::new();
    let coordinator: Arc<dyn CoordinatorClient> = Arc::new(InMemoryCoordinator::new());

    let node_a = joined_node(hub.clone(), coordinator.clone(), 7400).await;
    let node_b = joined_node(hub.clone(), coordinator.clone(), 7500).await;
    node_a.transport.dial(node_b.id.as_uuid(), "", "").await.unwrap();

    let tag = Tag::new("idx", "col");
    coordinator.sub_on(&tag, &node_a.id.to_string(), "R", "conn-a", None).await.unwrap();
    coordinator.sub_on(&tag, &node_b.id.to_string(), "R", "conn-b", None).await.unwrap();
    coordinator.collections_add(&tag).await.unwrap();
    node_a.state.set_room_count("idx", "col", "R", 2).await;
    node_a.state.set_version(&tag, 2).await;

    node_a.peers.record_heartbeat(node_b.descriptor.clone()).await;

    let mut config = ClusterConfig::default();
    config.timers.heartbeat_timeout_ms = 0;
    node_a.reap_stale_peers(&config).await;

    assert!(node_a.peers.is_empty().await);
    let (version, _) = coordinator.get_state(&tag).await.unwrap();
    assert_eq!(version, 3);
    assert_eq!(node_a.state.get_room("R").await.map(|r| r.count), Some(1));
}

#[tokio::test]
async fn list_override_sorts_by_index_then_collection_then_room() {
    let node = joined_node(Hub::new(), Arc::new(InMemoryCoordinator::new()), 7600).await;
    node.state.set_room_count("i2", "c2", "R1", 4).await;
    node.state.set_room_count("i1", "c1", "R2", 2).await;
    node.state.set_room_count("i1", "c2", "R3", 3).await;

    let realtime = ClusterRealtime {
        state: node.state.clone(),
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
async fn count_recovers_after_replication_lag() {
    let node = joined_node(Hub::new(), Arc::new(InMemoryCoordinator::new()), 7700).await;
    let realtime = Arc::new(ClusterRealtime {
        state: node.state.clone(),
        auth: Arc::new(AllowAll),
        wait_for_missing_rooms: Duration::from_millis(40),
    });

    let state_for_sync = node.state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        state_for_sync.set_room_count("idx", "col", "R", 1).await;
    });

    let result = realtime.count("R").await.unwrap();
    assert_eq!(result["count"], 1);
}

#[tokio::test]
async fn strategy_registration_propagates_and_removal_is_symmetric() {
    let hub = Hub::new();
    let coordinator: Arc<dyn CoordinatorClient> = Arc::new(InMemoryCoordinator::new());

    let node_a = joined_node(hub.clone(), coordinator.clone(), 7800).await;
    let node_b = joined_node(hub.clone(), coordinator.clone(), 7900).await;
    node_a.transport.dial(node_b.id.as_uuid(), "", "").await.unwrap();

    coordinator
        .strategies_set(
            "custom",
            &cluster_coordinator::coordinator::StrategyEntry {
                plugin: "auth-plugin".to_string(),
                strategy: "custom".to_string(),
            },
        )
        .await
        .unwrap();
    node_a
        .transport
        .broadcast(topics::SYNC, serde_json::json!({"event": "strategies"}))
        .await
        .unwrap();

    let registry_b = Arc::new(InMemoryStrategyRegistry::new());
    let sync_b = SyncEngine::new(
        node_b.state.clone(),
        coordinator.clone(),
        node_b.locks.clone(),
        Collaborators {
            strategies: Some(registry_b.clone() as Arc<dyn cluster_coordinator::platform::StrategyRegistry>),
            ..Collaborators::default()
        },
    );
    drain_sync(&node_b, &sync_b).await;
    assert!(registry_b.list().contains(&"custom".to_string()));

    coordinator.strategies_remove("custom").await.unwrap();
    node_a
        .transport
        .broadcast(topics::SYNC, serde_json::json!({"event": "strategies"}))
        .await
        .unwrap();
    drain_sync(&node_b, &sync_b).await;
    assert!(!registry_b.list().contains(&"custom".to_string()));
}
