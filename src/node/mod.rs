//! Local node membership: joins discovery, dials every known peer, keeps
//! a pool of live peer sockets, heartbeats, detects departures, triggers
//! cleanup (spec.md §4.3). Owns the `state` replica and the pending-op
//! locks that the sync and hooks subsystems serialize against.

pub mod discovery;
pub mod peer;
pub mod types;

pub use types::{NodeDescriptor, NodeId, PeerEntry};

use crate::config::ClusterConfig;
use crate::coordinator::{CoordinatorClient, PeerBinding};
use crate::error::ClusterError;
use crate::state::{PendingLocks, StateReplica};
use crate::transport::{topics, Inbound, Transport};
use peer::PeerPool;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A running node: identity, transport, coordinator handle, local
/// replica, pending-op locks, and the live peer pool.
pub struct Node {
    pub id: NodeId,
    pub descriptor: NodeDescriptor,
    pub transport: Arc<dyn Transport>,
    pub coordinator: Arc<dyn CoordinatorClient>,
    pub state: Arc<StateReplica>,
    pub locks: Arc<PendingLocks>,
    pub peers: Arc<PeerPool>,
    ready: AtomicBool,
}

impl Node {
    fn binding(&self) -> PeerBinding {
        PeerBinding {
            pub_addr: self.descriptor.pub_addr.clone(),
            router_addr: self.descriptor.router_addr.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Bring up a node: announce to discovery, dial known peers, hydrate
    /// strategies, seed the replica from every known tag, then announce
    /// readiness (spec.md §4.3, steps 2-6 — binding the transport and
    /// learning concrete addresses, step 1, happens before a `Node` is
    /// constructed; see `cluster::Cluster::start`).
    pub async fn join(
        id: NodeId,
        descriptor: NodeDescriptor,
        transport: Arc<dyn Transport>,
        coordinator: Arc<dyn CoordinatorClient>,
        strategies: &dyn crate::platform::StrategyRegistry,
    ) -> Result<Arc<Self>, ClusterError> {
        let node = Arc::new(Self {
            id,
            descriptor: descriptor.clone(),
            transport: transport.clone(),
            coordinator: coordinator.clone(),
            state: Arc::new(StateReplica::new()),
            locks: Arc::new(PendingLocks::new()),
            peers: Arc::new(PeerPool::new()),
            ready: AtomicBool::new(false),
        });

        discovery::announce(coordinator.as_ref(), &node.binding()).await?;

        let known = discovery::peers_excluding(coordinator.as_ref(), &node.binding()).await?;
        for peer in known {
            if let Err(e) = transport
                .dial(id.as_uuid(), &peer.pub_addr, &peer.router_addr)
                .await
            {
                warn!("failed to dial peer {}: {e}", peer.pub_addr);
            }
        }

        let remote_strategies =
            coordinator
                .strategies_all()
                .await
                .map_err(|source| ClusterError::TransientCoordinator {
                    tag: crate::state::Tag::new("cluster", "strategies"),
                    source,
                })?;
        for (name, entry) in remote_strategies {
            strategies.register(&name, &entry.plugin, &entry.strategy);
        }

        let tags = coordinator
            .collections_all()
            .await
            .map_err(|source| ClusterError::TransientCoordinator {
                tag: crate::state::Tag::new("cluster", "collections"),
                source,
            })?;
        for tag in tags {
            let guard = node.state.lock_tag(&tag).await;
            let (version, rooms) =
                coordinator
                    .get_state(&tag)
                    .await
                    .map_err(|source| ClusterError::TransientCoordinator {
                        tag: tag.clone(),
                        source,
                    })?;
            let (index, collection) = tag.split();
            node.state
                .replace_tag_snapshot(&index, &collection, &rooms)
                .await;
            node.state.set_version(&tag, version).await;
            drop(guard);
        }

        transport
            .broadcast(topics::READY, json!({ "uuid": id.to_string() }))
            .await
            .map_err(|e| ClusterError::TransientPeer {
                peer: "*".to_string(),
                reason: e.to_string(),
            })?;
        node.mark_ready();
        info!(node = %id, "node ready");

        Ok(node)
    }

    /// Periodic liveness broadcast (spec.md §4.2, `cluster:heartbeat`).
    pub async fn send_heartbeat(&self) -> Result<(), ClusterError> {
        self.transport
            .broadcast(
                topics::HEARTBEAT,
                json!({
                    "uuid": self.id.to_string(),
                    "birthdate": self.descriptor.birthdate,
                    "addresses": {
                        "pub": self.descriptor.pub_addr,
                        "router": self.descriptor.router_addr,
                    },
                }),
            )
            .await
            .map_err(|e| ClusterError::TransientPeer {
                peer: "*".to_string(),
                reason: e.to_string(),
            })
    }

    /// Record an inbound heartbeat from a peer (transparent reconnect,
    /// spec.md §4.3).
    pub async fn observe_heartbeat(&self, inbound: &Inbound) {
        let Some(addresses) = inbound.payload.get("addresses") else {
            return;
        };
        let pub_addr = addresses
            .get("pub")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let router_addr = addresses
            .get("router")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let birthdate = inbound
            .payload
            .get("birthdate")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        self.peers
            .record_heartbeat(NodeDescriptor {
                uuid: NodeId(inbound.from),
                pub_addr,
                router_addr,
                birthdate,
            })
            .await;
    }

    /// Sweep peers whose heartbeat has gone stale, running `cleanNode`
    /// on their behalf for every known tag (spec.md §4.3, "Peer
    /// lifecycle"; best-effort, the script is idempotent).
    pub async fn reap_stale_peers(&self, config: &ClusterConfig) {
        let stale = self.peers.stale(config.timers.heartbeat_timeout()).await;
        for peer_id in stale {
            debug!(peer = %peer_id, "peer heartbeat timed out, running cleanNode");
            self.peers.remove(peer_id).await;
            self.transport.drop_peer(peer_id.as_uuid()).await;

            let tags = match self.coordinator.collections_all().await {
                Ok(tags) => tags,
                Err(e) => {
                    warn!("failed to enumerate collections during peer cleanup: {e}");
                    continue;
                }
            };
            for tag in tags {
                let guard = self.state.lock_tag(&tag).await;
                match self.coordinator.clean_node(&tag, &peer_id.to_string()).await {
                    Ok(version) => match self.coordinator.get_state(&tag).await {
                        Ok((_, rooms)) => {
                            let (index, collection) = tag.split();
                            self.state.replace_tag_snapshot(&index, &collection, &rooms).await;
                            self.state.set_version(&tag, version).await;
                        }
                        Err(e) => warn!(tag = %tag, "getState after cleanNode failed: {e}"),
                    },
                    Err(e) => warn!(tag = %tag, "cleanNode failed for stale peer: {e}"),
                }
                drop(guard);
            }
        }
    }
}
