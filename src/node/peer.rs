//! Pool of live peer descriptors, with heartbeat bookkeeping used to
//! detect departures (spec.md §4.3, "Peer lifecycle").

use super::types::{NodeDescriptor, NodeId, PeerEntry};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Tracks every peer this node currently considers live. A heartbeat
/// missing for longer than `heartbeatTimeout` marks a peer stale; the
/// detecting node then runs `cleanNode` on its behalf (spec.md §4.3).
pub struct PeerPool {
    peers: RwLock<HashMap<NodeId, PeerEntry>>,
}

impl PeerPool {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Record a fresh heartbeat for a peer, adding it if unknown. A
    /// reconnect after a stale timeout is transparent (spec.md §4.3).
    pub async fn record_heartbeat(&self, descriptor: NodeDescriptor) {
        let id = descriptor.uuid;
        self.peers.write().await.insert(
            id,
            PeerEntry {
                descriptor,
                last_heartbeat: Instant::now(),
            },
        );
    }

    pub async fn contains(&self, id: NodeId) -> bool {
        self.peers.read().await.contains_key(&id)
    }

    pub async fn remove(&self, id: NodeId) -> Option<NodeDescriptor> {
        self.peers.write().await.remove(&id).map(|e| e.descriptor)
    }

    pub async fn descriptors(&self) -> Vec<NodeDescriptor> {
        self.peers
            .read()
            .await
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub async fn ids(&self) -> Vec<NodeId> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Peers whose last heartbeat is older than `timeout`.
    pub async fn stale(&self, timeout: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_heartbeat) >= timeout)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl Default for PeerPool {
    fn default() -> Self {
        Self::new()
    }
}
