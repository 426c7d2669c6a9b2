//! Node identity and descriptor types (spec.md §3, "Node descriptor").

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// This node's identity on the fabric, assigned at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `{uuid, pub, router, birthdate}` (spec.md §3). Created at startup,
/// inserted into discovery once the transport is bound, removed on
/// shutdown or swept by another node's `cleanNode` cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub uuid: NodeId,
    pub pub_addr: String,
    pub router_addr: String,
    pub birthdate: i64,
}

/// A peer known to this node, tracked for heartbeat/staleness detection
/// (spec.md §4.3, "Peer lifecycle").
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub descriptor: NodeDescriptor,
    pub last_heartbeat: std::time::Instant,
}
