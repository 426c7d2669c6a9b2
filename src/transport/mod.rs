//! Node-to-node messaging fabric: a publisher socket for fan-out
//! broadcast and a router socket for direct request/reply (spec.md §4.2).
//!
//! [`Transport`] is the trait every other subsystem programs against.
//! [`tcp::TcpTransport`] is the production implementation over plain
//! TCP sockets; [`loopback::LoopbackTransport`] is an in-process fake
//! used by tests to simulate a multi-node fleet without real sockets.

pub mod bindings;
pub mod loopback;
pub mod tcp;
pub mod wire;

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Topics used on the fabric (spec.md §4.2).
pub mod topics {
    pub const HEARTBEAT: &str = "cluster:heartbeat";
    pub const SYNC: &str = "cluster:sync";
    pub const NOTIFY_DOCUMENT: &str = "cluster:notify:document";
    pub const NOTIFY_USER: &str = "cluster:notify:user";
    pub const ADMIN_RESET_SECURITY: &str = "cluster:admin:resetSecurity";
    pub const ADMIN_DUMP: &str = "cluster:admin:dump";
    pub const ADMIN_SHUTDOWN: &str = "cluster:admin:shutdown";
    pub const READY: &str = "cluster:ready";
}

/// An inbound message received from a peer, either via the publisher
/// fan-out or a direct router request.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: Uuid,
    pub topic: String,
    pub payload: Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// This node's own identifier on the fabric.
    fn node_id(&self) -> Uuid;

    /// Fan out a message to every dialed peer's publisher subscription.
    /// Delivery is at-most-once (spec.md §4.2).
    async fn broadcast(&self, topic: &str, payload: Value) -> Result<(), TransportError>;

    /// Send a direct request to one peer's router endpoint and await its
    /// reply.
    async fn send(&self, peer: Uuid, topic: &str, payload: Value) -> Result<Value, TransportError>;

    /// Dial a peer's publisher and router endpoints, adding it to the
    /// live pool.
    async fn dial(&self, peer: Uuid, pub_addr: &str, router_addr: &str)
        -> Result<(), TransportError>;

    /// Drop a peer from the live pool (heartbeat timeout or shutdown
    /// cleanup).
    async fn drop_peer(&self, peer: Uuid);

    /// Peer uuids currently in the live pool.
    async fn pool(&self) -> Vec<Uuid>;

    /// Receive the next inbound message from any subscribed peer.
    async fn recv(&self) -> Option<Inbound>;
}
