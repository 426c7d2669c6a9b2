//! Per-node cluster coordinator: peer discovery, a replicated
//! subscription-room state replica, a node-to-node messaging fabric,
//! hooks/pipes intercepting local realtime operations, realtime
//! count/list overrides, and a shutdown supervisor.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hooks;
pub mod node;
pub mod platform;
pub mod realtime;
pub mod shutdown;
pub mod state;
pub mod sync;
pub mod transport;

pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use error::ClusterError;
pub use node::{Node, NodeDescriptor, NodeId};

/// Installs an `EnvFilter`-driven `tracing` subscriber, the same way the
/// teacher's standalone processes do at startup. The host embedding this
/// crate calls this once before starting a [`Cluster`]; library code
/// never calls it itself.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
