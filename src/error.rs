//! Crate-wide error taxonomy.
//!
//! Every subsystem (coordinator, transport, sync, hooks, realtime overrides)
//! funnels its failures into [`ClusterError`] so callers can match on the
//! error *kind* (transient vs. fatal vs. caller mistake) rather than on a
//! subsystem-specific type.

use crate::state::Tag;

/// Top-level error type for the cluster coordinator.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Coordinator round-trip failed transiently (timeout, reconnect in
    /// progress). Retried internally for setup operations, surfaced as-is
    /// for hot-path operations.
    #[error("coordinator unavailable for {tag}: {source}")]
    TransientCoordinator {
        tag: Tag,
        #[source]
        source: CoordinatorError,
    },

    /// Send to a peer failed or the peer is gone. Dropped by callers;
    /// heartbeat-driven cleanup repairs the fleet view.
    #[error("peer {peer} unreachable: {reason}")]
    TransientPeer { peer: String, reason: String },

    /// Caller supplied something the operation cannot act on (missing
    /// `roomId`, unknown sync event, malformed bind address, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation requires `node.ready` and the node has not finished
    /// its initial sync yet.
    #[error("node not ready")]
    NotReady,

    /// Unrecoverable startup failure (coordinator scripts refused to
    /// register, transport bind failed). Propagates and aborts startup.
    #[error("fatal cluster error: {0}")]
    Fatal(String),
}

/// Errors from the coordinator client (before classification into
/// [`ClusterError::TransientCoordinator`] or [`ClusterError::Fatal`]).
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator connection error: {0}")]
    Connection(String),
    #[error("coordinator script error: {0}")]
    Script(String),
    #[error("coordinator returned malformed reply: {0}")]
    MalformedReply(String),
    #[error("coordinator operation timed out")]
    Timeout,
}

impl From<redis::RedisError> for CoordinatorError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            CoordinatorError::Timeout
        } else if e.is_io_error() {
            CoordinatorError::Connection(e.to_string())
        } else {
            CoordinatorError::Script(e.to_string())
        }
    }
}

/// Errors from the node-to-node transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("failed to resolve bind address {0}")]
    UnresolvableAddress(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("peer did not reply before timeout")]
    ReplyTimeout,
    #[error("malformed frame: {0}")]
    Framing(String),
}
