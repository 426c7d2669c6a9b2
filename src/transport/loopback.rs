//! In-process fake transport: several [`LoopbackTransport`] instances
//! sharing one [`Hub`] behave like a small mesh of dialed peers, without
//! opening any real sockets. Used to drive the end-to-end scenarios in
//! spec.md §8 deterministically in tests.

use super::{Inbound, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

type RequestHandler =
    Arc<dyn Fn(Uuid, String, Value) -> BoxFuture<'static, Result<Value, TransportError>> + Send + Sync>;

struct PeerHandle {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    handler: Option<RequestHandler>,
}

/// Shared registry every [`LoopbackTransport`] in a simulated fleet joins.
#[derive(Default)]
pub struct Hub {
    peers: Mutex<HashMap<Uuid, PeerHandle>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// A transport backed by [`Hub`] instead of real sockets.
pub struct LoopbackTransport {
    id: Uuid,
    hub: Arc<Hub>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    dialed: Mutex<HashSet<Uuid>>,
}

impl LoopbackTransport {
    /// Register a new node on the hub. `handler` answers direct
    /// `send()` requests targeted at this node; pass `None` if this node
    /// never needs to answer router requests.
    pub async fn join(hub: Arc<Hub>, id: Uuid, handler: Option<RequestHandler>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.peers.lock().await.insert(
            id,
            PeerHandle {
                inbound_tx: tx,
                handler,
            },
        );

        Arc::new(Self {
            id,
            hub,
            inbound_rx: Mutex::new(rx),
            dialed: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn node_id(&self) -> Uuid {
        self.id
    }

    async fn broadcast(&self, topic: &str, payload: Value) -> Result<(), TransportError> {
        let dialed = self.dialed.lock().await.clone();
        let peers = self.hub.peers.lock().await;
        for peer_id in dialed {
            if let Some(peer) = peers.get(&peer_id) {
                // At-most-once: a full/closed channel just drops the message.
                let _ = peer.inbound_tx.send(Inbound {
                    from: self.id,
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn send(&self, peer: Uuid, topic: &str, payload: Value) -> Result<Value, TransportError> {
        let handler = {
            let peers = self.hub.peers.lock().await;
            peers
                .get(&peer)
                .ok_or_else(|| TransportError::Send(format!("unknown peer {peer}")))?
                .handler
                .clone()
        };

        match handler {
            Some(handler) => handler(self.id, topic.to_string(), payload).await,
            None => Err(TransportError::ReplyTimeout),
        }
    }

    async fn dial(
        &self,
        peer: Uuid,
        _pub_addr: &str,
        _router_addr: &str,
    ) -> Result<(), TransportError> {
        if !self.hub.peers.lock().await.contains_key(&peer) {
            return Err(TransportError::Send(format!("unknown peer {peer}")));
        }
        self.dialed.lock().await.insert(peer);
        Ok(())
    }

    async fn drop_peer(&self, peer: Uuid) {
        self.dialed.lock().await.remove(&peer);
    }

    async fn pool(&self) -> Vec<Uuid> {
        self.dialed.lock().await.iter().cloned().collect()
    }

    async fn recv(&self) -> Option<Inbound> {
        self.inbound_rx.lock().await.recv().await
    }
}
