//! Production [`Transport`] over plain TCP sockets.
//!
//! Two listeners per node (spec.md §4.2):
//! - the **publisher** listener accepts connections from peers that want
//!   to receive this node's fan-out broadcasts;
//! - the **router** listener accepts connections from peers that want to
//!   send this node direct request/reply queries.
//!
//! Framing is the length-prefixed JSON envelope in [`super::wire`].

use super::wire::{read_frame, write_frame, Envelope};
use super::{Inbound, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

const HELLO_TOPIC: &str = "__hello__";
const REPLY_TOPIC: &str = "__reply__";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type RequestHandler =
    Arc<dyn Fn(Uuid, String, Value) -> futures::future::BoxFuture<'static, Value> + Send + Sync>;

struct Subscriber {
    writer: Mutex<WriteHalf<TcpStream>>,
}

struct RouterClient {
    writer: Mutex<WriteHalf<TcpStream>>,
}

/// A request/reply envelope body: `{"request_id": n, "body": ...}`.
#[derive(serde::Serialize, serde::Deserialize)]
struct Correlated {
    request_id: u64,
    body: Value,
}

pub struct TcpTransport {
    id: Uuid,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    router_clients: RwLock<HashMap<Uuid, RouterClient>>,
    pending_replies: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_request_id: AtomicU64,
    request_handler: RwLock<Option<RequestHandler>>,
}

impl TcpTransport {
    /// Bind the publisher and router listeners and spawn their accept
    /// loops. Returns the transport plus the concrete addresses bound,
    /// so the node can advertise them in the discovery set.
    pub async fn bind(
        id: Uuid,
        pub_addr: SocketAddr,
        router_addr: SocketAddr,
    ) -> Result<(Arc<Self>, SocketAddr, SocketAddr), TransportError> {
        let pub_listener = TcpListener::bind(pub_addr)
            .await
            .map_err(|e| TransportError::Bind(pub_addr.to_string(), e))?;
        let router_listener = TcpListener::bind(router_addr)
            .await
            .map_err(|e| TransportError::Bind(router_addr.to_string(), e))?;

        let bound_pub = pub_listener
            .local_addr()
            .map_err(|e| TransportError::Bind(pub_addr.to_string(), e))?;
        let bound_router = router_listener
            .local_addr()
            .map_err(|e| TransportError::Bind(router_addr.to_string(), e))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            id,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            subscribers: RwLock::new(HashMap::new()),
            router_clients: RwLock::new(HashMap::new()),
            pending_replies: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            request_handler: RwLock::new(None),
        });

        transport.clone().spawn_publisher_accept_loop(pub_listener);
        transport.clone().spawn_router_accept_loop(router_listener);

        Ok((transport, bound_pub, bound_router))
    }

    /// Install the handler invoked for every inbound router request.
    pub async fn set_request_handler(&self, handler: RequestHandler) {
        *self.request_handler.write().await = Some(handler);
    }

    fn spawn_publisher_accept_loop(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("publisher accept failed: {e}");
                        continue;
                    }
                };
                let this = self.clone();
                tokio::spawn(async move { this.handle_subscriber(stream, peer_addr).await });
            }
        });
    }

    fn spawn_router_accept_loop(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("router accept failed: {e}");
                        continue;
                    }
                };
                let this = self.clone();
                tokio::spawn(async move { this.handle_router_connection(stream, peer_addr).await });
            }
        });
    }

    /// A peer connected to our publisher port: read its HELLO, register
    /// it as a subscriber, then keep the connection open purely to
    /// detect disconnection (subscribers never send anything else).
    async fn handle_subscriber(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let (mut reader, writer) = tokio::io::split(stream);

        let hello = match read_frame(&mut reader).await {
            Ok(envelope) if envelope.topic == HELLO_TOPIC => envelope,
            Ok(_) => {
                warn!("subscriber {peer_addr} skipped HELLO handshake");
                return;
            }
            Err(e) => {
                warn!("subscriber {peer_addr} handshake failed: {e}");
                return;
            }
        };

        let Some(peer_id) = hello
            .payload
            .get("uuid")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            warn!("subscriber {peer_addr} sent malformed HELLO");
            return;
        };

        self.subscribers.write().await.insert(
            peer_id,
            Subscriber {
                writer: Mutex::new(writer),
            },
        );

        debug!("subscriber {peer_id} ({peer_addr}) registered");

        // Drain the connection until it closes so we can deregister promptly.
        loop {
            if read_frame(&mut reader).await.is_err() {
                break;
            }
        }
        self.subscribers.write().await.remove(&peer_id);
    }

    /// A peer connected to our router port: read request frames, invoke
    /// the installed handler, write back correlated reply frames.
    async fn handle_router_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let (mut reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(writer));

        loop {
            let envelope = match read_frame(&mut reader).await {
                Ok(envelope) => envelope,
                Err(_) => break,
            };

            let Ok(correlated) = serde_json::from_value::<Correlated>(envelope.payload.clone())
            else {
                warn!("router request from {peer_addr} missing correlation envelope");
                continue;
            };

            let handler = self.request_handler.read().await.clone();
            let from = self.id;
            let topic = envelope.topic.clone();
            let writer = writer.clone();

            tokio::spawn(async move {
                let reply_body = match handler {
                    Some(handler) => handler(from, topic, correlated.body).await,
                    None => Value::Null,
                };

                let reply = Envelope::new(
                    REPLY_TOPIC,
                    serde_json::json!({ "request_id": correlated.request_id, "body": reply_body }),
                );
                let mut guard = writer.lock().await;
                let _ = write_frame(&mut *guard, &reply).await;
            });
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn node_id(&self) -> Uuid {
        self.id
    }

    async fn broadcast(&self, topic: &str, payload: Value) -> Result<(), TransportError> {
        let envelope = Envelope::new(topic, payload);
        let mut dead = Vec::new();

        for (peer_id, subscriber) in self.subscribers.read().await.iter() {
            let mut writer = subscriber.writer.lock().await;
            if write_frame(&mut *writer, &envelope).await.is_err() {
                dead.push(*peer_id);
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for peer_id in dead {
                subscribers.remove(&peer_id);
            }
        }

        Ok(())
    }

    async fn send(&self, peer: Uuid, topic: &str, payload: Value) -> Result<Value, TransportError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_replies
            .lock()
            .await
            .insert(request_id, reply_tx);

        let envelope = Envelope::new(
            topic,
            serde_json::json!({ "request_id": request_id, "body": payload }),
        );

        {
            let clients = self.router_clients.read().await;
            let client = clients
                .get(&peer)
                .ok_or_else(|| TransportError::Send(format!("no router connection to {peer}")))?;
            let mut writer = client.writer.lock().await;
            write_frame(&mut *writer, &envelope).await?;
        }

        match timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            _ => {
                self.pending_replies.lock().await.remove(&request_id);
                Err(TransportError::ReplyTimeout)
            }
        }
    }

    async fn dial(
        &self,
        peer: Uuid,
        pub_addr: &str,
        router_addr: &str,
    ) -> Result<(), TransportError> {
        // Subscribe to the peer's publisher: connect, send HELLO, then
        // forward every frame we read into our inbound queue.
        let pub_stream = TcpStream::connect(pub_addr)
            .await
            .map_err(|e| TransportError::Send(format!("connect to {pub_addr} failed: {e}")))?;
        let (mut reader, mut writer) = tokio::io::split(pub_stream);
        let hello = Envelope::new(HELLO_TOPIC, serde_json::json!({ "uuid": self.id.to_string() }));
        write_frame(&mut writer, &hello).await?;

        let inbound_tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(envelope) => {
                        let _ = inbound_tx.send(Inbound {
                            from: peer,
                            topic: envelope.topic,
                            payload: envelope.payload,
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        // Connect a persistent router client for targeted requests.
        let router_stream = TcpStream::connect(router_addr)
            .await
            .map_err(|e| TransportError::Send(format!("connect to {router_addr} failed: {e}")))?;
        let (mut reply_reader, reply_writer) = tokio::io::split(router_stream);

        self.router_clients.write().await.insert(
            peer,
            RouterClient {
                writer: Mutex::new(reply_writer),
            },
        );

        let pending_replies = self.pending_replies.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reply_reader).await {
                    Ok(envelope) if envelope.topic == REPLY_TOPIC => {
                        if let Ok(correlated) =
                            serde_json::from_value::<Correlated>(envelope.payload)
                        {
                            if let Some(tx) =
                                pending_replies.lock().await.remove(&correlated.request_id)
                            {
                                let _ = tx.send(correlated.body);
                            }
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        });

        Ok(())
    }

    async fn drop_peer(&self, peer: Uuid) {
        self.subscribers.write().await.remove(&peer);
        self.router_clients.write().await.remove(&peer);
    }

    async fn pool(&self) -> Vec<Uuid> {
        let subs = self.subscribers.read().await.keys().cloned();
        let routers = self.router_clients.read().await.keys().cloned().collect::<Vec<_>>();
        subs.chain(routers).collect::<std::collections::HashSet<_>>().into_iter().collect()
    }

    async fn recv(&self) -> Option<Inbound> {
        self.inbound_rx.lock().await.recv().await
    }
}
