//! Top-level wiring: binds the transport, joins the node, starts the
//! sync engine's inbound dispatch loop and the heartbeat/reap timers,
//! and exposes the handle the platform attaches hooks/pipes and realtime
//! overrides against (spec.md §4.1-§4.3, §9 "Cyclic references").

use crate::config::ClusterConfig;
use crate::coordinator::CoordinatorClient;
use crate::error::ClusterError;
use crate::hooks::{self, HookContext};
use crate::node::{Node, NodeDescriptor, NodeId};
use crate::platform::{AuthCollaborator, EventBus, RealtimeEngine, StrategyRegistry};
use crate::realtime::ClusterRealtime;
use crate::shutdown::ShutdownFlag;
use crate::sync::{Collaborators, SyncEngine};
use crate::transport::tcp::TcpTransport;
use crate::transport::{bindings, Transport};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running cluster node, and the background tasks that keep it alive.
/// Held by the platform for the lifetime of the process; dropping it
/// does not itself shut the node down cleanly — call
/// [`Cluster::shutdown`] first.
pub struct Cluster {
    pub node: Arc<Node>,
    pub realtime: Arc<ClusterRealtime>,
    hook_context: Arc<HookContext>,
    shutdown: Arc<ShutdownFlag>,
    tasks: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Bind the transport, join the fleet, wire the sync engine and
    /// realtime overrides, and spawn the background loops (spec.md
    /// §4.1-§4.3). `realtime_engine`/`auth` are the host's collaborators;
    /// `strategies`/`collaborators` seed the sync engine's local mirrors.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        config: ClusterConfig,
        coordinator: Arc<dyn CoordinatorClient>,
        realtime_engine: Arc<dyn RealtimeEngine>,
        auth: Arc<dyn AuthCollaborator>,
        strategies: Arc<dyn StrategyRegistry>,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>, ClusterError> {
        let id = NodeId::new();

        let pub_addr = bindings::resolve(&config.bindings.pub_, config.bindings.pub_port)
            .map_err(|e| ClusterError::Fatal(e.to_string()))?;
        let router_addr = bindings::resolve(&config.bindings.router, config.bindings.router_port)
            .map_err(|e| ClusterError::Fatal(e.to_string()))?;

        let (transport, bound_pub, bound_router) = TcpTransport::bind(id.as_uuid(), pub_addr, router_addr)
            .await
            .map_err(|e| ClusterError::Fatal(e.to_string()))?;
        let transport: Arc<dyn Transport> = transport;

        let descriptor = NodeDescriptor {
            uuid: id,
            pub_addr: bound_pub.to_string(),
            router_addr: bound_router.to_string(),
            birthdate: chrono::Utc::now().timestamp_millis(),
        };

        let node = Node::join(
            id,
            descriptor,
            transport.clone(),
            coordinator.clone(),
            strategies.as_ref(),
        )
        .await?;

        let realtime = Arc::new(ClusterRealtime {
            state: node.state.clone(),
            auth,
            wait_for_missing_rooms: config.timers.wait_for_missing_rooms(),
        });

        let hook_context = Arc::new(HookContext {
            node: node.clone(),
            realtime: realtime_engine,
            config: Arc::new(config.clone()),
            teardown: realtime.clone(),
        });

        let sync_engine = Arc::new(SyncEngine::new(
            node.state.clone(),
            coordinator.clone(),
            node.locks.clone(),
            collaborators,
        ));

        let shutdown = Arc::new(ShutdownFlag::new());

        let mut tasks = Vec::new();
        tasks.push(spawn_inbound_loop(node.clone(), sync_engine));
        tasks.push(spawn_heartbeat_loop(node.clone(), config.timers.heartbeat_interval()));
        tasks.push(spawn_reap_loop(node.clone(), config.clone()));

        info!(node = %id, pub_addr = %bound_pub, router_addr = %bound_router, "cluster node started");

        Ok(Arc::new(Self {
            node,
            realtime,
            hook_context,
            shutdown,
            tasks,
        }))
    }

    /// Install every pipe/hook from spec.md §4.6 onto the host's event
    /// bus, bound to this cluster's node (spec.md §9).
    pub fn register_hooks(&self, bus: &dyn EventBus) {
        hooks::register_all(bus, self.hook_context.clone());
    }

    /// Run the five-step shutdown sequence exactly once, then stop the
    /// background loops (spec.md §4.8).
    pub async fn shutdown(&self) {
        crate::shutdown::run(&self.node, &self.shutdown).await;
        for task in &self.tasks {
            task.abort();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.node.is_ready()
    }
}

fn spawn_inbound_loop(node: Arc<Node>, sync_engine: Arc<SyncEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(inbound) = node.transport.recv().await {
            match inbound.topic.as_str() {
                t if t == crate::transport::topics::HEARTBEAT => {
                    node.observe_heartbeat(&inbound).await;
                }
                t if t == crate::transport::topics::SYNC => {
                    match serde_json::from_value::<crate::sync::SyncEvent>(inbound.payload.clone()) {
                        Ok(event) => sync_engine.handle(event).await,
                        Err(e) => warn!("malformed cluster:sync payload: {e}"),
                    }
                }
                _ => {}
            }
        }
    })
}

fn spawn_heartbeat_loop(node: Arc<Node>, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = node.send_heartbeat().await {
                warn!("heartbeat broadcast failed: {e}");
            }
        }
    })
}

fn spawn_reap_loop(node: Arc<Node>, config: ClusterConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.timers.heartbeat_interval());
        loop {
            ticker.tick().await;
            node.reap_stale_peers(&config).await;
        }
    })
}
