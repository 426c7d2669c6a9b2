//! Cluster configuration: bind address selectors, timers, and coordinator
//! connection spec. Mirrors the defaulting style of a typical process
//! config — every field has a sane default so a minimal JSON document is
//! enough to start a node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub bindings: Bindings,
    #[serde(default)]
    pub timers: Timers,
    #[serde(default = "default_redis")]
    pub redis: RedisSpec,
    /// Enables crash-on-unhandled-rejection style dev behavior for the
    /// shutdown supervisor (spec.md §4.8).
    #[serde(default)]
    pub development: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bindings: Bindings::default(),
            timers: Timers::default(),
            redis: default_redis(),
            development: false,
        }
    }
}

/// A bind address selector, given as plain text. `transport::bindings`
/// sniffs the shape at resolve time: a CIDR block (contains `/`) picks
/// the first matching local interface address, anything else that fails
/// to parse as a literal host/`host:port` is tried as a named interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressSelector(pub String);

impl Default for AddressSelector {
    fn default() -> Self {
        AddressSelector("0.0.0.0".to_string())
    }
}

/// Publisher/router bind selectors and their default ports (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bindings {
    #[serde(default = "default_pub_selector", rename = "pub")]
    pub pub_: AddressSelector,
    #[serde(default = "default_router_selector")]
    pub router: AddressSelector,
    #[serde(default = "default_pub_port", rename = "pubPort")]
    pub pub_port: u16,
    #[serde(default = "default_router_port", rename = "routerPort")]
    pub router_port: u16,
}

impl Default for Bindings {
    fn default() -> Self {
        Self {
            pub_: default_pub_selector(),
            router: default_router_selector(),
            pub_port: default_pub_port(),
            router_port: default_router_port(),
        }
    }
}

fn default_pub_selector() -> AddressSelector {
    AddressSelector("0.0.0.0".to_string())
}

fn default_router_selector() -> AddressSelector {
    AddressSelector("0.0.0.0".to_string())
}

fn default_pub_port() -> u16 {
    7511
}

fn default_router_port() -> u16 {
    7510
}

/// Timed waits used throughout the node lifecycle (spec.md §5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timers {
    #[serde(
        default = "default_join_attempt_interval_ms",
        rename = "joinAttemptIntervalMs"
    )]
    pub join_attempt_interval_ms: u64,
    #[serde(
        default = "default_wait_for_missing_rooms_ms",
        rename = "waitForMissingRoomsMs"
    )]
    pub wait_for_missing_rooms_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms", rename = "heartbeatIntervalMs")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms", rename = "heartbeatTimeoutMs")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_coordinator_timeout_ms", rename = "coordinatorTimeoutMs")]
    pub coordinator_timeout_ms: u64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            join_attempt_interval_ms: default_join_attempt_interval_ms(),
            wait_for_missing_rooms_ms: default_wait_for_missing_rooms_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            coordinator_timeout_ms: default_coordinator_timeout_ms(),
        }
    }
}

impl Timers {
    pub fn join_attempt_interval(&self) -> Duration {
        Duration::from_millis(self.join_attempt_interval_ms)
    }

    pub fn wait_for_missing_rooms(&self) -> Duration {
        Duration::from_millis(self.wait_for_missing_rooms_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn coordinator_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator_timeout_ms)
    }
}

fn default_join_attempt_interval_ms() -> u64 {
    200
}

fn default_wait_for_missing_rooms_ms() -> u64 {
    500
}

fn default_heartbeat_interval_ms() -> u64 {
    2_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_coordinator_timeout_ms() -> u64 {
    5_000
}

/// Coordinator store connection spec: a single node, or a list for
/// cluster mode (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RedisSpec {
    Single(String),
    Cluster(Vec<String>),
}

fn default_redis() -> RedisSpec {
    RedisSpec::Single("redis://127.0.0.1:6379".to_string())
}

impl ClusterConfig {
    /// Load configuration from a JSON document, the same way
    /// `OrchestratorConfig::load` parses `.processes.json` files.
    pub fn load(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
