//! Coordinator client: a thin wrapper over an external key-value store
//! supporting hashes, sets, and atomic multi-key scripts (spec.md §4.1).
//!
//! [`CoordinatorClient`] is the trait every other subsystem programs
//! against; [`RedisCoordinator`] is the production implementation backed
//! by the `redis` crate, and [`fake::InMemoryCoordinator`] is an
//! in-process fake used by tests so the end-to-end scenarios in spec.md
//! §8 can run without a real Redis instance.

pub mod fake;

use crate::error::CoordinatorError;
use crate::state::{Room, Tag};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;

const SUB_ON_SCRIPT: &str = include_str!("scripts/subOn.lua");
const SUB_OFF_SCRIPT: &str = include_str!("scripts/suboff.lua");
const CLEAN_NODE_SCRIPT: &str = include_str!("scripts/cleanNode.lua");
const GET_STATE_SCRIPT: &str = include_str!("scripts/getState.lua");

pub const DISCOVERY_SET_KEY: &str = "cluster:discovery";
pub const STRATEGIES_HASH_KEY: &str = "cluster:strategies";
pub const COLLECTIONS_SET_KEY: &str = "cluster:collections";

/// Result of `subOn`/`subOff`: the new per-tag version and the fleet-wide
/// total subscriber count for the room touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubResult {
    pub version: u64,
    pub total_count: u64,
}

/// A peer binding as stored in the discovery set (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerBinding {
    pub pub_addr: String,
    pub router_addr: String,
}

/// A registered auth strategy entry (spec.md §3, strategy registry).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StrategyEntry {
    pub plugin: String,
    pub strategy: String,
}

#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn sub_on(
        &self,
        tag: &Tag,
        node_uuid: &str,
        room_id: &str,
        connection_id: &str,
        filter: Option<&str>,
    ) -> Result<SubResult, CoordinatorError>;

    async fn sub_off(
        &self,
        tag: &Tag,
        node_uuid: &str,
        room_id: &str,
        connection_id: &str,
    ) -> Result<SubResult, CoordinatorError>;

    async fn clean_node(&self, tag: &Tag, node_uuid: &str) -> Result<u64, CoordinatorError>;

    async fn get_state(&self, tag: &Tag) -> Result<(u64, Vec<Room>), CoordinatorError>;

    async fn discovery_add(&self, peer: &PeerBinding) -> Result<(), CoordinatorError>;
    async fn discovery_remove(&self, peer: &PeerBinding) -> Result<(), CoordinatorError>;
    async fn discovery_members(&self) -> Result<Vec<PeerBinding>, CoordinatorError>;

    async fn strategies_set(
        &self,
        name: &str,
        entry: &StrategyEntry,
    ) -> Result<(), CoordinatorError>;
    async fn strategies_remove(&self, name: &str) -> Result<(), CoordinatorError>;
    async fn strategies_all(&self) -> Result<HashMap<String, StrategyEntry>, CoordinatorError>;

    async fn collections_add(&self, tag: &Tag) -> Result<(), CoordinatorError>;
    async fn collections_all(&self) -> Result<Vec<Tag>, CoordinatorError>;
}

/// Production coordinator client, backed by a `redis` multiplexed,
/// auto-reconnecting connection.
pub struct RedisCoordinator {
    conn: ConnectionManager,
    sub_on: Script,
    sub_off: Script,
    clean_node: Script,
    get_state: Script,
}

impl RedisCoordinator {
    pub async fn connect(url: &str) -> Result<Self, CoordinatorError> {
        let client = redis::Client::open(url).map_err(CoordinatorError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(CoordinatorError::from)?;

        Ok(Self {
            conn,
            sub_on: Script::new(SUB_ON_SCRIPT),
            sub_off: Script::new(SUB_OFF_SCRIPT),
            clean_node: Script::new(CLEAN_NODE_SCRIPT),
            get_state: Script::new(GET_STATE_SCRIPT),
        })
    }
}

#[async_trait]
impl CoordinatorClient for RedisCoordinator {
    async fn sub_on(
        &self,
        tag: &Tag,
        node_uuid: &str,
        room_id: &str,
        connection_id: &str,
        filter: Option<&str>,
    ) -> Result<SubResult, CoordinatorError> {
        let mut conn = self.conn.clone();
        let (version, total_count): (u64, u64) = self
            .sub_on
            .key(tag.as_str())
            .arg(node_uuid)
            .arg(room_id)
            .arg(connection_id)
            .arg(filter.unwrap_or("none"))
            .invoke_async(&mut conn)
            .await
            .map_err(CoordinatorError::from)?;
        Ok(SubResult {
            version,
            total_count,
        })
    }

    async fn sub_off(
        &self,
        tag: &Tag,
        node_uuid: &str,
        room_id: &str,
        connection_id: &str,
    ) -> Result<SubResult, CoordinatorError> {
        let mut conn = self.conn.clone();
        let (version, total_count): (u64, u64) = self
            .sub_off
            .key(tag.as_str())
            .arg(node_uuid)
            .arg(room_id)
            .arg(connection_id)
            .invoke_async(&mut conn)
            .await
            .map_err(CoordinatorError::from)?;
        Ok(SubResult {
            version,
            total_count,
        })
    }

    async fn clean_node(&self, tag: &Tag, node_uuid: &str) -> Result<u64, CoordinatorError> {
        let mut conn = self.conn.clone();
        let version: u64 = self
            .clean_node
            .key(tag.as_str())
            .arg(node_uuid)
            .invoke_async(&mut conn)
            .await
            .map_err(CoordinatorError::from)?;
        Ok(version)
    }

    async fn get_state(&self, tag: &Tag) -> Result<(u64, Vec<Room>), CoordinatorError> {
        let mut conn = self.conn.clone();
        let (version, raw): (u64, Vec<Vec<String>>) = self
            .get_state
            .key(tag.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(CoordinatorError::from)?;

        let (index, collection) = tag.split();
        let rooms = raw
            .into_iter()
            .filter_map(|entry| {
                let room_id = entry.first()?.clone();
                let count: u64 = entry.get(1)?.parse().ok()?;
                Some(Room {
                    room_id,
                    index: index.clone(),
                    collection: collection.clone(),
                    count,
                })
            })
            .collect();

        Ok((version, rooms))
    }

    async fn discovery_add(&self, peer: &PeerBinding) -> Result<(), CoordinatorError> {
        let mut conn = self.conn.clone();
        let encoded = serde_json::to_string(peer)
            .map_err(|e| CoordinatorError::MalformedReply(e.to_string()))?;
        conn.sadd::<_, _, ()>(DISCOVERY_SET_KEY, encoded)
            .await
            .map_err(CoordinatorError::from)
    }

    async fn discovery_remove(&self, peer: &PeerBinding) -> Result<(), CoordinatorError> {
        let mut conn = self.conn.clone();
        let encoded = serde_json::to_string(peer)
            .map_err(|e| CoordinatorError::MalformedReply(e.to_string()))?;
        conn.srem::<_, _, ()>(DISCOVERY_SET_KEY, encoded)
            .await
            .map_err(CoordinatorError::from)
    }

    async fn discovery_members(&self) -> Result<Vec<PeerBinding>, CoordinatorError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .smembers(DISCOVERY_SET_KEY)
            .await
            .map_err(CoordinatorError::from)?;
        raw.into_iter()
            .map(|s| {
                serde_json::from_str(&s).map_err(|e| CoordinatorError::MalformedReply(e.to_string()))
            })
            .collect()
    }

    async fn strategies_set(
        &self,
        name: &str,
        entry: &StrategyEntry,
    ) -> Result<(), CoordinatorError> {
        let mut conn = self.conn.clone();
        let encoded = serde_json::to_string(entry)
            .map_err(|e| CoordinatorError::MalformedReply(e.to_string()))?;
        conn.hset::<_, _, _, ()>(STRATEGIES_HASH_KEY, name, encoded)
            .await
            .map_err(CoordinatorError::from)
    }

    async fn strategies_remove(&self, name: &str) -> Result<(), CoordinatorError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(STRATEGIES_HASH_KEY, name)
            .await
            .map_err(CoordinatorError::from)
    }

    async fn strategies_all(&self) -> Result<HashMap<String, StrategyEntry>, CoordinatorError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn
            .hgetall(STRATEGIES_HASH_KEY)
            .await
            .map_err(CoordinatorError::from)?;
        raw.into_iter()
            .map(|(name, value)| {
                let entry: StrategyEntry = serde_json::from_str(&value)
                    .map_err(|e| CoordinatorError::MalformedReply(e.to_string()))?;
                Ok((name, entry))
            })
            .collect()
    }

    async fn collections_add(&self, tag: &Tag) -> Result<(), CoordinatorError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(COLLECTIONS_SET_KEY, tag.as_str())
            .await
            .map_err(CoordinatorError::from)
    }

    async fn collections_all(&self) -> Result<Vec<Tag>, CoordinatorError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .smembers(COLLECTIONS_SET_KEY)
            .await
            .map_err(CoordinatorError::from)?;
        Ok(raw.into_iter().map(Tag).collect())
    }
}
