//! Cluster topology (read-only container context)
//!
//! Pools, nodes, tiers, tierings and buckets as the engine sees them. The
//! engine never mutates topology; it is loaded from cluster configuration and
//! node state is refreshed through the node registry.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BucketId, NodeId, PoolId, SystemId, TierId, TieringId};
use crate::coding::CodingConfig;
use crate::error::{Error, Result};

// =============================================================================
// Pools and Nodes
// =============================================================================

/// Kind of resource backing a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    #[default]
    Hosts,
    Cloud,
    Internal,
}

/// Storage backend type of the nodes in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    #[default]
    BlockStoreFs,
    BlockStoreS3,
    BlockStoreAzure,
    BlockStoreGoogle,
}

/// A group of storage nodes of one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    #[serde(default)]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Snapshot of a storage node as reported by the node registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub pool_id: PoolId,
    /// Address negotiated by the transport layer
    pub address: String,
    #[serde(default = "default_true")]
    pub online: bool,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default = "default_true")]
    pub writable: bool,
    #[serde(default = "Utc::now")]
    pub heartbeat: DateTime<Utc>,
    /// Free bytes reported by the node, before engine reservations
    pub free_bytes: u64,
}

fn default_true() -> bool {
    true
}

impl NodeInfo {
    /// Online and heard from within `timeout` of `now`.
    pub fn is_live(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if !self.online {
            return false;
        }
        let age = now.signed_duration_since(self.heartbeat);
        match age.to_std() {
            Ok(age) => age <= timeout,
            // Heartbeat in the future: clock skew, treat as fresh
            Err(_) => true,
        }
    }

    pub fn can_read(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.readable && self.is_live(now, timeout)
    }

    pub fn can_write(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.readable && self.writable && self.is_live(now, timeout)
    }
}

// =============================================================================
// Tiers and Tierings
// =============================================================================

/// How a tier distributes the frags of a chunk across its mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataPlacement {
    /// Every mirror holds a complete copy of every frag
    #[default]
    Mirror,
    /// Frags are spread once across all candidate pools
    Spread,
}

/// A group of candidate pools within a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierMirror {
    pub spread_pools: Vec<PoolId>,
}

/// A storage policy: coding configuration plus pool selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub id: TierId,
    pub coding: CodingConfig,
    #[serde(default)]
    pub data_placement: DataPlacement,
    pub mirrors: Vec<TierMirror>,
}

impl Tier {
    /// Blocks each frag should have when the chunk is fully healthy.
    pub fn expected_blocks_per_frag(&self) -> usize {
        let replicas = self.coding.replicas() as usize;
        match self.data_placement {
            DataPlacement::Mirror => replicas * self.mirrors.len().max(1),
            DataPlacement::Spread => replicas,
        }
    }

    /// Pool groups the planner fills independently.
    ///
    /// Mirror tiers yield one group per mirror; spread tiers merge every
    /// mirror's pools into a single group.
    pub fn placement_groups(&self) -> Vec<Vec<PoolId>> {
        match self.data_placement {
            DataPlacement::Mirror => self
                .mirrors
                .iter()
                .map(|m| m.spread_pools.clone())
                .collect(),
            DataPlacement::Spread => {
                let mut pools: Vec<PoolId> = Vec::new();
                for pool in self.mirrors.iter().flat_map(|m| m.spread_pools.iter()) {
                    if !pools.contains(pool) {
                        pools.push(pool.clone());
                    }
                }
                vec![pools]
            }
        }
    }
}

/// Content-defined chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSplitConfig {
    pub avg_chunk: usize,
    pub delta_chunk: usize,
}

impl Default for ChunkSplitConfig {
    fn default() -> Self {
        Self {
            avg_chunk: 4 * 1024 * 1024,
            delta_chunk: 1024 * 1024,
        }
    }
}

/// One tier slot within a tiering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieringEntry {
    pub order: u32,
    pub tier: TierId,
    #[serde(default)]
    pub spillover: bool,
    #[serde(default)]
    pub disabled: bool,
}

/// Ordered list of tiers a bucket writes into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tiering {
    pub id: TieringId,
    #[serde(default)]
    pub chunk_split: ChunkSplitConfig,
    pub tiers: Vec<TieringEntry>,
}

impl Tiering {
    /// Enabled entries in placement order: non-spillover tiers by `order`,
    /// then spillover tiers by `order`.
    pub fn placement_order(&self) -> Vec<&TieringEntry> {
        let mut entries: Vec<&TieringEntry> = self.tiers.iter().filter(|t| !t.disabled).collect();
        entries.sort_by_key(|t| (t.spillover, t.order));
        entries
    }
}

/// A bucket and the tiering governing its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: BucketId,
    pub tiering: TieringId,
}

// =============================================================================
// Topology Catalog
// =============================================================================

/// Arena of topology entities keyed by id.
#[derive(Debug, Clone)]
pub struct Topology {
    pub system_id: SystemId,
    pools: BTreeMap<PoolId, Pool>,
    tiers: BTreeMap<TierId, Tier>,
    tierings: BTreeMap<TieringId, Tiering>,
    buckets: BTreeMap<BucketId, Bucket>,
}

impl Topology {
    pub fn new(system_id: SystemId) -> Self {
        Self {
            system_id,
            pools: BTreeMap::new(),
            tiers: BTreeMap::new(),
            tierings: BTreeMap::new(),
            buckets: BTreeMap::new(),
        }
    }

    pub fn add_pool(&mut self, pool: Pool) -> &mut Self {
        self.pools.insert(pool.id.clone(), pool);
        self
    }

    pub fn add_tier(&mut self, tier: Tier) -> &mut Self {
        self.tiers.insert(tier.id.clone(), tier);
        self
    }

    pub fn add_tiering(&mut self, tiering: Tiering) -> &mut Self {
        self.tierings.insert(tiering.id.clone(), tiering);
        self
    }

    pub fn add_bucket(&mut self, bucket: Bucket) -> &mut Self {
        self.buckets.insert(bucket.id.clone(), bucket);
        self
    }

    pub fn pool(&self, id: &PoolId) -> Result<&Pool> {
        self.pools.get(id).ok_or_else(|| Error::not_found("pool", id))
    }

    pub fn tier(&self, id: &TierId) -> Result<&Tier> {
        self.tiers.get(id).ok_or_else(|| Error::not_found("tier", id))
    }

    pub fn tiering(&self, id: &TieringId) -> Result<&Tiering> {
        self.tierings
            .get(id)
            .ok_or_else(|| Error::not_found("tiering", id))
    }

    pub fn bucket(&self, id: &BucketId) -> Result<&Bucket> {
        self.buckets
            .get(id)
            .ok_or_else(|| Error::not_found("bucket", id))
    }

    pub fn tiering_for_bucket(&self, id: &BucketId) -> Result<&Tiering> {
        let bucket = self.bucket(id)?;
        self.tiering(&bucket.tiering)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn tiers(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.values()
    }

    /// Check that every reference resolves.
    pub fn validate(&self) -> Result<()> {
        for tier in self.tiers.values() {
            if tier.mirrors.is_empty() {
                return Err(Error::Config(format!("tier {} has no mirrors", tier.id)));
            }
            for pool in tier.mirrors.iter().flat_map(|m| m.spread_pools.iter()) {
                if !self.pools.contains_key(pool) {
                    return Err(Error::Config(format!(
                        "tier {} references unknown pool {}",
                        tier.id, pool
                    )));
                }
            }
        }
        for tiering in self.tierings.values() {
            let split = tiering.chunk_split;
            if split.avg_chunk == 0 || split.delta_chunk >= split.avg_chunk {
                return Err(Error::Config(format!(
                    "tiering {} needs avg_chunk > delta_chunk >= 0",
                    tiering.id
                )));
            }
            for entry in &tiering.tiers {
                if !self.tiers.contains_key(&entry.tier) {
                    return Err(Error::Config(format!(
                        "tiering {} references unknown tier {}",
                        tiering.id, entry.tier
                    )));
                }
            }
        }
        for bucket in self.buckets.values() {
            if !self.tierings.contains_key(&bucket.tiering) {
                return Err(Error::Config(format!(
                    "bucket {} references unknown tiering {}",
                    bucket.id, bucket.tiering
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(placement: DataPlacement, mirrors: Vec<Vec<&str>>) -> Tier {
        Tier {
            id: TierId::new("t"),
            coding: CodingConfig::erasure(4, 2).replicas(1).build().unwrap(),
            data_placement: placement,
            mirrors: mirrors
                .into_iter()
                .map(|pools| TierMirror {
                    spread_pools: pools.into_iter().map(PoolId::from).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_node_liveness_window() {
        let now = Utc::now();
        let mut node = NodeInfo {
            id: NodeId::new("n1"),
            pool_id: PoolId::new("p1"),
            address: "10.0.0.1:9000".to_string(),
            online: true,
            readable: true,
            writable: true,
            heartbeat: now - chrono::Duration::seconds(30),
            free_bytes: 1 << 30,
        };
        assert!(node.is_live(now, Duration::from_secs(60)));
        assert!(!node.is_live(now, Duration::from_secs(10)));

        node.writable = false;
        assert!(node.can_read(now, Duration::from_secs(60)));
        assert!(!node.can_write(now, Duration::from_secs(60)));

        node.online = false;
        assert!(!node.can_read(now, Duration::from_secs(60)));
    }

    #[test]
    fn test_expected_blocks_per_frag() {
        assert_eq!(
            tier(DataPlacement::Mirror, vec![vec!["a"], vec!["b"]]).expected_blocks_per_frag(),
            2
        );
        assert_eq!(
            tier(DataPlacement::Spread, vec![vec!["a", "b", "c"]]).expected_blocks_per_frag(),
            1
        );
    }

    #[test]
    fn test_spread_groups_merge_mirrors() {
        let t = tier(DataPlacement::Spread, vec![vec!["a", "b"], vec!["b", "c"]]);
        let groups = t.placement_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);

        let t = tier(DataPlacement::Mirror, vec![vec!["a"], vec!["b", "c"]]);
        assert_eq!(t.placement_groups().len(), 2);
    }

    #[test]
    fn test_placement_order_puts_spillover_last() {
        let tiering = Tiering {
            id: TieringId::new("tiering"),
            chunk_split: ChunkSplitConfig::default(),
            tiers: vec![
                TieringEntry {
                    order: 0,
                    tier: TierId::new("spill"),
                    spillover: true,
                    disabled: false,
                },
                TieringEntry {
                    order: 1,
                    tier: TierId::new("main"),
                    spillover: false,
                    disabled: false,
                },
                TieringEntry {
                    order: 2,
                    tier: TierId::new("off"),
                    spillover: false,
                    disabled: true,
                },
            ],
        };
        let order: Vec<_> = tiering
            .placement_order()
            .iter()
            .map(|e| e.tier.as_str())
            .collect();
        assert_eq!(order, vec!["main", "spill"]);
    }

    #[test]
    fn test_validate_catches_dangling_pool() {
        let mut topo = Topology::new(SystemId::new("sys"));
        topo.add_tier(tier(DataPlacement::Mirror, vec![vec!["missing"]]));
        assert!(topo.validate().is_err());
    }
}
