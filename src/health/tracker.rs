//! Health tracker
//!
//! Turns chunk snapshots into health reports and rebuild requests. Expected
//! block counts come from the chunk's tier.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::accessibility::{evaluate_chunk, ChunkHealth};
use crate::domain::ports::NodeRegistry;
use crate::model::{Chunk, ChunkId, FragIndex, NodeId, Topology};

/// Frags of one chunk that need new blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildRequest {
    pub chunk_id: ChunkId,
    pub frags: BTreeSet<FragIndex>,
    /// Previous attempts that failed with a retryable error
    pub attempt: u32,
}

impl RebuildRequest {
    pub fn new(chunk_id: ChunkId, frags: impl IntoIterator<Item = FragIndex>) -> Self {
        Self {
            chunk_id,
            frags: frags.into_iter().collect(),
            attempt: 0,
        }
    }

    /// Fold a later request for the same chunk into this one.
    pub fn merge(&mut self, other: RebuildRequest) {
        self.frags.extend(other.frags);
        self.attempt = self.attempt.max(other.attempt);
    }

    pub fn frag_list(&self) -> Vec<FragIndex> {
        self.frags.iter().copied().collect()
    }
}

/// Result of evaluating one chunk.
#[derive(Debug, Clone)]
pub struct HealthVerdict {
    pub health: ChunkHealth,
    pub request: Option<RebuildRequest>,
}

pub struct HealthTracker {
    topology: Arc<Topology>,
    registry: Arc<dyn NodeRegistry>,
    liveness_timeout: Duration,
}

impl HealthTracker {
    pub fn new(
        topology: Arc<Topology>,
        registry: Arc<dyn NodeRegistry>,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            topology,
            registry,
            liveness_timeout,
        }
    }

    /// Blocks a fully healthy frag of `chunk` should have.
    ///
    /// Chunks whose tier is no longer configured fall back to the replica
    /// count of their coding configuration.
    pub fn expected_blocks(&self, chunk: &Chunk) -> usize {
        self.topology
            .tier(&chunk.tier_id)
            .map(|t| t.expected_blocks_per_frag())
            .unwrap_or(chunk.coding.replicas() as usize)
    }

    pub fn evaluate(&self, chunk: &Chunk) -> ChunkHealth {
        evaluate_chunk(
            chunk,
            self.expected_blocks(chunk),
            self.registry.as_ref(),
            Utc::now(),
            self.liveness_timeout,
        )
    }

    /// Evaluate `chunk` and build a rebuild request when it is inaccessible
    /// or any frag is below its expected block count.
    pub fn check(&self, chunk: &Chunk) -> HealthVerdict {
        let health = self.evaluate(chunk);
        let request = if chunk.is_dedup_reference() || chunk.deleted.is_some() {
            None
        } else if health.needs_rebuild() {
            Some(RebuildRequest::new(chunk.id, health.deficient_frags()))
        } else {
            None
        };
        HealthVerdict { health, request }
    }

    /// Whether any block of `chunk` lives on `node`.
    pub fn touches_node(chunk: &Chunk, node: &NodeId) -> bool {
        chunk.blocks().any(|b| &b.node_id == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StaticNodeRegistry;
    use crate::coding::CodingConfig;
    use crate::model::{DataPlacement, PoolId, SystemId, Tier, TierId, TierMirror};
    use crate::schema::test_support::sample_chunk;

    fn tracker(chunk: &Chunk, mirrors: usize) -> (HealthTracker, Arc<StaticNodeRegistry>) {
        let mut topology = Topology::new(SystemId::new("sys"));
        topology.add_tier(Tier {
            id: chunk.tier_id.clone(),
            coding: chunk.coding.clone(),
            data_placement: DataPlacement::Mirror,
            mirrors: (0..mirrors)
                .map(|i| TierMirror {
                    spread_pools: vec![PoolId::new(format!("pool-{}", i))],
                })
                .collect(),
        });

        let registry = Arc::new(StaticNodeRegistry::new());
        for block in chunk.blocks() {
            registry.upsert(crate::model::NodeInfo {
                id: block.node_id.clone(),
                pool_id: block.pool_id.clone(),
                address: format!("{}:9000", block.node_id),
                online: true,
                readable: true,
                writable: true,
                heartbeat: Utc::now(),
                free_bytes: 1 << 30,
            });
        }
        let tracker = HealthTracker::new(
            Arc::new(topology),
            registry.clone(),
            Duration::from_secs(60),
        );
        (tracker, registry)
    }

    #[test]
    fn test_healthy_chunk_needs_nothing() {
        let config = CodingConfig::erasure(4, 2).replicas(2).build().unwrap();
        let chunk = sample_chunk(&config, 2);
        let (tracker, _) = tracker(&chunk, 1);

        let verdict = tracker.check(&chunk);
        assert!(verdict.health.accessible);
        assert!(verdict.request.is_none());
    }

    #[test]
    fn test_offline_replicas_request_rebuild_but_stay_accessible() {
        let config = CodingConfig::erasure(4, 2).replicas(2).build().unwrap();
        let chunk = sample_chunk(&config, 2);
        let (tracker, registry) = tracker(&chunk, 1);

        // one replica of three different frags goes away
        let offline: Vec<NodeId> = chunk
            .frags
            .iter()
            .take(3)
            .map(|f| f.blocks[0].node_id.clone())
            .collect();
        for node in &offline {
            registry.set_online(node, false);
        }

        let verdict = tracker.check(&chunk);
        assert!(verdict.health.accessible);
        let request = verdict.request.unwrap();
        assert_eq!(
            request.frag_list(),
            vec![FragIndex::Data(0), FragIndex::Data(1), FragIndex::Data(2)]
        );
    }

    #[test]
    fn test_expected_blocks_fall_back_to_replicas() {
        let config = CodingConfig::mirror(3).build().unwrap();
        let mut chunk = sample_chunk(&config, 3);
        let (tracker, _) = tracker(&chunk, 2);
        assert_eq!(tracker.expected_blocks(&chunk), 6);

        chunk.tier_id = TierId::new("gone");
        assert_eq!(tracker.expected_blocks(&chunk), 3);
    }

    #[test]
    fn test_merge_unions_frags() {
        let id = ChunkId::new();
        let mut a = RebuildRequest::new(id, [FragIndex::Data(0)]);
        let mut b = RebuildRequest::new(id, [FragIndex::Data(0), FragIndex::Parity(1)]);
        b.attempt = 2;
        a.merge(b);
        assert_eq!(a.frags.len(), 2);
        assert_eq!(a.attempt, 2);
    }
}
