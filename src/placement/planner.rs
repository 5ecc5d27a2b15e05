//! Placement Planner
//!
//! Chooses a tier for a chunk and a (pool, node) for each of its blocks.
//!
//! ```text
//!   Tiering ──▶ tiers by order (non-spillover first, then spillover)
//!                  │
//!                  ▼ coding matches chunk?
//!   Tier ──▶ placement groups ──▶ per block: pool ──▶ node ──▶ reserve
//!            Mirror: one group per mirror, replicas blocks per frag each
//!            Spread: all pools in one group, one block per pool
//! ```
//!
//! Choices are deterministic for a given registry snapshot:
//! - pool key: (blocks of this chunk in pool, available bytes desc, pool id)
//! - node key: (blocks of this chunk on node, available bytes desc, node id)
//!
//! A node never hosts two blocks of the same frag.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::reservation::ReservationTable;
use crate::domain::ports::NodeRegistry;
use crate::error::{Error, Result};
use crate::health::ChunkHealth;
use crate::model::{
    Block, BlockId, BlockState, Chunk, DataPlacement, FragId, FragIndex, NodeId, NodeInfo, PoolId,
    Tier, TierId, Tiering, Topology,
};

// =============================================================================
// Status Report
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub pool_id: PoolId,
    /// Known pool with at least one writable node
    pub valid_for_allocation: bool,
    pub online_nodes: usize,
    pub total_nodes: usize,
    /// Free bytes on writable nodes minus outstanding reservations
    pub available_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorStatus {
    pub pools: Vec<PoolStatus>,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    pub tier_id: TierId,
    pub data_placement: DataPlacement,
    pub mirrors: Vec<MirrorStatus>,
}

impl TierStatus {
    /// Whether every mirror has at least one pool that can take blocks.
    pub fn is_writable(&self) -> bool {
        !self.mirrors.is_empty()
            && self
                .mirrors
                .iter()
                .all(|m| m.pools.iter().any(|p| p.valid_for_allocation))
    }
}

// =============================================================================
// Planning State
// =============================================================================

/// One block to place: which frag, which placement group.
#[derive(Debug, Clone, Copy)]
struct Slot {
    frag: FragId,
    group: usize,
}

#[derive(Debug, Clone)]
struct Planned {
    frag: FragId,
    node: NodeInfo,
}

/// Per-plan bookkeeping over a registry snapshot.
struct PlanState {
    size: u64,
    spread: bool,
    nodes: HashMap<PoolId, Vec<NodeInfo>>,
    available: HashMap<NodeId, u64>,
    blocks_on_node: HashMap<NodeId, usize>,
    blocks_in_pool: HashMap<PoolId, usize>,
    frag_nodes: HashMap<FragId, HashSet<NodeId>>,
}

impl PlanState {
    fn seed(&mut self, block: &Block) {
        *self.blocks_on_node.entry(block.node_id.clone()).or_default() += 1;
        *self.blocks_in_pool.entry(block.pool_id.clone()).or_default() += 1;
        self.frag_nodes
            .entry(block.frag_id)
            .or_default()
            .insert(block.node_id.clone());
    }

    fn available(&self, node: &NodeId) -> u64 {
        self.available.get(node).copied().unwrap_or(0)
    }

    fn eligible_nodes<'a>(&'a self, pool: &PoolId, frag: FragId) -> Vec<&'a NodeInfo> {
        let used = self.frag_nodes.get(&frag);
        self.nodes
            .get(pool)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter(|n| self.available(&n.id) >= self.size)
                    .filter(|n| used.map(|u| !u.contains(&n.id)).unwrap_or(true))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn pool_available(&self, pool: &PoolId) -> u64 {
        self.nodes
            .get(pool)
            .map(|nodes| nodes.iter().map(|n| self.available(&n.id)).sum())
            .unwrap_or(0)
    }

    fn place(&mut self, slot: Slot, pools: &[PoolId]) -> Option<Planned> {
        let mut candidates: Vec<&PoolId> = pools
            .iter()
            .filter(|p| !self.spread || self.blocks_in_pool.get(*p).copied().unwrap_or(0) == 0)
            .filter(|p| !self.eligible_nodes(p, slot.frag).is_empty())
            .collect();
        candidates.sort_by_key(|p| {
            (
                self.blocks_in_pool.get(*p).copied().unwrap_or(0),
                Reverse(self.pool_available(p)),
                (*p).clone(),
            )
        });
        let pool = candidates.first().map(|p| (*p).clone())?;

        let mut nodes = self.eligible_nodes(&pool, slot.frag);
        nodes.sort_by_key(|n| {
            (
                self.blocks_on_node.get(&n.id).copied().unwrap_or(0),
                Reverse(self.available(&n.id)),
                n.id.clone(),
            )
        });
        let node = nodes.first().map(|n| (*n).clone())?;

        *self.blocks_on_node.entry(node.id.clone()).or_default() += 1;
        *self.blocks_in_pool.entry(pool).or_default() += 1;
        self.frag_nodes
            .entry(slot.frag)
            .or_default()
            .insert(node.id.clone());
        if let Some(avail) = self.available.get_mut(&node.id) {
            *avail = avail.saturating_sub(self.size);
        }
        Some(Planned {
            frag: slot.frag,
            node,
        })
    }
}

// =============================================================================
// Planner
// =============================================================================

/// Plans block placement against the topology and the live node view.
pub struct PlacementPlanner {
    topology: Arc<Topology>,
    registry: Arc<dyn NodeRegistry>,
    reservations: Arc<ReservationTable>,
    liveness_timeout: Duration,
}

impl std::fmt::Debug for PlacementPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacementPlanner")
            .field("system", &self.topology.system_id)
            .field("reservations", &self.reservations.len())
            .finish()
    }
}

impl PlacementPlanner {
    pub fn new(
        topology: Arc<Topology>,
        registry: Arc<dyn NodeRegistry>,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            topology,
            registry,
            reservations: Arc::new(ReservationTable::new()),
            liveness_timeout,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn reservations(&self) -> &ReservationTable {
        &self.reservations
    }

    /// Pick the tier a chunk of `chunk_size` plain bytes will be stored in,
    /// without reserving anything.
    pub fn select_tier(&self, tiering: &Tiering, chunk_size: u64) -> Result<&Tier> {
        let mut reasons = Vec::new();
        for entry in tiering.placement_order() {
            let tier = self.topology.tier(&entry.tier)?;
            let frag_size = estimated_frag_size(chunk_size, tier.coding.data_frags());
            let frags: Vec<FragId> = FragIndex::layout(&tier.coding)
                .iter()
                .map(|_| FragId::new())
                .collect();
            let slots = full_slots(tier, &frags);
            match self.plan(tier, &slots, frag_size, &[], Utc::now()) {
                Ok(_) => return Ok(tier),
                Err(Error::InsufficientPoolCapacity(reason)) => reasons.push(reason),
                Err(e) => return Err(e),
            }
        }
        Err(no_tier(tiering, &reasons))
    }

    /// Place every block of a freshly encoded chunk.
    ///
    /// Tries tiers in placement order, skipping tiers with a different coding
    /// configuration. On success the chunk's `tier_id` is updated and every
    /// frag carries its `Preallocated` blocks; returns the block count.
    #[instrument(skip(self, chunk, tiering), fields(chunk_id = %chunk.id, tiering = %tiering.id))]
    pub fn allocate_chunk(&self, chunk: &mut Chunk, tiering: &Tiering) -> Result<usize> {
        let mut reasons = Vec::new();
        for entry in tiering.placement_order() {
            let tier = self.topology.tier(&entry.tier)?;
            if tier.coding != chunk.coding {
                continue;
            }
            let frags: Vec<FragId> = chunk.frags.iter().map(|f| f.id).collect();
            let slots = full_slots(tier, &frags);
            match self.plan_and_reserve(tier, chunk, &slots, &[]) {
                Ok(blocks) => {
                    let count = blocks.len();
                    chunk.tier_id = tier.id.clone();
                    attach(chunk, blocks);
                    debug!(tier = %tier.id, blocks = count, spillover = entry.spillover, "Chunk placed");
                    return Ok(count);
                }
                Err(Error::InsufficientPoolCapacity(reason)) => {
                    debug!(tier = %tier.id, %reason, "Tier cannot host chunk");
                    reasons.push(reason);
                }
                Err(e) => return Err(e),
            }
        }
        Err(no_tier(tiering, &reasons))
    }

    /// Place replacement blocks for `frags` of a stored chunk.
    ///
    /// Counts the blocks `health` reports accessible, per mirror for mirror
    /// tiers, and adds only what is missing. New blocks are attached to the
    /// chunk in `Preallocated` state; their ids are returned.
    #[instrument(skip(self, chunk, health), fields(chunk_id = %chunk.id))]
    pub fn allocate_frags(
        &self,
        chunk: &mut Chunk,
        frags: &[FragIndex],
        health: &ChunkHealth,
    ) -> Result<Vec<BlockId>> {
        let tier = self.topology.tier(&chunk.tier_id)?;
        let groups = tier.placement_groups();
        let replicas = tier.coding.replicas() as usize;

        let accessible: Vec<Block> = chunk
            .blocks()
            .filter(|b| health.is_block_accessible(&b.id))
            .cloned()
            .collect();

        let mut slots = Vec::new();
        for index in frags {
            let frag = chunk
                .frag(*index)
                .ok_or_else(|| Error::not_found("frag", format!("{}/{}", chunk.id, index)))?;
            let have: Vec<&Block> = accessible.iter().filter(|b| b.frag_id == frag.id).collect();
            match tier.data_placement {
                DataPlacement::Spread => {
                    for _ in have.len()..replicas {
                        slots.push(Slot {
                            frag: frag.id,
                            group: 0,
                        });
                    }
                }
                DataPlacement::Mirror => {
                    for (g, pools) in groups.iter().enumerate() {
                        let in_group = have.iter().filter(|b| pools.contains(&b.pool_id)).count();
                        for _ in in_group..replicas {
                            slots.push(Slot {
                                frag: frag.id,
                                group: g,
                            });
                        }
                    }
                }
            }
        }

        if slots.is_empty() {
            return Ok(Vec::new());
        }
        let existing: Vec<&Block> = accessible.iter().collect();
        let blocks = self.plan_and_reserve(tier, chunk, &slots, &existing)?;
        let ids = blocks.iter().map(|b| b.id).collect();
        attach(chunk, blocks);
        Ok(ids)
    }

    /// Drop the space reservation of a committed or abandoned block.
    pub fn release(&self, block: &Block) {
        self.reservations.release(&block.node_id, &block.id);
    }

    /// Capacity and eligibility of a tier's pools.
    pub fn tier_status(&self, tier_id: &TierId) -> Result<TierStatus> {
        let tier = self.topology.tier(tier_id)?;
        let now = Utc::now();

        let mirrors = tier
            .mirrors
            .iter()
            .map(|mirror| {
                let pools: Vec<PoolStatus> = mirror
                    .spread_pools
                    .iter()
                    .map(|pool_id| {
                        let known = self.topology.pool(pool_id).is_ok();
                        let nodes = self.registry.nodes_in_pool(pool_id);
                        let writable: Vec<&NodeInfo> = nodes
                            .iter()
                            .filter(|n| n.can_write(now, self.liveness_timeout))
                            .collect();
                        PoolStatus {
                            pool_id: pool_id.clone(),
                            valid_for_allocation: known && !writable.is_empty(),
                            online_nodes: nodes
                                .iter()
                                .filter(|n| n.is_live(now, self.liveness_timeout))
                                .count(),
                            total_nodes: nodes.len(),
                            available_bytes: writable.iter().map(|n| self.node_available(n)).sum(),
                        }
                    })
                    .collect();
                MirrorStatus {
                    available_bytes: pools.iter().map(|p| p.available_bytes).sum(),
                    pools,
                }
            })
            .collect();

        Ok(TierStatus {
            tier_id: tier.id.clone(),
            data_placement: tier.data_placement,
            mirrors,
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn node_available(&self, node: &NodeInfo) -> u64 {
        node.free_bytes
            .saturating_sub(self.reservations.reserved(&node.id))
    }

    fn snapshot(&self, groups: &[Vec<PoolId>], now: DateTime<Utc>) -> HashMap<PoolId, Vec<NodeInfo>> {
        let mut nodes = HashMap::new();
        for pool in groups.iter().flatten() {
            if nodes.contains_key(pool) || self.topology.pool(pool).is_err() {
                continue;
            }
            let writable: Vec<NodeInfo> = self
                .registry
                .nodes_in_pool(pool)
                .into_iter()
                .filter(|n| n.can_write(now, self.liveness_timeout))
                .collect();
            nodes.insert(pool.clone(), writable);
        }
        nodes
    }

    fn plan(
        &self,
        tier: &Tier,
        slots: &[Slot],
        size: u64,
        existing: &[&Block],
        now: DateTime<Utc>,
    ) -> Result<Vec<Planned>> {
        let groups = tier.placement_groups();
        let nodes = self.snapshot(&groups, now);
        let available = nodes
            .values()
            .flatten()
            .map(|n| (n.id.clone(), self.node_available(n)))
            .collect();

        let mut state = PlanState {
            size,
            spread: tier.data_placement == DataPlacement::Spread,
            nodes,
            available,
            blocks_on_node: HashMap::new(),
            blocks_in_pool: HashMap::new(),
            frag_nodes: HashMap::new(),
        };
        for block in existing {
            state.seed(block);
        }

        let mut planned = Vec::with_capacity(slots.len());
        for slot in slots {
            let pools = groups.get(slot.group).map(Vec::as_slice).unwrap_or(&[]);
            match state.place(*slot, pools) {
                Some(p) => planned.push(p),
                None => {
                    return Err(Error::InsufficientPoolCapacity(format!(
                        "tier {} placed {} of {} blocks of {} bytes",
                        tier.id,
                        planned.len(),
                        slots.len(),
                        size
                    )))
                }
            }
        }
        Ok(planned)
    }

    fn plan_and_reserve(
        &self,
        tier: &Tier,
        chunk: &Chunk,
        slots: &[Slot],
        existing: &[&Block],
    ) -> Result<Vec<Block>> {
        let size = chunk.frag_size.max(1);
        let planned = self.plan(tier, slots, size, existing, Utc::now())?;

        let mut blocks: Vec<Block> = Vec::with_capacity(planned.len());
        for p in planned {
            let mut block = Block {
                id: BlockId::new(),
                system_id: chunk.system_id.clone(),
                bucket_id: chunk.bucket_id.clone(),
                chunk_id: chunk.id,
                frag_id: p.frag,
                node_id: p.node.id.clone(),
                pool_id: p.node.pool_id.clone(),
                size,
                address: Some(p.node.address.clone()),
                state: BlockState::Allocating,
                deleted: None,
                reclaimed: None,
            };
            if !self
                .reservations
                .try_reserve(&block.node_id, block.id, size, p.node.free_bytes)
            {
                warn!(node = %block.node_id, "Reservation lost to a concurrent planner");
                for b in &blocks {
                    self.release(b);
                }
                return Err(Error::InsufficientPoolCapacity(format!(
                    "node {} filled up during placement",
                    block.node_id
                )));
            }
            block.mark_preallocated();
            blocks.push(block);
        }
        Ok(blocks)
    }
}

fn estimated_frag_size(chunk_size: u64, data_frags: u32) -> u64 {
    chunk_size.div_ceil(data_frags.max(1) as u64).max(1)
}

/// Slots for every block of a chunk stored in `tier`.
fn full_slots(tier: &Tier, frags: &[FragId]) -> Vec<Slot> {
    let replicas = tier.coding.replicas() as usize;
    let groups = match tier.data_placement {
        DataPlacement::Mirror => tier.mirrors.len(),
        DataPlacement::Spread => 1,
    };
    let mut slots = Vec::with_capacity(groups * frags.len() * replicas);
    for group in 0..groups {
        for frag in frags {
            for _ in 0..replicas {
                slots.push(Slot { frag: *frag, group });
            }
        }
    }
    slots
}

fn attach(chunk: &mut Chunk, blocks: Vec<Block>) {
    for block in blocks {
        if let Some(frag) = chunk.frags.iter_mut().find(|f| f.id == block.frag_id) {
            frag.blocks.push(block);
        }
    }
}

fn no_tier(tiering: &Tiering, reasons: &[String]) -> Error {
    Error::InsufficientPoolCapacity(format!(
        "no tier of tiering {} can host the chunk: [{}]",
        tiering.id,
        reasons.join("; ")
    ))
}
