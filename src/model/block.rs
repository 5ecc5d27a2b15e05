//! Block entity - one physical replica of a frag on a node

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BlockId, BucketId, ChunkId, FragId, NodeId, PoolId, SystemId};

/// Lifecycle of a block.
///
/// ```text
/// Allocating ──▶ Preallocated ──▶ Committed ──▶ Deleting
///                                     │
///                                     └──────▶ FutureDeleting ──▶ Deleting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    /// Chosen by the planner, nothing reserved or written yet
    #[default]
    Allocating,
    /// Space reserved on the node, write in flight
    Preallocated,
    /// Written and durable on the node
    Committed,
    /// Superseded or relocated, awaiting reclaim
    Deleting,
    /// Still readable but scheduled for deletion once a replacement commits
    FutureDeleting,
}

/// A single replica of a frag stored on a specific node.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub system_id: SystemId,
    pub bucket_id: BucketId,
    pub chunk_id: ChunkId,
    pub frag_id: FragId,
    pub node_id: NodeId,
    pub pool_id: PoolId,
    pub size: u64,
    /// Node RPC address at allocation time
    pub address: Option<String>,
    pub state: BlockState,
    /// Soft-delete marker
    pub deleted: Option<DateTime<Utc>>,
    /// Set once the bytes were physically purged from the node
    pub reclaimed: Option<DateTime<Utc>>,
}

impl Block {
    pub fn is_allocation(&self) -> bool {
        self.state == BlockState::Allocating
    }

    pub fn is_preallocated(&self) -> bool {
        self.state == BlockState::Preallocated
    }

    pub fn is_committed(&self) -> bool {
        self.state == BlockState::Committed
    }

    pub fn is_deletion(&self) -> bool {
        self.state == BlockState::Deleting
    }

    pub fn is_future_deletion(&self) -> bool {
        self.state == BlockState::FutureDeleting
    }

    /// Whether the block's bytes exist on its node.
    pub fn is_written(&self) -> bool {
        matches!(
            self.state,
            BlockState::Committed | BlockState::FutureDeleting
        )
    }

    pub fn mark_preallocated(&mut self) {
        if self.state == BlockState::Allocating {
            self.state = BlockState::Preallocated;
        }
    }

    pub fn commit(&mut self) {
        if matches!(
            self.state,
            BlockState::Allocating | BlockState::Preallocated
        ) {
            self.state = BlockState::Committed;
        }
    }

    pub fn mark_future_deletion(&mut self) {
        if self.state == BlockState::Committed {
            self.state = BlockState::FutureDeleting;
        }
    }

    /// Soft-delete the block; the timestamp is kept if already set.
    pub fn mark_deletion(&mut self, now: DateTime<Utc>) {
        self.state = BlockState::Deleting;
        self.deleted.get_or_insert(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        Block {
            id: BlockId::new(),
            system_id: SystemId::new("sys"),
            bucket_id: BucketId::new("bucket"),
            chunk_id: ChunkId::new(),
            frag_id: FragId::new(),
            node_id: NodeId::new("node-1"),
            pool_id: PoolId::new("pool-a"),
            size: 128,
            address: None,
            state: BlockState::default(),
            deleted: None,
            reclaimed: None,
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut b = block();
        assert!(b.is_allocation());
        b.mark_preallocated();
        assert!(b.is_preallocated());
        b.commit();
        assert!(b.is_committed());
        assert!(b.is_written());
        b.mark_future_deletion();
        assert!(b.is_future_deletion());
        assert!(b.is_written());

        let now = Utc::now();
        b.mark_deletion(now);
        assert!(b.is_deletion());
        assert_eq!(b.deleted, Some(now));
    }

    #[test]
    fn test_commit_does_not_resurrect_deleted_block() {
        let mut b = block();
        b.mark_deletion(Utc::now());
        b.commit();
        assert!(b.is_deletion());
        b.mark_preallocated();
        assert!(b.is_deletion());
    }
}
