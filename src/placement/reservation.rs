//! Per-node space reservations
//!
//! Planned blocks reserve their size on the target node until they commit or
//! are abandoned. Check-then-reserve happens under the node's map entry lock,
//! so two planners can never both claim the last free bytes of a node.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::model::{BlockId, NodeId};

#[derive(Debug, Default)]
struct NodeReservations {
    bytes: u64,
    blocks: HashMap<BlockId, u64>,
}

#[derive(Debug, Default)]
pub struct ReservationTable {
    nodes: DashMap<NodeId, NodeReservations>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently reserved on `node`.
    pub fn reserved(&self, node: &NodeId) -> u64 {
        self.nodes.get(node).map(|r| r.bytes).unwrap_or(0)
    }

    /// Reserve `size` bytes for `block` if the node still has room within
    /// `free_bytes`. Reserving the same block twice is a no-op.
    pub fn try_reserve(&self, node: &NodeId, block: BlockId, size: u64, free_bytes: u64) -> bool {
        let mut entry = self.nodes.entry(node.clone()).or_default();
        if entry.blocks.contains_key(&block) {
            return true;
        }
        if entry.bytes.saturating_add(size) > free_bytes {
            return false;
        }
        entry.bytes += size;
        entry.blocks.insert(block, size);
        true
    }

    /// Drop the reservation of `block`. Returns false if none was held.
    pub fn release(&self, node: &NodeId, block: &BlockId) -> bool {
        let Some(mut entry) = self.nodes.get_mut(node) else {
            return false;
        };
        match entry.blocks.remove(block) {
            Some(size) => {
                entry.bytes = entry.bytes.saturating_sub(size);
                true
            }
            None => false,
        }
    }

    /// Number of blocks holding reservations across all nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().map(|r| r.blocks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_and_release() {
        let table = ReservationTable::new();
        let node = NodeId::new("n1");
        let (a, b) = (BlockId::new(), BlockId::new());

        assert!(table.try_reserve(&node, a, 60, 100));
        assert!(!table.try_reserve(&node, b, 60, 100));
        assert!(table.try_reserve(&node, a, 60, 100));
        assert_eq!(table.reserved(&node), 60);

        assert!(table.release(&node, &a));
        assert!(!table.release(&node, &a));
        assert!(table.try_reserve(&node, b, 60, 100));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_concurrent_reservations_never_overcommit() {
        let table = Arc::new(ReservationTable::new());
        let node = NodeId::new("n1");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = table.clone();
                let node = node.clone();
                std::thread::spawn(move || table.try_reserve(&node, BlockId::new(), 10, 75))
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 7);
        assert_eq!(table.reserved(&node), 70);
    }
}
