//! In-memory Block Store
//!
//! `BlockStore` keeping block bytes in a map. Nodes can be marked failing so
//! tests can exercise write failures and unreadable replicas without a real
//! cluster.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::domain::ports::BlockStore;
use crate::error::{Error, Result};
use crate::model::{BlockId, NodeId};
use crate::schema::wire::BlockMd;

#[derive(Debug, Default)]
pub struct InMemoryBlockStore {
    blocks: DashMap<BlockId, Bytes>,
    failing_nodes: DashSet<NodeId>,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read and write on `node` fail until cleared.
    pub fn fail_node(&self, node: impl Into<NodeId>) {
        self.failing_nodes.insert(node.into());
    }

    pub fn heal_node(&self, node: &NodeId) {
        self.failing_nodes.remove(node);
    }

    /// Overwrite stored bytes, bypassing digest checks.
    pub fn corrupt(&self, id: &BlockId, data: Bytes) -> bool {
        match self.blocks.get_mut(id) {
            Some(mut entry) => {
                *entry = data;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn check_node(&self, md: &BlockMd, write: bool) -> Result<()> {
        if self.failing_nodes.contains(&NodeId::new(md.node.clone())) {
            let reason = format!("node {} unavailable", md.node);
            return Err(if write {
                Error::BlockWrite {
                    block_id: md.id.clone(),
                    reason,
                }
            } else {
                Error::BlockRead {
                    block_id: md.id.clone(),
                    reason,
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlockStore for InMemoryBlockStore {
    async fn write_block(&self, md: &BlockMd, data: Bytes) -> Result<()> {
        self.check_node(md, true)?;
        if data.len() as u64 != md.size {
            return Err(Error::BlockWrite {
                block_id: md.id.clone(),
                reason: format!("got {} bytes, block size is {}", data.len(), md.size),
            });
        }
        if let (Some(digest_type), Some(expected)) = (md.digest_type, md.digest()?) {
            if digest_type.digest(&data) != expected {
                return Err(Error::DigestMismatch {
                    what: format!("block {}", md.id),
                });
            }
        }

        self.blocks.insert(md.block_id()?, data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(block_id = %md.id, node = %md.node, size = md.size, "Block written");
        Ok(())
    }

    async fn read_block(&self, md: &BlockMd) -> Result<Bytes> {
        self.check_node(md, false)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.blocks
            .get(&md.block_id()?)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::BlockRead {
                block_id: md.id.clone(),
                reason: "block not found".to_string(),
            })
    }

    async fn delete_blocks(&self, mds: &[BlockMd]) -> Result<()> {
        for md in mds {
            match md.block_id() {
                Ok(id) => {
                    self.blocks.remove(&id);
                }
                Err(e) => warn!(block_id = %md.id, error = %e, "Skipping malformed block id"),
            }
        }
        Ok(())
    }
}
