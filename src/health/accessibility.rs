//! Accessibility computation
//!
//! Pure functions over a chunk snapshot and the current node states. No I/O
//! happens here; the tracker and the rebuild workers call into this with
//! whatever the registry reported at that moment.
//!
//! ```text
//! block accessible  ⇔ node online ∧ readable ∧ heartbeat fresh
//!                     ∧ ¬deleting ∧ written (not an open allocation)
//! frag accessible   ⇔ ≥ 1 accessible block
//! chunk accessible  ⇔ data + parity + locally repairable data ≥ data_frags
//! ```

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::ports::NodeRegistry;
use crate::model::{Block, BlockId, Chunk, ChunkId, FragId, FragIndex, NodeInfo};

/// Whether a single block can currently be read.
pub fn is_block_accessible(
    block: &Block,
    node: Option<&NodeInfo>,
    now: DateTime<Utc>,
    liveness_timeout: Duration,
) -> bool {
    if block.is_deletion() || !block.is_written() {
        return false;
    }
    match node {
        Some(node) => node.can_read(now, liveness_timeout),
        None => false,
    }
}

// =============================================================================
// Health Report
// =============================================================================

/// Health of one frag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragHealth {
    pub index: FragIndex,
    pub frag_id: FragId,
    pub accessible_blocks: usize,
    pub expected_blocks: usize,
    /// Blocks that exist but cannot be read
    pub inaccessible_blocks: Vec<BlockId>,
}

impl FragHealth {
    pub fn is_accessible(&self) -> bool {
        self.accessible_blocks > 0
    }

    /// Fewer accessible blocks than the tier requires.
    pub fn is_deficient(&self) -> bool {
        self.accessible_blocks < self.expected_blocks
    }

    /// Blocks to add to bring the frag back to full redundancy.
    pub fn missing_blocks(&self) -> usize {
        self.expected_blocks.saturating_sub(self.accessible_blocks)
    }
}

/// Health of a chunk at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHealth {
    pub chunk_id: ChunkId,
    pub accessible: bool,
    /// Frags usable for decoding, counting locally repairable data frags
    pub available_frags: usize,
    pub required_frags: usize,
    pub frags: Vec<FragHealth>,
    accessible_blocks: HashSet<BlockId>,
}

impl ChunkHealth {
    /// Frags below their expected block count, in layout order.
    pub fn deficient_frags(&self) -> Vec<FragIndex> {
        self.frags
            .iter()
            .filter(|f| f.is_deficient())
            .map(|f| f.index)
            .collect()
    }

    pub fn needs_rebuild(&self) -> bool {
        !self.accessible || self.frags.iter().any(|f| f.is_deficient())
    }

    pub fn is_block_accessible(&self, id: &BlockId) -> bool {
        self.accessible_blocks.contains(id)
    }

    pub fn frag(&self, index: FragIndex) -> Option<&FragHealth> {
        self.frags.iter().find(|f| f.index == index)
    }

    /// Accessible frags only (ignoring LRC repair).
    pub fn accessible_frags(&self) -> Vec<FragIndex> {
        self.frags
            .iter()
            .filter(|f| f.is_accessible())
            .map(|f| f.index)
            .collect()
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Evaluate the health of a data chunk.
///
/// Dedup references carry no frags and evaluate as inaccessible; resolve
/// them to their data chunk first.
pub fn evaluate_chunk(
    chunk: &Chunk,
    expected_blocks_per_frag: usize,
    registry: &dyn NodeRegistry,
    now: DateTime<Utc>,
    liveness_timeout: Duration,
) -> ChunkHealth {
    let mut accessible_blocks = HashSet::new();
    let mut frags = Vec::with_capacity(chunk.frags.len());

    for frag in &chunk.frags {
        let mut accessible = 0;
        let mut inaccessible = Vec::new();
        for block in &frag.blocks {
            let node = registry.node(&block.node_id);
            if is_block_accessible(block, node.as_ref(), now, liveness_timeout) {
                accessible += 1;
                accessible_blocks.insert(block.id);
            } else if !block.is_deletion() {
                inaccessible.push(block.id);
            }
        }
        frags.push(FragHealth {
            index: frag.index,
            frag_id: frag.id,
            accessible_blocks: accessible,
            expected_blocks: expected_blocks_per_frag,
            inaccessible_blocks: inaccessible,
        });
    }

    let required = chunk.coding.data_frags() as usize;
    let available = available_frags(chunk, &frags);

    ChunkHealth {
        chunk_id: chunk.id,
        accessible: !frags.is_empty() && available >= required,
        available_frags: available,
        required_frags: required,
        frags,
        accessible_blocks,
    }
}

/// accessible data + accessible global parity + locally repairable data.
fn available_frags(chunk: &Chunk, frags: &[FragHealth]) -> usize {
    let k = chunk.coding.data_frags() as usize;
    let mut data_present = vec![false; k];
    let mut parity = 0;
    let mut lrc_present = vec![false; chunk.coding.lrc_frags_total() as usize];

    for f in frags.iter().filter(|f| f.is_accessible()) {
        match f.index {
            FragIndex::Data(i) => {
                if let Some(slot) = data_present.get_mut(i as usize) {
                    *slot = true;
                }
            }
            FragIndex::Parity(_) => parity += 1,
            FragIndex::Lrc(i) => {
                if let Some(slot) = lrc_present.get_mut(i as usize) {
                    *slot = true;
                }
            }
        }
    }

    let data = data_present.iter().filter(|p| **p).count();
    let repairable = match chunk.coding.lrc() {
        Some((group, lrc_frags, _)) => {
            let (group, lrc_frags) = (group as usize, lrc_frags as usize);
            (0..chunk.coding.lrc_groups() as usize)
                .map(|g| {
                    let missing = data_present[g * group..(g + 1) * group]
                        .iter()
                        .filter(|p| !**p)
                        .count();
                    let local = lrc_present[g * lrc_frags..(g + 1) * lrc_frags]
                        .iter()
                        .filter(|p| **p)
                        .count();
                    if missing <= local {
                        missing
                    } else {
                        0
                    }
                })
                .sum()
        }
        None => 0,
    };

    data + parity + repairable
}
