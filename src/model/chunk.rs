//! Chunk and Frag entities
//!
//! A chunk owns its frags and each frag owns the blocks loaded for it. Upward
//! references (block to frag/chunk/pool/node) are identifiers only, so the
//! graph is a tree in memory and a set of keyed tables at rest.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::block::Block;
use super::ids::{BucketId, ChunkId, FragId, SystemId, TierId};
use crate::coding::{CipherType, CodingConfig};
use crate::error::{Error, Result};

// =============================================================================
// Frag Index
// =============================================================================

/// Position of a frag inside its chunk's coding layout.
///
/// The string form (`D0`, `P1`, `L0`) is stable and used as the frag key on
/// every representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FragIndex {
    /// Data shard
    Data(u32),
    /// Global parity shard
    Parity(u32),
    /// Local reconstruction parity shard
    Lrc(u32),
}

impl FragIndex {
    /// Parse the stable string form.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::schema("frag", format!("invalid frag_index '{}'", s));
        let (kind, num) = s.split_at_checked(1).ok_or_else(bad)?;
        let n: u32 = num.parse().map_err(|_| bad())?;
        match kind {
            "D" => Ok(FragIndex::Data(n)),
            "P" => Ok(FragIndex::Parity(n)),
            "L" => Ok(FragIndex::Lrc(n)),
            _ => Err(bad()),
        }
    }

    pub fn data_index(&self) -> Option<u32> {
        match self {
            FragIndex::Data(i) => Some(*i),
            _ => None,
        }
    }

    pub fn parity_index(&self) -> Option<u32> {
        match self {
            FragIndex::Parity(i) => Some(*i),
            _ => None,
        }
    }

    pub fn lrc_index(&self) -> Option<u32> {
        match self {
            FragIndex::Lrc(i) => Some(*i),
            _ => None,
        }
    }

    /// Build from the three optional index fields used by wire and records.
    /// Exactly one must be present.
    pub fn from_parts(
        data_index: Option<u32>,
        parity_index: Option<u32>,
        lrc_index: Option<u32>,
    ) -> Result<Self> {
        match (data_index, parity_index, lrc_index) {
            (Some(i), None, None) => Ok(FragIndex::Data(i)),
            (None, Some(i), None) => Ok(FragIndex::Parity(i)),
            (None, None, Some(i)) => Ok(FragIndex::Lrc(i)),
            other => Err(Error::schema(
                "frag",
                format!("expected exactly one frag index, got {:?}", other),
            )),
        }
    }

    /// All frag indices of a coding layout, data first, then parity, then LRC.
    pub fn layout(config: &CodingConfig) -> Vec<FragIndex> {
        let data = (0..config.data_frags()).map(FragIndex::Data);
        let parity = (0..config.parity_frags()).map(FragIndex::Parity);
        let lrc = (0..config.lrc_frags_total()).map(FragIndex::Lrc);
        data.chain(parity).chain(lrc).collect()
    }
}

impl std::fmt::Display for FragIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FragIndex::Data(i) => write!(f, "D{}", i),
            FragIndex::Parity(i) => write!(f, "P{}", i),
            FragIndex::Lrc(i) => write!(f, "L{}", i),
        }
    }
}

// =============================================================================
// Frag
// =============================================================================

/// One data, parity or LRC shard of a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Frag {
    pub id: FragId,
    pub index: FragIndex,
    /// Digest of the shard bytes (chunk's `frag_digest_type`)
    pub digest: Vec<u8>,
    /// Replicas loaded for this frag
    pub blocks: Vec<Block>,
    /// Shard bytes, held only while the chunk is being encoded or rebuilt
    pub data: Option<Bytes>,
}

impl Frag {
    pub fn new(index: FragIndex, digest: Vec<u8>) -> Self {
        Self {
            id: FragId::new(),
            index,
            digest,
            blocks: Vec::new(),
            data: None,
        }
    }
}

// =============================================================================
// Chunk
// =============================================================================

/// Key material for an encrypted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherParams {
    pub cipher_type: CipherType,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

/// Content-addressed unit of erasure-coded object data.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: ChunkId,
    pub system_id: SystemId,
    pub bucket_id: BucketId,
    pub tier_id: TierId,
    pub coding: CodingConfig,
    /// Plain chunk size
    pub size: u64,
    /// Size after compression (and encryption, which preserves length)
    pub compress_size: u64,
    /// Size of every frag, including padding
    pub frag_size: u64,
    /// Content digest of the plain chunk (`coding.digest_type()`)
    pub digest: Vec<u8>,
    pub cipher: Option<CipherParams>,
    /// Earlier chunk holding identical content
    pub dup_chunk_id: Option<ChunkId>,
    /// Soft-delete marker
    pub deleted: Option<DateTime<Utc>>,
    pub frags: Vec<Frag>,
    pub is_building_blocks: bool,
    pub is_building_frags: bool,
}

impl Chunk {
    /// In-memory reference to an existing chunk with identical content.
    ///
    /// The returned chunk owns no frags; reads resolve through `dup_chunk_id`.
    pub fn dedup_of(existing: &Chunk) -> Self {
        Self {
            id: ChunkId::new(),
            frags: Vec::new(),
            dup_chunk_id: Some(existing.id),
            is_building_blocks: false,
            is_building_frags: false,
            deleted: None,
            ..existing.clone_without_frags()
        }
    }

    fn clone_without_frags(&self) -> Self {
        Self {
            id: self.id,
            system_id: self.system_id.clone(),
            bucket_id: self.bucket_id.clone(),
            tier_id: self.tier_id.clone(),
            coding: self.coding.clone(),
            size: self.size,
            compress_size: self.compress_size,
            frag_size: self.frag_size,
            digest: self.digest.clone(),
            cipher: self.cipher.clone(),
            dup_chunk_id: self.dup_chunk_id,
            deleted: self.deleted,
            frags: Vec::new(),
            is_building_blocks: self.is_building_blocks,
            is_building_frags: self.is_building_frags,
        }
    }

    /// Chunk id that actually holds the data.
    pub fn data_chunk_id(&self) -> ChunkId {
        self.dup_chunk_id.unwrap_or(self.id)
    }

    pub fn is_dedup_reference(&self) -> bool {
        self.dup_chunk_id.is_some()
    }

    pub fn frag(&self, index: FragIndex) -> Option<&Frag> {
        self.frags.iter().find(|f| f.index == index)
    }

    pub fn frag_mut(&mut self, index: FragIndex) -> Option<&mut Frag> {
        self.frags.iter_mut().find(|f| f.index == index)
    }

    /// All blocks of all frags.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.frags.iter().flat_map(|f| f.blocks.iter())
    }

    /// Drop the in-memory shard bytes once blocks are written.
    pub fn clear_frag_data(&mut self) {
        for frag in &mut self.frags {
            frag.data = None;
        }
    }

    /// Check the structural invariants of a chunk that owns its data.
    ///
    /// Dedup references must own no frags; data chunks must own exactly the
    /// layout of their coding configuration, with unique indices, and every
    /// block must point back at its own chunk and frag.
    pub fn check_layout(&self) -> Result<()> {
        if self.dup_chunk_id.is_some() {
            if !self.frags.is_empty() {
                return Err(Error::schema("chunk", "dedup reference owns frags"));
            }
            return Ok(());
        }

        let expected = FragIndex::layout(&self.coding);
        if self.frags.len() != expected.len() {
            return Err(Error::schema(
                "chunk",
                format!(
                    "chunk {} has {} frags, coding requires {}",
                    self.id,
                    self.frags.len(),
                    expected.len()
                ),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for frag in &self.frags {
            if !expected.contains(&frag.index) || !seen.insert(frag.index) {
                return Err(Error::schema(
                    "chunk",
                    format!("chunk {} has unexpected or duplicate frag {}", self.id, frag.index),
                ));
            }
            for block in &frag.blocks {
                if block.chunk_id != self.id || block.frag_id != frag.id {
                    return Err(Error::schema(
                        "block",
                        format!("block {} does not belong to frag {}", block.id, frag.index),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::CodingConfig;

    #[test]
    fn test_frag_index_string_form() {
        assert_eq!(FragIndex::Data(3).to_string(), "D3");
        assert_eq!(FragIndex::Parity(0).to_string(), "P0");
        assert_eq!(FragIndex::Lrc(12).to_string(), "L12");
        assert_eq!(FragIndex::parse("L12").unwrap(), FragIndex::Lrc(12));
        assert!(FragIndex::parse("X1").is_err());
        assert!(FragIndex::parse("D").is_err());
        assert!(FragIndex::parse("").is_err());
    }

    #[test]
    fn test_frag_index_from_parts() {
        assert_eq!(
            FragIndex::from_parts(None, Some(1), None).unwrap(),
            FragIndex::Parity(1)
        );
        assert!(FragIndex::from_parts(Some(0), Some(1), None).is_err());
        assert!(FragIndex::from_parts(None, None, None).is_err());
    }

    #[test]
    fn test_layout_is_unique_and_complete() {
        let config = CodingConfig::erasure_with_lrc(4, 2, 2, 1).build().unwrap();
        let layout = FragIndex::layout(&config);
        assert_eq!(layout.len(), 8);
        let unique: std::collections::HashSet<_> = layout.iter().collect();
        assert_eq!(unique.len(), 8);
        assert_eq!(layout[0], FragIndex::Data(0));
        assert_eq!(layout[4], FragIndex::Parity(0));
        assert_eq!(layout[7], FragIndex::Lrc(1));
    }
}
