//! Persisted records
//!
//! The shape chunks, blocks and parts take at rest. Binary fields are raw
//! bytes, references are ids, frags are embedded in their chunk record and
//! blocks are records of their own. Shard bytes and the `is_building_*`
//! flags never reach a record.
//!
//! Decoding validates shape and never coerces: a record that does not fit
//! its entity fails with `SchemaValidation`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coding::{CodingConfig, CodingConfigId};
use crate::error::{Error, Result};
use crate::model::{
    Block, BlockId, BlockState, BucketId, Chunk, ChunkId, CipherParams, Frag, FragId, FragIndex,
    MultipartId, NodeId, ObjectId, Part, PartId, PoolId, SystemId, TierId,
};

// =============================================================================
// Coding Config
// =============================================================================

/// A coding configuration, stored once and referenced by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodingConfigRecord {
    pub id: CodingConfigId,
    pub system: SystemId,
    pub config: CodingConfig,
}

impl CodingConfigRecord {
    pub fn new(system: SystemId, config: &CodingConfig) -> Self {
        Self {
            id: config.id(),
            system,
            config: config.clone(),
        }
    }

    /// The configuration, after checking it still hashes to its id.
    pub fn into_config(self) -> Result<CodingConfig> {
        if self.config.id() != self.id {
            return Err(Error::schema(
                "coding_config",
                format!("record {} does not match its content", self.id),
            ));
        }
        Ok(self.config)
    }
}

// =============================================================================
// Chunk / Frag
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragRecord {
    pub id: FragId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parity_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lrc_index: Option<u32>,
    pub digest: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub system: SystemId,
    pub bucket: BucketId,
    pub tier: TierId,
    pub chunk_config: CodingConfigId,
    pub size: u64,
    pub compress_size: u64,
    pub frag_size: u64,
    /// Dedup identity together with `chunk_config`
    pub dedup_key: Vec<u8>,
    pub digest: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_iv: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_auth_tag: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dup_chunk: Option<ChunkId>,
    #[serde(default)]
    pub deleted: Option<DateTime<Utc>>,
    pub frags: Vec<FragRecord>,
}

impl ChunkRecord {
    pub fn is_live(&self) -> bool {
        self.deleted.is_none()
    }

    /// Dedup references share the key of the chunk they point at and are
    /// not part of the unique index.
    pub fn is_indexed(&self) -> bool {
        self.dup_chunk.is_none()
    }
}

/// A chunk record together with every block record of the chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecordSet {
    pub chunk: ChunkRecord,
    pub blocks: Vec<BlockRecord>,
}

impl ChunkRecordSet {
    /// Encode a chunk and its loaded blocks.
    pub fn from_chunk(chunk: &Chunk) -> Result<Self> {
        chunk.check_layout()?;

        let (cipher_key, cipher_iv, cipher_auth_tag) = match &chunk.cipher {
            Some(c) => (
                Some(c.key.clone()),
                Some(c.iv.clone()),
                Some(c.auth_tag.clone()),
            ),
            None => (None, None, None),
        };

        let frags = chunk
            .frags
            .iter()
            .map(|f| FragRecord {
                id: f.id,
                data_index: f.index.data_index(),
                parity_index: f.index.parity_index(),
                lrc_index: f.index.lrc_index(),
                digest: f.digest.clone(),
            })
            .collect();

        let record = ChunkRecord {
            id: chunk.id,
            system: chunk.system_id.clone(),
            bucket: chunk.bucket_id.clone(),
            tier: chunk.tier_id.clone(),
            chunk_config: chunk.coding.id(),
            size: chunk.size,
            compress_size: chunk.compress_size,
            frag_size: chunk.frag_size,
            dedup_key: chunk.digest.clone(),
            digest: chunk.digest.clone(),
            cipher_key,
            cipher_iv,
            cipher_auth_tag,
            dup_chunk: chunk.dup_chunk_id,
            deleted: chunk.deleted,
            frags,
        };

        Ok(Self {
            chunk: record,
            blocks: chunk.blocks().map(BlockRecord::from).collect(),
        })
    }

    /// Decode into a chunk using its resolved coding configuration.
    pub fn into_chunk(self, config: &CodingConfig) -> Result<Chunk> {
        let ChunkRecordSet { chunk: rec, blocks } = self;

        if rec.chunk_config != config.id() {
            return Err(Error::schema(
                "chunk",
                format!(
                    "chunk {} references coding config {}, got {}",
                    rec.id,
                    rec.chunk_config,
                    config.id()
                ),
            ));
        }
        if rec.digest.len() != config.digest_type().output_len() {
            return Err(Error::schema(
                "chunk",
                format!(
                    "chunk {} digest is {} bytes, {} needs {}",
                    rec.id,
                    rec.digest.len(),
                    config.digest_type(),
                    config.digest_type().output_len()
                ),
            ));
        }
        if rec.dedup_key.is_empty() {
            return Err(Error::schema("chunk", format!("chunk {} has no dedup_key", rec.id)));
        }

        let cipher = match (
            config.cipher_type(),
            rec.cipher_key,
            rec.cipher_iv,
            rec.cipher_auth_tag,
        ) {
            (Some(cipher_type), Some(key), Some(iv), Some(auth_tag)) => Some(CipherParams {
                cipher_type,
                key,
                iv,
                auth_tag,
            }),
            (None, None, None, None) => None,
            _ => {
                return Err(Error::schema(
                    "chunk",
                    format!(
                        "chunk {} cipher fields do not match its coding config",
                        rec.id
                    ),
                ))
            }
        };

        let frag_digest_len = config.frag_digest_type().output_len();
        let mut frags = Vec::with_capacity(rec.frags.len());
        for f in rec.frags {
            let index = FragIndex::from_parts(f.data_index, f.parity_index, f.lrc_index)?;
            if f.digest.len() != frag_digest_len {
                return Err(Error::schema(
                    "frag",
                    format!("frag {} digest is {} bytes", index, f.digest.len()),
                ));
            }
            frags.push(Frag {
                id: f.id,
                index,
                digest: f.digest,
                blocks: Vec::new(),
                data: None,
            });
        }

        for b in blocks {
            if b.chunk != rec.id {
                return Err(Error::schema(
                    "block",
                    format!("block {} belongs to chunk {}", b.id, b.chunk),
                ));
            }
            let frag = frags.iter_mut().find(|f| f.id == b.frag).ok_or_else(|| {
                Error::schema(
                    "block",
                    format!("block {} references unknown frag {}", b.id, b.frag),
                )
            })?;
            frag.blocks.push(Block::from(b));
        }

        let chunk = Chunk {
            id: rec.id,
            system_id: rec.system,
            bucket_id: rec.bucket,
            tier_id: rec.tier,
            coding: config.clone(),
            size: rec.size,
            compress_size: rec.compress_size,
            frag_size: rec.frag_size,
            digest: rec.digest,
            cipher,
            dup_chunk_id: rec.dup_chunk,
            deleted: rec.deleted,
            frags,
            is_building_blocks: false,
            is_building_frags: false,
        };
        chunk.check_layout()?;
        Ok(chunk)
    }
}

// =============================================================================
// Block
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: BlockId,
    pub system: SystemId,
    pub bucket: BucketId,
    pub node: NodeId,
    pub pool: PoolId,
    pub chunk: ChunkId,
    pub frag: FragId,
    pub size: u64,
    pub state: BlockState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reclaimed: Option<DateTime<Utc>>,
}

impl From<&Block> for BlockRecord {
    fn from(b: &Block) -> Self {
        Self {
            id: b.id,
            system: b.system_id.clone(),
            bucket: b.bucket_id.clone(),
            node: b.node_id.clone(),
            pool: b.pool_id.clone(),
            chunk: b.chunk_id,
            frag: b.frag_id,
            size: b.size,
            state: b.state,
            address: b.address.clone(),
            deleted: b.deleted,
            reclaimed: b.reclaimed,
        }
    }
}

impl From<BlockRecord> for Block {
    fn from(r: BlockRecord) -> Self {
        Self {
            id: r.id,
            system_id: r.system,
            bucket_id: r.bucket,
            chunk_id: r.chunk,
            frag_id: r.frag,
            node_id: r.node,
            pool_id: r.pool,
            size: r.size,
            address: r.address,
            state: r.state,
            deleted: r.deleted,
            reclaimed: r.reclaimed,
        }
    }
}

// =============================================================================
// Part
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub id: PartId,
    pub system: SystemId,
    pub bucket: BucketId,
    pub chunk: ChunkId,
    pub obj: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart: Option<MultipartId>,
    pub seq: u64,
    pub start: u64,
    pub end: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_offset: Option<u64>,
    #[serde(default)]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uncommitted: bool,
}

impl From<&Part> for PartRecord {
    fn from(p: &Part) -> Self {
        Self {
            id: p.id,
            system: p.system_id.clone(),
            bucket: p.bucket_id.clone(),
            chunk: p.chunk_id,
            obj: p.obj_id,
            multipart: p.multipart_id,
            seq: p.seq,
            start: p.start,
            end: p.end,
            chunk_offset: p.chunk_offset,
            deleted: p.deleted,
            uncommitted: p.uncommitted,
        }
    }
}

impl TryFrom<PartRecord> for Part {
    type Error = Error;

    fn try_from(r: PartRecord) -> Result<Self> {
        if r.end < r.start {
            return Err(Error::schema(
                "part",
                format!("part {} ends at {} before its start {}", r.id, r.end, r.start),
            ));
        }
        Ok(Part {
            id: r.id,
            system_id: r.system,
            bucket_id: r.bucket,
            obj_id: r.obj,
            multipart_id: r.multipart,
            chunk_id: r.chunk,
            seq: r.seq,
            start: r.start,
            end: r.end,
            chunk_offset: r.chunk_offset,
            uncommitted: r.uncommitted,
            deleted: r.deleted,
        })
    }
}
