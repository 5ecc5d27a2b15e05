//! Wire representation
//!
//! JSON shapes exchanged with the object-protocol façade and the block-store
//! collaborator. Binary fields travel as base64 strings, ids as opaque
//! strings. Block lifecycle is exposed as the `is_*` flags; `is_accessible`
//! is derived from a health report on output and ignored on input.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coding::{CodingConfig, DigestType};
use crate::error::{Error, Result};
use crate::health::ChunkHealth;
use crate::model::{
    Block, BlockId, BlockState, BucketId, Chunk, ChunkId, CipherParams, Frag, FragId, FragIndex,
    MultipartId, NodeId, NodeType, ObjectId, Part, PartId, PoolId, SystemId, TierId,
};

fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn unb64(entity: &'static str, field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::schema(entity, format!("{} is not valid base64: {}", field, e)))
}

// =============================================================================
// Block
// =============================================================================

/// Block metadata handed to the block store for reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMd {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub node: String,
    pub pool: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_type: Option<DigestType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_preallocated: bool,
}

impl BlockMd {
    /// Metadata for `block`, carrying the digest of the frag it stores.
    pub fn for_block(block: &Block, frag: &Frag, frag_digest_type: DigestType) -> Self {
        Self {
            id: block.id.to_string(),
            address: block.address.clone(),
            node: block.node_id.to_string(),
            pool: block.pool_id.to_string(),
            size: block.size,
            digest_type: Some(frag_digest_type),
            digest_b64: Some(b64(&frag.digest)),
            node_type: None,
            is_preallocated: block.is_preallocated(),
        }
    }

    pub fn block_id(&self) -> Result<BlockId> {
        BlockId::parse(&self.id)
    }

    /// Raw digest the stored bytes must match, if one was sent.
    pub fn digest(&self) -> Result<Option<Vec<u8>>> {
        self.digest_b64
            .as_deref()
            .map(|d| unb64("block", "digest_b64", d))
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_md: BlockMd,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_accessible: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_allocation: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_deletion: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_future_deletion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaimed: Option<DateTime<Utc>>,
}

impl BlockInfo {
    fn from_block(block: &Block, frag: &Frag, chunk: &Chunk, health: Option<&ChunkHealth>) -> Self {
        Self {
            block_md: BlockMd::for_block(block, frag, chunk.coding.frag_digest_type()),
            is_accessible: health.map(|h| h.is_block_accessible(&block.id)),
            is_allocation: block.is_allocation(),
            is_deletion: block.is_deletion(),
            is_future_deletion: block.is_future_deletion(),
            deleted: block.deleted,
            reclaimed: block.reclaimed,
        }
    }

    fn state(&self) -> Result<BlockState> {
        let flags = [
            self.is_allocation,
            self.block_md.is_preallocated,
            self.is_deletion,
            self.is_future_deletion,
        ];
        match flags {
            [false, false, false, false] => Ok(BlockState::Committed),
            [true, false, false, false] => Ok(BlockState::Allocating),
            [false, true, false, false] => Ok(BlockState::Preallocated),
            [false, false, true, false] => Ok(BlockState::Deleting),
            [false, false, false, true] => Ok(BlockState::FutureDeleting),
            _ => Err(Error::schema(
                "block",
                format!("block {} has conflicting state flags", self.block_md.id),
            )),
        }
    }

    fn into_block(self, chunk: &Chunk, frag_id: FragId) -> Result<Block> {
        let state = self.state()?;
        let md = self.block_md;
        Ok(Block {
            id: md.block_id()?,
            system_id: chunk.system_id.clone(),
            bucket_id: chunk.bucket_id.clone(),
            chunk_id: chunk.id,
            frag_id,
            node_id: NodeId::new(md.node),
            pool_id: PoolId::new(md.pool),
            size: md.size,
            address: md.address,
            state,
            deleted: self.deleted,
            reclaimed: self.reclaimed,
        })
    }
}

// =============================================================================
// Frag
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parity_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lrc_index: Option<u32>,
    pub digest_b64: String,
    #[serde(default)]
    pub blocks: Vec<BlockInfo>,
}

// =============================================================================
// Chunk
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub id: String,
    pub system_id: String,
    pub bucket_id: String,
    pub tier_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dup_chunk: Option<String>,
    pub chunk_coder_config: CodingConfig,
    pub size: u64,
    pub compress_size: u64,
    pub frag_size: u64,
    pub digest_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_key_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_iv_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_auth_tag_b64: Option<String>,
    #[serde(default)]
    pub frags: Vec<FragInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_accessible: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_building_blocks: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_building_frags: bool,
}

impl ChunkInfo {
    /// Encode a chunk; `health` fills in the derived accessibility flags.
    pub fn from_chunk(chunk: &Chunk, health: Option<&ChunkHealth>) -> Self {
        let frags = chunk
            .frags
            .iter()
            .map(|f| FragInfo {
                id: f.id.to_string(),
                data_index: f.index.data_index(),
                parity_index: f.index.parity_index(),
                lrc_index: f.index.lrc_index(),
                digest_b64: b64(&f.digest),
                blocks: f
                    .blocks
                    .iter()
                    .map(|b| BlockInfo::from_block(b, f, chunk, health))
                    .collect(),
            })
            .collect();

        Self {
            id: chunk.id.to_string(),
            system_id: chunk.system_id.to_string(),
            bucket_id: chunk.bucket_id.to_string(),
            tier_id: chunk.tier_id.to_string(),
            dup_chunk: chunk.dup_chunk_id.map(|id| id.to_string()),
            chunk_coder_config: chunk.coding.clone(),
            size: chunk.size,
            compress_size: chunk.compress_size,
            frag_size: chunk.frag_size,
            digest_b64: b64(&chunk.digest),
            cipher_key_b64: chunk.cipher.as_ref().map(|c| b64(&c.key)),
            cipher_iv_b64: chunk.cipher.as_ref().map(|c| b64(&c.iv)),
            cipher_auth_tag_b64: chunk.cipher.as_ref().map(|c| b64(&c.auth_tag)),
            frags,
            deleted: chunk.deleted,
            is_accessible: health.map(|h| h.accessible),
            is_building_blocks: chunk.is_building_blocks,
            is_building_frags: chunk.is_building_frags,
        }
    }

    /// Decode and validate. `is_accessible` flags are ignored.
    pub fn into_chunk(self) -> Result<Chunk> {
        let config = self.chunk_coder_config;

        let cipher = match (
            config.cipher_type(),
            self.cipher_key_b64,
            self.cipher_iv_b64,
            self.cipher_auth_tag_b64,
        ) {
            (Some(cipher_type), Some(key), Some(iv), Some(tag)) => Some(CipherParams {
                cipher_type,
                key: unb64("chunk", "cipher_key_b64", &key)?,
                iv: unb64("chunk", "cipher_iv_b64", &iv)?,
                auth_tag: unb64("chunk", "cipher_auth_tag_b64", &tag)?,
            }),
            (None, None, None, None) => None,
            _ => {
                return Err(Error::schema(
                    "chunk",
                    "cipher fields do not match the coding config",
                ))
            }
        };

        let digest = unb64("chunk", "digest_b64", &self.digest_b64)?;
        if digest.len() != config.digest_type().output_len() {
            return Err(Error::schema(
                "chunk",
                format!("digest is {} bytes, expected {}", digest.len(), config.digest_type().output_len()),
            ));
        }

        let mut chunk = Chunk {
            id: ChunkId::parse(&self.id)?,
            system_id: SystemId::new(self.system_id),
            bucket_id: BucketId::new(self.bucket_id),
            tier_id: TierId::new(self.tier_id),
            coding: config,
            size: self.size,
            compress_size: self.compress_size,
            frag_size: self.frag_size,
            digest,
            cipher,
            dup_chunk_id: self.dup_chunk.as_deref().map(ChunkId::parse).transpose()?,
            deleted: self.deleted,
            frags: Vec::with_capacity(self.frags.len()),
            is_building_blocks: self.is_building_blocks,
            is_building_frags: self.is_building_frags,
        };

        for f in self.frags {
            let frag_id = FragId::parse(&f.id)?;
            let index = FragIndex::from_parts(f.data_index, f.parity_index, f.lrc_index)?;
            let mut frag = Frag {
                id: frag_id,
                index,
                digest: unb64("frag", "digest_b64", &f.digest_b64)?,
                blocks: Vec::with_capacity(f.blocks.len()),
                data: None,
            };
            for b in f.blocks {
                frag.blocks.push(b.into_block(&chunk, frag_id)?);
            }
            chunk.frags.push(frag);
        }

        chunk.check_layout()?;
        Ok(chunk)
    }
}

// =============================================================================
// Part
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub id: String,
    pub system_id: String,
    pub bucket_id: String,
    pub obj_id: String,
    pub chunk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart_id: Option<String>,
    pub seq: u64,
    pub start: u64,
    pub end: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub uncommitted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl From<&Part> for PartInfo {
    fn from(p: &Part) -> Self {
        Self {
            id: p.id.to_string(),
            system_id: p.system_id.to_string(),
            bucket_id: p.bucket_id.to_string(),
            obj_id: p.obj_id.to_string(),
            chunk_id: p.chunk_id.to_string(),
            multipart_id: p.multipart_id.map(|m| m.to_string()),
            seq: p.seq,
            start: p.start,
            end: p.end,
            chunk_offset: p.chunk_offset,
            uncommitted: p.uncommitted,
            deleted: p.deleted,
        }
    }
}

impl TryFrom<PartInfo> for Part {
    type Error = Error;

    fn try_from(info: PartInfo) -> Result<Self> {
        if info.end < info.start {
            return Err(Error::schema("part", "end precedes start"));
        }
        Ok(Part {
            id: PartId::parse(&info.id)?,
            system_id: SystemId::new(info.system_id),
            bucket_id: BucketId::new(info.bucket_id),
            obj_id: ObjectId::parse(&info.obj_id)?,
            multipart_id: info
                .multipart_id
                .as_deref()
                .map(MultipartId::parse)
                .transpose()?,
            chunk_id: ChunkId::parse(&info.chunk_id)?,
            seq: info.seq,
            start: info.start,
            end: info.end,
            chunk_offset: info.chunk_offset,
            uncommitted: info.uncommitted,
            deleted: info.deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StaticNodeRegistry;
    use crate::coding::CipherType;
    use crate::health::evaluate_chunk;
    use crate::schema::test_support::sample_chunk;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn test_chunk_json_roundtrip() {
        let config = CodingConfig::erasure_with_lrc(4, 2, 2, 1)
            .cipher(CipherType::Aes256Gcm)
            .build()
            .unwrap();
        let mut chunk = sample_chunk(&config, 2);
        chunk.frags[0].blocks[1].state = BlockState::Preallocated;
        chunk.frags[1].blocks[0].mark_deletion(Utc::now());
        chunk.frags[2].blocks[0].state = BlockState::FutureDeleting;
        chunk.is_building_frags = true;

        let json = serde_json::to_string(&ChunkInfo::from_chunk(&chunk, None)).unwrap();
        let info: ChunkInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info.into_chunk().unwrap(), chunk);
    }

    #[test]
    fn test_optional_fields_absent() {
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let chunk = sample_chunk(&config, 1);
        let value = serde_json::to_value(ChunkInfo::from_chunk(&chunk, None)).unwrap();

        assert!(value.get("cipher_key_b64").is_none());
        assert!(value.get("is_accessible").is_none());
        assert!(value.get("dup_chunk").is_none());
        let frag = &value["frags"][0];
        assert!(frag.get("lrc_index").is_none());
        assert!(frag.get("parity_index").is_none());
        assert_eq!(frag["data_index"], 0);
    }

    #[test]
    fn test_accessibility_is_output_only() {
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let chunk = sample_chunk(&config, 1);
        let registry = StaticNodeRegistry::new();
        let health = evaluate_chunk(&chunk, 1, &registry, Utc::now(), Duration::from_secs(60));

        let info = ChunkInfo::from_chunk(&chunk, Some(&health));
        assert_eq!(info.is_accessible, Some(false));
        assert_eq!(info.frags[0].blocks[0].is_accessible, Some(false));

        let mut forged = info;
        forged.is_accessible = Some(true);
        assert_eq!(forged.into_chunk().unwrap(), chunk);
    }

    #[test]
    fn test_conflicting_block_flags_rejected() {
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let mut info = ChunkInfo::from_chunk(&sample_chunk(&config, 1), None);
        info.frags[0].blocks[0].is_allocation = true;
        info.frags[0].blocks[0].is_deletion = true;
        assert_matches!(
            info.into_chunk(),
            Err(Error::SchemaValidation { entity: "block", .. })
        );
    }

    #[test]
    fn test_bad_base64_rejected() {
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let mut info = ChunkInfo::from_chunk(&sample_chunk(&config, 1), None);
        info.digest_b64 = "!!not base64!!".to_string();
        assert_matches!(info.into_chunk(), Err(Error::SchemaValidation { .. }));
    }

    #[test]
    fn test_missing_coder_config_rejected() {
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let mut value =
            serde_json::to_value(ChunkInfo::from_chunk(&sample_chunk(&config, 1), None)).unwrap();
        value.as_object_mut().unwrap().remove("chunk_coder_config");
        assert!(serde_json::from_value::<ChunkInfo>(value).is_err());
    }

    #[test]
    fn test_block_md_carries_frag_digest() {
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let chunk = sample_chunk(&config, 1);
        let frag = &chunk.frags[3];
        let md = BlockMd::for_block(&frag.blocks[0], frag, config.frag_digest_type());
        assert_eq!(md.digest().unwrap(), Some(frag.digest.clone()));
        assert_eq!(md.block_id().unwrap(), frag.blocks[0].id);
        assert!(!md.is_preallocated);
    }

    #[test]
    fn test_part_info_roundtrip() {
        let part = Part {
            id: PartId::new(),
            system_id: SystemId::new("sys"),
            bucket_id: BucketId::new("bucket"),
            obj_id: ObjectId::new(),
            multipart_id: None,
            chunk_id: ChunkId::new(),
            seq: 1,
            start: 0,
            end: 4096,
            chunk_offset: Some(0),
            uncommitted: false,
            deleted: None,
        };
        let info = PartInfo::from(&part);
        let value = serde_json::to_value(&info).unwrap();
        assert!(value.get("multipart_id").is_none());
        assert!(value.get("uncommitted").is_none());
        assert_eq!(Part::try_from(info).unwrap(), part);
    }
}
