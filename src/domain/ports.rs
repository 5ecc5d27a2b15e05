//! Domain Ports (Port/Adapter Pattern)
//!
//! Collaborators the engine depends on. Adapters in [`crate::adapters`]
//! implement these traits; tests and the bundled binary use the in-memory
//! adapters.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Engine                                  │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │ MetadataStore │ NodeRegistry │ BlockStore │ Events  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │ InMemoryMetadataStore │ StaticNodeRegistry │ ...    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::events::DomainEvent;
use crate::coding::CodingConfigId;
use crate::error::{Error, Result};
use crate::model::{Chunk, ChunkId, NodeId, NodeInfo, ObjectId, PoolId};
use crate::schema::record::{BlockRecord, ChunkRecord, ChunkRecordSet, CodingConfigRecord, PartRecord};
use crate::schema::wire::BlockMd;

// =============================================================================
// Metadata Store Port
// =============================================================================

/// Port for persisted chunk, block and part metadata.
///
/// Implementations must make `insert_chunk` an atomic check-and-insert on
/// `(dedup_key, chunk_config)` over live chunks.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Store a coding configuration record. Idempotent.
    async fn put_coding_config(&self, record: CodingConfigRecord) -> Result<()>;

    async fn get_coding_config(&self, id: &CodingConfigId) -> Result<Option<CodingConfigRecord>>;

    /// Live chunk with this dedup identity, if any.
    async fn find_chunk_by_dedup_key(
        &self,
        dedup_key: &[u8],
        chunk_config: &CodingConfigId,
    ) -> Result<Option<ChunkRecord>>;

    /// Insert a chunk with its blocks.
    ///
    /// Fails with `DedupRaceLost` when a live chunk with the same dedup
    /// identity already exists.
    async fn insert_chunk(&self, records: ChunkRecordSet) -> Result<()>;

    /// Chunk record with every block record of the chunk.
    async fn get_chunk(&self, id: ChunkId) -> Result<Option<ChunkRecordSet>>;

    /// Ids of all chunks that are not soft-deleted.
    async fn list_live_chunk_ids(&self) -> Result<Vec<ChunkId>>;

    /// Insert or replace block records.
    async fn upsert_blocks(&self, blocks: Vec<BlockRecord>) -> Result<()>;

    /// Soft-delete chunks and all their blocks.
    async fn mark_chunks_deleted(&self, ids: &[ChunkId], at: DateTime<Utc>) -> Result<()>;

    async fn insert_parts(&self, parts: Vec<PartRecord>) -> Result<()>;

    /// Parts of an object, ordered by `seq`.
    async fn find_parts_by_object(&self, obj: ObjectId) -> Result<Vec<PartRecord>>;

    /// Number of live parts pointing at a chunk.
    async fn count_live_parts(&self, chunk: ChunkId) -> Result<usize>;
}

/// Load a chunk with its blocks, resolving its coding configuration.
pub async fn load_chunk(store: &dyn MetadataStore, id: ChunkId) -> Result<Option<Chunk>> {
    let Some(records) = store.get_chunk(id).await? else {
        return Ok(None);
    };
    let config_id = records.chunk.chunk_config.clone();
    let config = store
        .get_coding_config(&config_id)
        .await?
        .ok_or_else(|| Error::not_found("coding_config", &config_id))?
        .into_config()?;
    records.into_chunk(&config).map(Some)
}

// =============================================================================
// Node Registry Port
// =============================================================================

/// Port for the current view of storage nodes.
///
/// Reads are synchronous snapshots; liveness is refreshed by whatever
/// collaborator feeds the registry.
pub trait NodeRegistry: Send + Sync {
    fn node(&self, id: &NodeId) -> Option<NodeInfo>;

    fn nodes_in_pool(&self, pool: &PoolId) -> Vec<NodeInfo>;

    fn all_nodes(&self) -> Vec<NodeInfo>;
}

// =============================================================================
// Block Store Port
// =============================================================================

/// Port for the bytes of blocks on storage nodes.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn write_block(&self, md: &BlockMd, data: Bytes) -> Result<()>;

    async fn read_block(&self, md: &BlockMd) -> Result<Bytes>;

    async fn delete_blocks(&self, mds: &[BlockMd]) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}
