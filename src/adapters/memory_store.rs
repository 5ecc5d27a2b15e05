//! In-memory Metadata Store
//!
//! `MetadataStore` over concurrent maps. The dedup index holds one entry per
//! `(dedup_key, chunk_config)` of a live data chunk; its entry lock makes the
//! check-and-insert in `insert_chunk` atomic across concurrent writers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::coding::CodingConfigId;
use crate::domain::ports::MetadataStore;
use crate::error::{Error, Result};
use crate::model::{BlockId, BlockState, ChunkId, ObjectId, PartId};
use crate::schema::record::{
    BlockRecord, ChunkRecord, ChunkRecordSet, CodingConfigRecord, PartRecord,
};

type DedupKey = (Vec<u8>, CodingConfigId);

#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    coding_configs: DashMap<CodingConfigId, CodingConfigRecord>,
    chunks: DashMap<ChunkId, ChunkRecord>,
    blocks: DashMap<BlockId, BlockRecord>,
    parts: DashMap<PartId, PartRecord>,
    dedup_index: DashMap<DedupKey, ChunkId>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunk records, live or deleted.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn blocks_of(&self, chunk: ChunkId) -> Vec<BlockRecord> {
        self.blocks
            .iter()
            .filter(|b| b.chunk == chunk)
            .map(|b| b.value().clone())
            .collect()
    }

    fn store_records(&self, chunk: ChunkRecord, blocks: Vec<BlockRecord>) {
        debug!(chunk_id = %chunk.id, blocks = blocks.len(), "Inserting chunk record");
        for block in blocks {
            self.blocks.insert(block.id, block);
        }
        self.chunks.insert(chunk.id, chunk);
    }

    fn is_live(&self, id: &ChunkId) -> bool {
        self.chunks.get(id).map(|c| c.is_live()).unwrap_or(false)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn put_coding_config(&self, record: CodingConfigRecord) -> Result<()> {
        self.coding_configs.entry(record.id.clone()).or_insert(record);
        Ok(())
    }

    async fn get_coding_config(&self, id: &CodingConfigId) -> Result<Option<CodingConfigRecord>> {
        Ok(self.coding_configs.get(id).map(|r| r.value().clone()))
    }

    async fn find_chunk_by_dedup_key(
        &self,
        dedup_key: &[u8],
        chunk_config: &CodingConfigId,
    ) -> Result<Option<ChunkRecord>> {
        let key = (dedup_key.to_vec(), chunk_config.clone());
        let Some(id) = self.dedup_index.get(&key).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self
            .chunks
            .get(&id)
            .filter(|c| c.is_live())
            .map(|c| c.value().clone()))
    }

    async fn insert_chunk(&self, records: ChunkRecordSet) -> Result<()> {
        let ChunkRecordSet { chunk, blocks } = records;

        if !(chunk.is_indexed() && chunk.is_live()) {
            self.store_records(chunk, blocks);
            return Ok(());
        }

        // The entry guard stays held until the chunk record is visible, so a
        // concurrent writer on the same key always sees a live owner.
        let key = (chunk.dedup_key.clone(), chunk.chunk_config.clone());
        match self.dedup_index.entry(key) {
            Entry::Occupied(mut entry) => {
                let existing = *entry.get();
                if self.is_live(&existing) {
                    return Err(Error::DedupRaceLost { existing });
                }
                entry.insert(chunk.id);
                self.store_records(chunk, blocks);
            }
            Entry::Vacant(entry) => {
                let _owner = entry.insert(chunk.id);
                self.store_records(chunk, blocks);
            }
        }
        Ok(())
    }

    async fn get_chunk(&self, id: ChunkId) -> Result<Option<ChunkRecordSet>> {
        let Some(chunk) = self.chunks.get(&id).map(|c| c.value().clone()) else {
            return Ok(None);
        };
        let blocks = self.blocks_of(id);
        Ok(Some(ChunkRecordSet { chunk, blocks }))
    }

    async fn list_live_chunk_ids(&self) -> Result<Vec<ChunkId>> {
        let mut ids: Vec<_> = self
            .chunks
            .iter()
            .filter(|c| c.is_live())
            .map(|c| *c.key())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn upsert_blocks(&self, blocks: Vec<BlockRecord>) -> Result<()> {
        for block in blocks {
            if !self.chunks.contains_key(&block.chunk) {
                return Err(Error::not_found("chunk", block.chunk));
            }
            self.blocks.insert(block.id, block);
        }
        Ok(())
    }

    async fn mark_chunks_deleted(&self, ids: &[ChunkId], at: DateTime<Utc>) -> Result<()> {
        for id in ids {
            let Some(mut chunk) = self.chunks.get_mut(id) else {
                continue;
            };
            if chunk.deleted.is_none() {
                chunk.deleted = Some(at);
            }
            let key = (chunk.dedup_key.clone(), chunk.chunk_config.clone());
            drop(chunk);
            self.dedup_index.remove_if(&key, |_, owner| owner == id);

            for mut block in self.blocks.iter_mut().filter(|b| b.chunk == *id) {
                block.state = BlockState::Deleting;
                block.deleted.get_or_insert(at);
            }
        }
        Ok(())
    }

    async fn insert_parts(&self, parts: Vec<PartRecord>) -> Result<()> {
        for part in parts {
            self.parts.insert(part.id, part);
        }
        Ok(())
    }

    async fn find_parts_by_object(&self, obj: ObjectId) -> Result<Vec<PartRecord>> {
        let mut parts: Vec<_> = self
            .parts
            .iter()
            .filter(|p| p.obj == obj && p.deleted.is_none())
            .map(|p| p.value().clone())
            .collect();
        parts.sort_by_key(|p| (p.seq, p.start));
        Ok(parts)
    }

    async fn count_live_parts(&self, chunk: ChunkId) -> Result<usize> {
        Ok(self
            .parts
            .iter()
            .filter(|p| p.chunk == chunk && p.deleted.is_none())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::CodingConfig;
    use crate::schema::test_support::sample_chunk;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn record_set(config: &CodingConfig) -> ChunkRecordSet {
        ChunkRecordSet::from_chunk(&sample_chunk(config, 1)).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get_chunk() {
        let store = InMemoryMetadataStore::new();
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let set = record_set(&config);
        let id = set.chunk.id;

        store.insert_chunk(set.clone()).await.unwrap();
        let loaded = store.get_chunk(id).await.unwrap().unwrap();
        assert_eq!(loaded.chunk, set.chunk);
        assert_eq!(loaded.blocks.len(), 6);

        let found = store
            .find_chunk_by_dedup_key(&set.chunk.dedup_key, &config.id())
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.id), Some(id));
    }

    #[tokio::test]
    async fn test_duplicate_dedup_key_loses_race() {
        let store = InMemoryMetadataStore::new();
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let first = record_set(&config);
        let mut second = record_set(&config);
        second.chunk.dedup_key = first.chunk.dedup_key.clone();

        store.insert_chunk(first.clone()).await.unwrap();
        assert_matches!(
            store.insert_chunk(second).await,
            Err(Error::DedupRaceLost { existing }) if existing == first.chunk.id
        );
    }

    #[tokio::test]
    async fn test_same_key_other_config_is_distinct() {
        let store = InMemoryMetadataStore::new();
        let a = CodingConfig::erasure(4, 2).build().unwrap();
        let b = CodingConfig::erasure(2, 1).build().unwrap();
        let first = record_set(&a);
        let mut second = record_set(&b);
        second.chunk.dedup_key = first.chunk.dedup_key.clone();

        store.insert_chunk(first).await.unwrap();
        store.insert_chunk(second).await.unwrap();
        assert_eq!(store.list_live_chunk_ids().await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_inserts_have_one_winner() {
        const WRITERS: usize = 8;
        let config = CodingConfig::erasure(4, 2).build().unwrap();

        for _ in 0..50 {
            let store = Arc::new(InMemoryMetadataStore::new());
            let barrier = Arc::new(tokio::sync::Barrier::new(WRITERS));
            let key = ChunkRecordSet::from_chunk(&sample_chunk(&config, 1))
                .unwrap()
                .chunk
                .dedup_key;

            let mut handles = Vec::new();
            for _ in 0..WRITERS {
                let store = store.clone();
                let barrier = barrier.clone();
                // many blocks per chunk keep each insert busy long enough to overlap
                let mut set = ChunkRecordSet::from_chunk(&sample_chunk(&config, 300)).unwrap();
                set.chunk.dedup_key = key.clone();
                handles.push(tokio::spawn(async move {
                    barrier.wait().await;
                    store.insert_chunk(set).await
                }));
            }

            let mut winners = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(()) => winners += 1,
                    Err(e) => assert_matches!(e, Error::DedupRaceLost { .. }),
                }
            }
            assert_eq!(winners, 1);
            assert_eq!(store.chunk_count(), 1);
            assert_eq!(store.list_live_chunk_ids().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_deleted_chunk_frees_dedup_key() {
        let store = InMemoryMetadataStore::new();
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let first = record_set(&config);
        let mut second = record_set(&config);
        second.chunk.dedup_key = first.chunk.dedup_key.clone();

        store.insert_chunk(first.clone()).await.unwrap();
        store
            .mark_chunks_deleted(&[first.chunk.id], Utc::now())
            .await
            .unwrap();

        let deleted = store.get_chunk(first.chunk.id).await.unwrap().unwrap();
        assert!(deleted.chunk.deleted.is_some());
        assert!(deleted.blocks.iter().all(|b| b.state == BlockState::Deleting));
        assert!(store
            .find_chunk_by_dedup_key(&first.chunk.dedup_key, &config.id())
            .await
            .unwrap()
            .is_none());

        store.insert_chunk(second).await.unwrap();
        assert_eq!(store.list_live_chunk_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_parts_by_object_sorted() {
        let store = InMemoryMetadataStore::new();
        let obj = ObjectId::new();
        let chunk = ChunkId::new();
        let part = |seq: u64| PartRecord {
            id: PartId::new(),
            system: "sys".into(),
            bucket: "b".into(),
            chunk,
            obj,
            multipart: None,
            seq,
            start: seq * 10,
            end: seq * 10 + 10,
            chunk_offset: None,
            deleted: None,
            uncommitted: false,
        };
        store
            .insert_parts(vec![part(2), part(0), part(1)])
            .await
            .unwrap();

        let seqs: Vec<_> = store
            .find_parts_by_object(obj)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(store.count_live_parts(chunk).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_upsert_blocks_requires_chunk() {
        let store = InMemoryMetadataStore::new();
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let set = record_set(&config);
        assert_matches!(
            store.upsert_blocks(set.blocks.clone()).await,
            Err(Error::NotFound { kind: "chunk", .. })
        );
    }
}
