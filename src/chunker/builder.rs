//! Chunk Builder
//!
//! Streams an object through the content-defined chunker and turns every
//! chunk into either a new stored chunk or a dedup reference, emitting one
//! [`Part`] per chunk boundary.
//!
//! ```text
//!  AsyncRead ─▶ ContentChunker ─▶ select tier ─▶ digest ─┬─▶ in-flight hit ─▶ dedup ref
//!                                                        ├─▶ store hit     ─▶ dedup ref
//!                                                        └─▶ miss ─▶ ChunkWriter::write_chunk
//!                                                                      └─ race lost ─▶ dedup ref
//! ```
//!
//! Storage side effects live behind [`ChunkWriter`]; the builder owns the
//! dedup decisions and the part layout.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument};

use super::cdc::ContentChunker;
use crate::coding::{CodingConfig, CodingConfigId};
use crate::error::Result;
use crate::model::{
    BucketId, Chunk, ChunkId, MultipartId, ObjectId, Part, PartId, SystemId, Tier, Tiering,
};

/// Result of writing a new chunk.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// The chunk was encoded, placed, written and inserted
    Stored(Chunk),
    /// A concurrent writer inserted identical content first; our blocks were
    /// discarded
    RaceLost { winner: Chunk },
}

/// Storage operations the builder drives.
#[async_trait]
pub trait ChunkWriter: Send + Sync {
    /// Tier whose coding configuration a chunk of `size` bytes will use.
    fn select_tier(&self, tiering: &Tiering, size: u64) -> Result<Tier>;

    /// Live chunk with this digest under this coding configuration.
    async fn find_existing(&self, digest: &[u8], config: &CodingConfig) -> Result<Option<Chunk>>;

    /// Encode, place, write and atomically insert a new chunk.
    async fn write_chunk(&self, chunk: Chunk, plain: Bytes) -> Result<WriteOutcome>;
}

/// Everything a build produced.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    /// One entry per part: the stored chunk or the dedup reference
    pub chunks: Vec<Chunk>,
    pub parts: Vec<Part>,
    pub size: u64,
    pub dedup_hits: usize,
    pub races_lost: usize,
}

impl BuildOutput {
    /// Chunks that were newly stored by this build.
    pub fn new_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(|c| !c.is_dedup_reference())
    }
}

/// Splits one object into chunks and parts.
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    chunker: ContentChunker,
    tiering: Tiering,
    system_id: SystemId,
    bucket_id: BucketId,
    obj_id: ObjectId,
    multipart_id: Option<MultipartId>,
}

impl ChunkBuilder {
    pub fn new(
        system_id: SystemId,
        bucket_id: BucketId,
        obj_id: ObjectId,
        tiering: Tiering,
    ) -> Result<Self> {
        Ok(Self {
            chunker: ContentChunker::new(tiering.chunk_split)?,
            tiering,
            system_id,
            bucket_id,
            obj_id,
            multipart_id: None,
        })
    }

    /// Mark every produced part as an uncommitted part of a multipart upload.
    pub fn with_multipart(mut self, multipart_id: MultipartId) -> Self {
        self.multipart_id = Some(multipart_id);
        self
    }

    #[instrument(skip(self, reader, writer), fields(obj = %self.obj_id, bucket = %self.bucket_id))]
    pub async fn build<R, W>(&self, mut reader: R, writer: &W) -> Result<BuildOutput>
    where
        R: AsyncRead + Unpin + Send,
        W: ChunkWriter + ?Sized,
    {
        let mut output = BuildOutput::default();
        let mut in_flight: HashMap<(Vec<u8>, CodingConfigId), Chunk> = HashMap::new();
        let mut buf = BytesMut::with_capacity(self.chunker.max_size() * 2);
        let mut eof = false;

        loop {
            while !eof && buf.len() < self.chunker.max_size() {
                if reader.read_buf(&mut buf).await? == 0 {
                    eof = true;
                }
            }
            if buf.is_empty() {
                break;
            }

            let cut = self.chunker.cut_point(&buf);
            let data = buf.split_to(cut).freeze();
            self.add_chunk(data, writer, &mut in_flight, &mut output)
                .await?;
        }

        debug!(
            parts = output.parts.len(),
            size = output.size,
            dedup_hits = output.dedup_hits,
            "Object chunked"
        );
        Ok(output)
    }

    async fn add_chunk<W>(
        &self,
        data: Bytes,
        writer: &W,
        in_flight: &mut HashMap<(Vec<u8>, CodingConfigId), Chunk>,
        output: &mut BuildOutput,
    ) -> Result<()>
    where
        W: ChunkWriter + ?Sized,
    {
        let size = data.len() as u64;
        let tier = writer.select_tier(&self.tiering, size)?;
        let digest = tier.coding.digest_type().digest(&data);
        let key = (digest.clone(), tier.coding.id());

        let existing = match in_flight.get(&key) {
            Some(chunk) => Some(chunk.clone()),
            None => writer.find_existing(&digest, &tier.coding).await?,
        };

        let chunk = match existing {
            Some(existing) => {
                output.dedup_hits += 1;
                Chunk::dedup_of(&existing)
            }
            None => {
                let fresh = self.new_chunk(&tier, size, digest);
                match writer.write_chunk(fresh, data).await? {
                    WriteOutcome::Stored(chunk) => {
                        in_flight.insert(key, chunk.clone());
                        chunk
                    }
                    WriteOutcome::RaceLost { winner } => {
                        output.races_lost += 1;
                        in_flight.insert(key, winner.clone());
                        Chunk::dedup_of(&winner)
                    }
                }
            }
        };

        output.parts.push(Part {
            id: PartId::new(),
            system_id: self.system_id.clone(),
            bucket_id: self.bucket_id.clone(),
            obj_id: self.obj_id,
            multipart_id: self.multipart_id,
            chunk_id: chunk.data_chunk_id(),
            seq: output.parts.len() as u64,
            start: output.size,
            end: output.size + size,
            chunk_offset: None,
            uncommitted: self.multipart_id.is_some(),
            deleted: None,
        });
        output.size += size;
        output.chunks.push(chunk);
        Ok(())
    }

    fn new_chunk(&self, tier: &Tier, size: u64, digest: Vec<u8>) -> Chunk {
        Chunk {
            id: ChunkId::new(),
            system_id: self.system_id.clone(),
            bucket_id: self.bucket_id.clone(),
            tier_id: tier.id.clone(),
            coding: tier.coding.clone(),
            size,
            compress_size: 0,
            frag_size: 0,
            digest,
            cipher: None,
            dup_chunk_id: None,
            deleted: None,
            frags: Vec::new(),
            is_building_blocks: false,
            is_building_frags: true,
        }
    }
}
