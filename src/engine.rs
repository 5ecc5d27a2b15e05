//! Storage Engine
//!
//! Wires the chunk builder, fragment encoder, placement planner and health
//! tracker to the collaborator ports.
//!
//! # Write Path
//!
//! ```text
//! put_object ─▶ ChunkBuilder ─▶ (per new chunk) encode on blocking pool
//!                                     │
//!                                     ▼
//!                      allocate_chunk ─▶ write blocks ─▶ commit ─▶ insert_chunk
//!                                                                    │
//!                                             DedupRaceLost ◀────────┘
//!                                             (drop our blocks, reference winner)
//! ```
//!
//! # Read Path
//!
//! ```text
//! read_object ─▶ parts ─▶ read_chunk ─▶ resolve dedup ─▶ read frags ─▶ decode
//! ```

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chunker::{BuildOutput, ChunkBuilder, ChunkWriter, WriteOutcome};
use crate::coding::CodingConfig;
use crate::config::EngineConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{load_chunk, BlockStore, EventPublisher, MetadataStore, NodeRegistry};
use crate::ec::EncoderCache;
use crate::error::{Error, Result};
use crate::health::{
    ChunkHealth, HealthTracker, RebuildContext, RebuildOutcome, Rebuilder, ScanReport,
};
use crate::metrics::EngineMetrics;
use crate::model::{
    BucketId, Chunk, ChunkId, FragIndex, MultipartId, NodeId, ObjectId, Part, Tier, TierId,
    Tiering, Topology,
};
use crate::placement::{PlacementPlanner, TierStatus};
use crate::schema::record::{ChunkRecordSet, CodingConfigRecord, PartRecord};
use crate::schema::wire::{BlockMd, ChunkInfo};

/// Collaborators an engine is built over.
#[derive(Clone)]
pub struct EnginePorts {
    pub store: Arc<dyn MetadataStore>,
    pub registry: Arc<dyn NodeRegistry>,
    pub blocks: Arc<dyn BlockStore>,
    pub publisher: Arc<dyn EventPublisher>,
}

pub struct Engine {
    config: EngineConfig,
    topology: Arc<Topology>,
    store: Arc<dyn MetadataStore>,
    registry: Arc<dyn NodeRegistry>,
    blocks: Arc<dyn BlockStore>,
    publisher: Arc<dyn EventPublisher>,
    metrics: EngineMetrics,
    planner: Arc<PlacementPlanner>,
    tracker: Arc<HealthTracker>,
    encoders: Arc<EncoderCache>,
    rebuilder: Arc<Rebuilder>,
    cancel: CancellationToken,
    workers: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, topology: Topology, ports: EnginePorts) -> Result<Self> {
        topology.validate()?;
        let topology = Arc::new(topology);
        let metrics = EngineMetrics::new()?;

        let planner = Arc::new(PlacementPlanner::new(
            topology.clone(),
            ports.registry.clone(),
            config.liveness_timeout,
        ));
        let tracker = Arc::new(HealthTracker::new(
            topology.clone(),
            ports.registry.clone(),
            config.liveness_timeout,
        ));
        let encoders = Arc::new(EncoderCache::new());

        let rebuilder = Arc::new(Rebuilder::new(
            config.rebuild.clone(),
            RebuildContext {
                store: ports.store.clone(),
                blocks: ports.blocks.clone(),
                planner: planner.clone(),
                tracker: tracker.clone(),
                encoders: encoders.clone(),
                publisher: ports.publisher.clone(),
                metrics: metrics.clone(),
            },
        ));

        Ok(Self {
            config,
            topology,
            store: ports.store,
            registry: ports.registry,
            blocks: ports.blocks,
            publisher: ports.publisher,
            metrics,
            planner,
            tracker,
            encoders,
            rebuilder,
            cancel: CancellationToken::new(),
            workers: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn planner(&self) -> &PlacementPlanner {
        &self.planner
    }

    pub fn rebuilder(&self) -> &Rebuilder {
        &self.rebuilder
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the background rebuild workers. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return;
        }
        let rebuilder = self.rebuilder.clone();
        let cancel = self.cancel.child_token();
        *workers = Some(tokio::spawn(rebuilder.run(cancel)));
        info!(system = %self.topology.system_id, "Engine started");
    }

    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the workers and wait for the dispatch loop to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.workers.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Rebuild dispatch loop ended abnormally");
            }
        }
        info!("Engine stopped");
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Chunk, deduplicate and store an object; records its parts.
    #[instrument(skip(self, reader), fields(bucket = %bucket, obj = %obj))]
    pub async fn put_object<R>(
        &self,
        bucket: &BucketId,
        obj: ObjectId,
        reader: R,
    ) -> Result<BuildOutput>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.put(bucket, obj, None, reader).await
    }

    /// Store one part of a multipart upload. Its parts stay uncommitted,
    /// and invisible to reads, until [`Engine::complete_multipart`].
    #[instrument(skip(self, reader), fields(bucket = %bucket, obj = %obj, multipart = %multipart_id))]
    pub async fn put_upload_part<R>(
        &self,
        bucket: &BucketId,
        obj: ObjectId,
        multipart_id: MultipartId,
        reader: R,
    ) -> Result<BuildOutput>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.put(bucket, obj, Some(multipart_id), reader).await
    }

    async fn put<R>(
        &self,
        bucket: &BucketId,
        obj: ObjectId,
        multipart_id: Option<MultipartId>,
        reader: R,
    ) -> Result<BuildOutput>
    where
        R: AsyncRead + Unpin + Send,
    {
        let tiering = self.topology.tiering_for_bucket(bucket)?.clone();
        let mut builder = ChunkBuilder::new(
            self.topology.system_id.clone(),
            bucket.clone(),
            obj,
            tiering,
        )?;
        if let Some(id) = multipart_id {
            builder = builder.with_multipart(id);
        }

        let mut output = builder.build(reader, self).await?;

        // Upload parts continue the object's sequence.
        if multipart_id.is_some() {
            let existing = self.store.find_parts_by_object(obj).await?;
            let seq = existing.iter().map(|p| p.seq + 1).max().unwrap_or(0);
            let start = existing.iter().map(|p| p.end).max().unwrap_or(0);
            for part in &mut output.parts {
                part.seq += seq;
                part.start += start;
                part.end += start;
            }
        }

        self.store
            .insert_parts(output.parts.iter().map(PartRecord::from).collect())
            .await?;

        self.metrics.bytes_ingested.inc_by(output.size);
        self.metrics.dedup_hits.inc_by(output.dedup_hits as u64);
        for chunk in output.chunks.iter().filter(|c| c.is_dedup_reference()) {
            self.emit(DomainEvent::DedupHit {
                chunk_id: chunk.data_chunk_id(),
                bucket: chunk.bucket_id.to_string(),
                size: chunk.size,
                timestamp: Utc::now(),
            })
            .await;
        }

        info!(
            size = output.size,
            parts = output.parts.len(),
            new_chunks = output.new_chunks().count(),
            dedup_hits = output.dedup_hits,
            "Object stored"
        );
        Ok(output)
    }

    /// Make every uncommitted part of `multipart_id` visible to reads.
    pub async fn complete_multipart(
        &self,
        obj: ObjectId,
        multipart_id: MultipartId,
    ) -> Result<usize> {
        let mut parts = self.store.find_parts_by_object(obj).await?;
        parts.retain(|p| p.multipart == Some(multipart_id) && p.uncommitted);
        for part in &mut parts {
            part.uncommitted = false;
        }
        let count = parts.len();
        self.store.insert_parts(parts).await?;
        debug!(%obj, %multipart_id, parts = count, "Multipart upload completed");
        Ok(count)
    }

    /// Write every block of a placed chunk; on failure the written blocks are
    /// removed and all reservations released.
    async fn write_blocks(&self, chunk: &mut Chunk) -> Result<()> {
        let digest_type = chunk.coding.frag_digest_type();
        let mut jobs = Vec::new();
        for frag in &chunk.frags {
            let data = frag.data.clone().ok_or_else(|| {
                Error::EncodingFailure(format!("frag {} of chunk {} has no bytes", frag.index, chunk.id))
            })?;
            for block in &frag.blocks {
                jobs.push((BlockMd::for_block(block, frag, digest_type), data.clone()));
            }
        }

        let blocks = &self.blocks;
        let results: Vec<(BlockMd, Result<()>)> = stream::iter(jobs)
            .map(|(md, data)| async move {
                let result = blocks.write_block(&md, data).await;
                (md, result)
            })
            .buffer_unordered(self.config.write_concurrency.max(1))
            .collect()
            .await;

        let mut written = Vec::new();
        let mut first_error = None;
        for (md, result) in results {
            match result {
                Ok(()) => written.push(md),
                Err(e) => {
                    warn!(block_id = %md.id, node = %md.node, error = %e, "Block write failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        for block in chunk.blocks() {
            self.planner.release(block);
        }

        if let Some(e) = first_error {
            if let Err(cleanup) = self.blocks.delete_blocks(&written).await {
                warn!(error = %cleanup, "Failed to remove blocks of abandoned chunk");
            }
            return Err(e);
        }

        for frag in &mut chunk.frags {
            for block in &mut frag.blocks {
                block.commit();
            }
        }
        self.metrics.blocks_committed.inc_by(written.len() as u64);
        Ok(())
    }

    async fn discard_blocks(&self, chunk: &Chunk) {
        let digest_type = chunk.coding.frag_digest_type();
        let mds: Vec<BlockMd> = chunk
            .frags
            .iter()
            .flat_map(|f| f.blocks.iter().map(move |b| BlockMd::for_block(b, f, digest_type)))
            .collect();
        if let Err(e) = self.blocks.delete_blocks(&mds).await {
            warn!(chunk_id = %chunk.id, error = %e, "Failed to discard blocks");
        }
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Plain bytes of a chunk, following a dedup reference and decoding
    /// around missing frags.
    #[instrument(skip(self))]
    pub async fn read_chunk(&self, id: ChunkId) -> Result<Bytes> {
        let chunk = self.load_live_chunk(id).await?;
        let chunk = match chunk.dup_chunk_id {
            Some(data_id) => self.load_live_chunk(data_id).await?,
            None => chunk,
        };

        let health = self.tracker.evaluate(&chunk);
        if !health.accessible {
            return Err(Error::InsufficientShards {
                available: health.available_frags,
                required: health.required_frags,
            });
        }

        let k = chunk.coding.data_frags() as usize;
        let mut available = BTreeMap::new();
        for frag in chunk.frags.iter().filter(|f| matches!(f.index, FragIndex::Data(_))) {
            if let Some(data) = self.read_frag(&chunk, &health, frag.index).await {
                available.insert(frag.index, data);
            }
        }
        if available.len() < k {
            debug!(have = available.len(), need = k, "Degraded read");
            for frag in chunk.frags.iter().filter(|f| !matches!(f.index, FragIndex::Data(_))) {
                if let Some(data) = self.read_frag(&chunk, &health, frag.index).await {
                    available.insert(frag.index, data);
                }
            }
        }

        let encoder = self.encoders.get(&chunk.coding)?;
        tokio::task::spawn_blocking(move || encoder.decode(&chunk, &available))
            .await
            .map_err(|e| Error::Internal(format!("decode task failed: {}", e)))?
    }

    /// Bytes `[range)` of an object, or the whole object.
    ///
    /// The range is clamped to the object size. Uncommitted multipart parts
    /// are not visible.
    #[instrument(skip(self))]
    pub async fn read_object(&self, obj: ObjectId, range: Option<Range<u64>>) -> Result<Bytes> {
        let parts: Vec<Part> = self
            .store
            .find_parts_by_object(obj)
            .await?
            .into_iter()
            .filter(|p| !p.uncommitted)
            .map(Part::try_from)
            .collect::<Result<_>>()?;
        if parts.is_empty() {
            return Err(Error::not_found("object", obj));
        }

        let size = parts.iter().map(|p| p.end).max().unwrap_or(0);
        let range = range.unwrap_or(0..size);
        let (start, end) = (range.start.min(size), range.end.min(size));

        let mut out = BytesMut::with_capacity(end.saturating_sub(start) as usize);
        let mut cache: HashMap<ChunkId, Bytes> = HashMap::new();
        for part in parts.iter().filter(|p| p.overlaps(start, end)) {
            let data = match cache.get(&part.chunk_id) {
                Some(data) => data.clone(),
                None => {
                    let data = self.read_chunk(part.chunk_id).await?;
                    cache.insert(part.chunk_id, data.clone());
                    data
                }
            };

            let base = part.chunk_offset.unwrap_or(0);
            let from = base + start.max(part.start) - part.start;
            let to = base + end.min(part.end) - part.start;
            let slice = data.get(from as usize..to as usize).ok_or_else(|| {
                Error::schema(
                    "part",
                    format!("part {} maps past the end of chunk {}", part.id, part.chunk_id),
                )
            })?;
            out.extend_from_slice(slice);
        }
        Ok(out.freeze())
    }

    async fn load_live_chunk(&self, id: ChunkId) -> Result<Chunk> {
        match load_chunk(self.store.as_ref(), id).await? {
            Some(chunk) if chunk.deleted.is_none() => Ok(chunk),
            _ => Err(Error::not_found("chunk", id)),
        }
    }

    async fn read_frag(&self, chunk: &Chunk, health: &ChunkHealth, index: FragIndex) -> Option<Bytes> {
        let frag = chunk.frag(index)?;
        let digest_type = chunk.coding.frag_digest_type();
        for block in frag.blocks.iter().filter(|b| health.is_block_accessible(&b.id)) {
            let md = BlockMd::for_block(block, frag, digest_type);
            match self.blocks.read_block(&md).await {
                Ok(data) if digest_type.digest(&data) == frag.digest => return Some(data),
                Ok(_) => warn!(block_id = %block.id, frag = %index, "Block failed digest check"),
                Err(e) => debug!(block_id = %block.id, frag = %index, error = %e, "Block unreadable"),
            }
        }
        None
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub async fn chunk_health(&self, id: ChunkId) -> Result<ChunkHealth> {
        let chunk = self.load_live_chunk(id).await?;
        Ok(self.tracker.evaluate(&chunk))
    }

    /// Wire form of a chunk with its derived accessibility.
    pub async fn chunk_info(&self, id: ChunkId) -> Result<ChunkInfo> {
        let chunk = self.load_live_chunk(id).await?;
        let health = self.tracker.evaluate(&chunk);
        Ok(ChunkInfo::from_chunk(&chunk, Some(&health)))
    }

    /// Evaluate every live chunk and queue rebuilds.
    pub async fn scan_health(&self) -> Result<ScanReport> {
        self.rebuilder.scan_all().await
    }

    /// React to a node going up or down: re-evaluate the chunks it hosts.
    #[instrument(skip(self))]
    pub async fn notify_node_change(&self, node: &NodeId) -> Result<ScanReport> {
        let online = self
            .registry
            .node(node)
            .map(|n| n.is_live(Utc::now(), self.config.liveness_timeout))
            .unwrap_or(false);
        info!(%node, online, "Node liveness changed");
        self.emit(DomainEvent::node_liveness_changed(node, online)).await;
        self.rebuilder.scan_node(node).await
    }

    /// Run every queued rebuild now, one at a time.
    pub async fn rebuild_pending(&self) -> Vec<(ChunkId, Result<RebuildOutcome>)> {
        self.rebuilder.drain().await
    }

    pub fn tier_status(&self, tier: &TierId) -> Result<TierStatus> {
        self.planner.tier_status(tier)
    }

    // =========================================================================
    // Garbage
    // =========================================================================

    /// Soft-delete live data chunks no live part points at, with their blocks.
    ///
    /// Only safe while no write is in flight: a chunk is inserted before the
    /// parts that reference it.
    #[instrument(skip(self))]
    pub async fn collect_unreferenced_chunks(&self) -> Result<Vec<ChunkId>> {
        let mut garbage = Vec::new();
        for id in self.store.list_live_chunk_ids().await? {
            if self.store.count_live_parts(id).await? == 0 {
                garbage.push(id);
            }
        }
        if !garbage.is_empty() {
            self.store.mark_chunks_deleted(&garbage, Utc::now()).await?;
            info!(chunks = garbage.len(), "Marked unreferenced chunks deleted");
        }
        Ok(garbage)
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("system", &self.topology.system_id)
            .field("config", &self.config)
            .field("encoders", &self.encoders.len())
            .finish()
    }
}

// =============================================================================
// Chunk Writer
// =============================================================================

#[async_trait]
impl ChunkWriter for Engine {
    fn select_tier(&self, tiering: &Tiering, size: u64) -> Result<Tier> {
        self.planner
            .select_tier(tiering, size)
            .cloned()
            .inspect_err(|_| {
                self.metrics
                    .placement_failures
                    .with_label_values(&["no_tier"])
                    .inc();
            })
    }

    async fn find_existing(&self, digest: &[u8], config: &CodingConfig) -> Result<Option<Chunk>> {
        match self.store.find_chunk_by_dedup_key(digest, &config.id()).await? {
            Some(record) => load_chunk(self.store.as_ref(), record.id).await,
            None => Ok(None),
        }
    }

    #[instrument(skip(self, chunk, plain), fields(chunk_id = %chunk.id, size = plain.len()))]
    async fn write_chunk(&self, chunk: Chunk, plain: Bytes) -> Result<WriteOutcome> {
        let tiering = self.topology.tiering_for_bucket(&chunk.bucket_id)?;

        let encoder = self.encoders.get(&chunk.coding)?;
        let mut chunk = tokio::task::spawn_blocking(move || encoder.encode(chunk, &plain))
            .await
            .map_err(|e| Error::Internal(format!("encode task failed: {}", e)))??;

        let placed = self
            .planner
            .allocate_chunk(&mut chunk, tiering)
            .inspect_err(|_| {
                self.metrics
                    .placement_failures
                    .with_label_values(&["capacity"])
                    .inc();
            })?;
        chunk.is_building_blocks = true;
        self.metrics.blocks_allocated.inc_by(placed as u64);
        self.emit(DomainEvent::blocks_allocated(&chunk, placed)).await;

        self.write_blocks(&mut chunk).await?;
        chunk.is_building_blocks = false;
        chunk.clear_frag_data();

        self.store
            .put_coding_config(CodingConfigRecord::new(chunk.system_id.clone(), &chunk.coding))
            .await?;

        match self.store.insert_chunk(ChunkRecordSet::from_chunk(&chunk)?).await {
            Ok(()) => {
                self.metrics.chunks_created.inc();
                self.emit(DomainEvent::chunk_created(&chunk)).await;
                debug!(tier = %chunk.tier_id, blocks = placed, "Chunk stored");
                Ok(WriteOutcome::Stored(chunk))
            }
            Err(Error::DedupRaceLost { existing }) => {
                self.metrics.dedup_races.inc();
                self.discard_blocks(&chunk).await;
                let winner = self.load_live_chunk(existing).await?;
                info!(winner = %existing, discarded = %chunk.id, "Dedup race lost");
                self.emit(DomainEvent::dedup_race_resolved(existing, chunk.id)).await;
                Ok(WriteOutcome::RaceLost { winner })
            }
            Err(e) => {
                self.discard_blocks(&chunk).await;
                Err(e)
            }
        }
    }
}
