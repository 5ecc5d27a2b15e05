//! Rebuild queue and workers
//!
//! Handles background restoration of chunks that lost blocks.
//!
//! ```text
//!   scan / node change ──▶ HealthTracker::check ──▶ RebuildQueue (coalesced per chunk)
//!                                                        │
//!                                      Semaphore(max_concurrent)
//!                                                        ▼
//!   re-evaluate ──▶ copy surviving replica | reconstruct ──▶ allocate_frags
//!        │                                                       │
//!        └── healthy: drop                      write ──▶ commit ──▶ retire replaced blocks
//! ```
//!
//! Retryable failures (no capacity, block I/O) come back with exponential
//! backoff until `max_retries`; anything else is logged and left for the
//! next scan.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::accessibility::ChunkHealth;
use super::tracker::{HealthTracker, RebuildRequest};
use crate::config::RebuildConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{load_chunk, BlockStore, EventPublisher, MetadataStore};
use crate::ec::EncoderCache;
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::model::{BlockId, Chunk, ChunkId, FragIndex, NodeId};
use crate::placement::PlacementPlanner;
use crate::schema::record::BlockRecord;
use crate::schema::wire::BlockMd;

// =============================================================================
// Queue
// =============================================================================

/// Pending rebuild requests, at most one per chunk.
///
/// The channel carries chunk ids; the request itself lives in `pending` so
/// later requests for a queued chunk merge into it instead of queueing twice.
/// A popped chunk stays in `in_flight` until `finish`; requests arriving in
/// the meantime are held there and queued again when the rebuild finishes.
///
/// Lock order: `in_flight` entry, then `pending` entry.
pub struct RebuildQueue {
    pending: DashMap<ChunkId, RebuildRequest>,
    in_flight: DashMap<ChunkId, Option<RebuildRequest>>,
    tx: mpsc::Sender<ChunkId>,
    rx: Mutex<mpsc::Receiver<ChunkId>>,
}

impl RebuildQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            pending: DashMap::new(),
            in_flight: DashMap::new(),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Queue `request`. Returns false when it merged into a pending or
    /// running request, or the queue is full.
    pub fn push(&self, request: RebuildRequest) -> bool {
        let _idle = match self.in_flight.entry(request.chunk_id) {
            Entry::Occupied(mut running) => {
                let merged = match running.get_mut().take() {
                    Some(mut deferred) => {
                        deferred.merge(request);
                        deferred
                    }
                    None => request,
                };
                running.insert(Some(merged));
                return false;
            }
            Entry::Vacant(idle) => idle,
        };

        match self.pending.entry(request.chunk_id) {
            Entry::Occupied(mut e) => {
                e.get_mut().merge(request);
                false
            }
            Entry::Vacant(e) => match self.tx.try_send(request.chunk_id) {
                Ok(()) => {
                    e.insert(request);
                    true
                }
                Err(err) => {
                    warn!(chunk_id = %request.chunk_id, error = %err, "Rebuild queue full, dropping request");
                    false
                }
            },
        }
    }

    /// Wait for the next request. The chunk counts as running until `finish`.
    pub async fn pop(&self) -> Option<RebuildRequest> {
        let mut rx = self.rx.lock().await;
        while let Some(id) = rx.recv().await {
            if let Some(request) = self.start(id) {
                return Some(request);
            }
        }
        None
    }

    /// Next request if one is ready now.
    pub fn try_pop(&self) -> Option<RebuildRequest> {
        let mut rx = self.rx.try_lock().ok()?;
        while let Ok(id) = rx.try_recv() {
            if let Some(request) = self.start(id) {
                return Some(request);
            }
        }
        None
    }

    fn start(&self, id: ChunkId) -> Option<RebuildRequest> {
        let Entry::Vacant(running) = self.in_flight.entry(id) else {
            return None;
        };
        let (_, request) = self.pending.remove(&id)?;
        running.insert(None);
        Some(request)
    }

    /// Mark the rebuild of `chunk` done. Returns the requests that arrived
    /// while it ran, merged, for the caller to queue again.
    pub fn finish(&self, chunk: &ChunkId) -> Option<RebuildRequest> {
        self.in_flight.remove(chunk).and_then(|(_, deferred)| deferred)
    }

    pub fn is_running(&self, chunk: &ChunkId) -> bool {
        self.in_flight.contains_key(chunk)
    }

    pub fn contains(&self, chunk: &ChunkId) -> bool {
        self.pending.contains_key(chunk)
    }

    pub fn get(&self, chunk: &ChunkId) -> Option<RebuildRequest> {
        self.pending.get(chunk).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// New blocks were written and committed
    Rebuilt { blocks: usize, frags: Vec<FragIndex> },
    /// The chunk recovered on its own before the worker got to it
    Healthy,
    /// The chunk is gone, deleted or a dedup reference
    Skipped,
}

/// Summary of one health scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub degraded: usize,
    pub unreadable: usize,
    pub queued: usize,
}

// =============================================================================
// Rebuilder
// =============================================================================

/// Collaborators the rebuild workers act through.
#[derive(Clone)]
pub struct RebuildContext {
    pub store: Arc<dyn MetadataStore>,
    pub blocks: Arc<dyn BlockStore>,
    pub planner: Arc<PlacementPlanner>,
    pub tracker: Arc<HealthTracker>,
    pub encoders: Arc<EncoderCache>,
    pub publisher: Arc<dyn EventPublisher>,
    pub metrics: EngineMetrics,
}

pub struct Rebuilder {
    config: RebuildConfig,
    ctx: RebuildContext,
    queue: RebuildQueue,
    semaphore: Arc<Semaphore>,
}

impl Rebuilder {
    pub fn new(config: RebuildConfig, ctx: RebuildContext) -> Self {
        Self {
            queue: RebuildQueue::new(config.queue_capacity),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            ctx,
        }
    }

    pub fn queue(&self) -> &RebuildQueue {
        &self.queue
    }

    /// Queue a request and announce it.
    pub async fn enqueue(&self, request: RebuildRequest) -> bool {
        let frags = request.frag_list();
        let chunk_id = request.chunk_id;
        let queued = self.queue.push(request);
        self.ctx.metrics.rebuild_queue_depth.set(self.queue.len() as i64);
        if queued {
            self.ctx.metrics.rebuilds.with_label_values(&["queued"]).inc();
            debug!(%chunk_id, frags = frags.len(), "Rebuild queued");
            self.emit(DomainEvent::rebuild_queued(chunk_id, &frags)).await;
        }
        queued
    }

    /// Evaluate every live data chunk and queue those needing a rebuild.
    pub async fn scan_all(&self) -> Result<ScanReport> {
        let report = self.scan_where(|_| true).await?;
        self.ctx.metrics.degraded_chunks.set(report.degraded as i64);
        self.ctx.metrics.unreadable_chunks.set(report.unreadable as i64);
        Ok(report)
    }

    /// Evaluate live data chunks with a block on `node`.
    pub async fn scan_node(&self, node: &NodeId) -> Result<ScanReport> {
        self.scan_where(|chunk| HealthTracker::touches_node(chunk, node))
            .await
    }

    #[instrument(skip(self, filter))]
    async fn scan_where<F>(&self, filter: F) -> Result<ScanReport>
    where
        F: Fn(&Chunk) -> bool + Send + Sync,
    {
        let mut report = ScanReport::default();
        for id in self.ctx.store.list_live_chunk_ids().await? {
            let chunk = match load_chunk(self.ctx.store.as_ref(), id).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => continue,
                Err(e) => {
                    warn!(chunk_id = %id, error = %e, "Skipping chunk that failed to load");
                    continue;
                }
            };
            if chunk.is_dedup_reference() || !filter(&chunk) {
                continue;
            }

            report.scanned += 1;
            let verdict = self.ctx.tracker.check(&chunk);
            if !verdict.health.accessible {
                report.unreadable += 1;
            }
            if let Some(request) = verdict.request {
                report.degraded += 1;
                self.emit(DomainEvent::chunk_degraded(
                    chunk.id,
                    verdict.health.accessible,
                    &request.frag_list(),
                ))
                .await;
                if self.enqueue(request).await {
                    report.queued += 1;
                }
            }
        }
        debug!(
            scanned = report.scanned,
            degraded = report.degraded,
            unreadable = report.unreadable,
            "Health scan finished"
        );
        Ok(report)
    }

    /// Run queued rebuilds one after another until the queue is empty.
    /// Retries are left to the caller.
    pub async fn drain(&self) -> Vec<(ChunkId, Result<RebuildOutcome>)> {
        let mut results = Vec::new();
        while let Some(request) = self.queue.try_pop() {
            let result = self.rebuild_chunk(&request).await;
            self.record(&request, &result).await;
            self.finish(&request.chunk_id).await;
            results.push((request.chunk_id, result));
        }
        self.ctx.metrics.rebuild_queue_depth.set(self.queue.len() as i64);
        results
    }

    /// Dispatch loop: periodic scans plus queued requests, bounded by the
    /// semaphore, until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            max_concurrent = self.config.max_concurrent,
            scan_interval = ?self.config.scan_interval,
            "Starting rebuild workers"
        );

        let mut tick = interval(self.config.scan_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Rebuild workers shutting down");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.scan_all().await {
                        error!(error = %e, "Health scan failed");
                    }
                }
                request = self.queue.pop() => {
                    let Some(request) = request else { break };
                    let permit = tokio::select! {
                        permit = self.semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = cancel.cancelled() => break,
                    };
                    self.ctx.metrics.rebuild_queue_depth.set(self.queue.len() as i64);

                    let worker = Arc::clone(&self);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let result = worker.rebuild_chunk(&request).await;
                        let retry = worker.record(&request, &result).await;
                        worker.finish(&request.chunk_id).await;
                        drop(permit);
                        if let Some((retry, delay)) = retry {
                            worker.retry_after(retry, delay, cancel).await;
                        }
                    });
                }
            }
        }
    }

    /// Log, count and announce the result of one rebuild. Returns the retry
    /// to schedule, if the error allows one.
    async fn record(
        &self,
        request: &RebuildRequest,
        result: &Result<RebuildOutcome>,
    ) -> Option<(RebuildRequest, Duration)> {
        let chunk_id = request.chunk_id;
        match result {
            Ok(RebuildOutcome::Rebuilt { blocks, frags }) => {
                self.ctx.metrics.rebuilds.with_label_values(&["completed"]).inc();
                info!(%chunk_id, blocks, frags = frags.len(), "Rebuild completed");
            }
            Ok(RebuildOutcome::Healthy) => {
                self.ctx.metrics.rebuilds.with_label_values(&["cancelled"]).inc();
                debug!(%chunk_id, "Chunk healed before rebuild");
            }
            Ok(RebuildOutcome::Skipped) => {
                debug!(%chunk_id, "Rebuild skipped");
            }
            Err(e) if e.is_retryable() && request.attempt < self.config.max_retries => {
                let mut retry = request.clone();
                retry.attempt += 1;
                let delay = self.config.backoff(retry.attempt);
                warn!(%chunk_id, attempt = retry.attempt, ?delay, error = %e, "Rebuild will be retried");
                self.ctx.metrics.rebuilds.with_label_values(&["retried"]).inc();
                return Some((retry, delay));
            }
            Err(e) => {
                let outcome = if e.is_retryable() { "failed" } else { "unrecoverable" };
                self.ctx.metrics.rebuilds.with_label_values(&[outcome]).inc();
                error!(%chunk_id, attempts = request.attempt + 1, error = %e, "Rebuild gave up until next scan");
                self.emit(DomainEvent::rebuild_failed(chunk_id, e.to_string(), request.attempt + 1))
                    .await;
            }
        }
        None
    }

    /// Release a finished chunk and queue whatever arrived while it ran.
    async fn finish(&self, chunk_id: &ChunkId) {
        if let Some(deferred) = self.queue.finish(chunk_id) {
            debug!(%chunk_id, "Requeueing rebuild requested while running");
            self.enqueue(deferred).await;
        }
    }

    async fn retry_after(
        &self,
        request: RebuildRequest,
        delay: Duration,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = sleep(delay) => {
                self.enqueue(request).await;
            }
            _ = cancel.cancelled() => {}
        }
    }

    // =========================================================================
    // Single Chunk
    // =========================================================================

    /// Restore the deficient frags of one chunk.
    ///
    /// Health is evaluated again first; the frags in `request` are a hint,
    /// the current deficiency decides what gets rebuilt.
    #[instrument(skip(self, request), fields(chunk_id = %request.chunk_id, attempt = request.attempt))]
    pub async fn rebuild_chunk(&self, request: &RebuildRequest) -> Result<RebuildOutcome> {
        let started = Instant::now();
        let Some(mut chunk) = load_chunk(self.ctx.store.as_ref(), request.chunk_id).await? else {
            return Ok(RebuildOutcome::Skipped);
        };
        if chunk.deleted.is_some() || chunk.is_dedup_reference() {
            return Ok(RebuildOutcome::Skipped);
        }

        let health = self.ctx.tracker.evaluate(&chunk);
        if !health.needs_rebuild() {
            return Ok(RebuildOutcome::Healthy);
        }
        let wanted = health.deficient_frags();

        let sources = self.frag_sources(&chunk, &health, &wanted).await?;

        let new_ids = self.ctx.planner.allocate_frags(&mut chunk, &wanted, &health)?;
        self.ctx.metrics.blocks_allocated.inc_by(new_ids.len() as u64);

        let (committed, first_error) = self.write_new_blocks(&mut chunk, &new_ids, &sources).await;

        // Retire unreadable blocks of frags that are back at full strength.
        let now = Utc::now();
        let mut changed: Vec<BlockId> = committed.iter().copied().collect();
        for fh in health.frags.iter().filter(|f| wanted.contains(&f.index)) {
            let Some(frag) = chunk.frags.iter_mut().find(|f| f.id == fh.frag_id) else {
                continue;
            };
            let added = frag.blocks.iter().filter(|b| committed.contains(&b.id)).count();
            if fh.accessible_blocks + added < fh.expected_blocks {
                continue;
            }
            for block in frag.blocks.iter_mut() {
                if fh.inaccessible_blocks.contains(&block.id) {
                    block.mark_deletion(now);
                    changed.push(block.id);
                }
            }
        }

        let records: Vec<BlockRecord> = chunk
            .blocks()
            .filter(|b| changed.contains(&b.id))
            .map(BlockRecord::from)
            .collect();
        if !records.is_empty() {
            self.ctx.store.upsert_blocks(records).await?;
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        self.emit(DomainEvent::rebuild_completed(
            chunk.id,
            committed.len(),
            started.elapsed(),
        ))
        .await;
        Ok(RebuildOutcome::Rebuilt {
            blocks: committed.len(),
            frags: wanted,
        })
    }

    /// Bytes for every wanted frag: a surviving replica when one reads back
    /// intact, otherwise regenerated from the other frags.
    async fn frag_sources(
        &self,
        chunk: &Chunk,
        health: &ChunkHealth,
        wanted: &[FragIndex],
    ) -> Result<BTreeMap<FragIndex, Bytes>> {
        let mut sources = BTreeMap::new();
        for index in wanted {
            if let Some(data) = self.read_frag(chunk, health, *index).await {
                sources.insert(*index, data);
            }
        }

        let missing: Vec<FragIndex> = wanted
            .iter()
            .filter(|i| !sources.contains_key(*i))
            .copied()
            .collect();
        if missing.is_empty() {
            return Ok(sources);
        }

        let mut available = BTreeMap::new();
        for frag in chunk.frags.iter().filter(|f| !missing.contains(&f.index)) {
            if let Some(data) = sources.get(&frag.index) {
                available.insert(frag.index, data.clone());
            } else if let Some(data) = self.read_frag(chunk, health, frag.index).await {
                available.insert(frag.index, data);
            }
        }
        debug!(
            missing = missing.len(),
            available = available.len(),
            "Reconstructing frags"
        );

        let encoder = self.ctx.encoders.get(&chunk.coding)?;
        let snapshot = chunk.clone();
        let rebuilt = tokio::task::spawn_blocking(move || {
            encoder.reconstruct_frags(&snapshot, &available, &missing)
        })
        .await
        .map_err(|e| Error::Internal(format!("reconstruction task failed: {}", e)))??;

        sources.extend(rebuilt);
        Ok(sources)
    }

    /// First accessible block of a frag whose bytes match the frag digest.
    async fn read_frag(&self, chunk: &Chunk, health: &ChunkHealth, index: FragIndex) -> Option<Bytes> {
        let frag = chunk.frag(index)?;
        let digest_type = chunk.coding.frag_digest_type();
        for block in frag.blocks.iter().filter(|b| health.is_block_accessible(&b.id)) {
            let md = BlockMd::for_block(block, frag, digest_type);
            match self.ctx.blocks.read_block(&md).await {
                Ok(data) if digest_type.digest(&data) == frag.digest => return Some(data),
                Ok(_) => warn!(block_id = %block.id, frag = %index, "Replica failed digest check"),
                Err(e) => warn!(block_id = %block.id, frag = %index, error = %e, "Replica unreadable"),
            }
        }
        None
    }

    /// Write the new blocks concurrently. Committed blocks stay on the
    /// chunk, failed ones are dropped and their reservations released.
    async fn write_new_blocks(
        &self,
        chunk: &mut Chunk,
        new_ids: &[BlockId],
        sources: &BTreeMap<FragIndex, Bytes>,
    ) -> (HashSet<BlockId>, Option<Error>) {
        let digest_type = chunk.coding.frag_digest_type();
        let mut jobs = Vec::with_capacity(new_ids.len());
        for frag in &chunk.frags {
            let Some(data) = sources.get(&frag.index) else {
                continue;
            };
            for block in frag.blocks.iter().filter(|b| new_ids.contains(&b.id)) {
                jobs.push((block.id, BlockMd::for_block(block, frag, digest_type), data.clone()));
            }
        }

        let blocks = &self.ctx.blocks;
        let results = join_all(jobs.into_iter().map(|(id, md, data)| async move {
            (id, blocks.write_block(&md, data).await)
        }))
        .await;

        let mut committed = HashSet::new();
        let mut first_error = None;
        for (id, result) in results {
            match result {
                Ok(()) => {
                    committed.insert(id);
                }
                Err(e) => {
                    warn!(block_id = %id, error = %e, "Rebuilt block write failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        for frag in chunk.frags.iter_mut() {
            for block in frag.blocks.iter_mut().filter(|b| new_ids.contains(&b.id)) {
                self.ctx.planner.release(block);
                if committed.contains(&block.id) {
                    block.commit();
                }
            }
            frag.blocks
                .retain(|b| !new_ids.contains(&b.id) || committed.contains(&b.id));
        }
        self.ctx.metrics.blocks_committed.inc_by(committed.len() as u64);

        if committed.len() < new_ids.len() && first_error.is_none() {
            first_error = Some(Error::BlockWrite {
                block_id: chunk.id.to_string(),
                reason: "no source bytes for rebuilt frag".to_string(),
            });
        }
        (committed, first_error)
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.ctx.publisher.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}
