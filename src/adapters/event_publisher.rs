//! Event Publisher Adapters
//!
//! `LoggingEventPublisher` writes each domain event as one structured log
//! line keyed by `event_type` and `chunk_id`; `InMemoryEventCollector` keeps
//! events around for assertions.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;
use crate::model::ChunkId;

/// Logs domain events through `tracing`.
///
/// Unreadable chunks, failed rebuilds and nodes going offline are logged at
/// warn; everything else at info, or debug when built with `quiet()`.
#[derive(Debug, Clone)]
pub struct LoggingEventPublisher {
    quiet: bool,
}

impl Default for LoggingEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self { quiet: false }
    }

    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

fn needs_attention(event: &DomainEvent) -> bool {
    match event {
        DomainEvent::RebuildFailed { .. } => true,
        DomainEvent::ChunkDegraded { accessible, .. } => !accessible,
        DomainEvent::NodeLivenessChanged { online, .. } => !online,
        _ => false,
    }
}

/// Short `key=value` rendering of the fields not carried as log fields.
fn detail(event: &DomainEvent) -> String {
    match event {
        DomainEvent::ChunkCreated {
            bucket,
            tier,
            size,
            frags,
            ..
        } => format!("bucket={} tier={} size={} frags={}", bucket, tier, size, frags),
        DomainEvent::DedupHit { bucket, size, .. } => format!("bucket={} size={}", bucket, size),
        DomainEvent::DedupRaceResolved { discarded, .. } => format!("discarded={}", discarded),
        DomainEvent::BlocksAllocated { tier, blocks, .. } => {
            format!("tier={} blocks={}", tier, blocks)
        }
        DomainEvent::ChunkDegraded {
            accessible,
            deficient_frags,
            ..
        } => format!(
            "accessible={} deficient=[{}]",
            accessible,
            deficient_frags.join(",")
        ),
        DomainEvent::RebuildQueued { frags, .. } => format!("frags=[{}]", frags.join(",")),
        DomainEvent::RebuildCompleted {
            rebuilt_blocks,
            duration_ms,
            ..
        } => format!("blocks={} duration_ms={}", rebuilt_blocks, duration_ms),
        DomainEvent::RebuildFailed {
            reason, attempts, ..
        } => format!("attempts={} reason={}", attempts, reason),
        DomainEvent::NodeLivenessChanged { node_id, online, .. } => {
            format!("node={} online={}", node_id, online)
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let event_type = event.event_type();
        let chunk_id = event.chunk_id().map(|id| id.to_string());
        let chunk_id = chunk_id.as_deref();
        let detail = detail(&event);

        if needs_attention(&event) {
            warn!(event_type, chunk_id, %detail, "Domain event");
        } else if self.quiet {
            debug!(event_type, chunk_id, %detail, "Domain event");
        } else {
            info!(event_type, chunk_id, %detail, "Domain event");
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Keeps published events in order, for tests.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: Mutex<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.matching(|e| e.event_type() == event_type)
    }

    /// Events about `chunk`, oldest first.
    pub fn events_for_chunk(&self, chunk: ChunkId) -> Vec<DomainEvent> {
        self.matching(|e| e.chunk_id() == Some(chunk))
    }

    fn matching(&self, pred: impl Fn(&DomainEvent) -> bool) -> Vec<DomainEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        self.events.lock().extend(events);
        Ok(())
    }
}
