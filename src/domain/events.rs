//! Domain Events
//!
//! Immutable records of things that happened to chunks, blocks and nodes.
//! Used for audit logging and for tests that assert on engine behaviour.
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::chunk_created(&chunk);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::{Chunk, ChunkId, FragIndex, NodeId};

/// Domain event representing a significant occurrence in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Ingest Events
    // =========================================================================
    /// A new chunk was encoded, placed and stored.
    ChunkCreated {
        chunk_id: ChunkId,
        bucket: String,
        tier: String,
        size: u64,
        frags: usize,
        timestamp: DateTime<Utc>,
    },

    /// A chunk's content matched an existing chunk.
    DedupHit {
        chunk_id: ChunkId,
        bucket: String,
        size: u64,
        timestamp: DateTime<Utc>,
    },

    /// A concurrent writer stored the same content first.
    DedupRaceResolved {
        winner: ChunkId,
        discarded: ChunkId,
        timestamp: DateTime<Utc>,
    },

    /// Blocks were allocated for a chunk.
    BlocksAllocated {
        chunk_id: ChunkId,
        tier: String,
        blocks: usize,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Health Events
    // =========================================================================
    /// A chunk lost redundancy or became unreadable.
    ChunkDegraded {
        chunk_id: ChunkId,
        accessible: bool,
        deficient_frags: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A rebuild was queued for a chunk.
    RebuildQueued {
        chunk_id: ChunkId,
        frags: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A rebuild restored a chunk's redundancy.
    RebuildCompleted {
        chunk_id: ChunkId,
        rebuilt_blocks: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A rebuild gave up.
    RebuildFailed {
        chunk_id: ChunkId,
        reason: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// A node went offline or came back.
    NodeLivenessChanged {
        node_id: String,
        online: bool,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::ChunkCreated { timestamp, .. }
            | DomainEvent::DedupHit { timestamp, .. }
            | DomainEvent::DedupRaceResolved { timestamp, .. }
            | DomainEvent::BlocksAllocated { timestamp, .. }
            | DomainEvent::ChunkDegraded { timestamp, .. }
            | DomainEvent::RebuildQueued { timestamp, .. }
            | DomainEvent::RebuildCompleted { timestamp, .. }
            | DomainEvent::RebuildFailed { timestamp, .. }
            | DomainEvent::NodeLivenessChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ChunkCreated { .. } => "ChunkCreated",
            DomainEvent::DedupHit { .. } => "DedupHit",
            DomainEvent::DedupRaceResolved { .. } => "DedupRaceResolved",
            DomainEvent::BlocksAllocated { .. } => "BlocksAllocated",
            DomainEvent::ChunkDegraded { .. } => "ChunkDegraded",
            DomainEvent::RebuildQueued { .. } => "RebuildQueued",
            DomainEvent::RebuildCompleted { .. } => "RebuildCompleted",
            DomainEvent::RebuildFailed { .. } => "RebuildFailed",
            DomainEvent::NodeLivenessChanged { .. } => "NodeLivenessChanged",
        }
    }

    /// Get the chunk ID if applicable.
    pub fn chunk_id(&self) -> Option<ChunkId> {
        match self {
            DomainEvent::ChunkCreated { chunk_id, .. }
            | DomainEvent::DedupHit { chunk_id, .. }
            | DomainEvent::BlocksAllocated { chunk_id, .. }
            | DomainEvent::ChunkDegraded { chunk_id, .. }
            | DomainEvent::RebuildQueued { chunk_id, .. }
            | DomainEvent::RebuildCompleted { chunk_id, .. }
            | DomainEvent::RebuildFailed { chunk_id, .. } => Some(*chunk_id),
            DomainEvent::DedupRaceResolved { winner, .. } => Some(*winner),
            DomainEvent::NodeLivenessChanged { .. } => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

fn frag_names(frags: &[FragIndex]) -> Vec<String> {
    frags.iter().map(|f| f.to_string()).collect()
}

impl DomainEvent {
    pub fn chunk_created(chunk: &Chunk) -> Self {
        DomainEvent::ChunkCreated {
            chunk_id: chunk.id,
            bucket: chunk.bucket_id.to_string(),
            tier: chunk.tier_id.to_string(),
            size: chunk.size,
            frags: chunk.frags.len(),
            timestamp: Utc::now(),
        }
    }

    pub fn dedup_hit(existing: &Chunk) -> Self {
        DomainEvent::DedupHit {
            chunk_id: existing.id,
            bucket: existing.bucket_id.to_string(),
            size: existing.size,
            timestamp: Utc::now(),
        }
    }

    pub fn dedup_race_resolved(winner: ChunkId, discarded: ChunkId) -> Self {
        DomainEvent::DedupRaceResolved {
            winner,
            discarded,
            timestamp: Utc::now(),
        }
    }

    pub fn blocks_allocated(chunk: &Chunk, blocks: usize) -> Self {
        DomainEvent::BlocksAllocated {
            chunk_id: chunk.id,
            tier: chunk.tier_id.to_string(),
            blocks,
            timestamp: Utc::now(),
        }
    }

    pub fn chunk_degraded(chunk_id: ChunkId, accessible: bool, deficient: &[FragIndex]) -> Self {
        DomainEvent::ChunkDegraded {
            chunk_id,
            accessible,
            deficient_frags: frag_names(deficient),
            timestamp: Utc::now(),
        }
    }

    pub fn rebuild_queued(chunk_id: ChunkId, frags: &[FragIndex]) -> Self {
        DomainEvent::RebuildQueued {
            chunk_id,
            frags: frag_names(frags),
            timestamp: Utc::now(),
        }
    }

    pub fn rebuild_completed(chunk_id: ChunkId, rebuilt_blocks: usize, duration: Duration) -> Self {
        DomainEvent::RebuildCompleted {
            chunk_id,
            rebuilt_blocks,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn rebuild_failed(chunk_id: ChunkId, reason: impl Into<String>, attempts: u32) -> Self {
        DomainEvent::RebuildFailed {
            chunk_id,
            reason: reason.into(),
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn node_liveness_changed(node_id: &NodeId, online: bool) -> Self {
        DomainEvent::NodeLivenessChanged {
            node_id: node_id.to_string(),
            online,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let id = ChunkId::new();
        let event = DomainEvent::rebuild_queued(id, &[FragIndex::Data(0), FragIndex::Lrc(1)]);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("RebuildQueued"));
        assert!(json.contains("\"L1\""));

        let deserialized: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "RebuildQueued");
        assert_eq!(deserialized.chunk_id(), Some(id));
    }

    #[test]
    fn test_timestamp() {
        let before = Utc::now();
        let event = DomainEvent::node_liveness_changed(&NodeId::new("n1"), false);
        let after = Utc::now();

        assert!(event.timestamp() >= before);
        assert!(event.timestamp() <= after);
        assert_eq!(event.chunk_id(), None);
    }

    #[test]
    fn test_race_event_points_at_winner() {
        let winner = ChunkId::new();
        let event = DomainEvent::dedup_race_resolved(winner, ChunkId::new());
        assert_eq!(event.chunk_id(), Some(winner));
        assert_eq!(event.event_type(), "DedupRaceResolved");
    }

    #[test]
    fn test_rebuild_completed_duration() {
        let event =
            DomainEvent::rebuild_completed(ChunkId::new(), 3, Duration::from_millis(1500));
        match event {
            DomainEvent::RebuildCompleted { duration_ms, .. } => assert_eq!(duration_ms, 1500),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
