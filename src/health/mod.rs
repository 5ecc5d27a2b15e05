//! Block Health Tracker
//!
//! - **Accessibility** (`accessibility.rs`) - block, frag and chunk health
//!   from node state
//! - **Tracker** (`tracker.rs`) - health verdicts and rebuild requests
//! - **Rebuild** (`rebuild.rs`) - coalescing queue and bounded workers
//!
//! Reduced redundancy is a state, not an error: it shows up in
//! [`ChunkHealth`] and turns into a [`RebuildRequest`].

pub mod accessibility;
pub mod rebuild;
pub mod tracker;

pub use accessibility::{evaluate_chunk, is_block_accessible, ChunkHealth, FragHealth};
pub use rebuild::{RebuildContext, RebuildOutcome, RebuildQueue, Rebuilder, ScanReport};
pub use tracker::{HealthTracker, HealthVerdict, RebuildRequest};
