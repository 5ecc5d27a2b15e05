//! StrataStor - Erasure-Coded Object Storage Engine
//!
//! The data-path core of a distributed object store: objects are split into
//! content-defined chunks, deduplicated, compressed, encrypted and
//! erasure-coded into frags, and every frag is stored as one or more blocks
//! on storage nodes chosen by tier policy. A health tracker watches block
//! accessibility and rebuilds what was lost.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │    Chunk     │──▶│   Fragment   │──▶│  Placement   │──▶│  Block Store │
//! │   Builder    │   │   Encoder    │   │   Planner    │   │    (port)    │
//! │ (CDC+dedup)  │   │ (zip/AES/EC) │   │ (tiers/pools)│   │              │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────────┘
//!         │                                                        ▲
//!         ▼                                                        │
//! ┌──────────────┐                     ┌──────────────┐            │
//! │   Metadata   │◀────────────────────│    Health    │────────────┘
//! │ Store (port) │                     │   Tracker    │  rebuilds
//! └──────────────┘                     └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory and logging implementations of the ports
//! - [`chunker`] - Content-defined chunking and deduplication
//! - [`coding`] - Coding configuration (replicas, parity, LRC, digests)
//! - [`config`] - Engine and cluster configuration
//! - [`domain`] - Ports and domain events
//! - [`ec`] - Compression, encryption, erasure and LRC coding
//! - [`engine`] - Write and read paths over the ports
//! - [`error`] - Error types
//! - [`health`] - Accessibility, rebuild queue and workers
//! - [`metrics`] - Prometheus metrics
//! - [`model`] - Chunks, frags, blocks, parts and topology
//! - [`placement`] - Tier selection and block placement
//! - [`schema`] - Wire and persisted representations

pub mod adapters;
pub mod chunker;
pub mod coding;
pub mod config;
pub mod domain;
pub mod ec;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod placement;
pub mod schema;

// Re-export commonly used types
pub use coding::CodingConfig;
pub use config::{ClusterConfig, EngineConfig};
pub use engine::{Engine, EnginePorts};
pub use error::{Error, Result};
pub use health::{ChunkHealth, RebuildRequest};
pub use placement::PlacementPlanner;
