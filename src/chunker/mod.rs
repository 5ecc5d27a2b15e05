//! Chunk Builder
//!
//! - **CDC** (`cdc.rs`) - gear-hash content-defined chunking
//! - **Builder** (`builder.rs`) - chunk/part production with deduplication

pub mod builder;
pub mod cdc;

pub use builder::{BuildOutput, ChunkBuilder, ChunkWriter, WriteOutcome};
pub use cdc::ContentChunker;
