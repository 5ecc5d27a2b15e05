//! Entity model
//!
//! Chunks own frags, frags own blocks. Parts map object ranges onto chunks.
//! Topology is the read-only cluster context placement works against.

pub mod block;
pub mod chunk;
pub mod ids;
pub mod part;
pub mod topology;

pub use block::{Block, BlockState};
pub use chunk::{Chunk, CipherParams, Frag, FragIndex};
pub use ids::{
    BlockId, BucketId, ChunkId, FragId, MultipartId, NodeId, ObjectId, PartId, PoolId, SystemId,
    TierId, TieringId,
};
pub use part::Part;
pub use topology::{
    Bucket, ChunkSplitConfig, DataPlacement, NodeInfo, NodeType, Pool, ResourceType, Tier,
    TierMirror, Tiering, TieringEntry, Topology,
};
