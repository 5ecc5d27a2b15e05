//! Identifier value objects
//!
//! Entities created by the engine (chunks, frags, blocks, parts, objects) are
//! identified by random UUIDs. Topology entities (system, pools, nodes, tiers,
//! tierings, buckets) come from cluster configuration and use the operator's
//! string names, which also gives placement a stable lexicographic tie-break.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse the opaque string form used on the wire.
            pub fn parse(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| Error::schema($kind, format!("invalid id '{}': {}", s, e)))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

uuid_id!(
    /// Chunk identifier.
    ChunkId,
    "chunk"
);
uuid_id!(
    /// Fragment identifier.
    FragId,
    "frag"
);
uuid_id!(
    /// Block (fragment replica) identifier.
    BlockId,
    "block"
);
uuid_id!(
    /// Part identifier.
    PartId,
    "part"
);
uuid_id!(
    /// Object identifier.
    ObjectId,
    "object"
);
uuid_id!(
    /// Multipart upload identifier.
    MultipartId,
    "multipart"
);

name_id!(
    /// System (cluster) identifier.
    SystemId
);
name_id!(
    /// Pool identifier.
    PoolId
);
name_id!(
    /// Storage node identifier.
    NodeId
);
name_id!(
    /// Tier identifier.
    TierId
);
name_id!(
    /// Tiering policy identifier.
    TieringId
);
name_id!(
    /// Bucket identifier.
    BucketId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_id_parse_roundtrip() {
        let id = ChunkId::new();
        let parsed = ChunkId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_uuid_id_parse_rejects_garbage() {
        let err = BlockId::parse("not-an-id").unwrap_err();
        assert!(matches!(err, Error::SchemaValidation { entity: "block", .. }));
    }

    #[test]
    fn test_name_ids_order_lexicographically() {
        let mut pools = vec![PoolId::new("pool-c"), PoolId::new("pool-a"), PoolId::new("pool-b")];
        pools.sort();
        assert_eq!(pools[0].as_str(), "pool-a");
        assert_eq!(pools[2].to_string(), "pool-c");
    }
}
