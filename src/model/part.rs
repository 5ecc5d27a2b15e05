//! Part entity - maps an object byte range onto a chunk

use chrono::{DateTime, Utc};

use super::ids::{BucketId, ChunkId, MultipartId, ObjectId, PartId, SystemId};

/// Maps `[start, end)` of an object onto a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub id: PartId,
    pub system_id: SystemId,
    pub bucket_id: BucketId,
    pub obj_id: ObjectId,
    /// Upload part this range belongs to, for multipart uploads
    pub multipart_id: Option<MultipartId>,
    pub chunk_id: ChunkId,
    /// Order of this part within the object
    pub seq: u64,
    pub start: u64,
    pub end: u64,
    /// Offset of `start` within the chunk, when the part maps a sub-range
    pub chunk_offset: Option<u64>,
    /// Written but not yet part of a completed upload
    pub uncommitted: bool,
    pub deleted: Option<DateTime<Utc>>,
}

impl Part {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this part overlaps `[start, end)`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    pub fn is_live(&self) -> bool {
        self.deleted.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_range() {
        let part = Part {
            id: PartId::new(),
            system_id: SystemId::new("sys"),
            bucket_id: BucketId::new("b"),
            obj_id: ObjectId::new(),
            multipart_id: None,
            chunk_id: ChunkId::new(),
            seq: 0,
            start: 100,
            end: 200,
            chunk_offset: None,
            uncommitted: false,
            deleted: None,
        };
        assert_eq!(part.len(), 100);
        assert!(part.overlaps(150, 300));
        assert!(part.overlaps(0, 101));
        assert!(!part.overlaps(200, 300));
        assert!(!part.overlaps(0, 100));
        assert!(part.is_live());
    }
}
