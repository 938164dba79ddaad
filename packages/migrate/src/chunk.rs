//! Byte-range partitioning for chunked transfers.

use bucket_mover_storage_models::ByteRange;

/// How one object is split into parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total: u64,
    chunk_size: u64,
}

/// One part of a [`ChunkPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPart {
    /// 1-based part number.
    pub part_number: i32,
    /// Inclusive byte range of the part.
    pub range: ByteRange,
}

impl ChunkPlan {
    /// Plans `total` bytes in parts of `chunk_size`.
    ///
    /// Returns `None` when either size is zero or the part count does not
    /// fit a part number.
    #[must_use]
    pub fn new(total: u64, chunk_size: u64) -> Option<Self> {
        if total == 0 || chunk_size == 0 {
            return None;
        }
        let plan = Self { total, chunk_size };
        i32::try_from(plan.part_count()).ok().map(|_| plan)
    }

    /// Object size in bytes.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Bytes per part (the last part may be shorter).
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `ceil(total / chunk_size)`.
    #[must_use]
    pub const fn part_count(&self) -> u64 {
        self.total.div_ceil(self.chunk_size)
    }

    /// Parts in ascending order. The last part ends at `total - 1`.
    pub fn parts(&self) -> impl Iterator<Item = ChunkPart> + '_ {
        (0..self.part_count()).zip(1i32..).map(|(index, part_number)| {
            let start = index * self.chunk_size;
            let end = (start + self.chunk_size).min(self.total) - 1;
            ChunkPart {
                part_number,
                range: ByteRange { start, end },
            }
        })
    }
}
