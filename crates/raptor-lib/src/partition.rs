//! Hash-space partitioning
//!
//! A partitioned index is P independent filters, each holding only the
//! hashes of its shard. Build and query must shard identically, so the
//! mapping lives here and nowhere else.

use crate::error::{RaptorError, Result};

/// Deterministic mapping from hashes to one of `parts` shards.
///
/// Uses the top bits of the hash: `hash >> (64 - log2(parts))`. The top bits
/// of the avalanche-mixed hash are uniform, and top-bit sharding keeps each
/// shard an interval of the hash space.
#[derive(Clone, Copy, Debug)]
pub struct PartitionConfig {
    parts: usize,
    shift: u32,
}

impl PartitionConfig {
    /// Create a config for `parts` shards. `parts` must be a power of two.
    pub fn new(parts: usize) -> Result<Self> {
        if parts == 0 || !parts.is_power_of_two() {
            return Err(RaptorError::InvalidArgument(format!(
                "parts must be a power of two, got {parts}"
            )));
        }
        Ok(Self {
            parts,
            shift: 64 - parts.trailing_zeros(),
        })
    }

    /// Number of shards.
    #[inline]
    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Shard of `hash`, in `[0, parts)`.
    #[inline]
    pub fn hash_partition(&self, hash: u64) -> usize {
        if self.parts == 1 {
            0
        } else {
            (hash >> self.shift) as usize
        }
    }
}
