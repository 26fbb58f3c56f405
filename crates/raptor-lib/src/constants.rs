//! Pinned constants shared by build and search.
//!
//! Everything in this module is part of the persisted index format: changing
//! any of these values invalidates previously written indices.

/// Base seed for the canonical k-mer hash. The effective seed is derived from
/// the shape weight, see [`crate::shape::adjust_seed`].
pub const DEFAULT_SEED: u64 = 0x8F3F_73B5_CF1C_9ADE;

/// Seed family for the per-hash-function row mixers of the interleaved
/// Bloom filter. One entry per supported hash function, index 0..=4.
pub const ROW_SEEDS: [u64; 5] = [
    0x9E37_79B9_7F4A_7C15,
    0xC2B2_AE3D_27D4_EB4F,
    0x1656_67B1_9E37_79F9,
    0xD6E8_FEB8_6659_FD93,
    0xA076_1D64_78BD_642F,
];

/// Magic bytes identifying a persisted index file.
pub const INDEX_MAGIC: &[u8; 8] = b"RPTRIDX1";

/// Index file format version: (major, minor).
/// Increment major on breaking changes, minor on compatible changes.
pub const FORMAT_VERSION: (u32, u32) = (1, 0);

/// Number of query records processed per chunk at search time.
pub const QUERY_CHUNK_SIZE: usize = 10 * (1 << 20);

/// Occurrence counts in the prepare step saturate at this value. The largest
/// cutoff is far below it, so higher counts carry no information.
pub const MAX_OCCURRENCE: u8 = 254;

/// File-size tiers for the occurrence cutoff, as (upper bound in bytes,
/// cutoff). Files above the last bound get [`CUTOFF_MAX`]. Compressed inputs
/// count three times their on-disk size before the lookup.
pub const CUTOFF_BOUNDS: [(u64, u8); 2] = [(314_572_800, 1), (1_073_741_824, 2)];

/// Cutoff for files above every bound in [`CUTOFF_BOUNDS`].
pub const CUTOFF_MAX: u8 = 3;

/// Supported hash function counts for the interleaved Bloom filter.
pub const MIN_HASH_FUNCTIONS: u32 = 2;
/// Upper bound of the supported hash function range.
pub const MAX_HASH_FUNCTIONS: u32 = 5;

/// Largest minimiser count covered by a precomputed probabilistic threshold
/// table; larger queries clamp to the last entry.
pub const MAX_THRESHOLD_MINIMISERS: usize = 4096;

/// Crate version number.
pub const VERSION: (u8, u8, u8) = (0, 1, 0);
