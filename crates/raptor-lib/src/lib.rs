// Raptor: approximate membership queries over DNA sequence collections.
//
// Builds (Hierarchical) Interleaved Bloom Filter indices over user bins of
// sequence files and answers, for a query sequence, which bins share enough
// minimisers with it under a principled threshold model.

#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod constants;
pub mod encoding;
pub mod error;
pub mod shape;
pub mod minimiser;
pub mod ibf;
pub mod hibf;
pub mod threshold;
pub mod partition;
pub mod reader;
pub mod prepare;
pub mod index;
pub mod build;
pub mod search;

// Re-export common types at crate root
pub use build::{parse_bin_paths, parse_hibf_layout, BuildConfig};
pub use error::{RaptorError, Result};
pub use hibf::{BinKind, HibfNode, HierarchicalIbf};
pub use ibf::{CountingAgent, InterleavedBloomFilter, MembershipAgent};
pub use index::{IndexHeader, IndexPayload, RaptorIndex};
pub use minimiser::MinimiserExtractor;
pub use partition::PartitionConfig;
pub use prepare::PrepareConfig;
pub use search::{search, search_with_cancel, SearchConfig};
pub use shape::Shape;
pub use threshold::{Threshold, ThresholdMode, ThresholdParams};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}
