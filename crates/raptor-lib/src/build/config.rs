//! Build configuration
//!
//! Validated parameters for an index build. Validation runs before any file
//! is opened so argument errors surface immediately.

use std::path::PathBuf;

use crate::constants::{MAX_HASH_FUNCTIONS, MIN_HASH_FUNCTIONS};
use crate::error::{RaptorError, Result};
use crate::shape::Shape;

/// Parameters for building an index.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    /// One user bin per entry; each entry lists the bin's input files.
    /// Ignored (and taken from the layout) when `hibf_layout` is set.
    pub bin_paths: Vec<Vec<PathBuf>>,
    /// Output index path. Partitioned builds append `.0` through `.P-1`.
    pub output: PathBuf,
    /// Minimiser shape.
    pub shape: Shape,
    /// Minimiser window size in bases.
    pub window_size: usize,
    /// Target false-positive rate per bin.
    pub fpr: f64,
    /// Bloom filter hash function count.
    pub hash_count: u32,
    /// Number of hash-space partitions (power of two, 1 = monolithic).
    pub parts: usize,
    /// Inputs are `.minimiser` files instead of sequence files.
    pub input_is_minimiser: bool,
    /// Layout file describing a hierarchical index; `None` builds flat.
    pub hibf_layout: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            bin_paths: Vec::new(),
            output: PathBuf::from("raptor.index"),
            shape: Shape::ungapped(20).expect("20 is a valid span"),
            window_size: 24,
            fpr: 0.05,
            hash_count: 2,
            parts: 1,
            input_is_minimiser: false,
            hibf_layout: None,
        }
    }
}

impl BuildConfig {
    /// Check parameter consistency.
    pub fn validate(&self) -> Result<()> {
        if self.window_size < self.shape.span() {
            return Err(RaptorError::InvalidArgument(format!(
                "window size {} must be >= shape span {}",
                self.window_size,
                self.shape.span()
            )));
        }
        if !(self.fpr > 0.0 && self.fpr < 1.0) {
            return Err(RaptorError::InvalidArgument(format!(
                "false-positive rate must be in (0, 1), got {}",
                self.fpr
            )));
        }
        if !(MIN_HASH_FUNCTIONS..=MAX_HASH_FUNCTIONS).contains(&self.hash_count) {
            return Err(RaptorError::InvalidArgument(format!(
                "hash function count must be in [{MIN_HASH_FUNCTIONS}, {MAX_HASH_FUNCTIONS}], got {}",
                self.hash_count
            )));
        }
        if self.parts == 0 || !self.parts.is_power_of_two() {
            return Err(RaptorError::InvalidArgument(format!(
                "parts must be a power of two, got {}",
                self.parts
            )));
        }
        if self.hibf_layout.is_some() && self.parts != 1 {
            return Err(RaptorError::InvalidArgument(
                "a hierarchical index cannot be partitioned".into(),
            ));
        }
        if self.hibf_layout.is_none() && self.bin_paths.is_empty() {
            return Err(RaptorError::InvalidArgument(
                "no user bins given".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> BuildConfig {
        BuildConfig {
            bin_paths: vec![vec![PathBuf::from("a.fa")]],
            ..BuildConfig::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_window_smaller_than_shape() {
        let config = BuildConfig {
            window_size: 4,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fpr_range() {
        assert!(BuildConfig { fpr: 0.0, ..valid() }.validate().is_err());
        assert!(BuildConfig { fpr: 1.0, ..valid() }.validate().is_err());
    }

    #[test]
    fn test_parts_power_of_two() {
        assert!(BuildConfig { parts: 3, ..valid() }.validate().is_err());
        assert!(BuildConfig { parts: 4, ..valid() }.validate().is_ok());
    }

    #[test]
    fn test_hibf_excludes_partitioning() {
        let config = BuildConfig {
            parts: 2,
            hibf_layout: Some(PathBuf::from("layout.tsv")),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_bins_rejected() {
        assert!(BuildConfig::default().validate().is_err());
    }
}
