//! Interleaved Bloom Filter
//!
//! B Bloom filters sharing one hash family, laid out so that the B bits
//! answering "is this hash present in bin b?" for one row form a contiguous
//! stripe. A row is `bin_count_rounded / 64` words; row `r` occupies words
//! `[r * W, (r + 1) * W)`. One membership test per hash function touches one
//! stripe, so a bulk count over all bins is H stripe reads per hash.
//!
//! The row hash family is `fmix64(hash ^ ROW_SEEDS[i]) % bin_size`. It is
//! version-pinned: changing it invalidates persisted indices.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::{MAX_HASH_FUNCTIONS, MIN_HASH_FUNCTIONS, ROW_SEEDS};
use crate::error::{RaptorError, Result};
use crate::minimiser::fmix64;

/// Choose the number of rows so that a bin holding `cardinality` distinct
/// hashes stays at or below the target false-positive rate.
///
/// `bin_size = ceil(-H * n / ln(1 - p^(1/H)))`.
pub fn bin_size_for(cardinality: usize, fpr: f64, hash_count: u32) -> u64 {
    let n = cardinality.max(1) as f64;
    let h = hash_count as f64;
    let denom = (1.0 - fpr.powf(1.0 / h)).ln();
    ((-h * n) / denom).ceil().max(1.0) as u64
}

fn validate_params(bin_count: usize, bin_size: u64, hash_count: u32) -> Result<()> {
    if bin_count == 0 {
        return Err(RaptorError::InvalidArgument("bin count must be > 0".into()));
    }
    if bin_size == 0 {
        return Err(RaptorError::InvalidArgument("bin size must be > 0".into()));
    }
    if !(MIN_HASH_FUNCTIONS..=MAX_HASH_FUNCTIONS).contains(&hash_count) {
        return Err(RaptorError::InvalidArgument(format!(
            "hash function count must be in [{MIN_HASH_FUNCTIONS}, {MAX_HASH_FUNCTIONS}], got {hash_count}"
        )));
    }
    Ok(())
}

fn allocate_words(bin_size: u64, words_per_row: usize) -> Result<usize> {
    (bin_size as usize)
        .checked_mul(words_per_row)
        .ok_or(RaptorError::ResourceExhausted(usize::MAX))
}

/// A bit-packed bank of `bin_count` Bloom filters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterleavedBloomFilter {
    bin_count: usize,
    bin_count_rounded: usize,
    bin_size: u64,
    hash_count: u32,
    words_per_row: usize,
    data: Vec<u64>,
}

impl InterleavedBloomFilter {
    /// Allocate a zeroed filter. The bin count is rounded up to a multiple
    /// of 64; `bin_size` is the number of rows per hash function.
    pub fn new(bin_count: usize, bin_size: u64, hash_count: u32) -> Result<Self> {
        validate_params(bin_count, bin_size, hash_count)?;
        let bin_count_rounded = bin_count.div_ceil(64) * 64;
        let words_per_row = bin_count_rounded / 64;
        let len = allocate_words(bin_size, words_per_row)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| RaptorError::ResourceExhausted(len * 8))?;
        data.resize(len, 0);
        Ok(Self {
            bin_count,
            bin_count_rounded,
            bin_size,
            hash_count,
            words_per_row,
            data,
        })
    }

    /// Number of addressable bins (as requested, not rounded).
    #[inline]
    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    /// Rows per hash function.
    #[inline]
    pub fn bin_size(&self) -> u64 {
        self.bin_size
    }

    /// Number of hash functions.
    #[inline]
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    #[inline]
    fn row(&self, hash: u64, i: usize) -> usize {
        (fmix64(hash ^ ROW_SEEDS[i]) % self.bin_size) as usize
    }

    /// Record `hash` as present in `bin`.
    pub fn insert(&mut self, hash: u64, bin: usize) {
        debug_assert!(bin < self.bin_count);
        for i in 0..self.hash_count as usize {
            let row = self.row(hash, i);
            self.data[row * self.words_per_row + bin / 64] |= 1u64 << (bin % 64);
        }
    }

    /// A reusable counting agent over this filter.
    pub fn counting_agent(&self) -> CountingAgent<'_> {
        CountingAgent {
            ibf: self,
            stripe: vec![0u64; self.words_per_row],
        }
    }

    /// A reusable membership agent over this filter.
    pub fn membership_agent(&self) -> MembershipAgent<'_> {
        MembershipAgent {
            counting: self.counting_agent(),
        }
    }

    pub(crate) fn write_into<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.bin_count as u64).to_le_bytes())?;
        writer.write_all(&self.bin_size.to_le_bytes())?;
        writer.write_all(&self.hash_count.to_le_bytes())?;
        writer.write_all(&(self.data.len() as u64).to_le_bytes())?;
        for word in &self.data {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf8)?;
        let bin_count = u64::from_le_bytes(buf8) as usize;
        reader.read_exact(&mut buf8)?;
        let bin_size = u64::from_le_bytes(buf8);
        reader.read_exact(&mut buf4)?;
        let hash_count = u32::from_le_bytes(buf4);
        reader.read_exact(&mut buf8)?;
        let len = u64::from_le_bytes(buf8) as usize;

        validate_params(bin_count, bin_size, hash_count).map_err(|e| RaptorError::Format {
            what: "index",
            detail: e.to_string(),
        })?;
        let bin_count_rounded = bin_count.div_ceil(64) * 64;
        let words_per_row = bin_count_rounded / 64;
        let expected = allocate_words(bin_size, words_per_row)?;
        if len != expected {
            return Err(RaptorError::Format {
                what: "index",
                detail: format!("bit matrix holds {len} words, expected {expected}"),
            });
        }

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| RaptorError::ResourceExhausted(len * 8))?;
        for _ in 0..len {
            reader.read_exact(&mut buf8)?;
            data.push(u64::from_le_bytes(buf8));
        }
        Ok(Self {
            bin_count,
            bin_count_rounded,
            bin_size,
            hash_count,
            words_per_row,
            data,
        })
    }
}

/// Per-thread agent answering "how many of these hashes does each bin hold?".
///
/// Holds a scratch stripe so repeated bulk counts do not reallocate. Reads
/// are lock-free; the filter is immutable after build.
pub struct CountingAgent<'a> {
    ibf: &'a InterleavedBloomFilter,
    stripe: Vec<u64>,
}

impl CountingAgent<'_> {
    /// Count, per bin, how many of `hashes` are present. Saturates at
    /// `u16::MAX`.
    pub fn bulk_count<I>(&mut self, hashes: I) -> Vec<u16>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut counts = vec![0u16; self.ibf.bin_count];
        self.bulk_count_into(hashes, &mut counts);
        counts
    }

    /// As [`bulk_count`](Self::bulk_count), accumulating into an existing
    /// buffer. Used by the partitioned search to sum counts across parts.
    pub fn bulk_count_into<I>(&mut self, hashes: I, counts: &mut [u16])
    where
        I: IntoIterator<Item = u64>,
    {
        debug_assert_eq!(counts.len(), self.ibf.bin_count);
        let words = self.ibf.words_per_row;
        for hash in hashes {
            let first = self.ibf.row(hash, 0) * words;
            self.stripe
                .copy_from_slice(&self.ibf.data[first..first + words]);
            for i in 1..self.ibf.hash_count as usize {
                let start = self.ibf.row(hash, i) * words;
                for (dst, src) in self
                    .stripe
                    .iter_mut()
                    .zip(&self.ibf.data[start..start + words])
                {
                    *dst &= src;
                }
            }
            for (word_idx, &stripe_word) in self.stripe.iter().enumerate() {
                let mut word = stripe_word;
                while word != 0 {
                    let bin = word_idx * 64 + word.trailing_zeros() as usize;
                    word &= word - 1;
                    if bin < self.ibf.bin_count {
                        counts[bin] = counts[bin].saturating_add(1);
                    }
                }
            }
        }
    }
}

/// Agent answering "which bins hold at least τ of these hashes?".
pub struct MembershipAgent<'a> {
    counting: CountingAgent<'a>,
}

impl MembershipAgent<'_> {
    /// Bins whose count reaches `threshold`, ascending.
    pub fn membership_for(&mut self, hashes: &[u64], threshold: u16) -> Vec<usize> {
        let counts = self.counting.bulk_count(hashes.iter().copied());
        counts
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c >= threshold)
            .map(|(bin, _)| bin)
            .collect()
    }
}

/// Write handle for parallel builds.
///
/// Distinct bins may share a matrix word, so all writes go through relaxed
/// atomic OR. Converted into an immutable [`InterleavedBloomFilter`] once
/// every bin is filled.
pub struct FilterFiller {
    bin_count: usize,
    bin_count_rounded: usize,
    bin_size: u64,
    hash_count: u32,
    words_per_row: usize,
    data: Vec<AtomicU64>,
}

impl FilterFiller {
    /// Allocate a zeroed filler with the same geometry rules as
    /// [`InterleavedBloomFilter::new`].
    pub fn new(bin_count: usize, bin_size: u64, hash_count: u32) -> Result<Self> {
        validate_params(bin_count, bin_size, hash_count)?;
        let bin_count_rounded = bin_count.div_ceil(64) * 64;
        let words_per_row = bin_count_rounded / 64;
        let len = allocate_words(bin_size, words_per_row)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| RaptorError::ResourceExhausted(len * 8))?;
        data.resize_with(len, || AtomicU64::new(0));
        Ok(Self {
            bin_count,
            bin_count_rounded,
            bin_size,
            hash_count,
            words_per_row,
            data,
        })
    }

    /// Record `hash` as present in `bin`. Safe to call from many threads.
    pub fn insert(&self, hash: u64, bin: usize) {
        debug_assert!(bin < self.bin_count);
        for i in 0..self.hash_count as usize {
            let row = (fmix64(hash ^ ROW_SEEDS[i]) % self.bin_size) as usize;
            self.data[row * self.words_per_row + bin / 64]
                .fetch_or(1u64 << (bin % 64), Ordering::Relaxed);
        }
    }

    /// Freeze into an immutable filter.
    pub fn finish(self) -> InterleavedBloomFilter {
        InterleavedBloomFilter {
            bin_count: self.bin_count,
            bin_count_rounded: self.bin_count_rounded,
            bin_size: self.bin_size,
            hash_count: self.hash_count,
            words_per_row: self.words_per_row,
            data: self.data.into_iter().map(AtomicU64::into_inner).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_count_rounding() {
        let ibf = InterleavedBloomFilter::new(65, 128, 2).unwrap();
        assert_eq!(ibf.bin_count(), 65);
        assert_eq!(ibf.bin_count_rounded, 128);
        assert_eq!(ibf.words_per_row, 2);
        assert_eq!(ibf.data.len(), 256);
    }

    #[test]
    fn test_insert_then_count() {
        let mut ibf = InterleavedBloomFilter::new(3, 1024, 3).unwrap();
        ibf.insert(42, 0);
        ibf.insert(42, 2);
        ibf.insert(7, 1);

        let mut agent = ibf.counting_agent();
        let counts = agent.bulk_count([42u64]);
        assert_eq!(counts.len(), 3);
        assert_eq!(counts[0], 1);
        assert_eq!(counts[2], 1);

        let counts = agent.bulk_count([42u64, 7]);
        assert_eq!(counts[0], 1);
        assert_eq!(counts[1], 1);
        assert_eq!(counts[2], 1);
    }

    #[test]
    fn test_no_false_negatives() {
        let mut ibf = InterleavedBloomFilter::new(64, 4096, 4).unwrap();
        let hashes: Vec<u64> = (0..500u64).map(|i| fmix64(i)).collect();
        for &h in &hashes {
            ibf.insert(h, 17);
        }
        let counts = ibf.counting_agent().bulk_count(hashes.iter().copied());
        assert_eq!(counts[17] as usize, hashes.len());
    }

    #[test]
    fn test_membership_threshold() {
        let mut ibf = InterleavedBloomFilter::new(2, 2048, 2).unwrap();
        let hashes: Vec<u64> = (100..120u64).map(fmix64).collect();
        for &h in &hashes {
            ibf.insert(h, 0);
        }
        for &h in &hashes[..10] {
            ibf.insert(h, 1);
        }
        let mut agent = ibf.membership_agent();
        assert_eq!(agent.membership_for(&hashes, 20), vec![0]);
        assert_eq!(agent.membership_for(&hashes, 10), vec![0, 1]);
        assert_eq!(agent.membership_for(&hashes, 1), vec![0, 1]);
    }

    #[test]
    fn test_filler_matches_serial_insert() {
        let hashes: Vec<u64> = (0..200u64).map(fmix64).collect();

        let mut serial = InterleavedBloomFilter::new(70, 512, 2).unwrap();
        for (i, &h) in hashes.iter().enumerate() {
            serial.insert(h, i % 70);
        }

        let filler = FilterFiller::new(70, 512, 2).unwrap();
        for (i, &h) in hashes.iter().enumerate() {
            filler.insert(h, i % 70);
        }
        assert_eq!(filler.finish(), serial);
    }

    #[test]
    fn test_fpr_within_bound() {
        // Size for 1% at 1000 elements, insert 1000, probe 20000 fresh
        // hashes. Expected false positives: ~200; 3 sigma ~= 42.
        let fpr = 0.01;
        let n = 1000usize;
        let bin_size = bin_size_for(n, fpr, 3);
        let mut ibf = InterleavedBloomFilter::new(1, bin_size, 3).unwrap();
        for i in 0..n as u64 {
            ibf.insert(fmix64(i), 0);
        }
        let probes = 20_000u64;
        let mut agent = ibf.counting_agent();
        let mut positives = 0u64;
        for i in 0..probes {
            let counts = agent.bulk_count([fmix64(1_000_000 + i)]);
            positives += u64::from(counts[0] > 0);
        }
        let expected = probes as f64 * fpr;
        let sigma = (probes as f64 * fpr * (1.0 - fpr)).sqrt();
        assert!(
            (positives as f64) < expected + 3.0 * sigma,
            "false positive rate too high: {positives} of {probes}"
        );
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut ibf = InterleavedBloomFilter::new(130, 256, 2).unwrap();
        for i in 0..50u64 {
            ibf.insert(fmix64(i), (i % 130) as usize);
        }
        let mut buffer = Vec::new();
        ibf.write_into(&mut buffer).unwrap();
        let loaded = InterleavedBloomFilter::read_from(&mut buffer.as_slice()).unwrap();
        assert_eq!(loaded, ibf);
    }

    #[test]
    fn test_invalid_hash_count_rejected() {
        assert!(InterleavedBloomFilter::new(1, 64, 1).is_err());
        assert!(InterleavedBloomFilter::new(1, 64, 6).is_err());
    }

    #[test]
    fn test_bin_size_for_grows_with_cardinality() {
        assert!(bin_size_for(2000, 0.05, 2) > bin_size_for(1000, 0.05, 2));
        assert!(bin_size_for(1000, 0.01, 2) > bin_size_for(1000, 0.05, 2));
    }
}
