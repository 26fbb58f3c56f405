//! Input readers for the build pipeline
//!
//! A user bin is filled either from raw sequence files (FASTA/FASTQ, plain
//! or gzipped) or from precomputed `.minimiser` files. The two reader kinds
//! share the operations the build needs: stream every hash of a bin's files
//! into a sink, optionally filtered by a predicate (the partition filter).

use std::path::Path;

use anyhow::{Context, Result};
use memmap2::Mmap;
use needletail::parse_fastx_file;

use crate::error::RaptorError;
use crate::minimiser::MinimiserExtractor;
use crate::shape::Shape;

/// Reader over one kind of input file.
pub enum FileReader {
    /// FASTA/FASTQ input; minimisers are computed on the fly.
    Sequence(MinimiserExtractor),
    /// Raw little-endian `u64` minimiser files from `prepare`.
    Minimiser,
}

impl FileReader {
    /// Reader computing minimisers with the given scheme.
    pub fn sequence(shape: Shape, window_size: usize) -> crate::error::Result<Self> {
        Ok(Self::Sequence(MinimiserExtractor::new(shape, window_size)?))
    }

    /// Reader over precomputed minimiser files.
    pub fn minimiser() -> Self {
        Self::Minimiser
    }

    /// Stream every hash of `files` into `sink`.
    pub fn for_each_hash<P, F>(&self, files: &[P], sink: F) -> Result<()>
    where
        P: AsRef<Path>,
        F: FnMut(u64),
    {
        self.for_each_hash_if(files, sink, |_| true)
    }

    /// Stream the hashes of `files` that satisfy `predicate` into `sink`.
    pub fn for_each_hash_if<P, F, Pr>(
        &self,
        files: &[P],
        mut sink: F,
        predicate: Pr,
    ) -> Result<()>
    where
        P: AsRef<Path>,
        F: FnMut(u64),
        Pr: Fn(u64) -> bool,
    {
        for file in files {
            let path = file.as_ref();
            match self {
                Self::Sequence(extractor) => {
                    let mut reader = parse_fastx_file(path).with_context(|| {
                        format!("failed to open sequence file {}", path.display())
                    })?;
                    while let Some(record) = reader.next() {
                        let record = record.with_context(|| {
                            format!("failed to parse record in {}", path.display())
                        })?;
                        extractor.for_each_minimiser(&record.seq(), |hash| {
                            if predicate(hash) {
                                sink(hash);
                            }
                        });
                    }
                }
                Self::Minimiser => {
                    for_each_stored_hash(path, |hash| {
                        if predicate(hash) {
                            sink(hash);
                        }
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// Iterate the hashes of one `.minimiser` file via a memory map.
fn for_each_stored_hash<F: FnMut(u64)>(path: &Path, mut sink: F) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open minimiser file {}", path.display()))?;
    if file.metadata()?.len() == 0 {
        return Ok(());
    }
    let map = unsafe { Mmap::map(&file) }
        .with_context(|| format!("failed to map minimiser file {}", path.display()))?;
    if map.len() % 8 != 0 {
        return Err(RaptorError::Format {
            what: "minimiser file",
            detail: format!("{} has size {} not divisible by 8", path.display(), map.len()),
        }
        .into());
    }
    for chunk in map.chunks_exact(8) {
        sink(u64::from_le_bytes(chunk.try_into().expect("chunk of 8")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sequence_reader_matches_extractor() {
        let mut file = NamedTempFile::with_suffix(".fa").unwrap();
        writeln!(file, ">seq1").unwrap();
        writeln!(file, "ACGTACGTACGTACGTACGT").unwrap();
        file.flush().unwrap();

        let shape = Shape::ungapped(4).unwrap();
        let extractor = MinimiserExtractor::new(shape, 5).unwrap();
        let expected = extractor.minimisers(b"ACGTACGTACGTACGTACGT");

        let reader = FileReader::sequence(shape, 5).unwrap();
        let mut seen = Vec::new();
        reader
            .for_each_hash(&[file.path()], |h| seen.push(h))
            .unwrap();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_minimiser_reader_roundtrip() {
        let mut file = NamedTempFile::new().unwrap();
        let values = [3u64, 17, u64::MAX, 0];
        for v in values {
            file.write_all(&v.to_le_bytes()).unwrap();
        }
        file.flush().unwrap();

        let reader = FileReader::minimiser();
        let mut seen = Vec::new();
        reader
            .for_each_hash(&[file.path()], |h| seen.push(h))
            .unwrap();
        assert_eq!(seen, values);
    }

    #[test]
    fn test_predicate_filters() {
        let mut file = NamedTempFile::new().unwrap();
        for v in [1u64, 2, 3, 4, 5, 6] {
            file.write_all(&v.to_le_bytes()).unwrap();
        }
        file.flush().unwrap();

        let reader = FileReader::minimiser();
        let mut seen = Vec::new();
        reader
            .for_each_hash_if(&[file.path()], |h| seen.push(h), |h| h % 2 == 0)
            .unwrap();
        assert_eq!(seen, vec![2, 4, 6]);
    }

    #[test]
    fn test_truncated_minimiser_file_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        file.flush().unwrap();

        let reader = FileReader::minimiser();
        assert!(reader.for_each_hash(&[file.path()], |_| {}).is_err());
    }
}
