//! Precomputation of per-file minimiser sets
//!
//! For every user bin, counts how often each minimiser occurs in the bin's
//! representative file and persists the ones that pass an occurrence cutoff:
//!
//! - `<stem>.minimiser`: the passing hashes as raw little-endian `u64`s.
//! - `<stem>.header`: one line `shape<TAB>window<TAB>cutoff<TAB>count`.
//! - `<stem>.in_progress`: sentinel created before work starts and removed
//!   after both outputs are written. Its presence on a later run means the
//!   previous attempt died and the pair is recomputed; outputs without the
//!   sentinel are skipped. This makes interrupted runs idempotent.
//!
//! A `minimiser.list` file naming every `.minimiser` output is written last.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::constants::{CUTOFF_BOUNDS, CUTOFF_MAX, MAX_OCCURRENCE};
use crate::reader::FileReader;
use crate::shape::Shape;

/// Arguments for a prepare run.
#[derive(Clone, Debug)]
pub struct PrepareConfig {
    /// One user bin per entry; each entry lists the bin's files.
    pub bin_paths: Vec<Vec<PathBuf>>,
    /// Directory receiving the `.minimiser`/`.header` pairs.
    pub out_dir: PathBuf,
    /// Minimiser shape.
    pub shape: Shape,
    /// Minimiser window size in bases.
    pub window_size: usize,
    /// Fixed cutoff overriding the file-size tiers.
    pub cutoff_override: Option<u8>,
}

/// Whether a file name looks like a compressed sequence file.
pub fn file_is_compressed(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("gz") | Some("bz2")
    )
}

/// Occurrence cutoff for a file, from its (decompression-adjusted) size.
///
/// Compressed inputs count three times their on-disk size. The tier table is
/// pinned in [`crate::constants`].
pub fn cutoff_for(path: &Path) -> Result<u8> {
    let size = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let effective = if file_is_compressed(path) { size * 3 } else { size };
    for (bound, cutoff) in CUTOFF_BOUNDS {
        if effective <= bound {
            return Ok(cutoff);
        }
    }
    Ok(CUTOFF_MAX)
}

/// Output stem for a bin's representative file: its file stem (with the
/// compression extension stripped first) under `out_dir`.
pub fn output_stem(out_dir: &Path, file: &Path) -> PathBuf {
    let mut name = file.to_path_buf();
    if file_is_compressed(&name) {
        name.set_extension("");
    }
    let stem = name.file_stem().unwrap_or(name.as_os_str());
    out_dir.join(stem)
}

fn with_extension(stem: &Path, extension: &str) -> PathBuf {
    let mut path = stem.to_path_buf();
    path.set_extension(extension);
    path
}

/// Compute and persist the minimiser set of every bin, in parallel.
pub fn compute_minimisers(config: &PrepareConfig) -> Result<()> {
    fs::create_dir_all(&config.out_dir)
        .with_context(|| format!("failed to create {}", config.out_dir.display()))?;
    let reader = FileReader::sequence(config.shape, config.window_size)?;

    config
        .bin_paths
        .par_iter()
        .try_for_each(|files| process_bin(config, &reader, files))?;

    write_list_file(config)
}

fn process_bin(config: &PrepareConfig, reader: &FileReader, files: &[PathBuf]) -> Result<()> {
    let representative = files
        .first()
        .context("user bin with no files in bin description")?;
    let stem = output_stem(&config.out_dir, representative);
    let minimiser_file = with_extension(&stem, "minimiser");
    let header_file = with_extension(&stem, "header");
    let progress_file = with_extension(&stem, "in_progress");

    let already_done =
        minimiser_file.exists() && header_file.exists() && !progress_file.exists();
    if already_done {
        debug!("skipping {}, outputs are complete", stem.display());
        return Ok(());
    }
    fs::File::create(&progress_file)
        .with_context(|| format!("failed to create {}", progress_file.display()))?;

    // Occurrences saturate at MAX_OCCURRENCE; every cutoff lies below it, so
    // the table never needs wider counters. Rebuilt per bin rather than
    // reused across bins, which would keep it as large as the largest bin.
    let mut occurrences: AHashMap<u64, u8> = AHashMap::new();
    reader.for_each_hash(files, |hash| {
        let count = occurrences.entry(hash).or_insert(0);
        *count = count.saturating_add(1).min(MAX_OCCURRENCE);
    })?;

    let cutoff = match config.cutoff_override {
        Some(value) => value,
        None => cutoff_for(representative)?,
    };

    let mut passing: Vec<u64> = occurrences
        .iter()
        .filter(|&(_, &count)| count >= cutoff)
        .map(|(&hash, _)| hash)
        .collect();
    // Sorted so repeated runs produce byte-identical files.
    passing.sort_unstable();

    {
        let mut out = BufWriter::new(
            fs::File::create(&minimiser_file)
                .with_context(|| format!("failed to create {}", minimiser_file.display()))?,
        );
        for hash in &passing {
            out.write_all(&hash.to_le_bytes())?;
        }
        out.flush()?;
    }

    let mut header = fs::File::create(&header_file)
        .with_context(|| format!("failed to create {}", header_file.display()))?;
    writeln!(
        header,
        "{}\t{}\t{}\t{}",
        config.shape.to_bit_string(),
        config.window_size,
        cutoff,
        passing.len()
    )?;

    fs::remove_file(&progress_file)
        .with_context(|| format!("failed to remove {}", progress_file.display()))?;
    info!(
        "prepared {} ({} minimisers, cutoff {})",
        minimiser_file.display(),
        passing.len(),
        cutoff
    );
    Ok(())
}

fn write_list_file(config: &PrepareConfig) -> Result<()> {
    let list_path = config.out_dir.join("minimiser.list");
    let mut list = BufWriter::new(
        fs::File::create(&list_path)
            .with_context(|| format!("failed to create {}", list_path.display()))?,
    );
    for files in &config.bin_paths {
        if let Some(representative) = files.first() {
            let stem = output_stem(&config.out_dir, representative);
            writeln!(list, "{}", with_extension(&stem, "minimiser").display())?;
        }
    }
    list.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fasta(dir: &Path, name: &str, seq: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, ">record").unwrap();
        writeln!(file, "{seq}").unwrap();
        path
    }

    fn config(dir: &Path, input: PathBuf) -> PrepareConfig {
        PrepareConfig {
            bin_paths: vec![vec![input]],
            out_dir: dir.join("out"),
            shape: Shape::ungapped(4).unwrap(),
            window_size: 5,
            cutoff_override: Some(1),
        }
    }

    #[test]
    fn test_outputs_written() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_fasta(dir.path(), "bin0.fa", "ACGTACGTACGTACGTACGT");
        let cfg = config(dir.path(), input);
        compute_minimisers(&cfg).unwrap();

        let stem = cfg.out_dir.join("bin0");
        let minimisers = fs::read(with_extension(&stem, "minimiser")).unwrap();
        assert!(!minimisers.is_empty());
        assert_eq!(minimisers.len() % 8, 0);

        let header = fs::read_to_string(with_extension(&stem, "header")).unwrap();
        let fields: Vec<&str> = header.trim_end().split('\t').collect();
        assert_eq!(fields, ["1111", "5", "1", &(minimisers.len() / 8).to_string()]);

        assert!(!with_extension(&stem, "in_progress").exists());
        let list = fs::read_to_string(cfg.out_dir.join("minimiser.list")).unwrap();
        assert!(list.trim_end().ends_with("bin0.minimiser"));
    }

    #[test]
    fn test_rerun_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_fasta(dir.path(), "bin0.fa", "ACGGTTACCATGGTACCATTGACCA");
        let cfg = config(dir.path(), input);

        compute_minimisers(&cfg).unwrap();
        let stem = cfg.out_dir.join("bin0");
        let first = fs::read(with_extension(&stem, "minimiser")).unwrap();

        // Force recomputation, then compare.
        fs::File::create(with_extension(&stem, "in_progress")).unwrap();
        compute_minimisers(&cfg).unwrap();
        let second = fs::read(with_extension(&stem, "minimiser")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_in_progress_forces_recompute_and_absence_skips() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_fasta(dir.path(), "bin0.fa", "ACGTACGTACGTACGTACGT");
        let cfg = config(dir.path(), input);
        compute_minimisers(&cfg).unwrap();

        let stem = cfg.out_dir.join("bin0");
        let minimiser_file = with_extension(&stem, "minimiser");

        // Absent sentinel: outputs are left alone.
        fs::write(&minimiser_file, b"sentinel").unwrap();
        compute_minimisers(&cfg).unwrap();
        assert_eq!(fs::read(&minimiser_file).unwrap(), b"sentinel");

        // Present sentinel: outputs are recomputed.
        fs::File::create(with_extension(&stem, "in_progress")).unwrap();
        compute_minimisers(&cfg).unwrap();
        assert_ne!(fs::read(&minimiser_file).unwrap(), b"sentinel");
        assert!(!with_extension(&stem, "in_progress").exists());
    }

    #[test]
    fn test_cutoff_respected() {
        let dir = tempfile::tempdir().unwrap();
        // Two distinct windows; every minimiser occurs once.
        let input = write_fasta(dir.path(), "bin0.fa", "ACGGTTACCATGGTACCATTGACCA");
        let mut cfg = config(dir.path(), input);
        cfg.cutoff_override = Some(2);
        compute_minimisers(&cfg).unwrap();

        let stem = cfg.out_dir.join("bin0");
        let extractor = crate::minimiser::MinimiserExtractor::new(cfg.shape, 5).unwrap();
        let all = extractor.minimisers(b"ACGGTTACCATGGTACCATTGACCA");
        let written = fs::read(with_extension(&stem, "minimiser")).unwrap().len() / 8;
        assert!(written < all.len());
    }

    #[test]
    fn test_cutoff_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let small = dir.path().join("small.fa");
        fs::write(&small, b">r\nACGT\n").unwrap();
        assert_eq!(cutoff_for(&small).unwrap(), 1);
        assert!(!file_is_compressed(&small));
        assert!(file_is_compressed(Path::new("reads.fa.gz")));
        assert!(file_is_compressed(Path::new("reads.fasta.bz2")));
    }

    #[test]
    fn test_output_stem_strips_compression_extension() {
        let out = Path::new("/tmp/out");
        assert_eq!(
            output_stem(out, Path::new("/data/reads.fasta.gz")),
            out.join("reads")
        );
        assert_eq!(
            output_stem(out, Path::new("/data/reads.fasta")),
            out.join("reads")
        );
    }
}
