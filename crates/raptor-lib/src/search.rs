//! Query engine
//!
//! Streams query records through the index in chunks. Each chunk is
//! shuffled with a fixed seed so neighbouring records (which tend to match
//! the same bins) spread across threads, then processed record-parallel:
//! extract minimisers, look up the threshold for the record's minimiser
//! count, count per-bin matches, emit one output line.
//!
//! The partitioned flow keeps one accumulator row per record and walks the
//! partitions one at a time, so only a single partition's filter is resident;
//! counts are compared to the threshold after the last partition. Index
//! loading overlaps chunk reading via a background thread.
//!
//! Output lines are atomic: a mutex-guarded writer takes whole lines only.
//! Record order in the output is unspecified.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result};
use needletail::parse_fastx_file;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::constants::QUERY_CHUNK_SIZE;
use crate::error::RaptorError;
use crate::index::{partition_path, IndexPayload, RaptorIndex};
use crate::minimiser::MinimiserExtractor;
use crate::partition::PartitionConfig;
use crate::threshold::{Threshold, ThresholdMode, ThresholdParams};

/// Parameters for a query run.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Index path; partitioned indices are `<path>.0` .. `<path>.P-1`.
    pub index_path: PathBuf,
    /// FASTA/FASTQ query file.
    pub query_path: PathBuf,
    /// Output file; `None` writes to stdout.
    pub output: Option<PathBuf>,
    /// Number of index partitions (must match the build).
    pub parts: usize,
    /// Threshold mode.
    pub mode: ThresholdMode,
    /// Cache directory for precomputed threshold tables.
    pub cache_dir: Option<PathBuf>,
}

/// One query record.
struct Record {
    id: String,
    seq: Vec<u8>,
}

/// Run a query, checking `cancel` between records. Cancelling mid-chunk lets
/// started records finish; every line written so far stays valid.
pub fn search_with_cancel(config: &SearchConfig, cancel: &AtomicBool) -> Result<()> {
    if config.parts == 0 || !config.parts.is_power_of_two() {
        return Err(RaptorError::InvalidArgument(format!(
            "parts must be a power of two, got {}",
            config.parts
        ))
        .into());
    }
    let out = SyncOut::new(config.output.as_deref())?;
    if config.parts == 1 {
        search_monolithic(config, cancel, &out)
    } else {
        search_partitioned(config, cancel, &out)
    }
}

/// Run a query to completion.
pub fn search(config: &SearchConfig) -> Result<()> {
    search_with_cancel(config, &AtomicBool::new(false))
}

fn search_monolithic(config: &SearchConfig, cancel: &AtomicBool, out: &SyncOut) -> Result<()> {
    // Overlap the index load with reading the first chunk.
    let load = spawn_load(config.index_path.clone());
    let mut reader = parse_fastx_file(&config.query_path)
        .with_context(|| format!("failed to open query file {}", config.query_path.display()))?;

    let mut loaded: Option<(RaptorIndex, MinimiserExtractor, Threshold)> = None;
    let mut header = HeaderState::Pending;
    let mut load = Some(load);

    loop {
        let mut records = read_chunk(&mut reader, QUERY_CHUNK_SIZE)?;
        if records.is_empty() {
            break;
        }
        // Spreads similar neighbouring records across threads.
        records.shuffle(&mut StdRng::seed_from_u64(0));

        if loaded.is_none() {
            let index = join_load(load.take().expect("load pending on first chunk"))?;
            let bundle = prepare_run(config, &index)?;
            loaded = Some((index, bundle.0, bundle.1));
        }
        let (index, extractor, thresholder) = loaded.as_ref().expect("set above");
        header.write_once(out, index)?;

        match &index.payload {
            IndexPayload::Flat(ibf) => {
                records.par_iter().try_for_each(|record| -> Result<()> {
                    if cancel.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    let minimisers = extractor.minimisers(&record.seq);
                    let threshold = thresholder.get(minimisers.len()) as u16;
                    let counts = ibf
                        .counting_agent()
                        .bulk_count(minimisers.iter().copied());
                    let hits: Vec<usize> = counts
                        .iter()
                        .enumerate()
                        .filter(|&(_, &c)| c >= threshold)
                        .map(|(bin, _)| bin)
                        .collect();
                    out.write(&format_hits(&record.id, &hits))
                })?;
            }
            IndexPayload::Hierarchical(hibf) => {
                records.par_iter().try_for_each(|record| -> Result<()> {
                    if cancel.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    let minimisers = extractor.minimisers(&record.seq);
                    let threshold = thresholder.get(minimisers.len()) as u16;
                    let hits: Vec<usize> = hibf
                        .membership(&minimisers, threshold)
                        .into_iter()
                        .map(|ub| ub as usize)
                        .collect();
                    out.write(&format_hits(&record.id, &hits))
                })?;
            }
        }

        if cancel.load(Ordering::Relaxed) {
            out.flush()?;
            return Err(RaptorError::Cancelled.into());
        }
    }
    out.flush()
}

fn search_partitioned(config: &SearchConfig, cancel: &AtomicBool, out: &SyncOut) -> Result<()> {
    let mut reader = parse_fastx_file(&config.query_path)
        .with_context(|| format!("failed to open query file {}", config.query_path.display()))?;
    let partition = PartitionConfig::new(config.parts)?;
    let mut header = HeaderState::Pending;
    let mut run: Option<(MinimiserExtractor, Threshold)> = None;

    loop {
        // Overlap the first partition's load with reading this chunk.
        let mut pending = Some(spawn_load(partition_path(&config.index_path, 0)));
        let mut records = read_chunk(&mut reader, QUERY_CHUNK_SIZE)?;
        if records.is_empty() {
            // Harmless: the loaded partition is dropped.
            if let Some(handle) = pending.take() {
                let _ = handle.join();
            }
            break;
        }
        records.shuffle(&mut StdRng::seed_from_u64(0));

        let mut counts: Vec<Vec<u16>> = Vec::new();
        for part in 0..config.parts {
            let index = match pending.take() {
                Some(handle) => join_load(handle)?,
                None => RaptorIndex::load(&partition_path(&config.index_path, part))?,
            };
            if run.is_none() {
                let bundle = prepare_run(config, &index)?;
                run = Some(bundle);
            }
            let (extractor, thresholder) = run.as_ref().expect("set above");
            // Every partition must carry the scheme of the first one.
            index.validate_query_scheme(extractor.shape(), extractor.window_size())?;
            header.write_once(out, &index)?;

            let IndexPayload::Flat(ibf) = &index.payload else {
                return Err(RaptorError::Format {
                    what: "index",
                    detail: "partitioned index with a hierarchical payload".into(),
                }
                .into());
            };
            if counts.is_empty() {
                counts = vec![vec![0u16; ibf.bin_count()]; records.len()];
            }

            let last = part == config.parts - 1;
            records
                .par_iter()
                .zip(counts.par_iter_mut())
                .try_for_each(|(record, record_counts)| -> Result<()> {
                    if cancel.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    let minimisers = extractor.minimisers(&record.seq);
                    let sharded = minimisers
                        .iter()
                        .copied()
                        .filter(|&h| partition.hash_partition(h) == part);
                    ibf.counting_agent()
                        .bulk_count_into(sharded, record_counts);

                    if last {
                        let threshold = thresholder.get(minimisers.len()) as u16;
                        let hits: Vec<usize> = record_counts
                            .iter()
                            .enumerate()
                            .filter(|&(_, &c)| c >= threshold)
                            .map(|(bin, _)| bin)
                            .collect();
                        out.write(&format_hits(&record.id, &hits))?;
                    }
                    Ok(())
                })?;
        }

        if cancel.load(Ordering::Relaxed) {
            out.flush()?;
            return Err(RaptorError::Cancelled.into());
        }
    }
    out.flush()
}

/// Extractor and thresholder bound to the index's minimiser scheme.
fn prepare_run(
    config: &SearchConfig,
    index: &RaptorIndex,
) -> Result<(MinimiserExtractor, Threshold)> {
    let extractor = MinimiserExtractor::new(index.header.shape, index.header.window_size)?;
    index.validate_query_scheme(extractor.shape(), extractor.window_size())?;
    let thresholder = Threshold::new(&ThresholdParams {
        window_size: index.header.window_size,
        shape: index.header.shape,
        mode: config.mode,
        cache_dir: config.cache_dir.clone(),
    })?;
    info!(
        "querying with w={}, shape={}, {} hash functions",
        index.header.window_size,
        index.header.shape.to_bit_string(),
        index.hash_count()
    );
    Ok((extractor, thresholder))
}

type LoadHandle = thread::JoinHandle<crate::error::Result<RaptorIndex>>;

fn spawn_load(path: PathBuf) -> LoadHandle {
    thread::spawn(move || {
        debug!("loading index {}", path.display());
        RaptorIndex::load(&path)
    })
}

fn join_load(handle: LoadHandle) -> Result<RaptorIndex> {
    let index = handle
        .join()
        .map_err(|_| RaptorError::Format {
            what: "index",
            detail: "index loader thread panicked".into(),
        })??;
    Ok(index)
}

fn read_chunk(
    reader: &mut Box<dyn needletail::FastxReader>,
    limit: usize,
) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    while records.len() < limit {
        let Some(record) = reader.next() else {
            break;
        };
        // A malformed record is logged and skipped; the run continues.
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!("skipping malformed query record: {e}");
                continue;
            }
        };
        records.push(Record {
            id: String::from_utf8_lossy(record.id()).into_owned(),
            seq: record.seq().into_owned(),
        });
    }
    Ok(records)
}

/// One output line: the record id, a tab, and the hit bins joined by commas.
/// No hits leaves the trailing tab in place.
fn format_hits(id: &str, hits: &[usize]) -> String {
    let mut line = String::with_capacity(id.len() + 2 + 2 * hits.len());
    line.push_str(id);
    line.push('\t');
    for (i, bin) in hits.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&bin.to_string());
    }
    line.push('\n');
    line
}

/// Run-scoped one-shot header state. Not process-global: unit tests run
/// several queries per process.
enum HeaderState {
    Pending,
    Written,
}

impl HeaderState {
    fn write_once(&mut self, out: &SyncOut, index: &RaptorIndex) -> Result<()> {
        if matches!(self, HeaderState::Pending) {
            out.write_header(&index.header.bin_paths)?;
            *self = HeaderState::Written;
        }
        Ok(())
    }
}

/// Synchronised line writer shared by the worker threads.
struct SyncOut {
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
}

impl SyncOut {
    fn new(output: Option<&Path>) -> Result<Self> {
        let sink: Box<dyn Write + Send> = match output {
            Some(path) => Box::new(
                File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?,
            ),
            None => Box::new(std::io::stdout()),
        };
        Ok(Self {
            writer: Mutex::new(BufWriter::new(sink)),
        })
    }

    /// Append one complete line.
    fn write(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().expect("output writer poisoned");
        writer.write_all(line.as_bytes())?;
        Ok(())
    }

    /// The user-bin mapping followed by the column header, written once per
    /// run before the first record line.
    fn write_header(&self, bin_paths: &[Vec<PathBuf>]) -> Result<()> {
        let mut writer = self.writer.lock().expect("output writer poisoned");
        for (ub, files) in bin_paths.iter().enumerate() {
            let joined = files
                .iter()
                .map(|f| f.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(",");
            writeln!(writer, "#{ub}\t{joined}")?;
        }
        writeln!(writer, "#QUERY_NAME\tUSER_BINS")?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.writer
            .lock()
            .expect("output writer poisoned")
            .flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hits() {
        assert_eq!(format_hits("read1", &[0, 2, 5]), "read1\t0,2,5\n");
        assert_eq!(format_hits("read1", &[7]), "read1\t7\n");
    }

    #[test]
    fn test_format_no_hits_keeps_trailing_tab() {
        assert_eq!(format_hits("read1", &[]), "read1\t\n");
    }

    #[test]
    fn test_sync_out_lines_stay_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tsv");
        let out = SyncOut::new(Some(&path)).unwrap();
        (0..64usize).into_par_iter().for_each(|i| {
            let line = format!("record{i}\t{}\n", "x".repeat(200));
            out.write(&line).unwrap();
        });
        out.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 64);
        for line in lines {
            assert!(line.starts_with("record"));
            assert!(line.ends_with(&"x".repeat(200)));
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tsv");
        let out = SyncOut::new(Some(&path)).unwrap();
        let index = sample_index();
        let mut header = HeaderState::Pending;
        header.write_once(&out, &index).unwrap();
        header.write_once(&out, &index).unwrap();
        out.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "#0\ta.fa\n#QUERY_NAME\tUSER_BINS\n",
            "header must appear exactly once"
        );
    }

    fn sample_index() -> RaptorIndex {
        use crate::ibf::InterleavedBloomFilter;
        use crate::index::IndexHeader;
        use crate::shape::Shape;
        RaptorIndex {
            header: IndexHeader {
                version: crate::constants::FORMAT_VERSION,
                window_size: 5,
                shape: Shape::ungapped(4).unwrap(),
                parts: 1,
                fpr: 0.05,
                bin_paths: vec![vec![PathBuf::from("a.fa")]],
            },
            payload: IndexPayload::Flat(InterleavedBloomFilter::new(1, 64, 2).unwrap()),
        }
    }
}
