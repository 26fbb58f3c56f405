//! Index construction
//!
//! The orchestrator gathers every user bin's distinct minimiser set in
//! parallel, sizes the filter(s) for the target false-positive rate from the
//! largest bin, and fills the technical bins in parallel. Partitioned builds
//! shard the gathered hashes with the same [`PartitionConfig`] the query
//! uses; hierarchical builds follow a planner layout bottom-up, a merged bin
//! holding the union of its subtree's content.
//!
//! A file-read error aborts the build; filters only exist in memory until
//! the final store, so previously persisted indices are never corrupted.

pub mod config;
pub mod layout;

use std::path::Path;

use ahash::AHashSet;
use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::info;

pub use config::BuildConfig;
pub use layout::{parse_bin_paths, parse_hibf_layout, HibfLayout};

use crate::constants::FORMAT_VERSION;
use crate::hibf::{BinKind, HibfNode, HierarchicalIbf};
use crate::ibf::{bin_size_for, FilterFiller, InterleavedBloomFilter};
use crate::index::{partition_path, IndexHeader, IndexPayload, RaptorIndex};
use crate::partition::PartitionConfig;
use crate::reader::FileReader;
use layout::{plan_tree, PlannedBin, PlannedNode};

/// Build and persist the index described by `config`.
pub fn build_index(config: &BuildConfig) -> Result<()> {
    config.validate()?;
    let reader = if config.input_is_minimiser {
        FileReader::minimiser()
    } else {
        FileReader::sequence(config.shape, config.window_size)?
    };

    match &config.hibf_layout {
        Some(layout_path) => build_hierarchical(config, &reader, layout_path),
        None => build_flat(config, &reader),
    }
}

/// Header shared by every stored part of this build.
fn header_for(config: &BuildConfig, bin_paths: Vec<Vec<std::path::PathBuf>>) -> IndexHeader {
    IndexHeader {
        version: FORMAT_VERSION,
        window_size: config.window_size,
        shape: config.shape,
        parts: config.parts,
        fpr: config.fpr,
        bin_paths,
    }
}

/// Distinct, sorted hash set of every user bin, gathered in parallel.
fn gather_user_bin_hashes(
    reader: &FileReader,
    bins: &[Vec<std::path::PathBuf>],
) -> Result<Vec<Vec<u64>>> {
    bins.par_iter()
        .map(|files| {
            let mut set = AHashSet::new();
            reader.for_each_hash(files, |hash| {
                set.insert(hash);
            })?;
            let mut hashes: Vec<u64> = set.into_iter().collect();
            hashes.sort_unstable();
            Ok(hashes)
        })
        .collect()
}

fn build_flat(config: &BuildConfig, reader: &FileReader) -> Result<()> {
    let ub_hashes = gather_user_bin_hashes(reader, &config.bin_paths)?;
    info!(
        "gathered {} user bins, largest holds {} minimisers",
        ub_hashes.len(),
        ub_hashes.iter().map(Vec::len).max().unwrap_or(0)
    );

    if config.parts == 1 {
        let ibf = fill_filter(&ub_hashes, config)?;
        store_part(config, &config.output, ibf)?;
        return Ok(());
    }

    let partition = PartitionConfig::new(config.parts)?;
    for part in 0..config.parts {
        let sharded: Vec<Vec<u64>> = ub_hashes
            .par_iter()
            .map(|hashes| {
                hashes
                    .iter()
                    .copied()
                    .filter(|&h| partition.hash_partition(h) == part)
                    .collect()
            })
            .collect();
        let ibf = fill_filter(&sharded, config)?;
        store_part(config, &partition_path(&config.output, part), ibf)?;
    }
    Ok(())
}

/// Size one filter from the largest bin and fill all bins in parallel.
fn fill_filter(ub_hashes: &[Vec<u64>], config: &BuildConfig) -> Result<InterleavedBloomFilter> {
    let max_cardinality = ub_hashes.iter().map(Vec::len).max().unwrap_or(0);
    let bin_size = bin_size_for(max_cardinality, config.fpr, config.hash_count);
    let filler = FilterFiller::new(ub_hashes.len(), bin_size, config.hash_count)?;
    ub_hashes.par_iter().enumerate().for_each(|(bin, hashes)| {
        for &hash in hashes {
            filler.insert(hash, bin);
        }
    });
    Ok(filler.finish())
}

fn store_part(
    config: &BuildConfig,
    path: &Path,
    ibf: InterleavedBloomFilter,
) -> Result<()> {
    let index = RaptorIndex {
        header: header_for(config, config.bin_paths.clone()),
        payload: IndexPayload::Flat(ibf),
    };
    index
        .store(path)
        .with_context(|| format!("failed to store index {}", path.display()))?;
    info!("stored {}", path.display());
    Ok(())
}

fn build_hierarchical(
    config: &BuildConfig,
    reader: &FileReader,
    layout_path: &Path,
) -> Result<()> {
    let layout = parse_hibf_layout(layout_path)?;
    let bin_paths: Vec<Vec<std::path::PathBuf>> =
        layout.records.iter().map(|r| r.files.clone()).collect();
    let ub_hashes = gather_user_bin_hashes(reader, &bin_paths)?;
    let plan = plan_tree(&layout)?;

    let mut nodes: Vec<Option<HibfNode>> = vec![None; plan.len()];
    build_planned_node(&plan, 0, &ub_hashes, config, &mut nodes)?;
    let nodes: Vec<HibfNode> = nodes
        .into_iter()
        .map(|n| n.context("layout planned an unreachable node"))
        .collect::<Result<_>>()?;
    let hibf = HierarchicalIbf::new(nodes)?;
    info!("built hierarchical index with {} nodes", hibf.node_count());

    let index = RaptorIndex {
        header: header_for(config, bin_paths),
        payload: IndexPayload::Hierarchical(hibf),
    };
    index
        .store(&config.output)
        .with_context(|| format!("failed to store index {}", config.output.display()))?;
    info!("stored {}", config.output.display());
    Ok(())
}

/// Build node `node_id` and its subtree; returns the node's full content.
///
/// Children are built first so merged bins can hold their subtree's union;
/// the arena order (parent before child) required by [`HierarchicalIbf`] is
/// the plan order, which `plan_tree` already guarantees.
fn build_planned_node(
    plan: &[PlannedNode],
    node_id: usize,
    ub_hashes: &[Vec<u64>],
    config: &BuildConfig,
    out: &mut Vec<Option<HibfNode>>,
) -> Result<Vec<u64>> {
    let planned = &plan[node_id];
    let bin_count = planned.bin_count();
    if bin_count == 0 {
        anyhow::bail!("layout planned an empty node");
    }

    // (first technical bin, kind, content) per planned bin.
    let mut filled: Vec<(usize, BinKind, Vec<Vec<u64>>)> = Vec::new();
    for (&tb, bin) in &planned.bins {
        match *bin {
            PlannedBin::Leaf { ub, span } => {
                let hashes = ub_hashes
                    .get(ub)
                    .context("layout references an unknown user bin")?;
                let kind = if span > 1 {
                    BinKind::Split(ub as u32)
                } else {
                    BinKind::Single(ub as u32)
                };
                filled.push((tb, kind, split_chunks(hashes, span)));
            }
            PlannedBin::Child(child) => {
                let content = build_planned_node(plan, child, ub_hashes, config, out)?;
                filled.push((tb, BinKind::Merged(child as u32), vec![content]));
            }
        }
    }

    let max_cardinality = filled
        .iter()
        .flat_map(|(_, _, chunks)| chunks.iter().map(Vec::len))
        .max()
        .unwrap_or(0);
    let bin_size = bin_size_for(max_cardinality, config.fpr, config.hash_count);
    let mut ibf = InterleavedBloomFilter::new(bin_count, bin_size, config.hash_count)?;
    let mut bins = vec![BinKind::Empty; bin_count];
    let mut content = AHashSet::new();
    for (tb, kind, chunks) in &filled {
        for (offset, chunk) in chunks.iter().enumerate() {
            bins[tb + offset] = *kind;
            for &hash in chunk {
                ibf.insert(hash, tb + offset);
                content.insert(hash);
            }
        }
    }

    out[node_id] = Some(HibfNode { ibf, bins });
    let mut content: Vec<u64> = content.into_iter().collect();
    content.sort_unstable();
    Ok(content)
}

/// Split a sorted hash list into exactly `span` contiguous chunks.
fn split_chunks(hashes: &[u64], span: usize) -> Vec<Vec<u64>> {
    let chunk_size = hashes.len().div_ceil(span).max(1);
    let mut chunks: Vec<Vec<u64>> = hashes
        .chunks(chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect();
    chunks.resize(span, Vec::new());
    chunks
}
