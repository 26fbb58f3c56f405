//! Bin descriptions and hierarchical layouts
//!
//! Two line-oriented inputs drive a build:
//!
//! - The **bin description file**: one user bin per line, the line being a
//!   whitespace-separated list of file paths.
//! - The **layout file** for hierarchical builds, as delivered by an
//!   external layout planner. Lines starting with `#` carry planner hints
//!   and are ignored here. Each record line has three tab-separated columns:
//!   the bin's files (whitespace-separated), the technical-bin chain from
//!   the root (`;`-separated), and the bin count at each chain level
//!   (`;`-separated, same length). A count above 1 at the last level splits
//!   the user bin over that many consecutive technical bins; counts above 1
//!   are only valid at the last level.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// One record of a hierarchical layout file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutRecord {
    /// The user bin's input files.
    pub files: Vec<PathBuf>,
    /// Technical bin index at each tree level, root first.
    pub tb_chain: Vec<usize>,
    /// Technical bin count at each level; only the last may exceed 1.
    pub tb_counts: Vec<usize>,
}

/// A parsed layout: records in user-bin order.
#[derive(Clone, Debug, Default)]
pub struct HibfLayout {
    /// User bin records; the index in this vector is the user-bin id.
    pub records: Vec<LayoutRecord>,
}

/// Parse a bin description file: each non-empty line is one user bin.
pub fn parse_bin_paths(path: &Path) -> Result<Vec<Vec<PathBuf>>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read bin description {}", path.display()))?;
    let mut bins = Vec::new();
    for line in text.lines() {
        let files: Vec<PathBuf> = line.split_whitespace().map(PathBuf::from).collect();
        if !files.is_empty() {
            bins.push(files);
        }
    }
    if bins.is_empty() {
        bail!("bin description {} lists no files", path.display());
    }
    Ok(bins)
}

/// Parse a hierarchical layout file.
pub fn parse_hibf_layout(path: &Path) -> Result<HibfLayout> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read layout {}", path.display()))?;
    let mut records = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != 3 {
            bail!(
                "{}:{}: expected 3 tab-separated columns, got {}",
                path.display(),
                number + 1,
                columns.len()
            );
        }
        let files: Vec<PathBuf> = columns[0].split_whitespace().map(PathBuf::from).collect();
        if files.is_empty() {
            bail!("{}:{}: record lists no files", path.display(), number + 1);
        }
        let tb_chain = parse_chain(columns[1])
            .with_context(|| format!("{}:{}: bad bin chain", path.display(), number + 1))?;
        let tb_counts = parse_chain(columns[2])
            .with_context(|| format!("{}:{}: bad bin counts", path.display(), number + 1))?;
        if tb_chain.len() != tb_counts.len() {
            bail!(
                "{}:{}: chain and counts differ in length",
                path.display(),
                number + 1
            );
        }
        if tb_counts[..tb_counts.len() - 1].iter().any(|&c| c != 1) {
            bail!(
                "{}:{}: only the last level of a chain may span multiple bins",
                path.display(),
                number + 1
            );
        }
        if tb_counts.last() == Some(&0) {
            bail!("{}:{}: bin count of zero", path.display(), number + 1);
        }
        records.push(LayoutRecord {
            files,
            tb_chain,
            tb_counts,
        });
    }
    if records.is_empty() {
        bail!("layout {} contains no records", path.display());
    }
    Ok(HibfLayout { records })
}

fn parse_chain(column: &str) -> Result<Vec<usize>> {
    column
        .split(';')
        .map(|field| field.parse::<usize>().context("not an unsigned integer"))
        .collect()
}

/// What a planned technical bin holds, before filters are sized.
#[derive(Clone, Debug)]
pub enum PlannedBin {
    /// User bin `ub` occupies `span` consecutive technical bins.
    Leaf {
        /// User-bin id (record index).
        ub: usize,
        /// Number of consecutive technical bins the user bin is split over.
        span: usize,
    },
    /// A merged bin backed by the planned node with this index.
    Child(usize),
}

/// One planned node: technical-bin index -> contents.
#[derive(Clone, Debug, Default)]
pub struct PlannedNode {
    /// Planned bins keyed by their first technical-bin index.
    pub bins: BTreeMap<usize, PlannedBin>,
}

impl PlannedNode {
    /// Technical bin count of this node (highest occupied slot + span).
    pub fn bin_count(&self) -> usize {
        self.bins
            .iter()
            .map(|(&tb, bin)| match bin {
                PlannedBin::Leaf { span, .. } => tb + span,
                PlannedBin::Child(_) => tb + 1,
            })
            .max()
            .unwrap_or(0)
    }
}

/// Plan the node arena from a layout. Node 0 is the root; a child node is
/// always created after its parent, so arena order is parent-before-child.
pub fn plan_tree(layout: &HibfLayout) -> Result<Vec<PlannedNode>> {
    let mut nodes = vec![PlannedNode::default()];
    for (ub, record) in layout.records.iter().enumerate() {
        let mut node = 0usize;
        let last = record.tb_chain.len() - 1;
        for (depth, &tb) in record.tb_chain.iter().enumerate() {
            if depth == last {
                let span = record.tb_counts[depth];
                if nodes[node].bins.contains_key(&tb) {
                    bail!("layout assigns technical bin {tb} of node {node} twice");
                }
                nodes[node].bins.insert(tb, PlannedBin::Leaf { ub, span });
            } else {
                let next = match nodes[node].bins.get(&tb) {
                    Some(PlannedBin::Child(child)) => *child,
                    Some(PlannedBin::Leaf { .. }) => {
                        bail!("layout uses technical bin {tb} of node {node} as both leaf and merged bin")
                    }
                    None => {
                        let child = nodes.len();
                        nodes.push(PlannedNode::default());
                        nodes[node].bins.insert(tb, PlannedBin::Child(child));
                        child
                    }
                };
                node = next;
            }
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_parse_bin_paths() {
        let file = write_file("a.fa a2.fa\nb.fa\n\n");
        let bins = parse_bin_paths(file.path()).unwrap();
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0], vec![PathBuf::from("a.fa"), PathBuf::from("a2.fa")]);
        assert_eq!(bins[1], vec![PathBuf::from("b.fa")]);
    }

    #[test]
    fn test_parse_layout_with_merged_and_split() {
        let file = write_file(
            "#HIGH_LEVEL_IBF max_bin_id:2\n\
             #MERGED_BIN_2 max_bin_id:0\n\
             a.fa\t0\t1\n\
             b.fa\t1\t2\n\
             c.fa\t2;0\t1;1\n\
             d.fa\t2;1\t1;3\n",
        );
        let layout = parse_hibf_layout(file.path()).unwrap();
        assert_eq!(layout.records.len(), 4);
        assert_eq!(layout.records[1].tb_counts, vec![2]);
        assert_eq!(layout.records[3].tb_chain, vec![2, 1]);
        assert_eq!(layout.records[3].tb_counts, vec![1, 3]);
    }

    #[test]
    fn test_plan_tree_structure() {
        let file = write_file(
            "a.fa\t0\t1\n\
             b.fa\t1\t2\n\
             c.fa\t3;0\t1;1\n\
             d.fa\t3;1\t1;1\n",
        );
        let layout = parse_hibf_layout(file.path()).unwrap();
        let nodes = plan_tree(&layout).unwrap();
        assert_eq!(nodes.len(), 2);
        // Root: leaf at 0, split leaf at 1..3, child at 3.
        assert_eq!(nodes[0].bin_count(), 4);
        assert!(matches!(
            nodes[0].bins.get(&1),
            Some(PlannedBin::Leaf { ub: 1, span: 2 })
        ));
        assert!(matches!(nodes[0].bins.get(&3), Some(PlannedBin::Child(1))));
        assert_eq!(nodes[1].bin_count(), 2);
    }

    #[test]
    fn test_duplicate_bin_rejected() {
        let file = write_file("a.fa\t0\t1\nb.fa\t0\t1\n");
        let layout = parse_hibf_layout(file.path()).unwrap();
        assert!(plan_tree(&layout).is_err());
    }

    #[test]
    fn test_split_only_at_last_level() {
        let file = write_file("a.fa\t0;1\t2;1\n");
        assert!(parse_hibf_layout(file.path()).is_err());
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(parse_hibf_layout(write_file("a.fa\t0\n").path()).is_err());
        assert!(parse_hibf_layout(write_file("a.fa\tx\t1\n").path()).is_err());
        assert!(parse_hibf_layout(write_file("").path()).is_err());
    }
}
