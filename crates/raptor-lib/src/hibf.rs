//! Hierarchical Interleaved Bloom Filter
//!
//! A rooted tree of IBFs (root at index 0) for collections too large or too
//! skewed for one flat filter. Every technical bin of a node either holds a
//! user bin directly (possibly one of several slots the user bin was split
//! over) or summarises a merged subtree stored in a child node.
//!
//! A query counts the node's bins once; bins reaching the threshold either
//! emit their user bin or recurse into their child with the same threshold.
//! The result is the de-duplicated union of user-bin ids.

use std::io::{Read, Write};

use ahash::AHashSet;

use crate::error::{RaptorError, Result};
use crate::ibf::InterleavedBloomFilter;

/// What one technical bin of a node resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinKind {
    /// The bin is unused (rounding padding or an empty layout slot).
    Empty,
    /// The bin holds this user bin.
    Single(u32),
    /// One of several slots a user bin was split over. A hit in any slot is
    /// a hit for the user bin.
    Split(u32),
    /// The bin summarises the subtree stored at this child node index.
    Merged(u32),
}

/// One node: an IBF plus the meaning of each of its technical bins.
#[derive(Clone, Debug)]
pub struct HibfNode {
    /// The node's filter.
    pub ibf: InterleavedBloomFilter,
    /// One entry per technical bin of `ibf`.
    pub bins: Vec<BinKind>,
}

/// The tree. Node 0 is the root; children are referenced by index.
#[derive(Clone, Debug)]
pub struct HierarchicalIbf {
    nodes: Vec<HibfNode>,
}

impl HierarchicalIbf {
    /// Assemble a tree from nodes. Validates bin maps and child references.
    pub fn new(nodes: Vec<HibfNode>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(RaptorError::InvalidArgument(
                "hierarchical index needs at least a root node".into(),
            ));
        }
        for (i, node) in nodes.iter().enumerate() {
            if node.bins.len() != node.ibf.bin_count() {
                return Err(RaptorError::InvalidArgument(format!(
                    "node {i} maps {} bins but its filter has {}",
                    node.bins.len(),
                    node.ibf.bin_count()
                )));
            }
            for kind in &node.bins {
                if let BinKind::Merged(child) = kind {
                    let child = *child as usize;
                    // Children always follow their parent, so the arena
                    // order itself rules out cycles.
                    if child <= i || child >= nodes.len() {
                        return Err(RaptorError::InvalidArgument(format!(
                            "node {i} references invalid child {child}"
                        )));
                    }
                }
            }
        }
        Ok(Self { nodes })
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The root node's filter (for reporting hash counts and the like).
    pub fn root_ibf(&self) -> &InterleavedBloomFilter {
        &self.nodes[0].ibf
    }

    /// User-bin ids whose bins reach `threshold` shared hashes, ascending
    /// and de-duplicated across split slots and merged subtrees.
    pub fn membership(&self, hashes: &[u64], threshold: u16) -> Vec<u32> {
        let mut result = AHashSet::new();
        self.query_node(0, hashes, threshold, &mut result);
        let mut out: Vec<u32> = result.into_iter().collect();
        out.sort_unstable();
        out
    }

    fn query_node(
        &self,
        node_idx: usize,
        hashes: &[u64],
        threshold: u16,
        result: &mut AHashSet<u32>,
    ) {
        let node = &self.nodes[node_idx];
        let counts = node.ibf.counting_agent().bulk_count(hashes.iter().copied());
        for (bin, &count) in counts.iter().enumerate() {
            if count < threshold {
                continue;
            }
            match node.bins[bin] {
                BinKind::Empty => {}
                BinKind::Single(ub) | BinKind::Split(ub) => {
                    result.insert(ub);
                }
                BinKind::Merged(child) => {
                    self.query_node(child as usize, hashes, threshold, result);
                }
            }
        }
    }

    pub(crate) fn write_into<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.nodes.len() as u64).to_le_bytes())?;
        for node in &self.nodes {
            node.ibf.write_into(writer)?;
            for kind in &node.bins {
                let (tag, value): (u8, u32) = match *kind {
                    BinKind::Empty => (0, 0),
                    BinKind::Single(ub) => (1, ub),
                    BinKind::Split(ub) => (2, ub),
                    BinKind::Merged(child) => (3, child),
                };
                writer.write_all(&[tag])?;
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf8 = [0u8; 8];
        reader.read_exact(&mut buf8)?;
        let node_count = u64::from_le_bytes(buf8) as usize;
        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let ibf = InterleavedBloomFilter::read_from(reader)?;
            let mut bins = Vec::with_capacity(ibf.bin_count());
            for _ in 0..ibf.bin_count() {
                let mut tag = [0u8; 1];
                let mut value = [0u8; 4];
                reader.read_exact(&mut tag)?;
                reader.read_exact(&mut value)?;
                let value = u32::from_le_bytes(value);
                bins.push(match tag[0] {
                    0 => BinKind::Empty,
                    1 => BinKind::Single(value),
                    2 => BinKind::Split(value),
                    3 => BinKind::Merged(value),
                    other => {
                        return Err(RaptorError::Format {
                            what: "index",
                            detail: format!("unknown bin kind tag {other}"),
                        })
                    }
                });
            }
            nodes.push(HibfNode { ibf, bins });
        }
        Self::new(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minimiser::fmix64;

    /// Root with bins [Single(0), Merged -> child], child with
    /// [Single(1), Single(2)].
    fn two_level_tree() -> (HierarchicalIbf, Vec<Vec<u64>>) {
        let contents: Vec<Vec<u64>> = vec![
            (0..30u64).map(fmix64).collect(),
            (100..130u64).map(fmix64).collect(),
            (200..230u64).map(fmix64).collect(),
        ];

        let mut child_ibf = InterleavedBloomFilter::new(2, 4096, 2).unwrap();
        for &h in &contents[1] {
            child_ibf.insert(h, 0);
        }
        for &h in &contents[2] {
            child_ibf.insert(h, 1);
        }

        let mut root_ibf = InterleavedBloomFilter::new(2, 4096, 2).unwrap();
        for &h in &contents[0] {
            root_ibf.insert(h, 0);
        }
        // The merged bin holds the whole subtree's content.
        for &h in contents[1].iter().chain(&contents[2]) {
            root_ibf.insert(h, 1);
        }

        let tree = HierarchicalIbf::new(vec![
            HibfNode {
                ibf: root_ibf,
                bins: vec![BinKind::Single(0), BinKind::Merged(1)],
            },
            HibfNode {
                ibf: child_ibf,
                bins: vec![BinKind::Single(1), BinKind::Single(2)],
            },
        ])
        .unwrap();
        (tree, contents)
    }

    #[test]
    fn test_merged_subtree_collapses_to_one_bin() {
        let (tree, contents) = two_level_tree();
        // Query matching user bin 2 only: bin 1 must not appear even though
        // both share the merged technical bin at the root.
        let hits = tree.membership(&contents[2], contents[2].len() as u16);
        assert_eq!(hits, vec![2]);
    }

    #[test]
    fn test_direct_bin_hit() {
        let (tree, contents) = two_level_tree();
        let hits = tree.membership(&contents[0], contents[0].len() as u16);
        assert_eq!(hits, vec![0]);
    }

    #[test]
    fn test_split_slots_deduplicate() {
        let content: Vec<u64> = (0..40u64).map(fmix64).collect();
        let mut ibf = InterleavedBloomFilter::new(2, 4096, 2).unwrap();
        // One user bin split over two slots.
        for &h in &content[..20] {
            ibf.insert(h, 0);
        }
        for &h in &content[20..] {
            ibf.insert(h, 1);
        }
        let tree = HierarchicalIbf::new(vec![HibfNode {
            ibf,
            bins: vec![BinKind::Split(7), BinKind::Split(7)],
        }])
        .unwrap();
        // Both slots cross the threshold; the user bin appears once.
        assert_eq!(tree.membership(&content, 10), vec![7]);
        // Disjunctive: only one slot crossing still reports the user bin.
        assert_eq!(tree.membership(&content[..20], 15), vec![7]);
    }

    #[test]
    fn test_bin_map_length_validated() {
        let ibf = InterleavedBloomFilter::new(2, 64, 2).unwrap();
        assert!(HierarchicalIbf::new(vec![HibfNode {
            ibf,
            bins: vec![BinKind::Single(0)],
        }])
        .is_err());
    }

    #[test]
    fn test_child_reference_must_follow_parent() {
        let ibf = InterleavedBloomFilter::new(1, 64, 2).unwrap();
        assert!(HierarchicalIbf::new(vec![HibfNode {
            ibf,
            bins: vec![BinKind::Merged(0)],
        }])
        .is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let (tree, contents) = two_level_tree();
        let mut buffer = Vec::new();
        tree.write_into(&mut buffer).unwrap();
        let loaded = HierarchicalIbf::read_from(&mut buffer.as_slice()).unwrap();
        assert_eq!(loaded.node_count(), tree.node_count());
        for hashes in &contents {
            assert_eq!(
                loaded.membership(hashes, hashes.len() as u16),
                tree.membership(hashes, hashes.len() as u16)
            );
        }
    }
}
