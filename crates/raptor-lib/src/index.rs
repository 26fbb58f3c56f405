//! Index persistence
//!
//! A persisted index is a versioned header followed by the filter payload:
//!
//! ```text
//! magic            "RPTRIDX1"
//! version          major u32, minor u32
//! window_size      u32
//! shape            mask u64, span u32
//! parts            u32
//! fpr              f64 bits
//! bin paths        count u64, then per bin: file count u64,
//!                  then per file: byte length u64 + UTF-8 path
//! payload tag      u8 (0 = flat IBF, 1 = hierarchical)
//! payload          filter data, see ibf/hibf modules
//! ```
//!
//! All integers are little-endian. Indices from a different major version
//! are rejected; so are queries whose shape or window differ from the ones
//! the index was built with. A partitioned index is `parts` files named
//! `<path>.0` through `<path>.<parts - 1>`, each a complete index record.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::constants::{FORMAT_VERSION, INDEX_MAGIC};
use crate::error::{RaptorError, Result};
use crate::hibf::HierarchicalIbf;
use crate::ibf::InterleavedBloomFilter;
use crate::shape::Shape;

/// Build parameters persisted with the filter data.
#[derive(Clone, Debug)]
pub struct IndexHeader {
    /// Format version the index was written with.
    pub version: (u32, u32),
    /// Minimiser window size.
    pub window_size: usize,
    /// Minimiser shape.
    pub shape: Shape,
    /// Number of partitions the full index was split into (1 = monolithic).
    pub parts: usize,
    /// False-positive rate the filters were sized for.
    pub fpr: f64,
    /// The user bins' input files, in user-bin order.
    pub bin_paths: Vec<Vec<PathBuf>>,
}

/// Filter payload variants.
#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug)]
pub enum IndexPayload {
    /// A single flat filter.
    Flat(InterleavedBloomFilter),
    /// A tree of filters.
    Hierarchical(HierarchicalIbf),
}

/// A loaded or freshly built index.
#[derive(Clone, Debug)]
pub struct RaptorIndex {
    /// Build parameters.
    pub header: IndexHeader,
    /// Filter data.
    pub payload: IndexPayload,
}

/// Path of partition `part` of a partitioned index.
pub fn partition_path(base: &Path, part: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{part}"));
    PathBuf::from(name)
}

impl RaptorIndex {
    /// Hash function count of the payload's (root) filter.
    pub fn hash_count(&self) -> u32 {
        match &self.payload {
            IndexPayload::Flat(ibf) => ibf.hash_count(),
            IndexPayload::Hierarchical(hibf) => hibf.root_ibf().hash_count(),
        }
    }

    /// Reject a query whose minimiser scheme differs from the build's.
    pub fn validate_query_scheme(&self, shape: Shape, window_size: usize) -> Result<()> {
        if self.header.shape != shape {
            return Err(RaptorError::VersionMismatch(format!(
                "index was built with shape {}, query uses {}",
                self.header.shape.to_bit_string(),
                shape.to_bit_string()
            )));
        }
        if self.header.window_size != window_size {
            return Err(RaptorError::VersionMismatch(format!(
                "index was built with window size {}, query uses {window_size}",
                self.header.window_size
            )));
        }
        Ok(())
    }

    /// Write the index to `path`.
    pub fn store(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write_into(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Read an index from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader)
    }

    fn write_into<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(INDEX_MAGIC)?;
        writer.write_all(&FORMAT_VERSION.0.to_le_bytes())?;
        writer.write_all(&FORMAT_VERSION.1.to_le_bytes())?;
        writer.write_all(&(self.header.window_size as u32).to_le_bytes())?;
        writer.write_all(&self.header.shape.mask().to_le_bytes())?;
        writer.write_all(&(self.header.shape.span() as u32).to_le_bytes())?;
        writer.write_all(&(self.header.parts as u32).to_le_bytes())?;
        writer.write_all(&self.header.fpr.to_bits().to_le_bytes())?;

        writer.write_all(&(self.header.bin_paths.len() as u64).to_le_bytes())?;
        for files in &self.header.bin_paths {
            writer.write_all(&(files.len() as u64).to_le_bytes())?;
            for file in files {
                let bytes = file.to_string_lossy();
                let bytes = bytes.as_bytes();
                writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
                writer.write_all(bytes)?;
            }
        }

        match &self.payload {
            IndexPayload::Flat(ibf) => {
                writer.write_all(&[0u8])?;
                ibf.write_into(writer)?;
            }
            IndexPayload::Hierarchical(hibf) => {
                writer.write_all(&[1u8])?;
                hibf.write_into(writer)?;
            }
        }
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(RaptorError::Format {
                what: "index",
                detail: "bad magic bytes, not a raptor index".into(),
            });
        }

        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];
        reader.read_exact(&mut buf4)?;
        let major = u32::from_le_bytes(buf4);
        reader.read_exact(&mut buf4)?;
        let minor = u32::from_le_bytes(buf4);
        if major != FORMAT_VERSION.0 {
            return Err(RaptorError::VersionMismatch(format!(
                "index format {major}.{minor}, this build reads {}.{}",
                FORMAT_VERSION.0, FORMAT_VERSION.1
            )));
        }

        reader.read_exact(&mut buf4)?;
        let window_size = u32::from_le_bytes(buf4) as usize;
        reader.read_exact(&mut buf8)?;
        let mask = u64::from_le_bytes(buf8);
        reader.read_exact(&mut buf4)?;
        let span = u32::from_le_bytes(buf4);
        let shape = Shape::new(mask, span).map_err(|e| RaptorError::Format {
            what: "index",
            detail: e.to_string(),
        })?;
        reader.read_exact(&mut buf4)?;
        let parts = u32::from_le_bytes(buf4) as usize;
        reader.read_exact(&mut buf8)?;
        let fpr = f64::from_bits(u64::from_le_bytes(buf8));

        reader.read_exact(&mut buf8)?;
        let bin_count = u64::from_le_bytes(buf8) as usize;
        let mut bin_paths = Vec::with_capacity(bin_count);
        for _ in 0..bin_count {
            reader.read_exact(&mut buf8)?;
            let file_count = u64::from_le_bytes(buf8) as usize;
            let mut files = Vec::with_capacity(file_count);
            for _ in 0..file_count {
                reader.read_exact(&mut buf8)?;
                let len = u64::from_le_bytes(buf8) as usize;
                let mut bytes = vec![0u8; len];
                reader.read_exact(&mut bytes)?;
                let path = String::from_utf8(bytes).map_err(|_| RaptorError::Format {
                    what: "index",
                    detail: "bin path is not valid UTF-8".into(),
                })?;
                files.push(PathBuf::from(path));
            }
            bin_paths.push(files);
        }

        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;
        let payload = match tag[0] {
            0 => IndexPayload::Flat(InterleavedBloomFilter::read_from(reader)?),
            1 => IndexPayload::Hierarchical(HierarchicalIbf::read_from(reader)?),
            other => {
                return Err(RaptorError::Format {
                    what: "index",
                    detail: format!("unknown payload tag {other}"),
                })
            }
        };

        Ok(Self {
            header: IndexHeader {
                version: (major, minor),
                window_size,
                shape,
                parts,
                fpr,
                bin_paths,
            },
            payload,
        })
    }
}

/// Re-serialise an index in the current format.
///
/// Accepts any index this build can read (same major version) and rewrites
/// it with the current minor version. Unknown magic or an incompatible major
/// version is a [`RaptorError::VersionMismatch`] / format error from `load`.
pub fn upgrade(input: &Path, output: &Path) -> Result<()> {
    let mut index = RaptorIndex::load(input)?;
    index.header.version = FORMAT_VERSION;
    index.store(output)
}
