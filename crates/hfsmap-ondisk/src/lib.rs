#![forbid(unsafe_code)]
//! On-disk format parsing for HFS+ structures.
//!
//! Pure parsing crate — no I/O, no side effects. Parses byte slices into
//! typed structures for the volume header, fork descriptors, B-tree node
//! descriptors, the B-tree header record, node record tables, and the
//! catalog / extents-overflow key and value formats.
//!
//! All multi-byte integers are big-endian. Every accessor bounds-checks via
//! the helpers in `hfsmap-types`; nothing in this crate panics on arbitrary
//! input.

use hfsmap_types::{
    ensure_slice, read_be_i8, read_be_u16, read_be_u32, read_be_u64, read_utf16be, CatalogNodeId,
    Extent, ForkKind, ParseError, HFSPLUS_SIGNATURE, HFSX_SIGNATURE, INLINE_EXTENT_COUNT,
    MAX_NODE_SIZE, MIN_NODE_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Fork descriptors ────────────────────────────────────────────────────────

/// Size of an on-disk fork descriptor.
pub const FORK_DESCRIPTOR_SIZE: usize = 80;

/// Describes one fork of a file: logical size plus the first eight extents.
///
/// Extents beyond the inline eight live in the extents-overflow tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkDescriptor {
    pub logical_size: u64,
    /// Clump size hint; carried but not interpreted by the mapper.
    pub clump_size: u32,
    /// Total allocated blocks; carried but not interpreted by the mapper.
    pub total_blocks: u32,
    pub extents: [Extent; INLINE_EXTENT_COUNT],
}

impl ForkDescriptor {
    /// Parse an 80-byte fork descriptor starting at `offset`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let region = ensure_slice(data, offset, FORK_DESCRIPTOR_SIZE)?;
        Ok(Self {
            logical_size: read_be_u64(region, 0)?,
            clump_size: read_be_u32(region, 8)?,
            total_blocks: read_be_u32(region, 12)?,
            extents: parse_extent_record(region, 16)?,
        })
    }

    /// A fork with no content and no extents.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            logical_size: 0,
            clump_size: 0,
            total_blocks: 0,
            extents: [Extent::EMPTY; INLINE_EXTENT_COUNT],
        }
    }
}

/// Parse eight big-endian `(start_block, block_count)` pairs at `offset`.
pub fn parse_extent_record(
    data: &[u8],
    offset: usize,
) -> Result<[Extent; INLINE_EXTENT_COUNT], ParseError> {
    let region = ensure_slice(data, offset, INLINE_EXTENT_COUNT * 8)?;
    let mut extents = [Extent::EMPTY; INLINE_EXTENT_COUNT];
    for (i, extent) in extents.iter_mut().enumerate() {
        extent.start_block = read_be_u32(region, i * 8)?;
        extent.block_count = read_be_u32(region, i * 8 + 4)?;
    }
    Ok(extents)
}

// ── Volume header ───────────────────────────────────────────────────────────

/// The 512-byte HFS+ volume header found at image offset 0x400.
///
/// Only geometry and the special-file fork descriptors matter to the
/// mapper; the remaining counters are carried for callers that report on
/// the volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_catalog_id: u32,
    pub allocation_file: ForkDescriptor,
    pub extents_file: ForkDescriptor,
    pub catalog_file: ForkDescriptor,
    pub attributes_file: ForkDescriptor,
    pub startup_file: ForkDescriptor,
}

impl VolumeHeader {
    /// Parse the volume-header region (the 512 bytes at image offset 0x400).
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let signature = read_be_u16(region, 0)?;
        if signature != HFSPLUS_SIGNATURE && signature != HFSX_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(HFSPLUS_SIGNATURE),
                actual: u64::from(signature),
            });
        }

        let header = Self {
            signature,
            version: read_be_u16(region, 2)?,
            attributes: read_be_u32(region, 4)?,
            last_mounted_version: read_be_u32(region, 8)?,
            journal_info_block: read_be_u32(region, 12)?,
            file_count: read_be_u32(region, 32)?,
            folder_count: read_be_u32(region, 36)?,
            block_size: read_be_u32(region, 40)?,
            total_blocks: read_be_u32(region, 44)?,
            free_blocks: read_be_u32(region, 48)?,
            next_catalog_id: read_be_u32(region, 64)?,
            allocation_file: ForkDescriptor::parse(region, 112)?,
            extents_file: ForkDescriptor::parse(region, 192)?,
            catalog_file: ForkDescriptor::parse(region, 272)?,
            attributes_file: ForkDescriptor::parse(region, 352)?,
            startup_file: ForkDescriptor::parse(region, 432)?,
        };

        if header.block_size == 0 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be nonzero",
            });
        }

        Ok(header)
    }

    /// Whether this is a case-sensitive HFSX volume.
    #[must_use]
    pub fn is_hfsx(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }
}

// ── B-tree nodes ────────────────────────────────────────────────────────────

/// Size of the descriptor at the start of every B-tree node.
pub const NODE_DESCRIPTOR_SIZE: usize = 14;

/// Length of the header region read from fork offset 0 (node descriptor
/// plus the leading fields of the header record).
pub const TREE_HEADER_LEN: usize = 106;

/// B-tree node kinds, as stored in the descriptor's `kind` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Index,
    Header,
    Map,
}

impl NodeKind {
    pub fn from_i8(value: i8) -> Result<Self, ParseError> {
        match value {
            -1 => Ok(Self::Leaf),
            0 => Ok(Self::Index),
            1 => Ok(Self::Header),
            2 => Ok(Self::Map),
            _ => Err(ParseError::InvalidField {
                field: "node_kind",
                reason: "must be -1 (leaf), 0 (index), 1 (header), or 2 (map)",
            }),
        }
    }
}

/// The 14-byte descriptor at the start of every node.
///
/// `kind` stays the raw on-disk byte: the leaf-chain walk never interprets
/// it, and point-lookup descent converts it through [`NodeKind::from_i8`]
/// only where it matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Next node in this node's chain, `0` at the end.
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind: i8,
    pub height: u8,
    pub num_records: u16,
}

impl NodeDescriptor {
    pub fn parse(node: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            forward_link: read_be_u32(node, 0)?,
            backward_link: read_be_u32(node, 4)?,
            kind: read_be_i8(node, 8)?,
            height: ensure_slice(node, 9, 1)?[0],
            num_records: read_be_u16(node, 10)?,
        })
    }
}

/// The fields of the B-tree header record the mapper uses, read from the
/// 106-byte region at fork offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    pub node_size: u16,
    pub root_node: u32,
    pub first_leaf_node: u32,
}

impl TreeHeader {
    /// Parse and validate the header region.
    ///
    /// `node_size` outside `512..=32768` is rejected here; everything
    /// downstream sizes its node buffer from this field.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let node_size = read_be_u16(region, 32)?;
        if !(MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&node_size) {
            return Err(ParseError::InvalidField {
                field: "node_size",
                reason: "must be in 512..=32768",
            });
        }
        Ok(Self {
            node_size,
            root_node: read_be_u32(region, 16)?,
            first_leaf_node: read_be_u32(region, 24)?,
        })
    }
}

/// One record sliced out of a node: raw key bytes and raw value bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Slice record `record_number` (1-based) out of a node buffer.
///
/// Record offsets come from the reverse offset table anchored at the node's
/// last bytes: entry `r` sits at `node_size - 2*r`, and the entry after the
/// last record marks the start of free space, which is what makes
/// `next_start - record_offset` the record length.
pub fn read_record(node: &[u8], record_number: u16) -> Result<RawRecord<'_>, ParseError> {
    let node_size = node.len();
    let entry = |index: usize| -> Result<usize, ParseError> {
        let back = 2_usize.checked_mul(index).ok_or(ParseError::InvalidField {
            field: "record_number",
            reason: "offset table index overflow",
        })?;
        let pos = node_size.checked_sub(back).ok_or(ParseError::InvalidField {
            field: "record_number",
            reason: "offset table entry outside node",
        })?;
        Ok(usize::from(read_be_u16(node, pos)?))
    };

    let record_offset = entry(usize::from(record_number))?;
    let next_start = entry(usize::from(record_number) + 1)?;
    let record_len = next_start
        .checked_sub(record_offset)
        .ok_or(ParseError::InvalidField {
            field: "record_offset",
            reason: "offset table entries not monotonic",
        })?;
    if record_len < 2 {
        return Err(ParseError::InvalidField {
            field: "record_length",
            reason: "record too short for a key length",
        });
    }

    let key_length = usize::from(read_be_u16(node, record_offset)?);
    let key = ensure_slice(node, record_offset + 2, key_length)?;
    let value_start = record_offset + 2 + key_length;
    let record_end = record_offset
        .checked_add(record_len)
        .ok_or(ParseError::InvalidField {
            field: "record_length",
            reason: "overflow",
        })?;
    let value_len = record_end
        .checked_sub(value_start)
        .ok_or(ParseError::InvalidField {
            field: "key_length",
            reason: "key exceeds record length",
        })?;
    let value = ensure_slice(node, value_start, value_len)?;

    Ok(RawRecord { key, value })
}

// ── Catalog keys and records ────────────────────────────────────────────────

/// Catalog record types stored at the start of a leaf record's value.
pub const CATALOG_RECORD_FOLDER: u16 = 1;
pub const CATALOG_RECORD_FILE: u16 = 2;
pub const CATALOG_RECORD_FOLDER_THREAD: u16 = 3;
pub const CATALOG_RECORD_FILE_THREAD: u16 = 4;

/// Value-buffer offsets within folder and file records.
const CATALOG_ID_OFFSET: usize = 8;
const DATA_FORK_OFFSET: usize = 88;
const RESOURCE_FORK_OFFSET: usize = 168;

/// Catalog key: `(parent folder id, node name)`.
///
/// The derived ordering (parent id, then name) is the total order the
/// catalog tree is sorted by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub parent_id: CatalogNodeId,
    pub name: String,
}

impl CatalogKey {
    #[must_use]
    pub fn new(parent_id: CatalogNodeId, name: impl Into<String>) -> Self {
        Self {
            parent_id,
            name: name.into(),
        }
    }

    /// Decode a catalog key buffer: parent id, name length in UTF-16 code
    /// units, then the name itself.
    pub fn parse(key: &[u8]) -> Result<Self, ParseError> {
        let parent_id = CatalogNodeId(read_be_u32(key, 0)?);
        let name_length = usize::from(read_be_u16(key, 4)?);
        let name = if name_length == 0 {
            String::new()
        } else {
            read_utf16be(key, 6, name_length)?
        };
        Ok(Self { parent_id, name })
    }
}

impl fmt::Display for CatalogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:\"{}\"", self.parent_id, self.name)
    }
}

/// Extents-overflow key: `(fork kind, file id, start block)`.
///
/// Field order here is the comparison order (file id, fork kind, start
/// block), which differs from the on-disk byte layout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ExtentsKey {
    pub file_id: CatalogNodeId,
    pub fork: ForkKind,
    pub start_block: u32,
}

impl ExtentsKey {
    #[must_use]
    pub fn new(file_id: CatalogNodeId, fork: ForkKind, start_block: u32) -> Self {
        Self {
            file_id,
            fork,
            start_block,
        }
    }

    /// Decode an extents key buffer: fork type byte, pad byte, file id,
    /// start block.
    pub fn parse(key: &[u8]) -> Result<Self, ParseError> {
        let fork = ForkKind::from_u8(ensure_slice(key, 0, 1)?[0])?;
        let file_id = CatalogNodeId(read_be_u32(key, 2)?);
        let start_block = read_be_u32(key, 6)?;
        Ok(Self {
            file_id,
            fork,
            start_block,
        })
    }
}

impl fmt::Display for ExtentsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.file_id, self.fork, self.start_block)
    }
}

/// A decoded catalog leaf value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRecord {
    Folder(FolderRecord),
    File(FileRecord),
    /// Thread records only map ids back to keys; the walk ignores them.
    Thread,
    /// Unrecognized record type, carried for logging.
    Unknown(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderRecord {
    pub folder_id: CatalogNodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: CatalogNodeId,
    pub data_fork: ForkDescriptor,
    pub resource_fork: ForkDescriptor,
}

/// Decode a catalog leaf record value.
pub fn parse_catalog_record(value: &[u8]) -> Result<CatalogRecord, ParseError> {
    let record_type = read_be_u16(value, 0)?;
    match record_type {
        CATALOG_RECORD_FOLDER => Ok(CatalogRecord::Folder(FolderRecord {
            folder_id: CatalogNodeId(read_be_u32(value, CATALOG_ID_OFFSET)?),
        })),
        CATALOG_RECORD_FILE => Ok(CatalogRecord::File(FileRecord {
            file_id: CatalogNodeId(read_be_u32(value, CATALOG_ID_OFFSET)?),
            data_fork: ForkDescriptor::parse(value, DATA_FORK_OFFSET)?,
            resource_fork: ForkDescriptor::parse(value, RESOURCE_FORK_OFFSET)?,
        })),
        CATALOG_RECORD_FOLDER_THREAD | CATALOG_RECORD_FILE_THREAD => Ok(CatalogRecord::Thread),
        other => Ok(CatalogRecord::Unknown(other)),
    }
}
