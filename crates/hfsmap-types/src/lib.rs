#![forbid(unsafe_code)]
//! Core identifiers, extent types, and big-endian parse primitives shared by
//! every hfsmap crate.
//!
//! All HFS+ on-disk integers are big-endian; the `read_be_*` helpers here are
//! the only sanctioned way to pull them out of a byte slice, and every one of
//! them bounds-checks through [`ensure_slice`] before touching the data.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Byte offset of the volume header within an HFS+ image (after the 1 KiB
/// boot area).
pub const VOLUME_HEADER_OFFSET: u64 = 0x400;
/// Size of the volume header region handed to the parser.
pub const VOLUME_HEADER_SIZE: usize = 512;

/// `H+` signature of an HFS Plus volume header.
pub const HFSPLUS_SIGNATURE: u16 = 0x482B;
/// `HX` signature of a case-sensitive HFSX volume header.
pub const HFSX_SIGNATURE: u16 = 0x4858;

/// Shift applied when converting allocation blocks to device byte offsets.
///
/// Block-relative addressing in the B-tree extents is anchored 0xa00 bytes
/// into the first physical block, past the boot area and volume header.
pub const BLOCK_ADDRESS_BIAS: u64 = 0xa00;

/// Number of extents stored inline in a fork descriptor or overflow record.
pub const INLINE_EXTENT_COUNT: usize = 8;

/// Inclusive bounds on a B-tree node size.
pub const MIN_NODE_SIZE: u16 = 512;
pub const MAX_NODE_SIZE: u16 = 32768;

/// Catalog node id (CNID): identifies a file or folder in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogNodeId(pub u32);

impl CatalogNodeId {
    /// CNID of the root folder. It has no name component of its own and is
    /// never entered into the folder-path cache.
    pub const ROOT_FOLDER: Self = Self(2);
    /// CNID owning the extents-overflow file's own fork.
    pub const EXTENTS_FILE: Self = Self(3);
    /// CNID owning the catalog file's own fork.
    pub const CATALOG_FILE: Self = Self(4);
}

impl fmt::Display for CatalogNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which of a file's two byte streams an extent record belongs to.
///
/// Declaration order matters: `Data < Resource` matches the on-disk fork
/// type ordering (0x00 < 0xFF) used by extents-overflow keys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ForkKind {
    Data,
    Resource,
}

impl ForkKind {
    /// On-disk fork type byte.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::Resource => 0xFF,
        }
    }

    /// Decode an on-disk fork type byte.
    pub fn from_u8(value: u8) -> Result<Self, ParseError> {
        match value {
            0x00 => Ok(Self::Data),
            0xFF => Ok(Self::Resource),
            _ => Err(ParseError::InvalidField {
                field: "fork_type",
                reason: "must be 0x00 (data) or 0xFF (resource)",
            }),
        }
    }
}

impl fmt::Display for ForkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Resource => write!(f, "resource"),
        }
    }
}

/// One contiguous run of allocation blocks.
///
/// A zeroed extent terminates a partially filled extent list.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Extent {
    pub start_block: u32,
    pub block_count: u32,
}

impl Extent {
    pub const EMPTY: Self = Self {
        start_block: 0,
        block_count: 0,
    };

    #[must_use]
    pub fn new(start_block: u32, block_count: u32) -> Self {
        Self {
            start_block,
            block_count,
        }
    }

    /// The `(0, 0)` list terminator.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.start_block == 0 && self.block_count == 0
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.start_block, self.block_count)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_be_i8(data: &[u8], offset: usize) -> Result<i8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0] as i8)
}

/// Decode `units` UTF-16BE code units starting at `offset`.
///
/// Decoding is lossy: unpaired surrogates become U+FFFD rather than failing
/// the record they appear in.
pub fn read_utf16be(data: &[u8], offset: usize, units: usize) -> Result<String, ParseError> {
    let len = units.checked_mul(2).ok_or(ParseError::InvalidField {
        field: "name_length",
        reason: "overflow",
    })?;
    let bytes = ensure_slice(data, offset, len)?;
    let code_units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&code_units))
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers_are_big_endian() {
        let bytes = [0x12_u8, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        assert_eq!(read_be_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_be_u32(&bytes, 0).expect("u32"), 0x1234_5678);
        assert_eq!(read_be_u32(&bytes, 4).expect("u32"), 0x9ABC_DEF0);
        assert_eq!(read_be_u64(&bytes, 0).expect("u64"), 0x1234_5678_9ABC_DEF0);
    }

    #[test]
    fn short_slice_reports_insufficient_data() {
        let bytes = [0_u8; 3];
        let err = read_be_u32(&bytes, 1).expect_err("short");
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 4,
                offset: 1,
                actual: 2,
            }
        );
    }

    #[test]
    fn fork_kind_round_trips() {
        assert_eq!(ForkKind::from_u8(0x00), Ok(ForkKind::Data));
        assert_eq!(ForkKind::from_u8(0xFF), Ok(ForkKind::Resource));
        assert!(ForkKind::from_u8(0x01).is_err());
        assert_eq!(ForkKind::Data.as_u8(), 0x00);
        assert_eq!(ForkKind::Resource.as_u8(), 0xFF);
        assert!(ForkKind::Data < ForkKind::Resource);
    }

    #[test]
    fn extent_terminator() {
        assert!(Extent::EMPTY.is_empty());
        assert!(!Extent::new(0, 1).is_empty());
        assert!(!Extent::new(1, 0).is_empty());
    }

    #[test]
    fn utf16be_decoding() {
        // "abc"
        let bytes = [0x00, 0x61, 0x00, 0x62, 0x00, 0x63];
        assert_eq!(read_utf16be(&bytes, 0, 3).expect("name"), "abc");
        assert_eq!(read_utf16be(&bytes, 0, 0).expect("empty"), "");
        assert!(read_utf16be(&bytes, 0, 4).is_err());
        // Unpaired surrogate decodes lossily instead of failing.
        let bad = [0xD8, 0x00];
        assert_eq!(read_utf16be(&bad, 0, 1).expect("lossy"), "\u{FFFD}");
    }

    #[test]
    fn root_folder_constant() {
        assert_eq!(CatalogNodeId::ROOT_FOLDER, CatalogNodeId(2));
    }
}
