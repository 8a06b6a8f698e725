#![forbid(unsafe_code)]
//! Fork mapping: fork-relative offsets to device byte offsets.
//!
//! A fork carries up to eight inline extents; longer forks continue in the
//! extents-overflow tree, keyed by `(file id, fork kind, start block)`.
//! [`ForkData`] walks that sequence to translate offsets and to assemble a
//! [`SegmentedSource`] covering the fork's full logical size.
//! [`ExtentsFile`] is the overflow tree itself — a point-lookup
//! configuration of the generic B-tree engine, running over its own fork,
//! which never consults an overflow source.

use hfsmap_block::{BlockDevice, ByteSource, SegmentedSource, SourceRange};
use hfsmap_btree::{BTreeFile, ForkRead};
use hfsmap_error::{HpsError, Result};
use hfsmap_ondisk::{parse_extent_record, ExtentsKey, ForkDescriptor};
use hfsmap_types::{CatalogNodeId, Extent, ForkKind, INLINE_EXTENT_COUNT};
use std::sync::Arc;
use tracing::warn;

/// One fork of one file, ready to answer offset queries and to be mapped
/// into a virtual input. Immutable after construction.
pub struct ForkData<'a> {
    file_id: CatalogNodeId,
    kind: ForkKind,
    logical_size: u64,
    extents: [Extent; INLINE_EXTENT_COUNT],
    device: BlockDevice,
    source: Arc<dyn ByteSource>,
    overflow: Option<&'a ExtentsFile>,
}

impl<'a> ForkData<'a> {
    #[must_use]
    pub fn new(
        file_id: CatalogNodeId,
        kind: ForkKind,
        descriptor: &ForkDescriptor,
        device: BlockDevice,
        source: Arc<dyn ByteSource>,
        overflow: Option<&'a ExtentsFile>,
    ) -> Self {
        Self {
            file_id,
            kind,
            logical_size: descriptor.logical_size,
            extents: descriptor.extents,
            device,
            source,
            overflow,
        }
    }

    #[must_use]
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    /// Translate a fork-relative byte offset to a device byte offset.
    ///
    /// Scans the extent sequence from block 0, consuming inline extents
    /// first and fetching overflow records as the inline eight run out.
    pub fn position(&self, offset: u64) -> Result<u64> {
        let mut remaining = offset;
        let mut next_start_block = 0_u32;
        let mut extents = self.extents;
        loop {
            for extent in extents {
                if extent.is_empty() {
                    return Err(HpsError::Structure(format!(
                        "invalid fork data offset {offset} in fork {}/{}: \
                         extent list ends {remaining} bytes short",
                        self.file_id, self.kind
                    )));
                }
                let extent_bytes = self.extent_bytes(extent)?;
                if remaining < extent_bytes {
                    return Ok(self.device.offset(extent.start_block) + remaining);
                }
                remaining -= extent_bytes;
                next_start_block = self.advance_start_block(next_start_block, extent)?;
            }
            extents = self.overflow_extents(next_start_block)?;
        }
    }

    /// Assemble the fork into a named virtual input of device byte ranges.
    ///
    /// Ranges are clipped so the cumulative mapped length never exceeds the
    /// logical size. A terminator extent reached before the logical size is
    /// covered ends the mapping early; the resulting input is shorter than
    /// the fork claims, which is logged and otherwise tolerated.
    pub fn map(&self, name: impl Into<String>) -> Result<SegmentedSource> {
        let mut ranges: Vec<SourceRange> = Vec::new();
        let mut mapped = 0_u64;
        let mut next_start_block = 0_u32;
        let mut extents = self.extents;
        'assemble: while mapped < self.logical_size {
            for extent in extents {
                if extent.is_empty() {
                    warn!(
                        file = %self.file_id,
                        fork = %self.kind,
                        mapped,
                        logical_size = self.logical_size,
                        "extent list ended early; virtual input is truncated"
                    );
                    break 'assemble;
                }
                let len = self
                    .extent_bytes(extent)?
                    .min(self.logical_size - mapped);
                ranges.push(SourceRange {
                    source: Arc::clone(&self.source),
                    offset: self.device.offset(extent.start_block),
                    len,
                });
                mapped += len;
                next_start_block = self.advance_start_block(next_start_block, extent)?;
                if mapped == self.logical_size {
                    break 'assemble;
                }
            }
            extents = self.overflow_extents(next_start_block)?;
        }

        Ok(SegmentedSource::new(name, ranges))
    }

    /// Byte length of one extent; a zero block count on a non-terminator
    /// extent would stall the scan loops, so it is rejected here.
    fn extent_bytes(&self, extent: Extent) -> Result<u64> {
        if extent.block_count == 0 {
            return Err(HpsError::Structure(format!(
                "fork {}/{} has extent {} with zero block count",
                self.file_id, self.kind, extent
            )));
        }
        Ok(self.device.size(extent.block_count))
    }

    fn advance_start_block(&self, start_block: u32, extent: Extent) -> Result<u32> {
        start_block.checked_add(extent.block_count).ok_or_else(|| {
            HpsError::Structure(format!(
                "fork {}/{} block count overflows past extent {}",
                self.file_id, self.kind, extent
            ))
        })
    }

    fn overflow_extents(&self, start_block: u32) -> Result<[Extent; INLINE_EXTENT_COUNT]> {
        let Some(overflow) = self.overflow else {
            return Err(HpsError::Structure(format!(
                "fork {}/{} continues past its inline extents at block {start_block} \
                 but no overflow source is configured",
                self.file_id, self.kind
            )));
        };
        overflow.get_extents(self.file_id, self.kind, start_block)
    }
}

impl ForkRead for ForkData<'_> {
    fn len_bytes(&self) -> u64 {
        self.logical_size
    }

    fn read_fork_exact(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let device_offset = self.position(offset)?;
        self.source.read_exact_at(device_offset, buf)
    }
}

impl std::fmt::Debug for ForkData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkData")
            .field("file_id", &self.file_id)
            .field("kind", &self.kind)
            .field("logical_size", &self.logical_size)
            .field("extents", &self.extents)
            .field("has_overflow", &self.overflow.is_some())
            .finish()
    }
}

/// The extents-overflow tree: point lookups for extent continuations.
pub struct ExtentsFile {
    tree: BTreeFile<ExtentsKey, ForkData<'static>>,
}

impl ExtentsFile {
    /// Build the overflow tree over its own fork. The fork must carry no
    /// overflow source of its own; the tree's extents are fully inline.
    #[must_use]
    pub fn new(fork: ForkData<'static>) -> Self {
        Self {
            tree: BTreeFile::new(fork),
        }
    }

    /// Fetch the eight extents continuing `fork` of `file_id` at
    /// fork-relative `start_block`.
    pub fn get_extents(
        &self,
        file_id: CatalogNodeId,
        fork: ForkKind,
        start_block: u32,
    ) -> Result<[Extent; INLINE_EXTENT_COUNT]> {
        let key = ExtentsKey::new(file_id, fork, start_block);
        let value = self.tree.find_leaf(&key)?;
        parse_extent_record(&value, 0).map_err(|err| HpsError::Parse(err.to_string()))
    }
}

impl std::fmt::Debug for ExtentsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentsFile").finish_non_exhaustive()
    }
}
