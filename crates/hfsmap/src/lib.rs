#![forbid(unsafe_code)]
//! Read-only HFS+ volume mapping.
//!
//! The driver wires the subsystem together from pre-parsed volume geometry:
//! block device math, the extents-overflow tree over its own fork (which
//! never needs overflow itself), the catalog fork (overflow-capable), and
//! the catalog walk that emits one virtual input per discoverable file
//! fork. The result set is materialized eagerly; content stays
//! range-referenced into the original image.
//!
//! Failures escaping the walk are downgraded by [`map_volume`] to a logged
//! error and zero inputs, so a damaged volume shortens the file list
//! instead of aborting the surrounding scan.

use hfsmap_types::{ParseError, VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

pub use hfsmap_block::{
    BlockDevice, ByteSource, FileByteSource, MemoryByteSource, SegmentedSource, SourceRange,
};
pub use hfsmap_btree::{BTreeFile, BtreeKey, ForkRead};
pub use hfsmap_catalog::{CatalogFile, FolderCache, ScanOptions, RESOURCE_FORK_SUFFIX};
pub use hfsmap_error::{HpsError, Result};
pub use hfsmap_fork::{ExtentsFile, ForkData};
pub use hfsmap_ondisk::{CatalogKey, ExtentsKey, ForkDescriptor, VolumeHeader};
pub use hfsmap_types::{CatalogNodeId, Extent, ForkKind};

/// Pre-parsed volume geometry handed in by the surrounding engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeParams {
    pub block_size: u32,
    pub total_blocks: u32,
    pub extents_fork: ForkDescriptor,
    pub catalog_fork: ForkDescriptor,
}

impl VolumeParams {
    /// Extract the mapping-relevant geometry from a parsed volume header.
    #[must_use]
    pub fn from_header(header: &VolumeHeader) -> Self {
        Self {
            block_size: header.block_size,
            total_blocks: header.total_blocks,
            extents_fork: header.extents_file,
            catalog_fork: header.catalog_file,
        }
    }
}

/// Summary of one volume mapping, for reporting alongside the inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSurvey {
    pub input_count: usize,
    pub mapped_bytes: u64,
}

impl VolumeSurvey {
    #[must_use]
    pub fn of(inputs: &[SegmentedSource]) -> Self {
        Self {
            input_count: inputs.len(),
            mapped_bytes: inputs.iter().map(|input| input.len_bytes()).sum(),
        }
    }
}

fn parse_to_error(err: ParseError) -> HpsError {
    match err {
        ParseError::InvalidMagic { .. } | ParseError::InvalidField { .. } => {
            HpsError::Structure(err.to_string())
        }
        other => HpsError::Parse(other.to_string()),
    }
}

/// Walk one HFS+ volume and return every discoverable file as a named
/// virtual input.
///
/// Errors anywhere in the decode propagate to the caller; use
/// [`map_volume`] for the recovering variant.
pub fn try_map_volume(
    source: &Arc<dyn ByteSource>,
    params: &VolumeParams,
    options: &ScanOptions,
) -> Result<Vec<SegmentedSource>> {
    let device = BlockDevice::new(params.block_size);

    // The extents-overflow file's own fork must resolve without consulting
    // the tree it backs.
    let extents_fork = ForkData::new(
        CatalogNodeId::EXTENTS_FILE,
        ForkKind::Data,
        &params.extents_fork,
        device,
        Arc::clone(source),
        None,
    );
    let extents = ExtentsFile::new(extents_fork);

    let catalog_fork = ForkData::new(
        CatalogNodeId::CATALOG_FILE,
        ForkKind::Data,
        &params.catalog_fork,
        device,
        Arc::clone(source),
        Some(&extents),
    );
    let catalog = CatalogFile::new(catalog_fork, device, Arc::clone(source), &extents);

    let mut inputs = Vec::new();
    catalog.walk_file_tree(options, |input| inputs.push(input))?;
    debug!(
        inputs = inputs.len(),
        block_size = params.block_size,
        total_blocks = params.total_blocks,
        "volume walk complete"
    );
    Ok(inputs)
}

/// Walk one HFS+ volume, downgrading any failure to a logged error and an
/// empty result so the surrounding scan proceeds with the volume header it
/// already has.
#[must_use]
pub fn map_volume(
    source: &Arc<dyn ByteSource>,
    params: &VolumeParams,
    options: &ScanOptions,
) -> Vec<SegmentedSource> {
    match try_map_volume(source, params, options) {
        Ok(inputs) => inputs,
        Err(err) => {
            error!(error = %err, "HFS+ volume decode failed; contributing no inputs");
            Vec::new()
        }
    }
}

/// Probe the volume header at image offset 0x400 and map the volume it
/// describes.
pub fn map_image(
    source: &Arc<dyn ByteSource>,
    options: &ScanOptions,
) -> Result<Vec<SegmentedSource>> {
    let mut region = [0_u8; VOLUME_HEADER_SIZE];
    source.read_exact_at(VOLUME_HEADER_OFFSET, &mut region)?;
    let header = VolumeHeader::parse(&region).map_err(parse_to_error)?;
    try_map_volume(source, &VolumeParams::from_header(&header), options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_params() -> VolumeParams {
        VolumeParams {
            block_size: 4096,
            total_blocks: 16,
            extents_fork: ForkDescriptor::empty(),
            catalog_fork: ForkDescriptor::empty(),
        }
    }

    #[test]
    fn try_map_volume_fails_on_a_blank_image() {
        let source: Arc<dyn ByteSource> = Arc::new(MemoryByteSource::new(vec![0_u8; 1024]));
        let err = try_map_volume(&source, &empty_params(), &ScanOptions::default())
            .expect_err("blank image");
        // The catalog fork has no extents to read a header from.
        assert!(matches!(err, HpsError::Structure(_)), "{err:?}");
    }

    #[test]
    fn map_volume_downgrades_failures_to_empty() {
        let source: Arc<dyn ByteSource> = Arc::new(MemoryByteSource::new(vec![0_u8; 1024]));
        let inputs = map_volume(&source, &empty_params(), &ScanOptions::default());
        assert!(inputs.is_empty());
    }

    #[test]
    fn map_image_rejects_a_missing_header() {
        let source: Arc<dyn ByteSource> = Arc::new(MemoryByteSource::new(vec![0_u8; 64]));
        let err = map_image(&source, &ScanOptions::default()).expect_err("no header");
        assert!(matches!(err, HpsError::ShortRead { .. }), "{err:?}");

        // Present but not an HFS+ signature.
        let source: Arc<dyn ByteSource> = Arc::new(MemoryByteSource::new(vec![0_u8; 4096]));
        let err = map_image(&source, &ScanOptions::default()).expect_err("bad magic");
        assert!(matches!(err, HpsError::Structure(_)), "{err:?}");
    }

    #[test]
    fn survey_sums_mapped_bytes() {
        let backing: Arc<dyn ByteSource> = Arc::new(MemoryByteSource::new(vec![0_u8; 64]));
        let inputs = vec![
            SegmentedSource::new(
                "a",
                vec![SourceRange {
                    source: Arc::clone(&backing),
                    offset: 0,
                    len: 10,
                }],
            ),
            SegmentedSource::new(
                "b",
                vec![SourceRange {
                    source: Arc::clone(&backing),
                    offset: 16,
                    len: 22,
                }],
            ),
        ];
        let survey = VolumeSurvey::of(&inputs);
        assert_eq!(survey.input_count, 2);
        assert_eq!(survey.mapped_bytes, 32);
    }
}
