#![forbid(unsafe_code)]
//! Test tooling: synthetic HFS+ volumes built in memory.
//!
//! [`TreeBuilder`] assembles a B-tree fork byte-for-byte (header node, leaf
//! chain, optional index nodes); [`VolumeBuilder`] lays forks and file
//! content out at allocation blocks of an image and can stamp a volume
//! header. Sparse JSON fixtures (image size plus hex writes at offsets)
//! cover the adversarial cases that are easier to state as raw bytes.
//!
//! Everything here is for tests; builders assert on misuse instead of
//! propagating errors.

use anyhow::{bail, Context, Result};
use hfsmap::{BlockDevice, Extent, ForkDescriptor, ForkKind, VolumeParams};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ── Byte helpers ────────────────────────────────────────────────────────────

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

// ── Record encoders ─────────────────────────────────────────────────────────

/// Encode a catalog key: parent id, name length in UTF-16 code units, name.
#[must_use]
pub fn catalog_key(parent: u32, name: &str) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut key = vec![0_u8; 6 + units.len() * 2];
    put_u32(&mut key, 0, parent);
    put_u16(&mut key, 4, units.len() as u16);
    for (i, unit) in units.iter().enumerate() {
        put_u16(&mut key, 6 + i * 2, *unit);
    }
    key
}

/// Encode an extents-overflow key: fork type, pad, file id, start block.
#[must_use]
pub fn extents_key(file_id: u32, fork: ForkKind, start_block: u32) -> Vec<u8> {
    let mut key = vec![0_u8; 10];
    key[0] = fork.as_u8();
    put_u32(&mut key, 2, file_id);
    put_u32(&mut key, 6, start_block);
    key
}

/// Encode a folder record value.
#[must_use]
pub fn folder_value(folder_id: u32) -> Vec<u8> {
    let mut value = vec![0_u8; 88];
    put_u16(&mut value, 0, 1);
    put_u32(&mut value, 8, folder_id);
    value
}

/// Encode a file record value with both fork descriptors.
#[must_use]
pub fn file_value(file_id: u32, data: &ForkDescriptor, resource: &ForkDescriptor) -> Vec<u8> {
    let mut value = vec![0_u8; 248];
    put_u16(&mut value, 0, 2);
    put_u32(&mut value, 8, file_id);
    value[88..168].copy_from_slice(&encode_fork_descriptor(data));
    value[168..248].copy_from_slice(&encode_fork_descriptor(resource));
    value
}

/// Encode a thread record value (only the record type matters to the walk).
#[must_use]
pub fn thread_value(record_type: u16) -> Vec<u8> {
    let mut value = vec![0_u8; 16];
    put_u16(&mut value, 0, record_type);
    value
}

/// Encode an extents-overflow record value: eight extent pairs.
#[must_use]
pub fn extent_record_value(extents: &[Extent]) -> Vec<u8> {
    assert!(extents.len() <= 8, "at most 8 extents per record");
    let mut value = vec![0_u8; 64];
    for (i, extent) in extents.iter().enumerate() {
        put_u32(&mut value, i * 8, extent.start_block);
        put_u32(&mut value, i * 8 + 4, extent.block_count);
    }
    value
}

/// Encode an 80-byte fork descriptor.
#[must_use]
pub fn encode_fork_descriptor(fork: &ForkDescriptor) -> [u8; 80] {
    let mut bytes = [0_u8; 80];
    put_u64(&mut bytes, 0, fork.logical_size);
    put_u32(&mut bytes, 8, fork.clump_size);
    put_u32(&mut bytes, 12, fork.total_blocks);
    for (i, extent) in fork.extents.iter().enumerate() {
        put_u32(&mut bytes, 16 + i * 8, extent.start_block);
        put_u32(&mut bytes, 16 + i * 8 + 4, extent.block_count);
    }
    bytes
}

/// Build a fork descriptor from a logical size and up to eight extents.
#[must_use]
pub fn fork_descriptor(logical_size: u64, extents: &[Extent]) -> ForkDescriptor {
    assert!(extents.len() <= 8, "at most 8 inline extents");
    let mut fork = ForkDescriptor::empty();
    fork.logical_size = logical_size;
    for (i, extent) in extents.iter().enumerate() {
        fork.extents[i] = *extent;
        fork.total_blocks += extent.block_count;
    }
    fork
}

// ── B-tree builder ──────────────────────────────────────────────────────────

/// Assembles one B-tree fork: node 0 is the header node, further nodes are
/// added as leaves or index nodes and chained explicitly.
#[derive(Debug)]
pub struct TreeBuilder {
    node_size: usize,
    nodes: Vec<Vec<u8>>,
}

impl TreeBuilder {
    #[must_use]
    pub fn new(node_size: usize) -> Self {
        Self {
            node_size,
            // Node 0 reserved for the header node, filled in `finish`.
            nodes: vec![vec![0_u8; node_size]],
        }
    }

    fn add_node(&mut self, kind: i8, records: &[(Vec<u8>, Vec<u8>)]) -> u32 {
        let mut node = vec![0_u8; self.node_size];
        node[8] = kind as u8;
        put_u16(&mut node, 10, records.len() as u16);

        let mut offset = 14_usize;
        for (i, (key, value)) in records.iter().enumerate() {
            put_u16(&mut node, self.node_size - 2 * (i + 1), offset as u16);
            put_u16(&mut node, offset, key.len() as u16);
            node[offset + 2..offset + 2 + key.len()].copy_from_slice(key);
            node[offset + 2 + key.len()..offset + 2 + key.len() + value.len()]
                .copy_from_slice(value);
            offset += 2 + key.len() + value.len();
        }
        assert!(
            offset + 2 * (records.len() + 1) <= self.node_size,
            "records overflow the node"
        );
        put_u16(
            &mut node,
            self.node_size - 2 * (records.len() + 1),
            offset as u16,
        );

        self.nodes.push(node);
        (self.nodes.len() - 1) as u32
    }

    /// Add a leaf node; forward links are wired by [`chain`](Self::chain).
    pub fn add_leaf(&mut self, records: &[(Vec<u8>, Vec<u8>)]) -> u32 {
        self.add_node(-1, records)
    }

    /// Add an index node whose records point at child nodes.
    pub fn add_index(&mut self, entries: &[(Vec<u8>, u32)]) -> u32 {
        let records: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|(key, child)| (key.clone(), child.to_be_bytes().to_vec()))
            .collect();
        self.add_node(0, &records)
    }

    /// Set forward links along `order`; the last node ends the chain.
    pub fn chain(&mut self, order: &[u32]) {
        for window in order.windows(2) {
            put_u32(&mut self.nodes[window[0] as usize], 0, window[1]);
        }
        if let Some(last) = order.last() {
            put_u32(&mut self.nodes[*last as usize], 0, 0);
        }
    }

    /// Stamp the header node and return the fork bytes.
    #[must_use]
    pub fn finish(mut self, root: u32, first_leaf: u32) -> Vec<u8> {
        let header = &mut self.nodes[0];
        header[8] = 1; // header node kind
        put_u32(header, 16, root);
        put_u32(header, 24, first_leaf);
        put_u16(header, 32, self.node_size as u16);
        self.nodes.into_iter().flatten().collect()
    }
}

// ── Volume builder ──────────────────────────────────────────────────────────

/// Lays out fork content at allocation blocks of an in-memory image.
#[derive(Debug)]
pub struct VolumeBuilder {
    device: BlockDevice,
    block_size: u32,
    total_blocks: u32,
    image: Vec<u8>,
}

impl VolumeBuilder {
    #[must_use]
    pub fn new(block_size: u32, total_blocks: u32) -> Self {
        let device = BlockDevice::new(block_size);
        let len = usize::try_from(device.offset(total_blocks)).expect("image fits memory");
        Self {
            device,
            block_size,
            total_blocks,
            image: vec![0_u8; len],
        }
    }

    #[must_use]
    pub fn device(&self) -> BlockDevice {
        self.device
    }

    /// Write `bytes` into the given extents in order, returning the fork
    /// descriptor that addresses them.
    pub fn place_fork(&mut self, bytes: &[u8], extents: &[Extent]) -> ForkDescriptor {
        let mut remaining = bytes;
        for extent in extents {
            let capacity = usize::try_from(self.device.size(extent.block_count))
                .expect("extent fits memory");
            let chunk_len = remaining.len().min(capacity);
            let base = usize::try_from(self.device.offset(extent.start_block)).expect("offset");
            self.image[base..base + chunk_len].copy_from_slice(&remaining[..chunk_len]);
            remaining = &remaining[chunk_len..];
        }
        assert!(remaining.is_empty(), "extents too small for fork content");
        fork_descriptor(bytes.len() as u64, extents)
    }

    /// Write raw bytes at a device offset (for deliberate corruption).
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) {
        let base = usize::try_from(offset).expect("offset fits memory");
        self.image[base..base + bytes.len()].copy_from_slice(bytes);
    }

    /// Stamp a volume header at image offset 0x400 describing the given
    /// special-file forks.
    pub fn write_volume_header(
        &mut self,
        extents_fork: &ForkDescriptor,
        catalog_fork: &ForkDescriptor,
    ) {
        let mut region = vec![0_u8; 512];
        put_u16(&mut region, 0, 0x482B); // 'H+'
        put_u16(&mut region, 2, 4);
        put_u32(&mut region, 40, self.block_size);
        put_u32(&mut region, 44, self.total_blocks);
        region[192..272].copy_from_slice(&encode_fork_descriptor(extents_fork));
        region[272..352].copy_from_slice(&encode_fork_descriptor(catalog_fork));
        self.write_at(0x400, &region);
    }

    /// Volume parameters as the surrounding engine would hand them in.
    #[must_use]
    pub fn params(
        &self,
        extents_fork: ForkDescriptor,
        catalog_fork: ForkDescriptor,
    ) -> VolumeParams {
        VolumeParams {
            block_size: self.block_size,
            total_blocks: self.total_blocks,
            extents_fork,
            catalog_fork,
        }
    }

    #[must_use]
    pub fn into_image(self) -> Vec<u8> {
        self.image
    }
}

/// An extents tree with no records at all: header node only.
#[must_use]
pub fn empty_tree(node_size: usize) -> Vec<u8> {
    TreeBuilder::new(node_size).finish(0, 0)
}

// ── Sparse fixtures ─────────────────────────────────────────────────────────

/// A sparse image description: total size plus hex payloads at offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseFixture {
    pub size: usize,
    pub writes: Vec<FixtureWrite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureWrite {
    pub offset: usize,
    pub hex: String,
}

/// Materialize a sparse fixture into image bytes.
pub fn materialize_fixture(fixture: &SparseFixture) -> Result<Vec<u8>> {
    let mut bytes = vec![0_u8; fixture.size];
    for write in &fixture.writes {
        let payload =
            hex::decode(&write.hex).with_context(|| format!("invalid hex at offset {}", write.offset))?;
        let end = write
            .offset
            .checked_add(payload.len())
            .context("fixture offset overflow")?;
        if end > bytes.len() {
            bail!(
                "fixture write out of bounds: offset={} payload={} size={}",
                write.offset,
                payload.len(),
                bytes.len()
            );
        }
        bytes[write.offset..end].copy_from_slice(&payload);
    }
    Ok(bytes)
}

/// Load and materialize a sparse fixture from a JSON file.
pub fn load_sparse_fixture(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let fixture: SparseFixture = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;
    materialize_fixture(&fixture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfsmap::{CatalogKey, CatalogNodeId, ExtentsKey};
    use std::io::Write;

    #[test]
    fn tree_builder_output_parses_back() {
        let mut builder = TreeBuilder::new(512);
        let leaf1 = builder.add_leaf(&[(catalog_key(2, "docs"), folder_value(16))]);
        let leaf2 = builder.add_leaf(&[(
            catalog_key(16, "readme.txt"),
            file_value(
                17,
                &fork_descriptor(10, &[Extent::new(100, 1)]),
                &ForkDescriptor::empty(),
            ),
        )]);
        builder.chain(&[leaf1, leaf2]);
        let bytes = builder.finish(0, leaf1);

        assert_eq!((leaf1, leaf2), (1, 2));
        assert_eq!(bytes.len(), 512 * 3);

        let header = hfsmap_ondisk_header(&bytes);
        assert_eq!(header, (512, 0, 1));

        // Leaf 1 carries its forward link and one record.
        let record = hfsmap_ondisk::read_record(&bytes[512..1024], 1).expect("record");
        let key = CatalogKey::parse(record.key).expect("key");
        assert_eq!(key, CatalogKey::new(CatalogNodeId(2), "docs"));
    }

    fn hfsmap_ondisk_header(bytes: &[u8]) -> (u16, u32, u32) {
        let header = hfsmap_ondisk::TreeHeader::parse(&bytes[..106]).expect("tree header");
        (header.node_size, header.root_node, header.first_leaf_node)
    }

    #[test]
    fn extents_key_encodes_comparison_fields() {
        let bytes = extents_key(7, ForkKind::Resource, 64);
        let parsed = ExtentsKey::parse(&bytes).expect("key");
        assert_eq!(
            parsed,
            ExtentsKey::new(CatalogNodeId(7), ForkKind::Resource, 64)
        );
    }

    #[test]
    fn volume_builder_places_fork_content() {
        let mut volume = VolumeBuilder::new(4096, 64);
        let device = volume.device();
        let fork = volume.place_fork(&[0xAB_u8; 6000], &[Extent::new(10, 1), Extent::new(20, 1)]);
        assert_eq!(fork.logical_size, 6000);

        let image = volume.into_image();
        let first = usize::try_from(device.offset(10)).expect("offset");
        let second = usize::try_from(device.offset(20)).expect("offset");
        assert_eq!(image[first], 0xAB);
        assert_eq!(image[first + 4095], 0xAB);
        assert_eq!(image[second], 0xAB);
        assert_eq!(image[second + 6000 - 4096 - 1], 0xAB);
        assert_eq!(image[second + 6000 - 4096], 0);
    }

    #[test]
    fn volume_header_stamp_parses_back() {
        let mut volume = VolumeBuilder::new(4096, 64);
        let extents_fork = fork_descriptor(512, &[Extent::new(4, 1)]);
        let catalog_fork = fork_descriptor(1024, &[Extent::new(8, 1)]);
        volume.write_volume_header(&extents_fork, &catalog_fork);

        let image = volume.into_image();
        let header = hfsmap::VolumeHeader::parse(&image[0x400..0x600]).expect("header");
        assert_eq!(header.block_size, 4096);
        assert_eq!(header.total_blocks, 64);
        assert_eq!(header.extents_file, extents_fork);
        assert_eq!(header.catalog_file, catalog_fork);
    }

    #[test]
    fn sparse_fixture_materializes() {
        let fixture: SparseFixture = serde_json::from_str(
            r#"{"size": 32, "writes": [{"offset": 4, "hex": "deadbeef"}]}"#,
        )
        .expect("fixture json");
        let bytes = materialize_fixture(&fixture).expect("materialize");
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn sparse_fixture_rejects_out_of_bounds_writes() {
        let fixture = SparseFixture {
            size: 4,
            writes: vec![FixtureWrite {
                offset: 2,
                hex: "aabbcc".into(),
            }],
        };
        assert!(materialize_fixture(&fixture).is_err());
    }

    #[test]
    fn sparse_fixture_loads_from_disk() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.write_all(br#"{"size": 8, "writes": [{"offset": 0, "hex": "482b"}]}"#)
            .expect("write");
        tmp.flush().expect("flush");

        let bytes = load_sparse_fixture(tmp.path()).expect("load");
        assert_eq!(&bytes[..2], &[0x48, 0x2B]);
    }
}
