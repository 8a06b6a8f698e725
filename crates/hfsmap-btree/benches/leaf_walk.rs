//! Leaf-chain traversal throughput over a synthetic extents tree.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hfsmap_btree::{BTreeFile, ForkRead};
use hfsmap_error::{HpsError, Result};
use hfsmap_ondisk::ExtentsKey;

const NODE_SIZE: usize = 4096;
const LEAF_COUNT: u32 = 64;
const RECORDS_PER_LEAF: u32 = 40;

struct VecStore(Vec<u8>);

impl ForkRead for VecStore {
    fn len_bytes(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_fork_exact(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = usize::try_from(offset).expect("offset fits usize");
        let end = offset + buf.len();
        if end > self.0.len() {
            return Err(HpsError::ShortRead {
                offset: offset as u64,
                needed: buf.len(),
                actual: self.0.len().saturating_sub(offset),
            });
        }
        buf.copy_from_slice(&self.0[offset..end]);
        Ok(())
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn build_tree() -> BTreeFile<ExtentsKey, VecStore> {
    let mut bytes = vec![0_u8; NODE_SIZE * (LEAF_COUNT as usize + 1)];

    // Header node: node size, no root, first leaf is node 1.
    bytes[8] = 1;
    put_u32(&mut bytes, 24, 1);
    put_u16(&mut bytes, 32, NODE_SIZE as u16);

    for leaf in 0..LEAF_COUNT {
        let base = NODE_SIZE * (leaf as usize + 1);
        let node = &mut bytes[base..base + NODE_SIZE];
        let forward = if leaf + 1 < LEAF_COUNT { leaf + 2 } else { 0 };
        put_u32(node, 0, forward);
        node[8] = 0xFF; // leaf
        put_u16(node, 10, RECORDS_PER_LEAF as u16);

        let mut offset = 14_usize;
        for record in 0..RECORDS_PER_LEAF {
            put_u16(node, NODE_SIZE - 2 * (record as usize + 1), offset as u16);
            put_u16(node, offset, 10); // key length
            put_u32(node, offset + 4, leaf * RECORDS_PER_LEAF + record); // file id
            put_u32(node, offset + 8, record * 8); // start block
            // 64-byte extent record value, left zeroed.
            offset += 2 + 10 + 64;
        }
        put_u16(
            node,
            NODE_SIZE - 2 * (RECORDS_PER_LEAF as usize + 1),
            offset as u16,
        );
    }

    BTreeFile::new(VecStore(bytes))
}

fn bench_leaf_walk(c: &mut Criterion) {
    let tree = build_tree();
    c.bench_function("walk_leaf_nodes", |b| {
        b.iter(|| {
            let mut records = 0_u64;
            tree.walk_leaf_nodes(|key, value| {
                black_box(&key);
                records += value.len() as u64;
                Ok(())
            })
            .expect("walk");
            black_box(records)
        });
    });
}

criterion_group!(benches, bench_leaf_walk);
criterion_main!(benches);
