#![forbid(unsafe_code)]
//! Generic read-only B-tree engine for HFS+ trees resident in a fork.
//!
//! [`BTreeFile`] is parameterized over a key type (decode + total order) and
//! a fork store (positioned exact reads). The catalog and extents-overflow
//! trees are thin configurations of this one engine: the catalog walks the
//! leaf chain record by record, the extents tree answers point lookups by
//! descending from the root.
//!
//! The header is read lazily on first use and cached; a `BTreeFile` is
//! single-use per volume decode and deliberately not `Sync`.

use hfsmap_error::{HpsError, Result};
use hfsmap_ondisk::{
    read_record, NodeDescriptor, NodeKind, TreeHeader, TREE_HEADER_LEN,
};
use hfsmap_types::{read_be_u32, ParseError};
use std::cell::OnceCell;
use std::fmt;
use std::marker::PhantomData;
use tracing::trace;

/// Upper bound on index-node descent depth.
///
/// A legal HFS+ tree is far shallower; hitting this means the child
/// pointers form a cycle.
const MAX_DESCENT_DEPTH: u32 = 16;

/// A decodable, totally ordered B-tree key.
pub trait BtreeKey: Ord + Clone + fmt::Debug + fmt::Display + Sized {
    /// Tree label used in diagnostics.
    const TREE_NAME: &'static str;

    /// Decode a key from its raw bytes (without the length prefix).
    fn decode(key: &[u8]) -> std::result::Result<Self, ParseError>;
}

impl BtreeKey for hfsmap_ondisk::CatalogKey {
    const TREE_NAME: &'static str = "catalog";

    fn decode(key: &[u8]) -> std::result::Result<Self, ParseError> {
        Self::parse(key)
    }
}

impl BtreeKey for hfsmap_ondisk::ExtentsKey {
    const TREE_NAME: &'static str = "extents overflow";

    fn decode(key: &[u8]) -> std::result::Result<Self, ParseError> {
        Self::parse(key)
    }
}

/// Positioned exact reads against one fork's byte stream.
///
/// Implemented by the fork layer; node reads are single contiguous reads at
/// the device position of a fork-relative offset.
pub trait ForkRead {
    /// The fork's logical size in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes at fork-relative `offset`.
    fn read_fork_exact(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Map a parse failure to the runtime taxonomy: invalid field values are
/// structural violations of the tree, everything else is a plain parse
/// error.
fn parse_to_error(err: ParseError) -> HpsError {
    match err {
        ParseError::InvalidField { .. } => HpsError::Structure(err.to_string()),
        other => HpsError::Parse(other.to_string()),
    }
}

/// Generic read-only B-tree resident in a fork.
pub struct BTreeFile<K, F> {
    store: F,
    header: OnceCell<TreeHeader>,
    _key: PhantomData<K>,
}

impl<K: BtreeKey, F: ForkRead> BTreeFile<K, F> {
    #[must_use]
    pub fn new(store: F) -> Self {
        Self {
            store,
            header: OnceCell::new(),
            _key: PhantomData,
        }
    }

    #[must_use]
    pub fn store(&self) -> &F {
        &self.store
    }

    /// The tree header, read and validated once on first use.
    pub fn header(&self) -> Result<&TreeHeader> {
        if let Some(header) = self.header.get() {
            return Ok(header);
        }

        let mut region = [0_u8; TREE_HEADER_LEN];
        self.store.read_fork_exact(0, &mut region)?;
        let header = TreeHeader::parse(&region).map_err(parse_to_error)?;
        trace!(
            tree = K::TREE_NAME,
            node_size = header.node_size,
            root = header.root_node,
            first_leaf = header.first_leaf_node,
            "read b-tree header"
        );
        Ok(self.header.get_or_init(|| header))
    }

    fn read_node(&self, node_index: u32, buf: &mut [u8]) -> Result<()> {
        let offset = u64::from(node_index) * buf.len() as u64;
        self.store.read_fork_exact(offset, buf)
    }

    /// Visit every record of every leaf node, in leaf-chain order.
    ///
    /// An empty tree (`first_leaf_node == 0`) visits nothing. Errors from
    /// the consumer abort the walk; record handlers that want per-record
    /// recovery catch internally and return `Ok`.
    pub fn walk_leaf_nodes(
        &self,
        mut consumer: impl FnMut(K, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let header = *self.header()?;
        if header.first_leaf_node == 0 {
            return Ok(());
        }

        // A fork of N bytes can hold at most N / node_size nodes; a longer
        // chain means the forward links cycle.
        let max_nodes = (self.store.len_bytes() / u64::from(header.node_size)).max(1);

        let mut buf = vec![0_u8; usize::from(header.node_size)];
        let mut node_index = header.first_leaf_node;
        let mut visited = 0_u64;
        loop {
            visited += 1;
            if visited > max_nodes {
                return Err(HpsError::Structure(format!(
                    "{} leaf chain exceeds the {max_nodes} nodes its fork can hold",
                    K::TREE_NAME
                )));
            }

            self.read_node(node_index, &mut buf)?;
            let descriptor = NodeDescriptor::parse(&buf).map_err(parse_to_error)?;
            trace!(
                tree = K::TREE_NAME,
                node = node_index,
                records = descriptor.num_records,
                "visiting leaf node"
            );

            for record_number in 1..=descriptor.num_records {
                let record = read_record(&buf, record_number).map_err(parse_to_error)?;
                let key = K::decode(record.key).map_err(parse_to_error)?;
                consumer(key, record.value)?;
            }

            if descriptor.forward_link == 0 {
                return Ok(());
            }
            node_index = descriptor.forward_link;
        }
    }

    /// Point lookup: descend from the root and return the value buffer of
    /// the record matching `key` exactly.
    ///
    /// On an index node the descent follows the last record whose key is
    /// `<=` the search key; the leaf is then scanned for an exact match.
    /// Never degrades to a leaf-chain scan.
    pub fn find_leaf(&self, key: &K) -> Result<Vec<u8>> {
        let header = *self.header()?;
        if header.root_node == 0 {
            return Err(HpsError::NotFound(format!(
                "{} record {key} (empty tree)",
                K::TREE_NAME
            )));
        }

        let mut buf = vec![0_u8; usize::from(header.node_size)];
        let mut node_index = header.root_node;
        for _ in 0..MAX_DESCENT_DEPTH {
            self.read_node(node_index, &mut buf)?;
            let descriptor = NodeDescriptor::parse(&buf).map_err(parse_to_error)?;

            match NodeKind::from_i8(descriptor.kind).map_err(parse_to_error)? {
                NodeKind::Leaf => {
                    for record_number in 1..=descriptor.num_records {
                        let record = read_record(&buf, record_number).map_err(parse_to_error)?;
                        let candidate = K::decode(record.key).map_err(parse_to_error)?;
                        if candidate == *key {
                            return Ok(record.value.to_vec());
                        }
                    }
                    return Err(HpsError::NotFound(format!(
                        "{} record {key}",
                        K::TREE_NAME
                    )));
                }
                NodeKind::Index => {
                    let mut child = None;
                    for record_number in 1..=descriptor.num_records {
                        let record = read_record(&buf, record_number).map_err(parse_to_error)?;
                        let candidate = K::decode(record.key).map_err(parse_to_error)?;
                        if candidate <= *key {
                            child = Some(read_be_u32(record.value, 0).map_err(parse_to_error)?);
                        } else {
                            break;
                        }
                    }
                    let Some(next) = child else {
                        // Every index key is greater than the search key.
                        return Err(HpsError::NotFound(format!(
                            "{} record {key}",
                            K::TREE_NAME
                        )));
                    };
                    node_index = next;
                }
                NodeKind::Header | NodeKind::Map => {
                    return Err(HpsError::Structure(format!(
                        "{} lookup reached a non-search node (kind {})",
                        K::TREE_NAME,
                        descriptor.kind
                    )));
                }
            }
        }

        Err(HpsError::Structure(format!(
            "{} descent exceeds depth {MAX_DESCENT_DEPTH}",
            K::TREE_NAME
        )))
    }
}
