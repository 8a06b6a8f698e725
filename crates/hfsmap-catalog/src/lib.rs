#![forbid(unsafe_code)]
//! Catalog tree walk.
//!
//! Drives the generic B-tree engine over the catalog fork, caching folder
//! ancestry as folder records stream past and emitting one virtual input
//! per cataloged file with a nonzero data fork (plus, optionally, one per
//! nonzero resource fork).
//!
//! Record handling is recover-per-record: one unreadable catalog record is
//! logged with its key and skipped; the walk continues with the next
//! record.

use hfsmap_block::{BlockDevice, ByteSource, SegmentedSource};
use hfsmap_btree::BTreeFile;
use hfsmap_error::{HpsError, Result};
use hfsmap_fork::{ExtentsFile, ForkData};
use hfsmap_ondisk::{parse_catalog_record, CatalogKey, CatalogRecord};
use hfsmap_types::{CatalogNodeId, ForkKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Options controlling one volume scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Also emit an input for each nonzero resource fork, name-suffixed
    /// `:resourceFork`.
    pub include_resource_forks: bool,
}

/// Name suffix for resource-fork inputs.
pub const RESOURCE_FORK_SUFFIX: &str = ":resourceFork";

/// Folder ancestry cache, scoped to one catalog walk.
///
/// Maps a folder's own id to its catalog key `(parent id, name)`. Folder
/// records appear in key order, so by the time a file record streams past,
/// its ancestors have usually been cached already; an ancestor that was not
/// (or never will be) visited simply truncates the reconstructed path at
/// that point.
#[derive(Debug, Default)]
pub struct FolderCache {
    entries: HashMap<CatalogNodeId, CatalogKey>,
}

impl FolderCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a folder's key under its own id. The root folder contributes
    /// no path component and is never cached.
    pub fn insert(&mut self, folder_id: CatalogNodeId, key: CatalogKey) {
        if folder_id != CatalogNodeId::ROOT_FOLDER {
            self.entries.insert(folder_id, key);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reconstruct the full `/`-joined path for a catalog key by resolving
    /// cached ancestors upward from its parent.
    ///
    /// Resolution stops cleanly at the root folder or at the first parent
    /// absent from the cache. A parent chain longer than the cache itself
    /// can only be a cycle and fails this record.
    pub fn build_path(&self, key: &CatalogKey) -> Result<String> {
        let mut components = vec![key.name.as_str()];
        let mut parent = key.parent_id;
        let mut depth = 0_usize;
        while parent != CatalogNodeId::ROOT_FOLDER {
            let Some(ancestor) = self.entries.get(&parent) else {
                break;
            };
            depth += 1;
            if depth > self.entries.len() {
                return Err(HpsError::Structure(format!(
                    "cyclic folder parent chain above {key}"
                )));
            }
            components.push(ancestor.name.as_str());
            parent = ancestor.parent_id;
        }
        components.reverse();
        Ok(components.join("/"))
    }
}

/// The catalog tree of one volume, ready to be walked.
pub struct CatalogFile<'a> {
    tree: BTreeFile<CatalogKey, ForkData<'a>>,
    device: BlockDevice,
    source: Arc<dyn ByteSource>,
    extents: &'a ExtentsFile,
}

impl<'a> CatalogFile<'a> {
    #[must_use]
    pub fn new(
        fork: ForkData<'a>,
        device: BlockDevice,
        source: Arc<dyn ByteSource>,
        extents: &'a ExtentsFile,
    ) -> Self {
        Self {
            tree: BTreeFile::new(fork),
            device,
            source,
            extents,
        }
    }

    /// Walk every catalog leaf record, emitting a virtual input to
    /// `consumer` for each file fork worth scanning.
    ///
    /// Folder records populate the path cache; file records resolve their
    /// path against it and map their forks. Thread records are ignored.
    /// Errors inside one record are logged and skipped; errors from the
    /// tree traversal itself abort the walk.
    pub fn walk_file_tree(
        &self,
        options: &ScanOptions,
        mut consumer: impl FnMut(SegmentedSource),
    ) -> Result<()> {
        let mut folders = FolderCache::new();
        self.tree.walk_leaf_nodes(|key, value| {
            if let Err(err) = self.handle_record(&mut folders, options, &key, value, &mut consumer)
            {
                warn!(key = %key, error = %err, "skipping unreadable catalog record");
            }
            Ok(())
        })
    }

    fn handle_record(
        &self,
        folders: &mut FolderCache,
        options: &ScanOptions,
        key: &CatalogKey,
        value: &[u8],
        consumer: &mut impl FnMut(SegmentedSource),
    ) -> Result<()> {
        match parse_catalog_record(value).map_err(|err| HpsError::Parse(err.to_string()))? {
            CatalogRecord::Folder(folder) => {
                folders.insert(folder.folder_id, key.clone());
            }
            CatalogRecord::File(file) => {
                let path = folders.build_path(key)?;
                if file.data_fork.logical_size != 0 {
                    let fork = ForkData::new(
                        file.file_id,
                        ForkKind::Data,
                        &file.data_fork,
                        self.device,
                        Arc::clone(&self.source),
                        Some(self.extents),
                    );
                    consumer(fork.map(path.as_str())?);
                }
                if options.include_resource_forks && file.resource_fork.logical_size != 0 {
                    let fork = ForkData::new(
                        file.file_id,
                        ForkKind::Resource,
                        &file.resource_fork,
                        self.device,
                        Arc::clone(&self.source),
                        Some(self.extents),
                    );
                    consumer(fork.map(format!("{path}{RESOURCE_FORK_SUFFIX}"))?);
                }
            }
            CatalogRecord::Thread => {}
            CatalogRecord::Unknown(record_type) => {
                warn!(key = %key, record_type, "unrecognized catalog record type");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CatalogFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogFile").finish_non_exhaustive()
    }
}
