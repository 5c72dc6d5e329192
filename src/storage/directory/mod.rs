use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::primitives::io::BackingStore;
use crate::types::{PstError, Result};

use super::btree::{LeafRecord, NodeBTree, TreeWalk, PAGE_SIZE};
use super::heap::{HeapAllocator, HeapStats};
use super::metrics::{default_metrics, DirectoryMetrics};
use super::node::NodeEntry;
use super::options::{DirectoryOptions, FormatKind};
use super::side_index::{self, SideIndexRecord};

mod lookup;
mod mutate;
mod tables;

/// Well-known top-level folders that can be rebuilt without reading disk.
const SYSTEM_FOLDERS: &[(u32, &str)] = &[
    (0x43, "Top of Personal Folders"),
    (0x44, "Search Root"),
    (0x45, "Deleted Items"),
    (0x46, "Inbox"),
    (0x47, "Outbox"),
    (0x48, "Sent Items"),
    (0x49, "Drafts"),
];

/// Display name given to the root folder.
pub const ROOT_FOLDER_NAME: &str = "Root Folder";

/// Index from node id to payload location, backed by a B-tree in the
/// container file.
///
/// Entries are cached once resolved. Any mutation first walks the whole
/// tree so the heap knows every live extent before it hands out space.
pub struct NodeDirectory<S: BackingStore> {
    store: S,
    opts: DirectoryOptions,
    metrics: Arc<dyn DirectoryMetrics>,
    tree: NodeBTree,
    heap: HeapAllocator,
    cache: BTreeMap<u32, NodeEntry>,
    side_records: HashMap<u32, SideIndexRecord>,
    /// False for a read-only container whose root page was never written.
    tree_present: bool,
    fully_loaded: bool,
}

impl<S: BackingStore> NodeDirectory<S> {
    /// Opens the directory rooted at `options.root_page_offset`.
    ///
    /// An empty writable container receives a fresh root page and root
    /// folder. An empty read-only container gets a root folder in memory
    /// only. A non-empty container whose root page cannot be decoded fails
    /// with [`PstError::Corrupted`].
    pub fn open(store: S, options: DirectoryOptions) -> Result<Self> {
        options.validate()?;
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        let mut heap = HeapAllocator::new(options.heap);
        heap.reserve(options.root_page_offset, PAGE_SIZE as u32);
        let tree = NodeBTree::new(
            options.root_page_offset,
            options.page_cache_capacity,
            metrics.clone(),
        );
        let mut dir = Self {
            store,
            opts: options,
            metrics,
            tree,
            heap,
            cache: BTreeMap::new(),
            side_records: HashMap::new(),
            tree_present: true,
            fully_loaded: false,
        };

        let blank = dir.tree.root_is_blank(&dir.store).map_err(|err| {
            PstError::Corrupted(format!(
                "root page at {}: {err}",
                dir.opts.root_page_offset
            ))
        })?;
        if blank {
            dir.initialise_blank()?;
        } else if let Err(err) = dir.tree.check_root(&dir.store) {
            error!(
                offset = dir.opts.root_page_offset,
                error = %err,
                "directory.open.failed"
            );
            return Err(err);
        }
        dir.load_side_index();
        info!(
            root = dir.root_id(),
            format = ?dir.opts.format,
            read_only = dir.is_read_only(),
            blank,
            "directory.open"
        );
        Ok(dir)
    }

    fn initialise_blank(&mut self) -> Result<()> {
        let root = self.synthesized_root();
        self.fully_loaded = true;
        if self.is_read_only() {
            self.tree_present = false;
            self.cache.insert(root.node_id(), root);
            return Ok(());
        }
        self.tree.init_root(&self.store)?;
        self.tree
            .insert(&self.store, &mut self.heap, root.to_record())?;
        self.cache.insert(root.node_id(), root);
        self.persist()
    }

    fn load_side_index(&mut self) {
        let Some(path) = self.opts.side_index.clone() else {
            return;
        };
        match side_index::read(&path) {
            Ok(Some(records)) => {
                debug!(path = %path.display(), records = records.len(), "directory.side_index.loaded");
                self.side_records = records.into_iter().map(|r| (r.node_id, r)).collect();
                let cached: Vec<u32> = self.cache.keys().copied().collect();
                for node_id in cached {
                    if let Some(mut entry) = self.cache.remove(&node_id) {
                        self.apply_side_record(&mut entry);
                        self.cache.insert(node_id, entry);
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "directory.side_index.unreadable");
            }
        }
    }

    /// Builds an entry from a tree record, enriched from the side index.
    fn materialize(&mut self, record: &LeafRecord) -> NodeEntry {
        let mut entry = NodeEntry::from_record(record);
        self.apply_side_record(&mut entry);
        entry
    }

    fn apply_side_record(&mut self, entry: &mut NodeEntry) {
        if let Some(record) = self.side_records.remove(&entry.node_id()) {
            if record.matches(entry) {
                entry.enrich_from(&record.to_entry());
            } else {
                warn!(node_id = entry.node_id(), "directory.side_index.stale");
            }
        }
    }

    /// Walks the tree once, registering every page and payload with the heap.
    pub(crate) fn ensure_fully_loaded(&mut self) -> Result<()> {
        if self.fully_loaded {
            return Ok(());
        }
        let TreeWalk {
            pages,
            records,
            damaged,
            height,
        } = self.tree.walk(&self.store)?;
        let file_len = self.store.file_length()?;
        for page in &pages {
            self.heap.reserve(*page, PAGE_SIZE as u32);
        }
        let mut out_of_range = 0usize;
        for record in &records {
            let in_file = record.data_size == 0
                || record
                    .data_offset
                    .checked_add(record.data_size as u64)
                    .is_some_and(|end| end <= file_len);
            if !in_file || !self.heap.reserve(record.data_offset, record.data_size) {
                warn!(
                    node_id = record.node_id,
                    offset = record.data_offset,
                    size = record.data_size,
                    "directory.traversal.bad_extent"
                );
                out_of_range += 1;
            }
            match self.cache.get_mut(&record.node_id) {
                Some(entry) => {
                    entry.data_id = record.data_id;
                    entry.parent_id = record.parent_id;
                    entry.set_location(record.data_offset, record.data_size);
                }
                None => {
                    let entry = self.materialize(record);
                    self.cache.insert(record.node_id, entry);
                }
            }
        }
        if !damaged.is_empty() || out_of_range > 0 {
            // Extents under damaged pages or records are unknown; stay above them.
            self.heap.raise_floor(file_len);
            warn!(
                damaged = damaged.len(),
                out_of_range,
                floor = file_len,
                "directory.traversal.partial"
            );
        }
        debug!(pages = pages.len(), records = records.len(), height, "directory.traversal");
        self.fully_loaded = true;
        Ok(())
    }

    pub(crate) fn ensure_writable(&self, op: &'static str) -> Result<()> {
        if self.is_read_only() {
            warn!(op, "directory.write.denied");
            return Err(PstError::AccessDenied(op));
        }
        Ok(())
    }

    /// Syncs the backing store and rewrites the side index when configured.
    ///
    /// A side index that cannot be written is logged and skipped.
    pub fn persist(&mut self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        self.store
            .sync()
            .map_err(|err| PstError::AllocationFailure(format!("sync: {err}")))?;
        if let Some(path) = &self.opts.side_index {
            if let Err(err) = side_index::write(path, self.cache.values()) {
                warn!(path = %path.display(), error = %err, "directory.side_index.write_failed");
            }
        }
        Ok(())
    }

    /// Node id of the root folder.
    pub fn root_id(&self) -> u32 {
        self.opts.format.root_folder_id()
    }

    /// Container header shape.
    pub fn format(&self) -> FormatKind {
        self.opts.format
    }

    /// True when the backing store refuses writes.
    pub fn is_read_only(&self) -> bool {
        self.store.is_read_only()
    }

    /// End of the highest live extent.
    pub fn heap_high_water(&self) -> u64 {
        self.heap.high_water()
    }

    /// Allocator counters.
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Live heap extents, pages included.
    pub fn live_extents(&self) -> Vec<(u64, u32)> {
        self.heap.live_extents().collect()
    }

    /// Number of entries resolved so far.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Metrics sink shared with the property codec.
    pub fn metrics(&self) -> &Arc<dyn DirectoryMetrics> {
        &self.metrics
    }

    /// Options the directory was opened with.
    pub fn options(&self) -> &DirectoryOptions {
        &self.opts
    }

    /// Borrows the backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consumes the directory, returning the backing store.
    pub fn into_store(self) -> S {
        self.store
    }

    fn synthesized_root(&self) -> NodeEntry {
        let mut root = NodeEntry::new(self.root_id(), 0, 0).with_display_name(ROOT_FOLDER_NAME);
        root.set_location(self.heap.reserved_offset(), 0);
        root
    }

    /// Default entry for the root or a well-known top-level folder.
    pub(crate) fn synthesize(&self, node_id: u32) -> Option<NodeEntry> {
        if node_id == self.root_id() {
            return Some(self.synthesized_root());
        }
        let (_, name) = SYSTEM_FOLDERS.iter().find(|(id, _)| *id == node_id)?;
        let mut entry = NodeEntry::new(node_id, 0, self.root_id()).with_display_name(*name);
        entry.set_location(self.heap.reserved_offset(), 0);
        Some(entry)
    }
}
