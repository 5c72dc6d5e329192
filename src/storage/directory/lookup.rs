use tracing::{error, warn};

use crate::primitives::io::BackingStore;
use crate::types::{PstError, Result};

use super::NodeDirectory;
use crate::storage::node::NodeEntry;

impl<S: BackingStore> NodeDirectory<S> {
    /// Resolves `node_id`, consulting the cache before the tree.
    ///
    /// When the tree cannot be read, the root and well-known folders are
    /// synthesised; any other id fails with [`PstError::Corrupted`].
    pub fn find(&mut self, node_id: u32) -> Result<Option<NodeEntry>> {
        if let Some(entry) = self.cache.get(&node_id) {
            return Ok(Some(entry.clone()));
        }
        if !self.tree_present {
            return Ok(None);
        }
        match self.tree.search(&self.store, node_id) {
            Ok(Some(record)) => {
                let entry = self.materialize(&record);
                self.cache.insert(node_id, entry.clone());
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(err) => match self.synthesize(node_id) {
                Some(entry) => {
                    warn!(node_id, error = %err, "directory.find.synthesized");
                    self.metrics.degraded_read("synthesized");
                    Ok(Some(entry))
                }
                None => {
                    error!(node_id, error = %err, "directory.find.failed");
                    Err(PstError::Corrupted(format!("node {node_id:#x}: {err}")))
                }
            },
        }
    }

    /// Every known entry in id order, the root always included.
    ///
    /// Walks the tree on first use unless the cache already holds more
    /// entries than the fully-loaded threshold. A failed walk is logged and
    /// the cache contents are returned as they are.
    pub fn get_all(&mut self) -> Result<Vec<NodeEntry>> {
        if !self.fully_loaded && self.cache.len() <= self.opts.fully_loaded_threshold {
            if let Err(err) = self.ensure_fully_loaded() {
                warn!(error = %err, "directory.get_all.degraded");
            }
        }
        let mut all: Vec<NodeEntry> = self.cache.values().cloned().collect();
        if !self.cache.contains_key(&self.root_id()) {
            let root = self.synthesized_root();
            let at = all.partition_point(|e| e.node_id() < root.node_id());
            all.insert(at, root);
        }
        Ok(all)
    }

    /// Entries whose parent is `parent_id`, in id order.
    pub fn children(&mut self, parent_id: u32) -> Result<Vec<NodeEntry>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|e| e.parent_id == parent_id && e.node_id() != parent_id)
            .collect())
    }

    /// Payload bytes of a live node.
    pub fn read_payload(&mut self, node_id: u32) -> Result<Vec<u8>> {
        let entry = self.find(node_id)?.ok_or(PstError::NotFound(node_id))?;
        self.read_entry_payload(&entry)
    }

    pub(crate) fn read_entry_payload(&self, entry: &NodeEntry) -> Result<Vec<u8>> {
        if entry.data_size() == 0 {
            return Ok(Vec::new());
        }
        self.store
            .read_range(entry.data_offset(), entry.data_size())
            .map_err(|err| {
                PstError::Corrupted(format!("payload of node {:#x}: {err}", entry.node_id()))
            })
    }
}
