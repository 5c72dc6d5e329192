use std::collections::{BTreeMap, HashSet};

use smallvec::{smallvec, SmallVec};
use tracing::{debug, error};

use crate::primitives::io::BackingStore;
use crate::storage::node::NodeEntry;
use crate::types::{classify, companion_id, PstError, Result, TableKind};

use super::NodeDirectory;

impl<S: BackingStore> NodeDirectory<S> {
    /// Stores `payload` and records `entry`, returning the stored entry.
    ///
    /// Adding an id that already exists replaces its payload and metadata.
    /// Folders, messages and attachments are appended to the matching
    /// table of their parent, which is created on first use.
    pub fn add(&mut self, entry: NodeEntry, payload: &[u8]) -> Result<NodeEntry> {
        self.ensure_writable("add")?;
        self.ensure_fully_loaded()?;
        let node_id = entry.node_id();
        if entry.parent_id != 0 && !self.cache.contains_key(&entry.parent_id) {
            return Err(PstError::NotFound(entry.parent_id));
        }

        if self.cache.contains_key(&node_id) {
            let previous_parent = self.cache.get(&node_id).map(|e| e.parent_id);
            let mut stored = self.store_payload(node_id, payload)?;
            stored.absorb_metadata(&entry);
            self.commit_metadata(stored.clone(), previous_parent)?;
            self.persist()?;
            debug!(node_id, size = payload.len(), "directory.add.replaced");
            return Ok(stored);
        }

        let size = payload_len(payload)?;
        let offset = self.heap.allocate(&self.store, size).map_err(|err| {
            error!(node_id, size, error = %err, "directory.add.alloc_failed");
            err
        })?;
        if size > 0 {
            self.metrics.allocation(size);
        }
        let mut stored = entry;
        stored.set_location(offset, size);
        if let Err(err) = self.commit_new(&stored, payload) {
            self.heap.free(offset, size);
            error!(node_id, error = %err, "directory.add.failed");
            return Err(err);
        }
        self.cache.insert(node_id, stored.clone());
        self.link_into_parent(&stored)?;
        self.metrics.node_added();
        self.persist()?;
        debug!(node_id, offset, size, "directory.add");
        Ok(stored)
    }

    fn commit_new(&mut self, entry: &NodeEntry, payload: &[u8]) -> Result<()> {
        if !payload.is_empty() {
            write_payload(&self.store, entry, payload)?;
        }
        self.tree
            .insert(&self.store, &mut self.heap, entry.to_record())?;
        Ok(())
    }

    /// Overwrites the metadata of an existing entry, keeping its payload
    /// location; `false` when the id is unknown.
    pub fn update(&mut self, entry: &NodeEntry) -> Result<bool> {
        self.ensure_writable("update")?;
        self.ensure_fully_loaded()?;
        let Some(current) = self.cache.get(&entry.node_id()).cloned() else {
            return Ok(false);
        };
        if entry.parent_id != 0
            && entry.parent_id != current.parent_id
            && !self.cache.contains_key(&entry.parent_id)
        {
            return Err(PstError::NotFound(entry.parent_id));
        }
        let mut next = current.clone();
        next.absorb_metadata(entry);
        self.commit_metadata(next, Some(current.parent_id))?;
        self.persist()?;
        Ok(true)
    }

    /// Rewrites the tree record when structural fields moved, and relinks
    /// parent tables when the parent changed.
    fn commit_metadata(&mut self, next: NodeEntry, previous_parent: Option<u32>) -> Result<()> {
        let node_id = next.node_id();
        let structural_change = self
            .cache
            .get(&node_id)
            .map_or(true, |cur| cur.to_record() != next.to_record());
        if structural_change {
            self.tree
                .insert(&self.store, &mut self.heap, next.to_record())?;
        }
        let parent_changed = previous_parent.is_some_and(|p| p != next.parent_id);
        if parent_changed {
            if let Some(old) = self.cache.get(&node_id).cloned() {
                self.unlink_from_parent(&old)?;
            }
        }
        self.cache.insert(node_id, next.clone());
        if parent_changed {
            self.link_into_parent(&next)?;
        }
        Ok(())
    }

    /// Replaces the payload of an existing node.
    ///
    /// Writes in place when the new payload fits the current range,
    /// otherwise moves it to fresh space and forgets the old range.
    pub fn update_payload(&mut self, entry: &NodeEntry, payload: &[u8]) -> Result<NodeEntry> {
        self.ensure_writable("update_payload")?;
        self.ensure_fully_loaded()?;
        let stored = self.store_payload(entry.node_id(), payload)?;
        self.persist()?;
        Ok(stored)
    }

    /// Payload replacement without the public preconditions or persistence.
    pub(super) fn store_payload(&mut self, node_id: u32, payload: &[u8]) -> Result<NodeEntry> {
        let mut current = self
            .cache
            .get(&node_id)
            .cloned()
            .ok_or(PstError::NotFound(node_id))?;
        let size = payload_len(payload)?;
        let (old_offset, old_size) = (current.data_offset(), current.data_size());

        // Ranges unknown to the heap come from damaged records and are never written.
        let in_place =
            size == 0 || (size <= old_size && self.heap.is_live(old_offset, old_size));
        if in_place {
            if size > 0 {
                write_payload(&self.store, &current, payload)?;
            }
            if size != old_size {
                self.heap.free(old_offset, old_size);
                self.heap.reserve(old_offset, size);
                current.set_location(old_offset, size);
                self.tree
                    .insert(&self.store, &mut self.heap, current.to_record())?;
            }
            debug!(node_id, size, "directory.payload.in_place");
        } else {
            let offset = self.heap.allocate(&self.store, size).map_err(|err| {
                error!(node_id, size, error = %err, "directory.payload.alloc_failed");
                err
            })?;
            self.metrics.allocation(size);
            let mut moved = current.clone();
            moved.set_location(offset, size);
            let committed = write_payload(&self.store, &moved, payload).and_then(|()| {
                self.tree
                    .insert(&self.store, &mut self.heap, moved.to_record())
                    .map(|_| ())
            });
            if let Err(err) = committed {
                self.heap.free(offset, size);
                error!(node_id, error = %err, "directory.payload.failed");
                return Err(err);
            }
            self.heap.free(old_offset, old_size);
            current = moved;
            debug!(node_id, from = old_offset, to = offset, size, "directory.payload.moved");
        }
        self.cache.insert(node_id, current.clone());
        Ok(current)
    }

    /// Removes `node_id` and everything it owns; `false` when unknown.
    ///
    /// Folders take their tables, subfolders and messages with them;
    /// messages take their attachment table and attachments.
    pub fn remove(&mut self, node_id: u32) -> Result<bool> {
        self.ensure_writable("remove")?;
        self.ensure_fully_loaded()?;
        let Some(target) = self.cache.get(&node_id).cloned() else {
            return Ok(false);
        };

        let mut by_parent: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for entry in self.cache.values() {
            if entry.node_id() != entry.parent_id {
                by_parent
                    .entry(entry.parent_id)
                    .or_default()
                    .push(entry.node_id());
            }
        }
        let mut doomed = Vec::new();
        let mut seen = HashSet::new();
        let mut work: SmallVec<[u32; 16]> = smallvec![node_id];
        while let Some(id) = work.pop() {
            if !seen.insert(id) || !self.cache.contains_key(&id) {
                continue;
            }
            doomed.push(id);
            for kind in TableKind::owned_by(classify(id)) {
                work.push(companion_id(id, *kind));
            }
            if let Some(children) = by_parent.get(&id) {
                work.extend(children.iter().copied());
            }
        }

        if !seen.contains(&target.parent_id) {
            self.unlink_from_parent(&target)?;
        }
        for id in &doomed {
            self.tree
                .delete(&self.store, &mut self.heap, *id)?;
            if let Some(entry) = self.cache.remove(id) {
                self.heap.free(entry.data_offset(), entry.data_size());
            }
            self.metrics.node_removed();
        }
        self.persist()?;
        debug!(node_id, removed = doomed.len(), "directory.remove");
        Ok(true)
    }
}

fn payload_len(payload: &[u8]) -> Result<u32> {
    u32::try_from(payload.len()).map_err(|_| PstError::Invalid("payload larger than u32::MAX bytes"))
}

fn write_payload<S: BackingStore + ?Sized>(
    store: &S,
    entry: &NodeEntry,
    payload: &[u8],
) -> Result<()> {
    store
        .write_range(entry.data_offset(), payload)
        .map_err(|err| match err {
            PstError::AccessDenied(op) => PstError::AccessDenied(op),
            other => PstError::AllocationFailure(format!(
                "write payload of node {:#x}: {other}",
                entry.node_id()
            )),
        })
}
