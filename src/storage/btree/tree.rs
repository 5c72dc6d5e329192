use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::{debug, warn};

use crate::primitives::io::BackingStore;
use crate::storage::heap::HeapAllocator;
use crate::storage::metrics::DirectoryMetrics;
use crate::types::{PstError, Result};

use super::page::{is_blank, InternalEntry, LeafRecord, Page, PAGE_SIZE};

/// Result of splitting a non-root page: the left half stays in place.
#[derive(Clone, Copy, Debug)]
struct Split {
    median: u32,
    right: u64,
}

/// Everything reachable from the root, in key order.
#[derive(Clone, Debug, Default)]
pub struct TreeWalk {
    /// Offsets of every page that decoded cleanly.
    pub pages: Vec<u64>,
    /// Leaf records in ascending id order.
    pub records: Vec<LeafRecord>,
    /// Offsets of pages that could not be read; their subtrees are missing.
    pub damaged: Vec<u64>,
    /// Number of levels, 1 for a lone leaf root.
    pub height: u8,
}

/// Disk-resident B-tree keyed by node id.
///
/// Internal keys are exclusive upper bounds: a lookup descends into the
/// first child whose key is greater than the target, or the last child.
/// The root page never moves; it splits by pushing both halves into new
/// pages and collapses by copying its only child back.
pub struct NodeBTree {
    root: u64,
    cache: LruCache<u64, Page>,
    metrics: Arc<dyn DirectoryMetrics>,
}

impl NodeBTree {
    /// Binds a tree to the root page at `root`.
    pub fn new(root: u64, cache_pages: usize, metrics: Arc<dyn DirectoryMetrics>) -> Self {
        let capacity = NonZeroUsize::new(cache_pages).unwrap_or(NonZeroUsize::MIN);
        Self {
            root,
            cache: LruCache::new(capacity),
            metrics,
        }
    }

    /// Offset of the root page.
    pub fn root_offset(&self) -> u64 {
        self.root
    }

    /// Pages currently held in the cache.
    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    /// True when the root page lies beyond the end of the file or is all zero.
    pub fn root_is_blank<S: BackingStore + ?Sized>(&self, store: &S) -> Result<bool> {
        let len = store.file_length()?;
        if len < self.root + PAGE_SIZE as u64 {
            return Ok(true);
        }
        let bytes = store.read_range(self.root, PAGE_SIZE as u32)?;
        Ok(is_blank(&bytes))
    }

    /// Writes an empty leaf at the root offset.
    pub fn init_root<S: BackingStore + ?Sized>(&mut self, store: &S) -> Result<()> {
        self.write_page(store, self.root, &Page::empty_leaf())
    }

    /// Decodes the root page, failing with `Corrupted` when it is unreadable.
    pub fn check_root<S: BackingStore + ?Sized>(&mut self, store: &S) -> Result<()> {
        self.load(store, self.root).map(|_| ())
    }

    /// Drops every cached page.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Looks up `node_id`.
    pub fn search<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        node_id: u32,
    ) -> Result<Option<LeafRecord>> {
        let mut offset = self.root;
        let mut parent_level = None;
        loop {
            match self.load_checked(store, offset, parent_level)? {
                Page::Leaf(records) => {
                    return Ok(records
                        .binary_search_by_key(&node_id, |r| r.node_id)
                        .ok()
                        .map(|i| records[i]));
                }
                Page::Internal { level, entries } => {
                    offset = entries[route(&entries, node_id)].child;
                    parent_level = Some(level);
                }
            }
        }
    }

    /// Inserts `record`, replacing and returning any record with the same id.
    pub fn insert<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        heap: &mut HeapAllocator,
        record: LeafRecord,
    ) -> Result<Option<LeafRecord>> {
        let root = self.root;
        let (previous, split) = self.insert_into(store, heap, root, None, record)?;
        debug_assert!(split.is_none(), "root splits in place");
        Ok(previous)
    }

    /// Removes `node_id`, rebalancing on the way back up.
    pub fn delete<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        heap: &mut HeapAllocator,
        node_id: u32,
    ) -> Result<Option<LeafRecord>> {
        let root = self.root;
        let removed = self.delete_from(store, heap, root, None, node_id)?;
        if removed.is_some() {
            self.collapse_root(store, heap)?;
        }
        Ok(removed)
    }

    /// Visits every page reachable from the root.
    ///
    /// Unreadable subtrees are skipped and reported in
    /// [`TreeWalk::damaged`]; an unreadable root is an error.
    pub fn walk<S: BackingStore + ?Sized>(&mut self, store: &S) -> Result<TreeWalk> {
        let mut walk = TreeWalk::default();
        let root = self.load(store, self.root)?;
        walk.height = root.level().saturating_add(1);
        let mut stack: Vec<(u64, Option<u8>)> = vec![(self.root, None)];
        while let Some((offset, parent_level)) = stack.pop() {
            let page = match self.load_checked(store, offset, parent_level) {
                Ok(page) => page,
                Err(err) => {
                    warn!(offset, error = %err, "btree.walk.damaged");
                    walk.damaged.push(offset);
                    continue;
                }
            };
            walk.pages.push(offset);
            match page {
                Page::Leaf(records) => walk.records.extend(records),
                Page::Internal { level, entries } => {
                    for entry in entries.iter().rev() {
                        stack.push((entry.child, Some(level)));
                    }
                }
            }
        }
        Ok(walk)
    }

    fn insert_into<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        heap: &mut HeapAllocator,
        offset: u64,
        parent_level: Option<u8>,
        record: LeafRecord,
    ) -> Result<(Option<LeafRecord>, Option<Split>)> {
        let mut page = self.load_checked(store, offset, parent_level)?;
        let previous = match &mut page {
            Page::Leaf(records) => {
                match records.binary_search_by_key(&record.node_id, |r| r.node_id) {
                    Ok(i) => Some(std::mem::replace(&mut records[i], record)),
                    Err(i) => {
                        records.insert(i, record);
                        None
                    }
                }
            }
            Page::Internal { level, entries } => {
                let idx = route(entries, record.node_id);
                let (previous, split) =
                    self.insert_into(store, heap, entries[idx].child, Some(*level), record)?;
                let Some(split) = split else {
                    return Ok((previous, None));
                };
                let bound = entries[idx].key;
                entries[idx].key = split.median;
                entries.insert(
                    idx + 1,
                    InternalEntry {
                        key: bound,
                        child: split.right,
                    },
                );
                previous
            }
        };

        if !page.overflows() {
            self.write_page(store, offset, &page)?;
            return Ok((previous, None));
        }
        if offset == self.root {
            self.split_root(store, heap, page)?;
            return Ok((previous, None));
        }
        let (left, right, median) = halves(page)?;
        let right_offset = self.allocate_page(store, heap)?;
        self.write_page(store, right_offset, &right)?;
        self.write_page(store, offset, &left)?;
        self.metrics.page_split();
        debug!(offset, right = right_offset, median, "btree.split");
        Ok((
            previous,
            Some(Split {
                median,
                right: right_offset,
            }),
        ))
    }

    fn split_root<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        heap: &mut HeapAllocator,
        page: Page,
    ) -> Result<()> {
        let level = page
            .level()
            .checked_add(1)
            .ok_or_else(|| PstError::Corrupted("tree height exceeds page level range".into()))?;
        let (left, right, median) = halves(page)?;
        let left_offset = self.allocate_page(store, heap)?;
        let right_offset = self.allocate_page(store, heap)?;
        self.write_page(store, left_offset, &left)?;
        self.write_page(store, right_offset, &right)?;
        let root = Page::Internal {
            level,
            entries: vec![
                InternalEntry {
                    key: median,
                    child: left_offset,
                },
                InternalEntry {
                    key: u32::MAX,
                    child: right_offset,
                },
            ],
        };
        self.write_page(store, self.root, &root)?;
        self.metrics.page_split();
        debug!(level, median, "btree.root.split");
        Ok(())
    }

    fn delete_from<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        heap: &mut HeapAllocator,
        offset: u64,
        parent_level: Option<u8>,
        node_id: u32,
    ) -> Result<Option<LeafRecord>> {
        let mut page = self.load_checked(store, offset, parent_level)?;
        match &mut page {
            Page::Leaf(records) => {
                let Ok(i) = records.binary_search_by_key(&node_id, |r| r.node_id) else {
                    return Ok(None);
                };
                let removed = records.remove(i);
                self.write_page(store, offset, &page)?;
                Ok(Some(removed))
            }
            Page::Internal { level, entries } => {
                let level = *level;
                let idx = route(entries, node_id);
                let removed =
                    self.delete_from(store, heap, entries[idx].child, Some(level), node_id)?;
                if removed.is_none() {
                    return Ok(None);
                }
                if self.rebalance(store, heap, level, entries, idx)? {
                    self.write_page(store, offset, &page)?;
                }
                Ok(removed)
            }
        }
    }

    /// Restores minimum fill of child `idx`; returns whether `entries` changed.
    fn rebalance<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        heap: &mut HeapAllocator,
        level: u8,
        entries: &mut Vec<InternalEntry>,
        idx: usize,
    ) -> Result<bool> {
        let child_offset = entries[idx].child;
        let mut child = self.load_checked(store, child_offset, Some(level))?;
        if !child.underflows() {
            return Ok(false);
        }
        let mut left = match idx.checked_sub(1) {
            Some(l) => Some(self.load_checked(store, entries[l].child, Some(level))?),
            None => None,
        };
        let mut right = match entries.get(idx + 1) {
            Some(entry) => Some(self.load_checked(store, entry.child, Some(level))?),
            None => None,
        };

        if let Some(lender) = left.as_mut().filter(|p| p.len() > p.kind().min_fill()) {
            entries[idx - 1].key = shift_last_to_front(lender, &mut child)?;
            self.write_page(store, entries[idx - 1].child, lender)?;
            self.write_page(store, child_offset, &child)?;
            debug!(offset = child_offset, "btree.borrow.left");
            return Ok(true);
        }
        if let Some(lender) = right.as_mut().filter(|p| p.len() > p.kind().min_fill()) {
            entries[idx].key = shift_first_to_back(&mut child, lender)?;
            self.write_page(store, entries[idx + 1].child, lender)?;
            self.write_page(store, child_offset, &child)?;
            debug!(offset = child_offset, "btree.borrow.right");
            return Ok(true);
        }

        match (left, right) {
            (Some(mut lp), _) => self.merge_pair(store, heap, entries, idx - 1, &mut lp, child)?,
            (None, Some(rp)) => self.merge_pair(store, heap, entries, idx, &mut child, rp)?,
            (None, None) => return Ok(false),
        }
        Ok(true)
    }

    /// Folds the page at `entries[l + 1]` into the page at `entries[l]`.
    fn merge_pair<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        heap: &mut HeapAllocator,
        entries: &mut Vec<InternalEntry>,
        l: usize,
        left: &mut Page,
        right: Page,
    ) -> Result<()> {
        match (&mut *left, right) {
            (Page::Leaf(dst), Page::Leaf(src)) => dst.extend(src),
            (Page::Internal { entries: dst, .. }, Page::Internal { entries: src, .. }) => {
                dst.extend(src)
            }
            _ => return Err(sibling_mismatch()),
        }
        entries[l].key = entries[l + 1].key;
        let freed = entries.remove(l + 1).child;
        self.write_page(store, entries[l].child, left)?;
        self.cache.pop(&freed);
        heap.free(freed, PAGE_SIZE as u32);
        self.metrics.page_merge();
        debug!(into = entries[l].child, freed, "btree.merge");
        Ok(())
    }

    fn collapse_root<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        heap: &mut HeapAllocator,
    ) -> Result<()> {
        loop {
            let (level, only_child) = match self.load(store, self.root)? {
                Page::Internal { level, entries } if entries.len() == 1 => {
                    (level, entries[0].child)
                }
                _ => return Ok(()),
            };
            let child = self.load_checked(store, only_child, Some(level))?;
            self.write_page(store, self.root, &child)?;
            self.cache.pop(&only_child);
            heap.free(only_child, PAGE_SIZE as u32);
            self.metrics.page_merge();
            debug!(level = child.level(), "btree.root.collapse");
        }
    }

    fn allocate_page<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        heap: &mut HeapAllocator,
    ) -> Result<u64> {
        let offset = heap.allocate(store, PAGE_SIZE as u32)?;
        self.metrics.allocation(PAGE_SIZE as u32);
        Ok(offset)
    }

    fn load<S: BackingStore + ?Sized>(&mut self, store: &S, offset: u64) -> Result<Page> {
        if let Some(page) = self.cache.get(&offset) {
            self.metrics.page_cache(true);
            return Ok(page.clone());
        }
        self.metrics.page_cache(false);
        let bytes = store
            .read_range(offset, PAGE_SIZE as u32)
            .map_err(|err| PstError::Corrupted(format!("page at {offset}: {err}")))?;
        let page = Page::decode(offset, &bytes)?;
        self.cache.put(offset, page.clone());
        Ok(page)
    }

    /// Loads a child page and checks it sits exactly one level below its parent.
    fn load_checked<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        offset: u64,
        parent_level: Option<u8>,
    ) -> Result<Page> {
        let page = self.load(store, offset)?;
        if let Some(parent) = parent_level {
            if page.level().checked_add(1) != Some(parent) {
                return Err(PstError::Corrupted(format!(
                    "page at {offset}: level {} under parent level {parent}",
                    page.level()
                )));
            }
        }
        Ok(page)
    }

    fn write_page<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
        offset: u64,
        page: &Page,
    ) -> Result<()> {
        let bytes = page.encode()?;
        store.write_range(offset, &bytes).map_err(|err| match err {
            PstError::AccessDenied(op) => PstError::AccessDenied(op),
            other => PstError::AllocationFailure(format!("write page at {offset}: {other}")),
        })?;
        self.cache.put(offset, page.clone());
        Ok(())
    }
}

/// Index of the child covering `node_id`.
fn route(entries: &[InternalEntry], node_id: u32) -> usize {
    entries
        .iter()
        .position(|e| e.key > node_id)
        .unwrap_or(entries.len().saturating_sub(1))
}

/// Splits an overflowing page; returns the halves and the left half's bound.
fn halves(page: Page) -> Result<(Page, Page, u32)> {
    match page {
        Page::Leaf(mut records) => {
            let right = records.split_off(records.len() / 2);
            let median = right.first().map(|r| r.node_id).ok_or_else(sibling_mismatch)?;
            Ok((Page::Leaf(records), Page::Leaf(right), median))
        }
        Page::Internal { level, mut entries } => {
            let right = entries.split_off(entries.len() / 2);
            let median = entries.last().map(|e| e.key).ok_or_else(sibling_mismatch)?;
            Ok((
                Page::Internal { level, entries },
                Page::Internal {
                    level,
                    entries: right,
                },
                median,
            ))
        }
    }
}

/// Moves the last entry of `left` to the front of `child`; returns the new
/// bound of `left`.
fn shift_last_to_front(left: &mut Page, child: &mut Page) -> Result<u32> {
    match (left, child) {
        (Page::Leaf(l), Page::Leaf(c)) => {
            let moved = l.pop().ok_or_else(sibling_mismatch)?;
            c.insert(0, moved);
            Ok(moved.node_id)
        }
        (Page::Internal { entries: l, .. }, Page::Internal { entries: c, .. }) => {
            let moved = l.pop().ok_or_else(sibling_mismatch)?;
            c.insert(0, moved);
            l.last().map(|e| e.key).ok_or_else(sibling_mismatch)
        }
        _ => Err(sibling_mismatch()),
    }
}

/// Moves the first entry of `right` to the back of `child`; returns the new
/// bound of `child`.
fn shift_first_to_back(child: &mut Page, right: &mut Page) -> Result<u32> {
    match (child, right) {
        (Page::Leaf(c), Page::Leaf(r)) => {
            if r.is_empty() {
                return Err(sibling_mismatch());
            }
            c.push(r.remove(0));
            r.first().map(|rec| rec.node_id).ok_or_else(sibling_mismatch)
        }
        (Page::Internal { entries: c, .. }, Page::Internal { entries: r, .. }) => {
            if r.is_empty() {
                return Err(sibling_mismatch());
            }
            let moved = r.remove(0);
            c.push(moved);
            Ok(moved.key)
        }
        _ => Err(sibling_mismatch()),
    }
}

fn sibling_mismatch() -> PstError {
    PstError::Corrupted("sibling pages disagree in shape".into())
}
