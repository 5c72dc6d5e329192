use std::collections::BTreeMap;

use tracing::{debug, error};

use crate::primitives::io::BackingStore;
use crate::types::{PstError, Result};

use super::options::HeapOptions;

/// Counters describing allocator activity since open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Non-empty ranges handed out.
    pub allocations: u64,
    /// Bytes requested across all allocations.
    pub bytes_allocated: u64,
    /// Ranges forgotten through `free`.
    pub frees: u64,
    /// Times the backing file was extended.
    pub file_extensions: u64,
}

/// Block-aligned bump allocator over the live extents of the backing file.
///
/// There is no free list. Freed ranges are only dropped from the live set, so
/// they stop contributing to the high-water mark; a hole below the highest
/// live extent is never handed out again.
#[derive(Debug)]
pub struct HeapAllocator {
    opts: HeapOptions,
    extents: BTreeMap<u64, u32>,
    ends: BTreeMap<u64, u32>,
    floor: u64,
    stats: HeapStats,
}

impl HeapAllocator {
    /// Creates an allocator with no known extents.
    pub fn new(opts: HeapOptions) -> Self {
        Self {
            opts,
            extents: BTreeMap::new(),
            ends: BTreeMap::new(),
            floor: opts.heap_start,
            stats: HeapStats::default(),
        }
    }

    /// Offset returned for zero-length requests.
    pub fn reserved_offset(&self) -> u64 {
        self.opts.heap_start
    }

    /// End of the highest live extent, or `heap_start` when none exist.
    pub fn high_water(&self) -> u64 {
        self.ends
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.opts.heap_start)
            .max(self.floor)
    }

    /// Never allocate below `offset`, regardless of which extents are live.
    ///
    /// Used when part of the file could not be accounted for.
    pub fn raise_floor(&mut self, offset: u64) {
        self.floor = self.floor.max(offset);
    }

    /// Registers a range that already exists on disk.
    ///
    /// Returns `false`, registering nothing, when the range runs past
    /// `u64::MAX`.
    pub fn reserve(&mut self, offset: u64, len: u32) -> bool {
        if len == 0 {
            return true;
        }
        let Some(end) = offset.checked_add(len as u64) else {
            return false;
        };
        if let Some(prev) = self.extents.insert(offset, len) {
            self.drop_end(offset, prev);
        }
        *self.ends.entry(end).or_insert(0) += 1;
        true
    }

    /// True when exactly `offset..offset + len` is a live extent.
    pub fn is_live(&self, offset: u64, len: u32) -> bool {
        self.extents.get(&offset) == Some(&len)
    }

    /// Reserves `len` bytes above the high-water mark and returns their offset.
    pub fn allocate<S: BackingStore + ?Sized>(&mut self, store: &S, len: u32) -> Result<u64> {
        if len == 0 {
            return Ok(self.reserved_offset());
        }
        let offset = round_up(self.high_water(), self.opts.block_size);
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| PstError::AllocationFailure("heap offset overflow".into()))?;
        let file_len = store.file_length().map_err(|err| {
            PstError::AllocationFailure(format!("query file length: {err}"))
        })?;
        if end > file_len {
            let target = round_up(end, self.opts.growth_increment);
            if let Err(err) = store.set_file_length(target) {
                error!(target, error = %err, "heap.extend.failed");
                return Err(PstError::AllocationFailure(format!(
                    "extend file to {target}: {err}"
                )));
            }
            self.stats.file_extensions += 1;
            debug!(from = file_len, to = target, "heap.extend");
        }
        self.extents.insert(offset, len);
        *self.ends.entry(end).or_insert(0) += 1;
        self.stats.allocations += 1;
        self.stats.bytes_allocated += len as u64;
        Ok(offset)
    }

    /// Forgets the range starting at `offset`; unknown ranges are ignored.
    pub fn free(&mut self, offset: u64, len: u32) {
        if len == 0 {
            return;
        }
        if let Some(known) = self.extents.remove(&offset) {
            self.drop_end(offset, known);
            self.stats.frees += 1;
        }
    }

    /// Live extents ordered by offset.
    pub fn live_extents(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.extents.iter().map(|(&off, &len)| (off, len))
    }

    /// Allocation counters.
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    fn drop_end(&mut self, offset: u64, len: u32) {
        let Some(end) = offset.checked_add(len as u64) else {
            return;
        };
        if let Some(count) = self.ends.get_mut(&end) {
            *count -= 1;
            if *count == 0 {
                self.ends.remove(&end);
            }
        }
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}
