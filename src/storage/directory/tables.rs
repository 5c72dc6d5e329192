use std::io::Cursor;

use tracing::{debug, warn};

use crate::primitives::bytes::BinaryCursor;
use crate::primitives::io::BackingStore;
use crate::storage::node::NodeEntry;
use crate::types::{companion_id, Result, TableKind};

use super::NodeDirectory;

impl<S: BackingStore> NodeDirectory<S> {
    /// Ids listed in the `kind` table of `owner_id`, in insertion order.
    ///
    /// A table that was never created reads as empty.
    pub fn table_rows(&mut self, owner_id: u32, kind: TableKind) -> Result<Vec<u32>> {
        let table_id = companion_id(owner_id, kind);
        match self.find(table_id)? {
            Some(table) => Ok(decode_rows(table_id, &self.read_entry_payload(&table)?)),
            None => Ok(Vec::new()),
        }
    }

    /// Appends `child` to the table of its parent that lists its type,
    /// creating the table on first use.
    pub(super) fn link_into_parent(&mut self, child: &NodeEntry) -> Result<()> {
        let Some((table_id, owner_id)) = self.listing_table(child) else {
            return Ok(());
        };
        self.ensure_table(table_id, owner_id)?;
        let mut rows = self.cached_rows(table_id)?;
        if rows.contains(&child.node_id()) {
            return Ok(());
        }
        rows.push(child.node_id());
        self.write_rows(table_id, &rows)
    }

    /// Drops `child` from its parent's table, if listed.
    pub(super) fn unlink_from_parent(&mut self, child: &NodeEntry) -> Result<()> {
        let Some((table_id, _)) = self.listing_table(child) else {
            return Ok(());
        };
        if !self.cache.contains_key(&table_id) {
            return Ok(());
        }
        let mut rows = self.cached_rows(table_id)?;
        let before = rows.len();
        rows.retain(|id| *id != child.node_id());
        if rows.len() != before {
            self.write_rows(table_id, &rows)?;
        }
        Ok(())
    }

    fn listing_table(&self, child: &NodeEntry) -> Option<(u32, u32)> {
        let kind = TableKind::listing(child.node_type())?;
        let owner = self.cache.get(&child.parent_id)?;
        if !TableKind::owned_by(owner.node_type()).contains(&kind) {
            return None;
        }
        Some((companion_id(child.parent_id, kind), child.parent_id))
    }

    fn ensure_table(&mut self, table_id: u32, owner_id: u32) -> Result<()> {
        if self.cache.contains_key(&table_id) {
            return Ok(());
        }
        let mut table = NodeEntry::new(table_id, 0, owner_id);
        table.set_location(self.heap.reserved_offset(), 0);
        self.tree
            .insert(&self.store, &mut self.heap, table.to_record())?;
        self.cache.insert(table_id, table);
        self.metrics.node_added();
        debug!(table_id, owner_id, "directory.table.created");
        Ok(())
    }

    fn cached_rows(&self, table_id: u32) -> Result<Vec<u32>> {
        match self.cache.get(&table_id) {
            Some(table) => Ok(decode_rows(table_id, &self.read_entry_payload(table)?)),
            None => Ok(Vec::new()),
        }
    }

    fn write_rows(&mut self, table_id: u32, rows: &[u32]) -> Result<()> {
        let payload = encode_rows(rows)?;
        self.store_payload(table_id, &payload).map(|_| ())
    }
}

/// `{row_count:u32}{node_id:u32}*`
fn encode_rows(rows: &[u32]) -> Result<Vec<u8>> {
    let mut cur = BinaryCursor::new(Cursor::new(Vec::with_capacity(4 + rows.len() * 4)));
    cur.write_u32(rows.len() as u32)?;
    for id in rows {
        cur.write_u32(*id)?;
    }
    Ok(cur.into_inner().into_inner())
}

/// Reads as many rows as the payload actually holds.
fn decode_rows(table_id: u32, bytes: &[u8]) -> Vec<u32> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let mut cur = BinaryCursor::new(Cursor::new(bytes));
    let Ok(count) = cur.read_u32() else {
        warn!(table_id, "directory.table.truncated");
        return Vec::new();
    };
    let mut rows = Vec::with_capacity((count as usize).min(bytes.len() / 4));
    for _ in 0..count {
        match cur.read_u32() {
            Ok(id) => rows.push(id),
            Err(_) => {
                warn!(table_id, expected = count, found = rows.len(), "directory.table.truncated");
                break;
            }
        }
    }
    rows
}
