use std::io::Cursor;

use crate::primitives::bytes::BinaryCursor;
use crate::types::{PstError, Result};

/// Size of every directory page on disk.
pub const PAGE_SIZE: usize = 512;
/// Bytes occupied by the page header.
pub const PAGE_HEADER_LEN: usize = 16;
/// "BN" in little-endian byte order.
pub const PAGE_MAGIC: u16 = 0x4E42;
/// Current page layout version.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Encoded size of one leaf record.
pub const LEAF_ENTRY_LEN: usize = 24;
/// Encoded size of one internal entry.
pub const INTERNAL_ENTRY_LEN: usize = 12;
/// Leaf page capacity.
pub const MAX_LEAF_ENTRIES: usize = 20;
/// Internal page capacity.
pub const MAX_INTERNAL_ENTRIES: usize = 40;

const CHECKSUM_OFFSET: usize = 8;

/// Logical kind for a directory page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Page holding node records.
    Leaf = 1,
    /// Page holding child pointers.
    Internal = 2,
}

impl PageKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Leaf),
            2 => Some(Self::Internal),
            _ => None,
        }
    }

    /// Maximum entries a page of this kind holds.
    pub fn capacity(self) -> usize {
        match self {
            PageKind::Leaf => MAX_LEAF_ENTRIES,
            PageKind::Internal => MAX_INTERNAL_ENTRIES,
        }
    }

    /// Entry count below which a non-root page is rebalanced.
    pub fn min_fill(self) -> usize {
        self.capacity() / 2
    }
}

/// On-disk form of one directory record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LeafRecord {
    /// Primary key.
    pub node_id: u32,
    /// Opaque secondary identifier.
    pub data_id: u32,
    /// Owning node, 0 for the root.
    pub parent_id: u32,
    /// Payload start.
    pub data_offset: u64,
    /// Payload length.
    pub data_size: u32,
}

/// Child pointer of an internal page.
///
/// `key` is the exclusive upper bound of ids stored under `child`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InternalEntry {
    /// Exclusive upper bound.
    pub key: u32,
    /// Offset of the child page.
    pub child: u64,
}

/// Decoded directory page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Page {
    /// Level-0 page of sorted records.
    Leaf(Vec<LeafRecord>),
    /// Page of sorted child pointers at `level` >= 1.
    Internal {
        /// Distance from the leaves.
        level: u8,
        /// Child pointers ordered by key.
        entries: Vec<InternalEntry>,
    },
}

impl Page {
    /// An empty leaf, the shape of a freshly initialised root.
    pub fn empty_leaf() -> Self {
        Page::Leaf(Vec::new())
    }

    /// Page kind.
    pub fn kind(&self) -> PageKind {
        match self {
            Page::Leaf(_) => PageKind::Leaf,
            Page::Internal { .. } => PageKind::Internal,
        }
    }

    /// Distance from the leaves.
    pub fn level(&self) -> u8 {
        match self {
            Page::Leaf(_) => 0,
            Page::Internal { level, .. } => *level,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            Page::Leaf(records) => records.len(),
            Page::Internal { entries, .. } => entries.len(),
        }
    }

    /// True when the page holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the page holds more entries than fit on disk.
    pub fn overflows(&self) -> bool {
        self.len() > self.kind().capacity()
    }

    /// True when a non-root page should borrow or merge.
    pub fn underflows(&self) -> bool {
        self.len() < self.kind().min_fill()
    }

    /// Serialises the page into exactly [`PAGE_SIZE`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.overflows() {
            return Err(PstError::Invalid("page entry count exceeds capacity"));
        }
        let mut cur = BinaryCursor::new(Cursor::new(Vec::with_capacity(PAGE_SIZE)));
        cur.write_u16(PAGE_MAGIC)?;
        cur.write_u8(self.kind() as u8)?;
        cur.write_u8(self.level())?;
        cur.write_u16(self.len() as u16)?;
        cur.write_u16(PAGE_FORMAT_VERSION)?;
        cur.write_u32(0)?;
        cur.write_u32(0)?;
        match self {
            Page::Leaf(records) => {
                for r in records {
                    cur.write_u32(r.node_id)?;
                    cur.write_u32(r.data_id)?;
                    cur.write_u32(r.parent_id)?;
                    cur.write_u64(r.data_offset)?;
                    cur.write_u32(r.data_size)?;
                }
            }
            Page::Internal { entries, .. } => {
                for e in entries {
                    cur.write_u32(e.key)?;
                    cur.write_u64(e.child)?;
                }
            }
        }
        let used = cur.position()? as usize;
        cur.write_bytes(&[0u8; PAGE_SIZE][..PAGE_SIZE - used])?;
        let crc = crc32fast::hash(cur.get_ref().get_ref());
        cur.write_at(CHECKSUM_OFFSET as u64, |c| c.write_u32(crc))?;
        Ok(cur.into_inner().into_inner())
    }

    /// Parses a page read from `offset`, verifying magic, version, checksum
    /// and key order.
    pub fn decode(offset: u64, bytes: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| PstError::Corrupted(format!("page at {offset}: {what}"));
        if bytes.len() != PAGE_SIZE {
            return Err(corrupt("short page"));
        }
        let stored = u32::from_le_bytes([
            bytes[CHECKSUM_OFFSET],
            bytes[CHECKSUM_OFFSET + 1],
            bytes[CHECKSUM_OFFSET + 2],
            bytes[CHECKSUM_OFFSET + 3],
        ]);
        let mut zeroed = bytes.to_vec();
        zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        if crc32fast::hash(&zeroed) != stored {
            return Err(corrupt("checksum mismatch"));
        }

        let mut cur = BinaryCursor::new(Cursor::new(bytes));
        if cur.read_u16()? != PAGE_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let kind = PageKind::from_u8(cur.read_u8()?).ok_or_else(|| corrupt("unknown page type"))?;
        let level = cur.read_u8()?;
        let count = cur.read_u16()? as usize;
        if cur.read_u16()? != PAGE_FORMAT_VERSION {
            return Err(corrupt("unsupported page version"));
        }
        if count > kind.capacity() {
            return Err(corrupt("entry count exceeds capacity"));
        }
        cur.seek_to(PAGE_HEADER_LEN as u64)?;

        let page = match kind {
            PageKind::Leaf => {
                if level != 0 {
                    return Err(corrupt("leaf page with non-zero level"));
                }
                let mut records = Vec::with_capacity(count);
                for _ in 0..count {
                    records.push(LeafRecord {
                        node_id: cur.read_u32()?,
                        data_id: cur.read_u32()?,
                        parent_id: cur.read_u32()?,
                        data_offset: cur.read_u64()?,
                        data_size: cur.read_u32()?,
                    });
                }
                if !records.windows(2).all(|w| w[0].node_id < w[1].node_id) {
                    return Err(corrupt("leaf keys out of order"));
                }
                Page::Leaf(records)
            }
            PageKind::Internal => {
                if level == 0 || count == 0 {
                    return Err(corrupt("malformed internal page"));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(InternalEntry {
                        key: cur.read_u32()?,
                        child: cur.read_u64()?,
                    });
                }
                if !entries.windows(2).all(|w| w[0].key < w[1].key) {
                    return Err(corrupt("internal keys out of order"));
                }
                Page::Internal { level, entries }
            }
        };
        Ok(page)
    }
}

/// True for an all-zero page image, i.e. a root that was never written.
pub fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}
