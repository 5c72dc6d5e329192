use std::collections::BTreeMap;

use crate::types::{classify, NodeType};

use super::btree::page::LeafRecord;

/// The directory's unit of record for one node.
///
/// `node_id` is fixed at construction; the payload location is assigned by
/// the directory when the entry is added. Everything else is mutable cached
/// state that callers may enrich and write back through `update`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeEntry {
    node_id: u32,
    /// Opaque secondary identifier.
    pub data_id: u32,
    /// Owning node, or 0 for the root.
    pub parent_id: u32,
    pub(crate) data_offset: u64,
    pub(crate) data_size: u32,
    /// Cached display name (folders, attachments).
    pub display_name: Option<String>,
    /// Cached message subject.
    pub subject: Option<String>,
    /// Cached sender display name.
    pub sender_name: Option<String>,
    /// Cached sender address.
    pub sender_email: Option<String>,
    /// Cached submit time in milliseconds since the Unix epoch.
    pub sent_date: Option<i64>,
    /// Cached message size in bytes.
    pub message_size: Option<u32>,
    /// Cached has-attachment flag.
    pub has_attachment: Option<bool>,
    /// Fields not promoted to first-class attributes.
    pub metadata: BTreeMap<String, String>,
}

impl NodeEntry {
    /// Creates an entry that has no payload location yet.
    pub fn new(node_id: u32, data_id: u32, parent_id: u32) -> Self {
        Self {
            node_id,
            data_id,
            parent_id,
            ..Self::default()
        }
    }

    /// Sets the cached display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Primary key.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Node type derived from the id.
    pub fn node_type(&self) -> NodeType {
        classify(self.node_id)
    }

    /// Start of the payload range in the backing file.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Length of the payload range.
    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    /// Exclusive end of the payload range; `None` when it would pass
    /// `u64::MAX`.
    pub fn data_end(&self) -> Option<u64> {
        self.data_offset.checked_add(self.data_size as u64)
    }

    /// True when the root of the folder tree.
    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }

    pub(crate) fn from_record(record: &LeafRecord) -> Self {
        Self {
            node_id: record.node_id,
            data_id: record.data_id,
            parent_id: record.parent_id,
            data_offset: record.data_offset,
            data_size: record.data_size,
            ..Self::default()
        }
    }

    pub(crate) fn to_record(&self) -> LeafRecord {
        LeafRecord {
            node_id: self.node_id,
            data_id: self.data_id,
            parent_id: self.parent_id,
            data_offset: self.data_offset,
            data_size: self.data_size,
        }
    }

    /// Copies the caller-editable fields of `other`, keeping identity and
    /// payload location.
    pub(crate) fn absorb_metadata(&mut self, other: &NodeEntry) {
        self.data_id = other.data_id;
        self.parent_id = other.parent_id;
        self.display_name = other.display_name.clone();
        self.subject = other.subject.clone();
        self.sender_name = other.sender_name.clone();
        self.sender_email = other.sender_email.clone();
        self.sent_date = other.sent_date;
        self.message_size = other.message_size;
        self.has_attachment = other.has_attachment;
        self.metadata = other.metadata.clone();
    }

    /// Fills summary fields that are still unset from `other`.
    pub(crate) fn enrich_from(&mut self, other: &NodeEntry) {
        fn fill<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if dst.is_none() {
                dst.clone_from(src);
            }
        }
        fill(&mut self.display_name, &other.display_name);
        fill(&mut self.subject, &other.subject);
        fill(&mut self.sender_name, &other.sender_name);
        fill(&mut self.sender_email, &other.sender_email);
        fill(&mut self.sent_date, &other.sent_date);
        fill(&mut self.message_size, &other.message_size);
        fill(&mut self.has_attachment, &other.has_attachment);
        for (k, v) in &other.metadata {
            self.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub(crate) fn set_location(&mut self, offset: u64, size: u32) {
        self.data_offset = offset;
        self.data_size = size;
    }
}
