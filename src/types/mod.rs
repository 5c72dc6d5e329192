#![forbid(unsafe_code)]
//! Identifiers, node-type numbering and the crate-wide error type.

use std::fmt;

/// 32-bit node identifier.
///
/// Bits 5..=9 carry the node type, the low five bits and everything above
/// bit 9 carry the index of the node within its type.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u32);

const TYPE_SHIFT: u32 = 5;
const TYPE_MASK: u32 = 0x1F;
const INDEX_LOW_MASK: u32 = 0x1F;
const INDEX_HIGH_SHIFT: u32 = 10;

impl NodeId {
    /// Builds an id from a raw node type value and an index.
    pub const fn compose(node_type: u8, index: u32) -> Self {
        let low = index & INDEX_LOW_MASK;
        let high = index >> 5;
        NodeId((high << INDEX_HIGH_SHIFT) | (((node_type as u32) & TYPE_MASK) << TYPE_SHIFT) | low)
    }

    /// Raw node type bits.
    pub const fn type_bits(self) -> u8 {
        ((self.0 >> TYPE_SHIFT) & TYPE_MASK) as u8
    }

    /// Index of the node within its type.
    pub const fn index(self) -> u32 {
        ((self.0 >> INDEX_HIGH_SHIFT) << 5) | (self.0 & INDEX_LOW_MASK)
    }

    /// Node type derived from the id bits.
    pub fn node_type(self) -> NodeType {
        NodeType::from_u8(self.type_bits())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for u32 {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

/// Raw node-type values as they appear in bits 5..=9 of a node id.
#[allow(missing_docs)]
pub mod node_type {
    pub const HID: u8 = 0x00;
    pub const INTERNAL: u8 = 0x01;
    pub const NORMAL_FOLDER: u8 = 0x02;
    pub const SEARCH_FOLDER: u8 = 0x03;
    pub const NORMAL_MESSAGE: u8 = 0x04;
    pub const ATTACHMENT: u8 = 0x05;
    pub const SEARCH_UPDATE_QUEUE: u8 = 0x06;
    pub const SEARCH_CRITERIA_OBJECT: u8 = 0x07;
    pub const ASSOCIATED_MESSAGE: u8 = 0x08;
    pub const CONTENTS_TABLE_INDEX: u8 = 0x0A;
    pub const RECEIVE_FOLDER_TABLE: u8 = 0x0B;
    pub const OUTGOING_QUEUE_TABLE: u8 = 0x0C;
    pub const HIERARCHY_TABLE: u8 = 0x0D;
    pub const CONTENTS_TABLE: u8 = 0x0E;
    pub const ASSOCIATED_CONTENTS_TABLE: u8 = 0x0F;
    pub const SEARCH_CONTENTS_TABLE: u8 = 0x10;
    pub const ATTACHMENT_TABLE: u8 = 0x11;
    pub const RECIPIENT_TABLE: u8 = 0x12;
}

/// Category of a node, derived from its id.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NodeType {
    Hid,
    Internal,
    NormalFolder,
    SearchFolder,
    NormalMessage,
    Attachment,
    SearchUpdateQueue,
    SearchCriteriaObject,
    AssociatedMessage,
    ContentsTableIndex,
    ReceiveFolderTable,
    OutgoingQueueTable,
    HierarchyTable,
    ContentsTable,
    AssociatedContentsTable,
    SearchContentsTable,
    AttachmentTable,
    RecipientTable,
    Other(u8),
}

impl NodeType {
    /// Maps raw type bits to a node type.
    pub fn from_u8(value: u8) -> Self {
        use node_type::*;
        match value {
            HID => NodeType::Hid,
            INTERNAL => NodeType::Internal,
            NORMAL_FOLDER => NodeType::NormalFolder,
            SEARCH_FOLDER => NodeType::SearchFolder,
            NORMAL_MESSAGE => NodeType::NormalMessage,
            ATTACHMENT => NodeType::Attachment,
            SEARCH_UPDATE_QUEUE => NodeType::SearchUpdateQueue,
            SEARCH_CRITERIA_OBJECT => NodeType::SearchCriteriaObject,
            ASSOCIATED_MESSAGE => NodeType::AssociatedMessage,
            CONTENTS_TABLE_INDEX => NodeType::ContentsTableIndex,
            RECEIVE_FOLDER_TABLE => NodeType::ReceiveFolderTable,
            OUTGOING_QUEUE_TABLE => NodeType::OutgoingQueueTable,
            HIERARCHY_TABLE => NodeType::HierarchyTable,
            CONTENTS_TABLE => NodeType::ContentsTable,
            ASSOCIATED_CONTENTS_TABLE => NodeType::AssociatedContentsTable,
            SEARCH_CONTENTS_TABLE => NodeType::SearchContentsTable,
            ATTACHMENT_TABLE => NodeType::AttachmentTable,
            RECIPIENT_TABLE => NodeType::RecipientTable,
            other => NodeType::Other(other),
        }
    }

    /// Raw type bits for this node type.
    pub fn as_u8(self) -> u8 {
        use node_type::*;
        match self {
            NodeType::Hid => HID,
            NodeType::Internal => INTERNAL,
            NodeType::NormalFolder => NORMAL_FOLDER,
            NodeType::SearchFolder => SEARCH_FOLDER,
            NodeType::NormalMessage => NORMAL_MESSAGE,
            NodeType::Attachment => ATTACHMENT,
            NodeType::SearchUpdateQueue => SEARCH_UPDATE_QUEUE,
            NodeType::SearchCriteriaObject => SEARCH_CRITERIA_OBJECT,
            NodeType::AssociatedMessage => ASSOCIATED_MESSAGE,
            NodeType::ContentsTableIndex => CONTENTS_TABLE_INDEX,
            NodeType::ReceiveFolderTable => RECEIVE_FOLDER_TABLE,
            NodeType::OutgoingQueueTable => OUTGOING_QUEUE_TABLE,
            NodeType::HierarchyTable => HIERARCHY_TABLE,
            NodeType::ContentsTable => CONTENTS_TABLE,
            NodeType::AssociatedContentsTable => ASSOCIATED_CONTENTS_TABLE,
            NodeType::SearchContentsTable => SEARCH_CONTENTS_TABLE,
            NodeType::AttachmentTable => ATTACHMENT_TABLE,
            NodeType::RecipientTable => RECIPIENT_TABLE,
            NodeType::Other(v) => v,
        }
    }

    /// True for normal and search folders.
    pub fn is_folder(self) -> bool {
        matches!(self, NodeType::NormalFolder | NodeType::SearchFolder)
    }

    /// True for normal and associated messages.
    pub fn is_message(self) -> bool {
        matches!(self, NodeType::NormalMessage | NodeType::AssociatedMessage)
    }
}

/// Derives the node type of `node_id`.
pub fn classify(node_id: u32) -> NodeType {
    NodeId(node_id).node_type()
}

/// Kinds of companion table a folder or message owns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableKind {
    /// Child folders of a folder.
    Hierarchy,
    /// Messages of a folder.
    Contents,
    /// Attachments of a message.
    Attachment,
}

/// Offset added to a folder id to obtain its hierarchy table id.
pub const HIERARCHY_TABLE_OFFSET: u32 =
    ((node_type::HIERARCHY_TABLE - node_type::NORMAL_FOLDER) as u32) << TYPE_SHIFT;
/// Offset added to a folder id to obtain its contents table id.
pub const CONTENTS_TABLE_OFFSET: u32 =
    ((node_type::CONTENTS_TABLE - node_type::NORMAL_FOLDER) as u32) << TYPE_SHIFT;
/// Offset added to a message id to obtain its attachment table id.
pub const ATTACHMENT_TABLE_OFFSET: u32 =
    ((node_type::ATTACHMENT_TABLE - node_type::NORMAL_MESSAGE) as u32) << TYPE_SHIFT;

impl TableKind {
    /// Fixed id offset between the owner and its table.
    pub const fn offset(self) -> u32 {
        match self {
            TableKind::Hierarchy => HIERARCHY_TABLE_OFFSET,
            TableKind::Contents => CONTENTS_TABLE_OFFSET,
            TableKind::Attachment => ATTACHMENT_TABLE_OFFSET,
        }
    }

    /// Table kinds owned by a node of type `owner`.
    pub fn owned_by(owner: NodeType) -> &'static [TableKind] {
        if owner == NodeType::NormalFolder {
            &[TableKind::Hierarchy, TableKind::Contents]
        } else if owner == NodeType::NormalMessage {
            &[TableKind::Attachment]
        } else {
            &[]
        }
    }

    /// Table of the parent that lists a child of type `child`.
    pub fn listing(child: NodeType) -> Option<TableKind> {
        match child {
            NodeType::NormalFolder | NodeType::SearchFolder => Some(TableKind::Hierarchy),
            NodeType::NormalMessage | NodeType::AssociatedMessage => Some(TableKind::Contents),
            NodeType::Attachment => Some(TableKind::Attachment),
            _ => None,
        }
    }
}

/// Id of the `kind` companion table of `owner_id`.
pub fn companion_id(owner_id: u32, kind: TableKind) -> u32 {
    owner_id.wrapping_add(kind.offset())
}

/// Errors surfaced by the node directory and property codec.
#[derive(thiserror::Error, Debug)]
pub enum PstError {
    /// Low-level I/O failure below the directory boundary.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Page structure or payload could not be interpreted.
    #[error("corrupted: {0}")]
    Corrupted(String),
    /// The operation requires a node that does not exist.
    #[error("node {0:#x} not found")]
    NotFound(u32),
    /// Mutation attempted on a read-only container.
    #[error("access denied: {0} on read-only container")]
    AccessDenied(&'static str),
    /// The heap could not grow the file or write the range.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),
    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration could not be read or parsed.
    #[error("configuration: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PstError>;
