//! Typed property access for one node's payload.

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::primitives::bytes::StringEncoding;
use crate::primitives::io::BackingStore;
use crate::types::{NodeType, PstError, Result};

use super::directory::NodeDirectory;
use super::node::NodeEntry;
use super::options::FormatKind;
use super::props::{
    self, ids, Layout, PropertySet, PropertyTag, PropertyType, PropertyValue, MSGFLAG_HASATTACH,
};

/// Decoded property set of a single node, bound to the directory that
/// stores it.
///
/// Properties are loaded lazily on first access. Changes stay in memory
/// until [`PropertyContext::save`] writes the block back.
pub struct PropertyContext<'d, S: BackingStore> {
    directory: &'d mut NodeDirectory<S>,
    entry: NodeEntry,
    properties: PropertySet,
    loaded: bool,
    dirty: bool,
}

impl<'d, S: BackingStore> PropertyContext<'d, S> {
    /// Binds to `entry`; nothing is read until the first access.
    pub fn new(directory: &'d mut NodeDirectory<S>, entry: NodeEntry) -> Self {
        Self {
            directory,
            entry,
            properties: PropertySet::new(),
            loaded: false,
            dirty: false,
        }
    }

    /// Resolves `node_id` through the directory and binds to it.
    pub fn open(directory: &'d mut NodeDirectory<S>, node_id: u32) -> Result<Self> {
        let entry = directory.find(node_id)?.ok_or(PstError::NotFound(node_id))?;
        Ok(Self::new(directory, entry))
    }

    /// Entry the context is bound to, refreshed after each save.
    pub fn entry(&self) -> &NodeEntry {
        &self.entry
    }

    /// True when there are unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Reads and decodes the payload. Never fails.
    ///
    /// Returns `true` when the block parsed cleanly. Otherwise whatever the
    /// recovery scan found is kept, and a node with nothing recoverable is
    /// given the defaults for its type.
    pub fn load(&mut self) -> bool {
        self.loaded = true;
        self.dirty = false;
        let node_id = self.entry.node_id();
        let payload = match self.directory.read_entry_payload(&self.entry) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(node_id, error = %err, "props.load.unreadable");
                self.properties = self.defaults(0);
                self.directory.metrics().degraded_read("defaults");
                return false;
            }
        };
        let decoded = props::decode_block(&payload);
        if decoded.clean {
            debug!(node_id, count = decoded.properties.len(), "props.load");
            self.properties = decoded.properties;
            return true;
        }
        self.directory.metrics().degraded_read("recovered");
        if decoded.properties.is_empty() {
            warn!(node_id, size = payload.len(), "props.load.defaults");
            self.directory.metrics().degraded_read("defaults");
            self.properties = self.defaults(payload.len());
        } else {
            warn!(
                node_id,
                recovered = decoded.properties.len(),
                skipped = decoded.skipped,
                "props.load.recovered"
            );
            self.properties = decoded.properties;
        }
        false
    }

    fn ensure_loaded(&mut self) {
        if !self.loaded {
            self.load();
        }
    }

    fn string_type(&self) -> PropertyType {
        match self.directory.format() {
            FormatKind::Unicode => PropertyType::Unicode,
            FormatKind::Ansi => PropertyType::String8,
        }
    }

    fn defaults(&self, payload_size: usize) -> PropertySet {
        let text = self.string_type();
        let kind = self.entry.node_type();
        let now = PropertyValue::SystemTime(OffsetDateTime::now_utc());
        let mut set = PropertySet::new();
        let mut put = |id: u16, ty: PropertyType, value: PropertyValue| {
            if let Some(value) = value.normalized(ty) {
                set.insert(PropertyTag::new(id, ty), value);
            }
        };
        if kind.is_folder() {
            let name = self
                .entry
                .display_name
                .clone()
                .filter(|name| {
                    text == PropertyType::Unicode || StringEncoding::Ansi.encode(name).is_ok()
                })
                .unwrap_or_else(|| "Unnamed Folder".into());
            put(ids::DISPLAY_NAME, text, PropertyValue::Str(name));
            put(ids::CONTENT_COUNT, PropertyType::Int32, PropertyValue::Int32(0));
            put(ids::CONTENT_UNREAD_COUNT, PropertyType::Int32, PropertyValue::Int32(0));
            put(ids::SUBFOLDERS, PropertyType::Boolean, PropertyValue::Bool(false));
        } else if kind.is_message() {
            put(ids::SUBJECT, text, PropertyValue::Str(String::new()));
            put(ids::MESSAGE_CLASS, text, PropertyValue::Str("IPM.Note".into()));
            for id in [
                ids::CREATION_TIME,
                ids::LAST_MODIFICATION_TIME,
                ids::MESSAGE_DELIVERY_TIME,
                ids::CLIENT_SUBMIT_TIME,
            ] {
                put(id, PropertyType::SystemTime, now.clone());
            }
            put(ids::MESSAGE_FLAGS, PropertyType::Int32, PropertyValue::Int32(0));
            let size = i32::try_from(payload_size).unwrap_or(i32::MAX);
            put(ids::MESSAGE_SIZE, PropertyType::Int32, PropertyValue::Int32(size));
        } else if kind == NodeType::Attachment {
            put(ids::ATTACH_FILENAME, text, PropertyValue::Str("attachment".into()));
            put(ids::ATTACH_LONG_FILENAME, text, PropertyValue::Str("attachment".into()));
            put(ids::ATTACH_METHOD, PropertyType::Int32, PropertyValue::Int32(1));
            put(ids::ATTACH_SIZE, PropertyType::Int32, PropertyValue::Int32(0));
        }
        set
    }

    /// Value stored under `id` with type `ty`.
    pub fn get(&mut self, id: u16, ty: PropertyType) -> Option<&PropertyValue> {
        self.ensure_loaded();
        self.properties.get(&PropertyTag::new(id, ty))
    }

    /// String under `id`, preferring the wide form over the narrow one.
    pub fn get_string(&mut self, id: u16) -> Option<String> {
        [PropertyType::Unicode, PropertyType::String8]
            .into_iter()
            .find_map(|ty| match self.get(id, ty) {
                Some(PropertyValue::Str(s)) => Some(s.clone()),
                _ => None,
            })
    }

    /// 32-bit integer under `id`.
    pub fn get_int32(&mut self, id: u16) -> Option<i32> {
        match self.get(id, PropertyType::Int32) {
            Some(PropertyValue::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    /// 64-bit integer under `id`.
    pub fn get_int64(&mut self, id: u16) -> Option<i64> {
        match self.get(id, PropertyType::Int64) {
            Some(PropertyValue::Int64(v)) => Some(*v),
            _ => None,
        }
    }

    /// Double under `id`.
    pub fn get_double(&mut self, id: u16) -> Option<f64> {
        match self.get(id, PropertyType::Double) {
            Some(PropertyValue::Double(v)) => Some(*v),
            _ => None,
        }
    }

    /// Boolean under `id`.
    pub fn get_bool(&mut self, id: u16) -> Option<bool> {
        match self.get(id, PropertyType::Boolean) {
            Some(PropertyValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Timestamp under `id`.
    pub fn get_time(&mut self, id: u16) -> Option<OffsetDateTime> {
        match self.get(id, PropertyType::SystemTime) {
            Some(PropertyValue::SystemTime(v)) => Some(*v),
            _ => None,
        }
    }

    /// Binary value under `id`.
    pub fn get_binary(&mut self, id: u16) -> Option<Vec<u8>> {
        match self.get(id, PropertyType::Binary) {
            Some(PropertyValue::Binary(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Sets `id` to `value`, stored as type `ty`.
    ///
    /// Times are truncated to the 100 ns resolution of the wire format, so
    /// the value read back before and after `save` is the same. Times before
    /// 1601 and narrow strings outside windows-1252 are `Invalid`.
    pub fn set(&mut self, id: u16, ty: PropertyType, value: PropertyValue) -> Result<()> {
        self.directory.ensure_writable("set_property")?;
        if !value.fits(ty) {
            return Err(PstError::Invalid("property value does not match its type"));
        }
        let value = value
            .normalized(ty)
            .ok_or(PstError::Invalid("property value not representable in its type"))?;
        self.ensure_loaded();
        self.properties.insert(PropertyTag::new(id, ty), value);
        self.dirty = true;
        Ok(())
    }

    /// Removes `id` of type `ty`; `false` when it was not present.
    pub fn delete(&mut self, id: u16, ty: PropertyType) -> Result<bool> {
        self.directory.ensure_writable("delete_property")?;
        self.ensure_loaded();
        let removed = self.properties.remove(&PropertyTag::new(id, ty)).is_some();
        self.dirty |= removed;
        Ok(removed)
    }

    /// Every property in tag order.
    pub fn properties(&mut self) -> impl Iterator<Item = (&PropertyTag, &PropertyValue)> {
        self.ensure_loaded();
        self.properties.iter()
    }

    /// Writes pending changes back to the node; `false` when there was
    /// nothing to write.
    ///
    /// Summary fields of the directory entry are refreshed from the saved
    /// properties.
    pub fn save(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let layout = match self.directory.format() {
            FormatKind::Unicode => Layout::Wide,
            FormatKind::Ansi => Layout::Narrow,
        };
        let block = props::encode_block(&self.properties, layout)?;
        let mut stored = self.directory.update_payload(&self.entry, &block)?;
        self.summarize_into(&mut stored);
        self.directory.update(&stored)?;
        debug!(
            node_id = stored.node_id(),
            count = self.properties.len(),
            size = block.len(),
            "props.save"
        );
        self.entry = stored;
        self.dirty = false;
        Ok(true)
    }

    fn summarize_into(&mut self, entry: &mut NodeEntry) {
        if let Some(name) = self
            .get_string(ids::DISPLAY_NAME)
            .or_else(|| self.get_string(ids::ATTACH_LONG_FILENAME))
        {
            entry.display_name = Some(name);
        }
        if !entry.node_type().is_message() {
            return;
        }
        if let Some(subject) = self.get_string(ids::SUBJECT) {
            entry.subject = Some(subject);
        }
        if let Some(sender) = self.get_string(ids::SENDER_NAME) {
            entry.sender_name = Some(sender);
        }
        if let Some(email) = self.get_string(ids::SENDER_EMAIL_ADDRESS) {
            entry.sender_email = Some(email);
        }
        if let Some(sent) = self.get_time(ids::CLIENT_SUBMIT_TIME) {
            entry.sent_date = i64::try_from(sent.unix_timestamp_nanos() / 1_000_000).ok();
        }
        if let Some(size) = self.get_int32(ids::MESSAGE_SIZE) {
            entry.message_size = u32::try_from(size).ok();
        }
        if let Some(flags) = self.get_int32(ids::MESSAGE_FLAGS) {
            entry.has_attachment = Some(flags & MSGFLAG_HASATTACH != 0);
        }
    }
}
