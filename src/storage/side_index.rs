//! Rebuildable JSON-lines index of resolved directory entries.
//!
//! The B-tree stays authoritative. On open, a record only enriches the
//! matching entry when every structural field agrees with the tree.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{PstError, Result};

use super::node::NodeEntry;

/// One line of the side index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideIndexRecord {
    /// Primary key.
    pub node_id: u32,
    /// Secondary identifier.
    pub data_id: u32,
    /// Owning node.
    pub parent_id: u32,
    /// Payload start.
    pub data_offset: u64,
    /// Payload length.
    pub data_size: u32,
    /// Cached display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Cached subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Cached sender name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Cached sender address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_email: Option<String>,
    /// Cached submit time, ms since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_date: Option<i64>,
    /// Cached message size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_size: Option<u32>,
    /// Cached attachment flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_attachment: Option<bool>,
    /// Extension fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl SideIndexRecord {
    /// Captures everything the index stores about `entry`.
    pub fn from_entry(entry: &NodeEntry) -> Self {
        Self {
            node_id: entry.node_id(),
            data_id: entry.data_id,
            parent_id: entry.parent_id,
            data_offset: entry.data_offset(),
            data_size: entry.data_size(),
            display_name: entry.display_name.clone(),
            subject: entry.subject.clone(),
            sender_name: entry.sender_name.clone(),
            sender_email: entry.sender_email.clone(),
            sent_date: entry.sent_date,
            message_size: entry.message_size,
            has_attachment: entry.has_attachment,
            metadata: entry.metadata.clone(),
        }
    }

    /// True when the structural fields agree with `entry`.
    pub fn matches(&self, entry: &NodeEntry) -> bool {
        self.node_id == entry.node_id()
            && self.data_id == entry.data_id
            && self.parent_id == entry.parent_id
            && self.data_offset == entry.data_offset()
            && self.data_size == entry.data_size()
    }

    /// Rebuilds the entry this record describes.
    pub fn to_entry(&self) -> NodeEntry {
        let mut entry = NodeEntry::new(self.node_id, self.data_id, self.parent_id);
        entry.set_location(self.data_offset, self.data_size);
        entry.display_name = self.display_name.clone();
        entry.subject = self.subject.clone();
        entry.sender_name = self.sender_name.clone();
        entry.sender_email = self.sender_email.clone();
        entry.sent_date = self.sent_date;
        entry.message_size = self.message_size;
        entry.has_attachment = self.has_attachment;
        entry.metadata = self.metadata.clone();
        entry
    }
}

/// Reads every record; `Ok(None)` when the file does not exist.
pub fn read(path: &Path) -> Result<Option<Vec<SideIndexRecord>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(PstError::from(err)),
    };
    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|err| {
            PstError::Corrupted(format!("side index line {}: {err}", line_no + 1))
        })?;
        records.push(record);
    }
    Ok(Some(records))
}

/// Replaces the index at `path` with one line per entry.
pub fn write<'a>(path: &Path, entries: impl IntoIterator<Item = &'a NodeEntry>) -> Result<()> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    if let Some(parent) = tmp.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut out = BufWriter::new(file);
        for entry in entries {
            serde_json::to_writer(&mut out, &SideIndexRecord::from_entry(entry))
                .map_err(|err| PstError::Corrupted(format!("side index encode: {err}")))?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
