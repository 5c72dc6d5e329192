//! Property tags, values and the property block wire format.
//!
//! A block is a header followed by records in tag order:
//!
//! ```text
//! narrow: {count:i32} record*
//! wide:   {magic:u32 = 0x5043_5557} {count:i32} record*
//! record: {id:u16} {type:u16} value
//! value:  fixed-width little-endian, or {size:i32}{bytes} for strings and binary
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Cursor, ErrorKind, Read};

use time::OffsetDateTime;
use tracing::warn;

use crate::primitives::bytes::{BinaryCursor, StringEncoding};
use crate::types::Result;

/// Leading signature of the wide layout ("WUCP" as little-endian bytes).
pub const WIDE_MAGIC: u32 = 0x5043_5557;
/// Largest property count accepted from a block header.
pub const MAX_PROPERTY_COUNT: i32 = 10_000;
/// Recovery stops after this many records.
pub const RECOVERY_MAX_PROPERTIES: usize = 100;
/// Recovery never looks further than this many bytes past the header.
pub const RECOVERY_MAX_BYTES: usize = 1 << 20;

/// FILETIME ticks between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: i128 = 116_444_736_000_000_000;

/// Well-known property ids.
#[allow(missing_docs)]
pub mod ids {
    pub const MESSAGE_CLASS: u16 = 0x001A;
    pub const SUBJECT: u16 = 0x0037;
    pub const CLIENT_SUBMIT_TIME: u16 = 0x0039;
    pub const SENDER_NAME: u16 = 0x0C1A;
    pub const SENDER_EMAIL_ADDRESS: u16 = 0x0C1F;
    pub const MESSAGE_DELIVERY_TIME: u16 = 0x0E06;
    pub const MESSAGE_FLAGS: u16 = 0x0E07;
    pub const MESSAGE_SIZE: u16 = 0x0E08;
    pub const ATTACH_SIZE: u16 = 0x0E20;
    pub const DISPLAY_NAME: u16 = 0x3001;
    pub const CREATION_TIME: u16 = 0x3007;
    pub const LAST_MODIFICATION_TIME: u16 = 0x3008;
    pub const CONTENT_COUNT: u16 = 0x3602;
    pub const CONTENT_UNREAD_COUNT: u16 = 0x3603;
    pub const SUBFOLDERS: u16 = 0x360A;
    pub const ATTACH_FILENAME: u16 = 0x3704;
    pub const ATTACH_METHOD: u16 = 0x3705;
    pub const ATTACH_LONG_FILENAME: u16 = 0x3707;
}

/// `MESSAGE_FLAGS` bit set when the message has attachments.
pub const MSGFLAG_HASATTACH: i32 = 0x10;

/// Wire type of a property value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum PropertyType {
    /// One byte, non-zero is true.
    Boolean,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// IEEE-754 double.
    Double,
    /// FILETIME: 100 ns ticks since 1601-01-01 UTC.
    SystemTime,
    /// Narrow (windows-1252) string.
    String8,
    /// Wide (UTF-16LE) string.
    Unicode,
    /// Opaque bytes.
    Binary,
}

impl PropertyType {
    /// Value written in the record's type field.
    pub const fn code(self) -> u16 {
        match self {
            PropertyType::Boolean => 0x000B,
            PropertyType::Int32 => 0x0003,
            PropertyType::Int64 => 0x0014,
            PropertyType::Double => 0x0005,
            PropertyType::SystemTime => 0x0040,
            PropertyType::String8 => 0x001E,
            PropertyType::Unicode => 0x001F,
            PropertyType::Binary => 0x0102,
        }
    }

    /// Parses a type field; anything outside the supported set is `None`.
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x000B => PropertyType::Boolean,
            0x0003 => PropertyType::Int32,
            0x0014 => PropertyType::Int64,
            0x0005 => PropertyType::Double,
            0x0040 => PropertyType::SystemTime,
            0x001E => PropertyType::String8,
            0x001F => PropertyType::Unicode,
            0x0102 => PropertyType::Binary,
            _ => return None,
        })
    }

    /// True for the two string types.
    pub fn is_string(self) -> bool {
        matches!(self, PropertyType::String8 | PropertyType::Unicode)
    }
}

/// Property id and type combined as `type << 16 | id`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PropertyTag(u32);

impl PropertyTag {
    /// Combines an id and a type.
    pub const fn new(id: u16, ty: PropertyType) -> Self {
        PropertyTag(((ty.code() as u32) << 16) | id as u32)
    }

    /// Property id.
    pub const fn id(self) -> u16 {
        self.0 as u16
    }

    /// Property type.
    pub fn property_type(self) -> PropertyType {
        // Tags are only built from a valid PropertyType.
        PropertyType::from_code((self.0 >> 16) as u16).unwrap_or(PropertyType::Binary)
    }

    /// Combined 32-bit form.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PropertyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyTag({:#010x})", self.0)
    }
}

/// Typed property value.
///
/// Narrow and wide strings are both `Str`; the tag decides the encoding.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    /// Boolean.
    Bool(bool),
    /// 32-bit integer.
    Int32(i32),
    /// 64-bit integer.
    Int64(i64),
    /// Double.
    Double(f64),
    /// Point in time, stored with 100 ns resolution.
    SystemTime(OffsetDateTime),
    /// Text.
    Str(String),
    /// Bytes.
    Binary(Vec<u8>),
}

impl PropertyValue {
    /// True when the value can be stored under a tag of type `ty`.
    pub fn fits(&self, ty: PropertyType) -> bool {
        matches!(
            (self, ty),
            (PropertyValue::Bool(_), PropertyType::Boolean)
                | (PropertyValue::Int32(_), PropertyType::Int32)
                | (PropertyValue::Int64(_), PropertyType::Int64)
                | (PropertyValue::Double(_), PropertyType::Double)
                | (PropertyValue::SystemTime(_), PropertyType::SystemTime)
                | (PropertyValue::Str(_), PropertyType::String8 | PropertyType::Unicode)
                | (PropertyValue::Binary(_), PropertyType::Binary)
        )
    }

    /// The value as it reads back after being stored under `ty`.
    ///
    /// Times are truncated to 100 ns ticks. `None` when the value does not
    /// fit `ty`, a time precedes 1601, or a narrow string holds characters
    /// outside windows-1252.
    pub fn normalized(self, ty: PropertyType) -> Option<PropertyValue> {
        if !self.fits(ty) {
            return None;
        }
        match self {
            PropertyValue::SystemTime(at) => {
                from_filetime(to_filetime(at)?).map(PropertyValue::SystemTime)
            }
            PropertyValue::Str(s) if ty == PropertyType::String8 => {
                StringEncoding::Ansi.encode(&s).ok()?;
                Some(PropertyValue::Str(s))
            }
            other => Some(other),
        }
    }
}

/// Properties of one node, ordered by tag.
pub type PropertySet = BTreeMap<PropertyTag, PropertyValue>;

/// Block header shape.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Layout {
    /// Count only.
    Narrow,
    /// Magic, then count.
    Wide,
}

/// Outcome of decoding a block.
#[derive(Clone, Debug, Default)]
pub struct Decoded {
    /// Properties that could be read.
    pub properties: PropertySet,
    /// True when the header and every record parsed without recovery.
    pub clean: bool,
    /// Bytes skipped while resynchronising.
    pub skipped: usize,
}

/// Converts a FILETIME tick count.
pub fn from_filetime(ticks: u64) -> Option<OffsetDateTime> {
    let nanos = (ticks as i128 - FILETIME_UNIX_EPOCH) * 100;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

/// Converts to FILETIME ticks, dropping precision below 100 ns.
///
/// `None` for instants before 1601-01-01 UTC.
pub fn to_filetime(value: OffsetDateTime) -> Option<u64> {
    let ticks = value.unix_timestamp_nanos().div_euclid(100) + FILETIME_UNIX_EPOCH;
    u64::try_from(ticks).ok()
}

/// Decodes a property block, falling back to the recovery scanner when
/// the header is implausible or any record fails to parse. Never fails.
pub fn decode_block(bytes: &[u8]) -> Decoded {
    let Some((header_len, count)) = read_header(bytes) else {
        return recover(bytes, 0);
    };
    if !(0..=MAX_PROPERTY_COUNT).contains(&count) {
        warn!(count, "props.header.implausible_count");
        return recover(bytes, header_len);
    }
    let mut cur = BinaryCursor::new(Cursor::new(&bytes[header_len..]));
    let mut properties = PropertySet::new();
    for _ in 0..count {
        match read_record(&mut cur) {
            Ok((tag, value)) => {
                properties.insert(tag, value);
            }
            Err(err) => {
                warn!(error = %err, parsed = properties.len(), count, "props.record.unreadable");
                return recover(bytes, header_len);
            }
        }
    }
    Decoded {
        properties,
        clean: true,
        skipped: 0,
    }
}

fn read_header(bytes: &[u8]) -> Option<(usize, i32)> {
    let word = |at: usize| -> Option<[u8; 4]> { bytes.get(at..at + 4)?.try_into().ok() };
    let first = word(0)?;
    if u32::from_le_bytes(first) == WIDE_MAGIC {
        return Some((8, i32::from_le_bytes(word(4)?)));
    }
    Some((4, i32::from_le_bytes(first)))
}

/// Best-effort scan for records starting at `start`.
///
/// A position that does not begin a well-formed record is abandoned one
/// byte at a time. Stops after [`RECOVERY_MAX_PROPERTIES`] records or
/// [`RECOVERY_MAX_BYTES`] bytes.
pub fn recover(bytes: &[u8], start: usize) -> Decoded {
    let end = bytes.len().min(start.saturating_add(RECOVERY_MAX_BYTES));
    let window = bytes.get(..end).unwrap_or(&[]);
    let mut decoded = Decoded::default();
    let mut recovered = 0usize;
    let mut pos = start;
    while pos + 4 <= end && recovered < RECOVERY_MAX_PROPERTIES {
        let mut cur = BinaryCursor::new(Cursor::new(&window[pos..]));
        match read_record(&mut cur) {
            Ok((tag, value)) => {
                decoded.properties.insert(tag, value);
                recovered += 1;
                let consumed = cur.position().map_or(1, |p| p as usize).max(1);
                pos += consumed;
            }
            Err(_) => {
                pos += 1;
                decoded.skipped += 1;
            }
        }
    }
    if recovered > 0 || decoded.skipped > 0 {
        warn!(
            recovered,
            skipped = decoded.skipped,
            "props.recovery.scanned"
        );
    }
    decoded
}

fn invalid(what: &'static str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, what)
}

fn read_record<R: Read + io::Seek>(
    cur: &mut BinaryCursor<R>,
) -> io::Result<(PropertyTag, PropertyValue)> {
    let id = cur.read_u16()?;
    let code = cur.read_u16()?;
    let ty = PropertyType::from_code(code).ok_or_else(|| invalid("unknown property type"))?;
    let value = match ty {
        PropertyType::Boolean => PropertyValue::Bool(cur.read_bool()?),
        PropertyType::Int32 => PropertyValue::Int32(cur.read_i32()?),
        PropertyType::Int64 => PropertyValue::Int64(cur.read_i64()?),
        PropertyType::Double => PropertyValue::Double(cur.read_f64()?),
        PropertyType::SystemTime => PropertyValue::SystemTime(
            from_filetime(cur.read_u64()?).ok_or_else(|| invalid("time out of range"))?,
        ),
        PropertyType::String8 | PropertyType::Unicode | PropertyType::Binary => {
            let size = cur.read_i32()?;
            if size < 0 || size as u64 > cur.remaining()? {
                return Err(invalid("implausible value size"));
            }
            let raw = cur.read_bytes(size as usize)?;
            match ty {
                PropertyType::String8 => PropertyValue::Str(StringEncoding::Ansi.decode(&raw)),
                PropertyType::Unicode => PropertyValue::Str(StringEncoding::Utf16Le.decode(&raw)),
                _ => PropertyValue::Binary(raw),
            }
        }
    };
    Ok((PropertyTag::new(id, ty), value))
}

/// Serialises `set` in tag order.
///
/// The count is written last, over the placeholder in the header. Fails
/// rather than substituting when a narrow string holds characters outside
/// windows-1252 or a time precedes 1601.
pub fn encode_block(set: &PropertySet, layout: Layout) -> Result<Vec<u8>> {
    let mut cur = BinaryCursor::new(Cursor::new(Vec::new()));
    if layout == Layout::Wide {
        cur.write_u32(WIDE_MAGIC)?;
    }
    let count_at = cur.position()?;
    cur.write_i32(0)?;
    let mut written = 0i32;
    for (tag, value) in set {
        let ty = tag.property_type();
        cur.write_u16(tag.id())?;
        cur.write_u16(ty.code())?;
        match value {
            PropertyValue::Bool(v) => cur.write_bool(*v)?,
            PropertyValue::Int32(v) => cur.write_i32(*v)?,
            PropertyValue::Int64(v) => cur.write_i64(*v)?,
            PropertyValue::Double(v) => cur.write_f64(*v)?,
            PropertyValue::SystemTime(v) => {
                let ticks = to_filetime(*v).ok_or_else(|| {
                    io::Error::new(ErrorKind::InvalidInput, "time before 1601")
                })?;
                cur.write_u64(ticks)?;
            }
            PropertyValue::Str(s) => {
                let encoding = if ty == PropertyType::Unicode {
                    StringEncoding::Utf16Le
                } else {
                    StringEncoding::Ansi
                };
                cur.write_length_prefixed_string(s, encoding)?;
            }
            PropertyValue::Binary(bytes) => {
                let len = i32::try_from(bytes.len()).map_err(|_| {
                    io::Error::new(ErrorKind::InvalidInput, "binary value too large")
                })?;
                cur.write_i32(len)?;
                cur.write_bytes(bytes)?;
            }
        }
        written += 1;
    }
    cur.write_at(count_at, |c| c.write_i32(written))?;
    Ok(cur.into_inner().into_inner())
}
