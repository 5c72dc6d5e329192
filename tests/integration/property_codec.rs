use pst_nodes::primitives::io::{FileStore, MemStore};
use pst_nodes::storage::props::{decode_block, encode_block, ids, Layout, WIDE_MAGIC};
use pst_nodes::storage::{
    DirectoryOptions, FormatKind, NodeDirectory, NodeEntry, PropertyContext, PropertySet,
    PropertyTag, PropertyType, PropertyValue,
};
use pst_nodes::types::{node_type, NodeId, PstError, Result};
use proptest::prelude::*;
use tempfile::tempdir;
use time::macros::datetime;
use time::OffsetDateTime;

fn message(index: u32) -> u32 {
    NodeId::compose(node_type::NORMAL_MESSAGE, index).0
}

fn folder(index: u32) -> u32 {
    NodeId::compose(node_type::NORMAL_FOLDER, index).0
}

#[test]
fn properties_survive_a_file_reopen() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("archive.pst");
    let id = message(7);
    let received = datetime!(2021-06-01 08:15:00 UTC);
    let attachment_blob: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
    {
        let mut dir = NodeDirectory::open(FileStore::open(&path)?, DirectoryOptions::default())?;
        let root = dir.root_id();
        dir.add(NodeEntry::new(id, 0, root), &[])?;
        let mut ctx = PropertyContext::open(&mut dir, id)?;
        ctx.set(ids::SUBJECT, PropertyType::Unicode, PropertyValue::Str("Grüße aus Köln".into()))?;
        ctx.set(ids::SENDER_NAME, PropertyType::Unicode, PropertyValue::Str("Ana".into()))?;
        ctx.set(
            ids::MESSAGE_DELIVERY_TIME,
            PropertyType::SystemTime,
            PropertyValue::SystemTime(received),
        )?;
        ctx.set(0x6700, PropertyType::Int64, PropertyValue::Int64(-1))?;
        ctx.set(0x6701, PropertyType::Double, PropertyValue::Double(0.125))?;
        ctx.set(0x6702, PropertyType::Binary, PropertyValue::Binary(attachment_blob.clone()))?;
        assert!(ctx.save()?);
        assert_eq!(ctx.entry().sender_name.as_deref(), Some("Ana"));
    }

    let mut dir = NodeDirectory::open(FileStore::open_read_only(&path)?, DirectoryOptions::default())?;
    let mut ctx = PropertyContext::open(&mut dir, id)?;
    assert!(ctx.load());
    assert_eq!(ctx.get_string(ids::SUBJECT).as_deref(), Some("Grüße aus Köln"));
    assert_eq!(ctx.get_time(ids::MESSAGE_DELIVERY_TIME), Some(received));
    assert_eq!(ctx.get_int64(0x6700), Some(-1));
    assert_eq!(ctx.get_double(0x6701), Some(0.125));
    assert_eq!(ctx.get_binary(0x6702), Some(attachment_blob));
    let tags: Vec<u32> = ctx.properties().map(|(tag, _)| tag.raw()).collect();
    let mut sorted = tags.clone();
    sorted.sort_unstable();
    assert_eq!(tags, sorted);

    let err = ctx
        .set(ids::SUBJECT, PropertyType::Unicode, PropertyValue::Str("nope".into()))
        .unwrap_err();
    assert!(matches!(err, PstError::AccessDenied(_)));
    Ok(())
}

#[test]
fn ansi_containers_write_the_narrow_layout() -> Result<()> {
    let mut dir = NodeDirectory::open(MemStore::new(), DirectoryOptions::new(FormatKind::Ansi))?;
    let root = dir.root_id();
    let id = folder(40);
    dir.add(NodeEntry::new(id, 0, root), &[])?;
    {
        let mut ctx = PropertyContext::open(&mut dir, id)?;
        ctx.set(ids::DISPLAY_NAME, PropertyType::String8, PropertyValue::Str("Café".into()))?;
        ctx.save()?;
    }
    let payload = dir.read_payload(id)?;
    assert_ne!(&payload[..4], &WIDE_MAGIC.to_le_bytes());
    // Defaults were loaded before the edit, so they are saved alongside it.
    let decoded = decode_block(&payload);
    assert!(decoded.clean);
    assert_eq!(
        decoded
            .properties
            .get(&PropertyTag::new(ids::DISPLAY_NAME, PropertyType::String8)),
        Some(&PropertyValue::Str("Café".into()))
    );
    // One byte per character in the narrow code page.
    assert!(payload.windows(4).any(|w| w == [b'C', b'a', b'f', 0xE9]));
    assert_eq!(dir.find(id)?.unwrap().display_name.as_deref(), Some("Café"));
    Ok(())
}

#[test]
fn ansi_subjects_outside_the_code_page_are_refused() -> Result<()> {
    let mut dir = NodeDirectory::open(MemStore::new(), DirectoryOptions::new(FormatKind::Ansi))?;
    let root = dir.root_id();
    let id = message(9);
    dir.add(NodeEntry::new(id, 0, root), &[])?;
    {
        let mut ctx = PropertyContext::open(&mut dir, id)?;
        let err = ctx
            .set(ids::SUBJECT, PropertyType::String8, PropertyValue::Str("ok ✓ 日本".into()))
            .unwrap_err();
        assert!(matches!(err, PstError::Invalid(_)));
        ctx.set(ids::SUBJECT, PropertyType::Unicode, PropertyValue::Str("ok ✓ 日本".into()))?;
        ctx.save()?;
    }
    let mut ctx = PropertyContext::open(&mut dir, id)?;
    assert_eq!(ctx.get_string(ids::SUBJECT).as_deref(), Some("ok ✓ 日本"));
    assert!(ctx.get(ids::SUBJECT, PropertyType::String8).is_some());
    Ok(())
}

#[test]
fn growing_a_block_moves_the_payload() -> Result<()> {
    let mut dir = NodeDirectory::open(MemStore::new(), DirectoryOptions::default())?;
    let root = dir.root_id();
    let id = message(1);
    let small = dir.add(NodeEntry::new(id, 0, root), &encode_block(&PropertySet::new(), Layout::Wide)?)?;
    let neighbour = dir.add(NodeEntry::new(message(2), 0, root), b"neighbour")?;

    let mut ctx = PropertyContext::open(&mut dir, id)?;
    assert!(ctx.load());
    ctx.set(0x1000, PropertyType::Unicode, PropertyValue::Str("x".repeat(2000)))?;
    ctx.save()?;
    let moved = ctx.entry().clone();
    assert_ne!(moved.data_offset(), small.data_offset());
    assert_eq!(dir.read_payload(message(2))?, b"neighbour");
    assert_eq!(dir.find(message(2))?.unwrap().data_offset(), neighbour.data_offset());
    Ok(())
}

#[test]
fn deleted_properties_stay_deleted() -> Result<()> {
    let mut dir = NodeDirectory::open(MemStore::new(), DirectoryOptions::default())?;
    let root = dir.root_id();
    {
        let mut ctx = PropertyContext::open(&mut dir, root)?;
        ctx.set(0x6000, PropertyType::Boolean, PropertyValue::Bool(true))?;
        assert!(ctx.delete(ids::CONTENT_UNREAD_COUNT, PropertyType::Int32)?);
        ctx.save()?;
    }
    let mut ctx = PropertyContext::open(&mut dir, root)?;
    assert!(ctx.load());
    assert_eq!(ctx.get_bool(0x6000), Some(true));
    assert_eq!(ctx.get_int32(ids::CONTENT_UNREAD_COUNT), None);
    assert_eq!(ctx.get_int32(ids::CONTENT_COUNT), Some(0));
    Ok(())
}

fn arb_time() -> impl Strategy<Value = OffsetDateTime> {
    // Year 1000 up to the end of 9999, at nanosecond precision.
    (-30_610_224_000i64..253_402_300_799i64, 0i64..1_000_000_000).prop_map(|(secs, nanos)| {
        OffsetDateTime::from_unix_timestamp_nanos(secs as i128 * 1_000_000_000 + nanos as i128)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    })
}

fn arb_value() -> impl Strategy<Value = (PropertyType, PropertyValue)> {
    prop_oneof![
        any::<bool>().prop_map(|v| (PropertyType::Boolean, PropertyValue::Bool(v))),
        any::<i32>().prop_map(|v| (PropertyType::Int32, PropertyValue::Int32(v))),
        any::<i64>().prop_map(|v| (PropertyType::Int64, PropertyValue::Int64(v))),
        any::<f64>()
            .prop_filter("NaN never compares equal", |v| !v.is_nan())
            .prop_map(|v| (PropertyType::Double, PropertyValue::Double(v))),
        arb_time().prop_map(|at| (PropertyType::SystemTime, PropertyValue::SystemTime(at))),
        "[ -~\u{A0}-\u{FF}\u{20AC}]{0,40}"
            .prop_map(|s| (PropertyType::String8, PropertyValue::Str(s))),
        "\\PC{0,20}".prop_map(|s| (PropertyType::String8, PropertyValue::Str(s))),
        "\\PC{0,20}".prop_map(|s| (PropertyType::Unicode, PropertyValue::Str(s))),
        prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(|v| (PropertyType::Binary, PropertyValue::Binary(v))),
    ]
}

/// Builds a set, keeping only values the wire format can hold.
fn storable(entries: Vec<(u16, (PropertyType, PropertyValue))>) -> PropertySet {
    entries
        .into_iter()
        .filter_map(|(id, (ty, value))| Some((PropertyTag::new(id, ty), value.normalized(ty)?)))
        .collect()
}

proptest! {
    #[test]
    fn arbitrary_sets_round_trip_or_are_rejected(
        entries in prop::collection::vec((any::<u16>(), arb_value()), 0..40),
        wide in any::<bool>(),
    ) {
        let layout = if wide { Layout::Wide } else { Layout::Narrow };
        let raw: PropertySet = entries
            .iter()
            .map(|(id, (ty, value))| (PropertyTag::new(*id, *ty), value.clone()))
            .collect();
        let normalized: Option<PropertySet> = raw
            .iter()
            .map(|(tag, value)| Some((*tag, value.clone().normalized(tag.property_type())?)))
            .collect();
        match normalized {
            None => prop_assert!(encode_block(&raw, layout).is_err()),
            Some(set) => {
                let bytes = encode_block(&set, layout).unwrap();
                let decoded = decode_block(&bytes);
                prop_assert!(decoded.clean);
                prop_assert_eq!(decoded.properties, set);
            }
        }
    }

    #[test]
    fn set_values_read_back_unchanged_after_save(
        entries in prop::collection::vec((0x6000u16..0x6040, arb_value()), 1..16),
        ansi in any::<bool>(),
    ) {
        let format = if ansi { FormatKind::Ansi } else { FormatKind::Unicode };
        let mut dir = NodeDirectory::open(MemStore::new(), DirectoryOptions::new(format)).unwrap();
        let root = dir.root_id();
        let id = message(1);
        dir.add(NodeEntry::new(id, 0, root), &[]).unwrap();
        let mut expected = PropertySet::new();
        {
            let mut ctx = PropertyContext::open(&mut dir, id).unwrap();
            for (pid, (ty, value)) in entries {
                let tag = PropertyTag::new(pid, ty);
                match value.clone().normalized(ty) {
                    Some(stored) => {
                        ctx.set(pid, ty, value).unwrap();
                        prop_assert_eq!(ctx.get(pid, ty), Some(&stored));
                        expected.insert(tag, stored);
                    }
                    None => {
                        let err = ctx.set(pid, ty, value).unwrap_err();
                        prop_assert!(matches!(err, PstError::Invalid(_)));
                    }
                }
            }
            ctx.save().unwrap();
        }
        let mut ctx = PropertyContext::open(&mut dir, id).unwrap();
        for (tag, value) in &expected {
            prop_assert_eq!(ctx.get(tag.id(), tag.property_type()), Some(value));
        }
    }

    #[test]
    fn truncated_blocks_keep_every_complete_record(
        entries in prop::collection::vec((0u16..64, arb_value()), 1..20),
        cut in any::<prop::sample::Index>(),
    ) {
        let set = storable(entries);
        prop_assume!(!set.is_empty());
        let bytes = encode_block(&set, Layout::Wide).unwrap();
        let keep = cut.index(bytes.len());
        let decoded = decode_block(&bytes[..keep]);
        prop_assert!(!decoded.clean);
        let mut prefix = PropertySet::new();
        for (tag, value) in &set {
            prefix.insert(*tag, value.clone());
            if encode_block(&prefix, Layout::Wide).unwrap().len() > keep {
                break;
            }
            prop_assert!(decoded.properties.contains_key(tag));
        }
    }
}
