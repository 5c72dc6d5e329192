use std::sync::Arc;

use pst_nodes::primitives::io::{BackingStore, MemStore};
use pst_nodes::storage::btree::{Page, PAGE_SIZE};
use pst_nodes::storage::props::{encode_block, ids, Layout};
use pst_nodes::storage::{
    CounterMetrics, DirectoryOptions, NodeDirectory, NodeEntry, PropertyContext, PropertySet,
    PropertyTag, PropertyType, PropertyValue, ROOT_FOLDER_NAME,
};
use pst_nodes::types::{companion_id, node_type, NodeId, PstError, Result, TableKind};

const ROOT: u32 = 0x42;
const INBOX: u32 = 0x46;

fn message(index: u32) -> u32 {
    NodeId::compose(node_type::NORMAL_MESSAGE, index).0
}

fn attachment(index: u32) -> u32 {
    NodeId::compose(node_type::ATTACHMENT, index).0
}

fn with_metrics(store: MemStore) -> Result<(NodeDirectory<MemStore>, Arc<CounterMetrics>)> {
    let metrics = Arc::new(CounterMetrics::default());
    let dir = NodeDirectory::open(store, DirectoryOptions::default().metrics(metrics.clone()))?;
    Ok((dir, metrics))
}

/// Follows first children from the root page down to a leaf.
fn leftmost_leaf(store: &MemStore) -> Result<u64> {
    let mut offset = DirectoryOptions::default().root_page_offset;
    loop {
        let bytes = store.read_range(offset, PAGE_SIZE as u32)?;
        match Page::decode(offset, &bytes)? {
            Page::Leaf(_) => return Ok(offset),
            Page::Internal { entries, .. } => offset = entries[0].child,
        }
    }
}

#[test]
fn well_known_folders_are_synthesized_over_a_damaged_leaf() -> Result<()> {
    let store = MemStore::new();
    {
        let mut dir = NodeDirectory::open(store.clone(), DirectoryOptions::default())?;
        for (id, name) in [(0x43, "Top of Personal Folders"), (INBOX, "Inbox"), (0x48, "Sent Items")] {
            dir.add(NodeEntry::new(id, 0, ROOT).with_display_name(name), b"folder")?;
        }
        for i in 1..=200 {
            dir.add(NodeEntry::new(message(i), i, INBOX), format!("body {i}").as_bytes())?;
        }
    }
    let leaf = leftmost_leaf(&store)?;
    assert_ne!(leaf, DirectoryOptions::default().root_page_offset);
    store.with_bytes_mut(|bytes| bytes[leaf as usize + 40] ^= 0xFF);

    let (mut dir, metrics) = with_metrics(store.clone())?;
    let inbox = dir.find(INBOX)?.expect("synthesized inbox");
    assert_eq!(inbox.display_name.as_deref(), Some("Inbox"));
    assert_eq!(inbox.parent_id, ROOT);
    let root = dir.find(ROOT)?.expect("synthesized root");
    assert_eq!(root.display_name.as_deref(), Some(ROOT_FOLDER_NAME));
    assert_eq!(CounterMetrics::get(&metrics.synthesized_reads), 2);
    assert_eq!(dir.cached_len(), 0);

    // Ordinary nodes under the damaged page are reported, not invented.
    let err = dir.find(message(1)).unwrap_err();
    assert!(matches!(err, PstError::Corrupted(_)));
    // Nodes in healthy pages still resolve.
    assert_eq!(dir.read_payload(message(150))?, b"body 150");

    // A partial walk still lists the readable part of the tree.
    let all = dir.get_all()?;
    assert!(all.iter().any(|e| e.node_id() == ROOT));
    assert!(all.iter().any(|e| e.node_id() == message(200)));
    assert!(!all.iter().any(|e| e.node_id() == message(1)));

    // Space under the unreadable page is never handed out again.
    let len_before = store.file_length()?;
    let late = dir.add(NodeEntry::new(attachment(5000), 0, message(100)), b"late")?;
    assert!(late.data_offset() >= len_before);
    assert_eq!(dir.read_payload(message(100))?, b"body 100");
    Ok(())
}

#[test]
fn damaged_property_blocks_are_recovered() -> Result<()> {
    let (mut dir, metrics) = with_metrics(MemStore::new())?;
    let mut set = PropertySet::new();
    set.insert(
        PropertyTag::new(ids::SUBJECT, PropertyType::Unicode),
        PropertyValue::Str("Status report".into()),
    );
    set.insert(
        PropertyTag::new(ids::MESSAGE_FLAGS, PropertyType::Int32),
        PropertyValue::Int32(1),
    );
    let mut block = encode_block(&set, Layout::Wide)?;
    // Claim an implausible number of properties.
    block[4..8].copy_from_slice(&50_000i32.to_le_bytes());
    let id = message(1);
    dir.add(NodeEntry::new(id, 0, ROOT), &block)?;

    let mut ctx = PropertyContext::open(&mut dir, id)?;
    assert!(!ctx.load());
    assert_eq!(ctx.get_string(ids::SUBJECT).as_deref(), Some("Status report"));
    assert_eq!(ctx.get_int32(ids::MESSAGE_FLAGS), Some(1));
    // Recovered values are not dirty until edited.
    assert!(!ctx.is_dirty());
    assert_eq!(CounterMetrics::get(&metrics.recovered_reads), 1);
    assert_eq!(CounterMetrics::get(&metrics.default_reads), 0);
    Ok(())
}

#[test]
fn unrecoverable_blocks_fall_back_to_type_defaults() -> Result<()> {
    let (mut dir, metrics) = with_metrics(MemStore::new())?;
    let garbage = b"\xff\xff\xff\xff this is not a property block at all";
    let msg = message(1);
    dir.add(NodeEntry::new(msg, 0, ROOT), garbage)?;
    {
        let mut ctx = PropertyContext::open(&mut dir, msg)?;
        assert!(!ctx.load());
        assert_eq!(ctx.get_string(ids::MESSAGE_CLASS).as_deref(), Some("IPM.Note"));
        assert_eq!(ctx.get_string(ids::SUBJECT).as_deref(), Some(""));
        assert_eq!(ctx.get_int32(ids::MESSAGE_SIZE), Some(garbage.len() as i32));
        assert_eq!(ctx.get_int32(ids::MESSAGE_FLAGS), Some(0));
        assert!(ctx.get_time(ids::CLIENT_SUBMIT_TIME).is_some());
    }

    let att = attachment(1);
    dir.add(NodeEntry::new(att, 0, msg), b"")?;
    {
        let mut ctx = PropertyContext::open(&mut dir, att)?;
        assert_eq!(ctx.get_string(ids::ATTACH_LONG_FILENAME).as_deref(), Some("attachment"));
        assert_eq!(ctx.get_int32(ids::ATTACH_METHOD), Some(1));
        assert_eq!(ctx.get_int32(ids::ATTACH_SIZE), Some(0));
    }
    assert_eq!(CounterMetrics::get(&metrics.default_reads), 2);
    Ok(())
}

#[test]
fn unreadable_payload_range_gets_defaults() -> Result<()> {
    let store = MemStore::new();
    let (mut dir, metrics) = with_metrics(store.clone())?;
    let msg = message(1);
    let entry = dir.add(NodeEntry::new(msg, 0, ROOT), &[0u8; 100])?;
    let cut = entry.data_offset() + 10;
    store.with_bytes_mut(|bytes| bytes.truncate(cut as usize));

    assert!(matches!(dir.read_payload(msg), Err(PstError::Corrupted(_))));
    let mut ctx = PropertyContext::new(&mut dir, entry);
    assert!(!ctx.load());
    assert_eq!(ctx.get_int32(ids::MESSAGE_SIZE), Some(0));
    assert_eq!(CounterMetrics::get(&metrics.default_reads), 1);
    Ok(())
}

#[test]
fn overstated_table_count_yields_the_rows_present() -> Result<()> {
    let store = MemStore::new();
    let mut dir = NodeDirectory::open(store.clone(), DirectoryOptions::default())?;
    let listed: Vec<u32> = (1..=3).map(message).collect();
    for id in &listed {
        dir.add(NodeEntry::new(*id, 0, ROOT), b"m")?;
    }
    let table = dir
        .find(companion_id(ROOT, TableKind::Contents))?
        .expect("contents table");
    let at = table.data_offset() as usize;
    store.with_bytes_mut(|bytes| bytes[at..at + 4].copy_from_slice(&100u32.to_le_bytes()));
    assert_eq!(dir.table_rows(ROOT, TableKind::Contents)?, listed);
    Ok(())
}

#[test]
fn payload_extent_past_the_address_space_degrades() -> Result<()> {
    let store = MemStore::new();
    let damaged = message(3);
    {
        let mut dir = NodeDirectory::open(store.clone(), DirectoryOptions::default())?;
        for i in 1..=5 {
            dir.add(NodeEntry::new(message(i), i, ROOT), format!("body {i}").as_bytes())?;
        }
    }
    // Rewrite the record with a valid checksum so only its extent is wrong.
    let leaf = leftmost_leaf(&store)?;
    let Page::Leaf(mut records) = Page::decode(leaf, &store.read_range(leaf, PAGE_SIZE as u32)?)?
    else {
        panic!("expected a leaf page at {leaf}");
    };
    let record = records
        .iter_mut()
        .find(|r| r.node_id == damaged)
        .expect("record of the damaged node");
    record.data_offset = u64::MAX - 2;
    store.write_range(leaf, &Page::Leaf(records).encode()?)?;
    let len_before = store.file_length()?;

    let mut dir = NodeDirectory::open(store.clone(), DirectoryOptions::default())?;
    let all = dir.get_all()?;
    assert!(all.iter().any(|e| e.node_id() == damaged));
    assert_eq!(all.iter().filter(|e| e.node_type().is_message()).count(), 5);
    assert!(matches!(dir.read_payload(damaged), Err(PstError::Corrupted(_))));
    assert_eq!(dir.read_payload(message(4))?, b"body 4");

    // A smaller payload still moves instead of writing at the bogus offset.
    let entry = dir.find(damaged)?.expect("damaged entry stays listed");
    let moved = dir.update_payload(&entry, b"fixed")?;
    assert!(moved.data_offset() >= len_before);
    assert_eq!(dir.read_payload(damaged)?, b"fixed");
    let fresh = dir.add(NodeEntry::new(message(6), 0, ROOT), b"six")?;
    assert!(fresh.data_offset() >= len_before);
    assert!(fresh.data_offset() >= moved.data_end().unwrap_or(u64::MAX));
    Ok(())
}
