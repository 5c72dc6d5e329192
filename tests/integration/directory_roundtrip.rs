use std::fs;

use pst_nodes::primitives::io::{BackingStore, FileStore, MemStore};
use pst_nodes::storage::{DirectoryConfig, DirectoryOptions, FormatKind, NodeDirectory, NodeEntry};
use pst_nodes::types::{node_type, NodeId, PstError, Result, TableKind};
use tempfile::tempdir;

const ROOT: u32 = 0x42;

fn folder(index: u32) -> u32 {
    NodeId::compose(node_type::NORMAL_FOLDER, index).0
}

fn message(index: u32) -> u32 {
    NodeId::compose(node_type::NORMAL_MESSAGE, index).0
}

#[test]
fn file_backed_hierarchy_survives_reopen() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("archive.pst");
    let inbox = folder(40);
    {
        let mut dir = NodeDirectory::open(FileStore::open(&path)?, DirectoryOptions::default())?;
        dir.add(NodeEntry::new(inbox, 1, ROOT), b"inbox properties")?;
        for i in 1..=25 {
            dir.add(
                NodeEntry::new(message(i), 100 + i, inbox),
                format!("message number {i}").as_bytes(),
            )?;
        }
    }

    let mut dir = NodeDirectory::open(FileStore::open_read_only(&path)?, DirectoryOptions::default())?;
    assert!(dir.is_read_only());
    assert_eq!(dir.find(inbox)?.map(|e| e.data_id), Some(1));
    let messages: Vec<u32> = dir
        .children(inbox)?
        .into_iter()
        .filter(|e| e.node_type().is_message())
        .map(|e| e.node_id())
        .collect();
    assert_eq!(messages.len(), 25);
    let listed = dir.table_rows(inbox, TableKind::Contents)?;
    assert_eq!(listed, (1..=25).map(message).collect::<Vec<_>>());
    for i in [1, 13, 25] {
        assert_eq!(
            dir.read_payload(message(i))?,
            format!("message number {i}").into_bytes()
        );
    }
    Ok(())
}

#[test]
fn read_only_container_refuses_every_mutation() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("archive.pst");
    {
        let mut dir = NodeDirectory::open(FileStore::open(&path)?, DirectoryOptions::default())?;
        dir.add(NodeEntry::new(message(1), 0, ROOT), b"body")?;
    }
    let len_before = fs::metadata(&path)?.len();
    let mut dir = NodeDirectory::open(FileStore::open_read_only(&path)?, DirectoryOptions::default())?;
    let existing = dir.find(message(1))?.unwrap();

    let denied = [
        dir.add(NodeEntry::new(message(2), 0, ROOT), b"x").err(),
        dir.update(&existing).err(),
        dir.update_payload(&existing, b"changed").err(),
        dir.remove(message(1)).err(),
    ];
    let ops: Vec<&str> = denied
        .iter()
        .map(|err| match err {
            Some(PstError::AccessDenied(op)) => *op,
            other => panic!("expected access denied, got {other:?}"),
        })
        .collect();
    assert_eq!(ops, ["add", "update", "update_payload", "remove"]);
    assert_eq!(dir.read_payload(message(1))?, b"body");
    assert_eq!(fs::metadata(&path)?.len(), len_before);
    Ok(())
}

#[test]
fn empty_read_only_file_yields_only_the_root() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("empty.pst");
    fs::write(&path, b"")?;
    let mut dir = NodeDirectory::open(FileStore::open_read_only(&path)?, DirectoryOptions::default())?;
    let all = dir.get_all()?;
    assert_eq!(all.len(), 1);
    assert!(all[0].is_root());
    assert!(dir.children(ROOT)?.is_empty());
    assert_eq!(fs::metadata(&path)?.len(), 0);
    Ok(())
}

#[test]
fn side_index_restores_cached_summaries() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("archive.pst");
    let idx = tmp.path().join("archive.idx");
    let with_index = || DirectoryOptions::default().side_index(&idx);
    let receipts = folder(40);
    {
        let mut dir = NodeDirectory::open(FileStore::open(&path)?, with_index())?;
        dir.add(NodeEntry::new(receipts, 0, ROOT).with_display_name("Receipts"), b"")?;
        let mut invoice = NodeEntry::new(message(1), 0, receipts);
        invoice.subject = Some("Invoice 22".into());
        invoice.metadata.insert("x-source".into(), "import".into());
        dir.add(invoice, b"body")?;
    }
    assert!(idx.exists());

    {
        let mut dir = NodeDirectory::open(FileStore::open(&path)?, with_index())?;
        assert_eq!(
            dir.find(receipts)?.unwrap().display_name.as_deref(),
            Some("Receipts")
        );
        let invoice = dir.find(message(1))?.unwrap();
        assert_eq!(invoice.subject.as_deref(), Some("Invoice 22"));
        assert_eq!(invoice.metadata.get("x-source").map(String::as_str), Some("import"));
    }

    // The tree alone carries structure but no summaries.
    let mut bare = NodeDirectory::open(FileStore::open(&path)?, DirectoryOptions::default())?;
    let invoice = bare.find(message(1))?.unwrap();
    assert_eq!(invoice.subject, None);
    assert_eq!(invoice.parent_id, receipts);
    // Moving the payload without the index makes its record stale.
    bare.update_payload(&invoice, &[7u8; 4000])?;
    drop(bare);

    let mut dir = NodeDirectory::open(FileStore::open(&path)?, with_index())?;
    let invoice = dir.find(message(1))?.unwrap();
    assert_eq!(invoice.subject, None);
    assert_eq!(invoice.data_size(), 4000);
    assert_eq!(
        dir.find(receipts)?.unwrap().display_name.as_deref(),
        Some("Receipts")
    );
    Ok(())
}

#[test]
fn toml_config_drives_open() -> Result<()> {
    let tmp = tempdir()?;
    let cfg_path = tmp.path().join("directory.toml");
    let idx = tmp.path().join("nodes.idx");
    fs::write(
        &cfg_path,
        format!(
            "format = \"ansi\"\nroot_page_offset = 2048\nside_index = {:?}\n\n[heap]\nheap_start = 4096\n",
            idx.display().to_string()
        ),
    )?;
    let cfg = DirectoryConfig::load(&cfg_path)?;
    assert_eq!(cfg.format, FormatKind::Ansi);

    let store = MemStore::new();
    let mut dir = NodeDirectory::open(store.clone(), DirectoryOptions::from_config(cfg))?;
    assert_eq!(dir.root_id(), 0x41);
    let stored = dir.add(NodeEntry::new(message(1), 0, 0x41), b"payload")?;
    assert!(stored.data_offset() >= 4096);
    assert_eq!(&store.read_range(2048, 2)?, &0x4E42u16.to_le_bytes());
    assert!(idx.exists());

    let missing = DirectoryConfig::load(tmp.path().join("absent.toml")).unwrap_err();
    assert!(matches!(missing, PstError::Config(_)));
    Ok(())
}
