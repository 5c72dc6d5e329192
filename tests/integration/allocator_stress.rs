use std::collections::BTreeMap;

use pst_nodes::primitives::io::{BackingStore, FileStore, MemStore};
use pst_nodes::storage::{DirectoryOptions, HeapOptions, NodeDirectory, NodeEntry};
use pst_nodes::types::{node_type, NodeId, Result};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::NamedTempFile;

const ROOT: u32 = 0x42;
const OPS: usize = 1500;

fn message(index: u32) -> u32 {
    NodeId::compose(node_type::NORMAL_MESSAGE, index).0
}

fn payload(rng: &mut ChaCha8Rng, id: u32) -> Vec<u8> {
    let len = match rng.gen_range(0..10) {
        0 => 0,
        1..=6 => rng.gen_range(1..200),
        _ => rng.gen_range(200..3000),
    };
    let tag = id.to_le_bytes();
    (0..len).map(|i| tag[i % 4] ^ (i as u8)).collect()
}

/// Live extents must be disjoint and inside the file.
fn assert_disjoint<S: BackingStore>(dir: &NodeDirectory<S>) -> Result<()> {
    let file_len = dir.store().file_length()?;
    let live = dir.live_extents();
    for pair in live.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        assert!(
            a.0 + a.1 as u64 <= b.0,
            "extent {a:?} overlaps {b:?}"
        );
    }
    if let Some((off, len)) = live.last() {
        assert!(off + *len as u64 <= file_len);
    }
    Ok(())
}

fn assert_matches<S: BackingStore>(
    dir: &mut NodeDirectory<S>,
    model: &BTreeMap<u32, Vec<u8>>,
) -> Result<()> {
    for (id, bytes) in model {
        assert_eq!(&dir.read_payload(*id)?, bytes, "payload of {id:#x}");
    }
    let messages = dir
        .get_all()?
        .into_iter()
        .filter(|e| e.node_type().is_message())
        .count();
    assert_eq!(messages, model.len());
    Ok(())
}

#[test]
fn seeded_workload_with_reopens() -> Result<()> {
    let tmp = NamedTempFile::new()?;
    let path = tmp.path().to_path_buf();
    let opts = || {
        DirectoryOptions::default()
            .page_cache_capacity(8)
            .heap(HeapOptions {
                growth_increment: 4096,
                ..HeapOptions::default()
            })
    };
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED_0F_D1);
    let mut model: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut dir = NodeDirectory::open(FileStore::open(&path)?, opts())?;

    for step in 0..OPS {
        let id = message(rng.gen_range(1..400));
        match rng.gen_range(0..10) {
            0..=4 => {
                let bytes = payload(&mut rng, id);
                dir.add(NodeEntry::new(id, step as u32, ROOT), &bytes)?;
                model.insert(id, bytes);
            }
            5..=6 => {
                let bytes = payload(&mut rng, id);
                match dir.find(id)? {
                    Some(entry) => {
                        dir.update_payload(&entry, &bytes)?;
                        model.insert(id, bytes);
                    }
                    None => assert!(!model.contains_key(&id)),
                }
            }
            7..=8 => {
                assert_eq!(dir.remove(id)?, model.remove(&id).is_some());
            }
            _ => {
                let mut entry = NodeEntry::new(id, step as u32, ROOT);
                entry.subject = Some(format!("step {step}"));
                assert_eq!(dir.update(&entry)?, model.contains_key(&id));
            }
        }
        if step % 250 == 249 {
            assert_disjoint(&dir)?;
            drop(dir);
            dir = NodeDirectory::open(FileStore::open(&path)?, opts())?;
            assert_matches(&mut dir, &model)?;
        }
    }
    assert_matches(&mut dir, &model)?;
    assert_disjoint(&dir)?;
    let stats = dir.heap_stats();
    assert!(stats.allocations > 0);
    Ok(())
}

#[derive(Clone, Debug)]
enum Op {
    Add(u32, usize),
    Resize(u32, usize),
    Remove(u32),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..60, 0usize..1500).prop_map(|(i, n)| Op::Add(i, n)),
        2 => (1u32..60, 0usize..1500).prop_map(|(i, n)| Op::Resize(i, n)),
        1 => (1u32..60).prop_map(Op::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn payloads_never_overlap(ops in prop::collection::vec(arb_op(), 1..120)) {
        let store = MemStore::new();
        let mut dir = NodeDirectory::open(store.clone(), DirectoryOptions::default()).unwrap();
        let mut model: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Add(i, n) => {
                    let id = message(i);
                    let bytes = vec![i as u8; n];
                    dir.add(NodeEntry::new(id, 0, ROOT), &bytes).unwrap();
                    model.insert(id, bytes);
                }
                Op::Resize(i, n) => {
                    let id = message(i);
                    if let Some(entry) = dir.find(id).unwrap() {
                        let bytes = vec![!(i as u8); n];
                        dir.update_payload(&entry, &bytes).unwrap();
                        model.insert(id, bytes);
                    }
                }
                Op::Remove(i) => {
                    let id = message(i);
                    prop_assert_eq!(dir.remove(id).unwrap(), model.remove(&id).is_some());
                }
            }
        }
        assert_disjoint(&dir).unwrap();
        drop(dir);
        let mut dir = NodeDirectory::open(store, DirectoryOptions::default()).unwrap();
        assert_matches(&mut dir, &model).unwrap();
    }
}
