use super::*;
use common::Config;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use tempfile::tempdir;

fn engine() -> PagedFiles {
    PagedFiles::new(Config::default())
}

/// Small pages force deep trees cheaply.
fn small_engine() -> PagedFiles {
    PagedFiles::new(Config::builder().page_size(512).build())
}

fn k(i: i32) -> [u8; 4] {
    i.to_le_bytes()
}

fn drain(index: &mut BTreeIndex, sd: usize) -> Vec<i32> {
    let mut out = Vec::new();
    while let Some(rid) = index.find_next(sd).unwrap() {
        out.push(rid);
    }
    index.close_scan(sd).unwrap();
    out
}

fn scan(index: &mut BTreeIndex, op: ScanOp, value: Option<&[u8]>) -> Vec<i32> {
    let sd = index.open_scan(op, value).unwrap();
    drain(index, sd)
}

#[test]
fn create_validates_attributes() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("emp");
    let pf = engine();

    assert!(matches!(
        BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 8),
        Err(Error::InvalidAttrLength)
    ));
    assert!(matches!(
        BTreeIndex::create(&pf, &rel, 0, KeyType::Bytes, 0),
        Err(Error::InvalidAttrLength)
    ));
    assert!(matches!(
        BTreeIndex::create(&pf, &rel, 0, KeyType::Float, 2),
        Err(Error::InvalidAttrLength)
    ));
    BTreeIndex::create(&pf, &rel, 0, KeyType::Bytes, 16).unwrap();

    // Opening with a mismatched length is rejected against the stored
    // header.
    assert!(matches!(
        BTreeIndex::open(&pf, &rel, 0, KeyType::Bytes, 8),
        Err(Error::InvalidAttrLength)
    ));
    let index = BTreeIndex::open(&pf, &rel, 0, KeyType::Bytes, 16).unwrap();
    index.close().unwrap();
    BTreeIndex::destroy(&pf, &rel, 0).unwrap();
}

#[test]
fn key_type_tags_roundtrip() {
    for kt in [KeyType::Int, KeyType::Float, KeyType::Bytes] {
        assert_eq!(KeyType::from_tag(kt.tag()).unwrap(), kt);
    }
    assert!(matches!(KeyType::from_tag(b'x'), Err(Error::InvalidAttrType)));
}

#[test]
fn empty_index_scans_empty() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("emp");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

    assert_eq!(scan(&mut index, ScanOp::All, None), Vec::<i32>::new());
    assert_eq!(scan(&mut index, ScanOp::Equal, Some(&k(5))), Vec::<i32>::new());
    index.close().unwrap();
}

// S5, first half: insert 0..20 with rid = key, delete the odd keys, and a
// null-valued scan yields the even rids in ascending key order.
#[test]
fn delete_odds_then_scan_evens() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("s5a");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

    for i in 0..20 {
        index.insert_entry(&k(i), i).unwrap();
    }
    for i in (1..20).step_by(2) {
        index.delete_entry(&k(i), i).unwrap();
    }

    let rids = scan(&mut index, ScanOp::Equal, None);
    assert_eq!(rids, (0..20).step_by(2).map(|i| i as i32).collect::<Vec<_>>());
    index.close().unwrap();
}

// S5, second half: a large build, a total teardown, a rebuild, and the
// range operators against it.
#[test]
fn bulk_insert_delete_and_ranges() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("s5b");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

    for i in 0..10_000 {
        index.insert_entry(&k(i), i).unwrap();
    }
    for i in 0..10_000 {
        index.delete_entry(&k(i), i).unwrap();
    }
    assert_eq!(scan(&mut index, ScanOp::All, None), Vec::<i32>::new());

    for i in 0..10_000 {
        index.insert_entry(&k(i), i).unwrap();
    }
    let mut less = scan(&mut index, ScanOp::LessThan, Some(&k(100)));
    less.sort_unstable();
    assert_eq!(less, (0..100).collect::<Vec<_>>());

    let mut greater = scan(&mut index, ScanOp::GreaterThan, Some(&k(150)));
    greater.sort_unstable();
    assert_eq!(greater, (151..10_000).collect::<Vec<_>>());

    index.close().unwrap();
}

#[test]
fn range_operator_boundaries() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("rng");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

    for i in 0..100 {
        index.insert_entry(&k(i), i).unwrap();
    }

    let mut le = scan(&mut index, ScanOp::LessThanEqual, Some(&k(10)));
    le.sort_unstable();
    assert_eq!(le, (0..=10).collect::<Vec<_>>());

    let mut ge = scan(&mut index, ScanOp::GreaterThanEqual, Some(&k(90)));
    ge.sort_unstable();
    assert_eq!(ge, (90..100).collect::<Vec<_>>());

    let mut ne = scan(&mut index, ScanOp::NotEqual, Some(&k(42)));
    ne.sort_unstable();
    let expected: Vec<i32> = (0..100).filter(|&i| i != 42).collect();
    assert_eq!(ne, expected);

    // Probing between stored keys and past both ends.
    for i in 0..100 {
        index.delete_entry(&k(i), i).unwrap();
    }
    for i in (0..100).step_by(10) {
        index.insert_entry(&k(i), i).unwrap();
    }
    let mut lt = scan(&mut index, ScanOp::LessThan, Some(&k(35)));
    lt.sort_unstable();
    assert_eq!(lt, vec![0, 10, 20, 30]);
    assert_eq!(scan(&mut index, ScanOp::LessThan, Some(&k(0))), Vec::<i32>::new());
    let mut gt = scan(&mut index, ScanOp::GreaterThan, Some(&k(95)));
    assert_eq!(gt, Vec::<i32>::new());
    gt = scan(&mut index, ScanOp::GreaterThan, Some(&k(55)));
    gt.sort_unstable();
    assert_eq!(gt, vec![60, 70, 80, 90]);

    index.close().unwrap();
}

// Property 5: every RID inserted under a key and not deleted comes back
// from an equality scan, duplicates included.
#[test]
fn duplicate_rid_chains() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("dup");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

    for rid in 0..50 {
        index.insert_entry(&k(7), rid).unwrap();
    }
    for rid in (0..50).step_by(3) {
        index.delete_entry(&k(7), rid).unwrap();
    }

    let mut rids = scan(&mut index, ScanOp::Equal, Some(&k(7)));
    rids.sort_unstable();
    let expected: Vec<i32> = (0..50).filter(|r| r % 3 != 0).collect();
    assert_eq!(rids, expected);
    index.close().unwrap();
}

#[test]
fn delete_missing_entries() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("miss");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

    index.insert_entry(&k(1), 10).unwrap();
    assert!(matches!(index.delete_entry(&k(2), 10), Err(Error::NotFound)));
    assert!(matches!(index.delete_entry(&k(1), 99), Err(Error::NotFound)));
    index.delete_entry(&k(1), 10).unwrap();
    assert!(matches!(index.delete_entry(&k(1), 10), Err(Error::NotFound)));
    index.close().unwrap();
}

// Property 6: the leaf chain visits keys in ascending order no matter the
// insertion order, across splits.
#[test]
fn shuffled_inserts_scan_ascending() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("shuf");
    let pf = small_engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

    let mut keys: Vec<i32> = (0..5000).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    keys.shuffle(&mut rng);
    for &key in &keys {
        index.insert_entry(&k(key), key).unwrap();
    }

    // rid == key, so the null scan's rid order is the key order.
    let rids = scan(&mut index, ScanOp::All, None);
    assert_eq!(rids, (0..5000).collect::<Vec<_>>());
    index.close().unwrap();
}

#[test]
fn reclaims_freed_chain_nodes() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("compact");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

    // Two RIDs per key, then free one node per key: the page fills up
    // with dead chain nodes that later inserts must reclaim in place.
    for i in 0..200 {
        index.insert_entry(&k(i), i).unwrap();
        index.insert_entry(&k(i), i + 10_000).unwrap();
    }
    for i in 0..150 {
        index.delete_entry(&k(i), i + 10_000).unwrap();
    }
    for i in 200..320 {
        index.insert_entry(&k(i), i).unwrap();
    }

    for i in 0..150 {
        assert_eq!(scan(&mut index, ScanOp::Equal, Some(&k(i))), vec![i]);
    }
    for i in 150..200 {
        let mut rids = scan(&mut index, ScanOp::Equal, Some(&k(i)));
        rids.sort_unstable();
        assert_eq!(rids, vec![i, i + 10_000]);
    }
    for i in 200..320 {
        assert_eq!(scan(&mut index, ScanOp::Equal, Some(&k(i))), vec![i]);
    }
    index.close().unwrap();
}

// A RID chain cannot span leaves: once a single key's chain fills a whole
// leaf, further RIDs for it are rejected cleanly, the chain keeps every
// accepted RID, and the rest of the tree stays usable.
#[test]
fn chain_overflow_rejected_cleanly() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("overflow");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

    // Neighbor keys end up on their own leaves as the splits progress.
    index.insert_entry(&k(3), 30).unwrap();
    index.insert_entry(&k(9), 90).unwrap();

    let mut accepted = 0;
    let overflow = loop {
        match index.insert_entry(&k(7), accepted) {
            Ok(()) => accepted += 1,
            Err(e) => break e,
        }
        assert!(accepted < 5000, "expected the chain to hit leaf capacity");
    };
    assert!(matches!(overflow, Error::InvalidValue));

    // Every accepted RID is still there.
    let mut rids = scan(&mut index, ScanOp::Equal, Some(&k(7)));
    rids.sort_unstable();
    assert_eq!(rids, (0..accepted).collect::<Vec<_>>());

    // Other keys keep working.
    index.insert_entry(&k(9), 91).unwrap();
    let mut nine = scan(&mut index, ScanOp::Equal, Some(&k(9)));
    nine.sort_unstable();
    assert_eq!(nine, vec![90, 91]);
    assert_eq!(scan(&mut index, ScanOp::Equal, Some(&k(3))), vec![30]);

    // Freeing a chain node makes room for the key again.
    index.delete_entry(&k(7), 0).unwrap();
    index.insert_entry(&k(7), accepted).unwrap();
    let mut rids = scan(&mut index, ScanOp::Equal, Some(&k(7)));
    rids.sort_unstable();
    assert_eq!(rids, (1..=accepted).collect::<Vec<_>>());

    index.close().unwrap();
}

// A scan parked on a key stays consistent when an already-visited key is
// deleted and the leaf reorganizes underneath it.
#[test]
fn scan_resyncs_after_concurrent_delete() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("resync");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

    for i in 0..10 {
        index.insert_entry(&k(i), i).unwrap();
    }
    let sd = index.open_scan(ScanOp::All, None).unwrap();
    assert_eq!(index.find_next(sd).unwrap(), Some(0));
    assert_eq!(index.find_next(sd).unwrap(), Some(1));
    assert_eq!(index.find_next(sd).unwrap(), Some(2));

    // The cursor is parked on key 3; deleting key 1 shifts it left.
    index.delete_entry(&k(1), 1).unwrap();

    let rest = drain(&mut index, sd);
    assert_eq!(rest, vec![3, 4, 5, 6, 7, 8, 9]);
    index.close().unwrap();
}

#[test]
fn scan_table_is_bounded() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("scans");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    index.insert_entry(&k(1), 1).unwrap();

    let max_scans = pf.config().max_scans;
    let mut open = Vec::new();
    for _ in 0..max_scans {
        open.push(index.open_scan(ScanOp::All, None).unwrap());
    }
    assert!(matches!(
        index.open_scan(ScanOp::All, None),
        Err(Error::ScanTabFull)
    ));

    let freed = open.pop().unwrap();
    index.close_scan(freed).unwrap();
    let sd = index.open_scan(ScanOp::All, None).unwrap();
    index.close_scan(sd).unwrap();

    assert!(matches!(index.find_next(99), Err(Error::InvalidScanDesc)));
    assert!(matches!(index.find_next(freed), Err(Error::InvalidScanDesc)));
    index.close().unwrap();
}

#[test]
fn byte_string_keys() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("names");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Bytes, 8).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Bytes, 8).unwrap();

    let names: [&[u8; 8]; 4] = [b"alice\0\0\0", b"bob\0\0\0\0\0", b"carol\0\0\0", b"dave\0\0\0\0"];
    for (rid, name) in names.iter().enumerate() {
        index.insert_entry(*name, rid as i32).unwrap();
    }

    assert_eq!(scan(&mut index, ScanOp::Equal, Some(b"carol\0\0\0")), vec![2]);
    let mut lt = scan(&mut index, ScanOp::LessThan, Some(b"carol\0\0\0"));
    lt.sort_unstable();
    assert_eq!(lt, vec![0, 1]);
    assert!(matches!(
        index.insert_entry(b"short", 9),
        Err(Error::InvalidValue)
    ));
    index.close().unwrap();
}

#[test]
fn float_keys() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("temps");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Float, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Float, 4).unwrap();

    for (rid, value) in [0.5f32, 1.5, 2.5, 3.5].into_iter().enumerate() {
        index.insert_entry(&value.to_le_bytes(), rid as i32).unwrap();
    }
    let mut lt = scan(&mut index, ScanOp::LessThan, Some(&2.0f32.to_le_bytes()));
    lt.sort_unstable();
    assert_eq!(lt, vec![0, 1]);
    index.close().unwrap();
}

// Property 8 for the index: entries survive close/reopen.
#[test]
fn entries_survive_reopen() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("persist");
    let pf = engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    {
        let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();
        for i in 0..2000 {
            index.insert_entry(&k(i), i).unwrap();
        }
        index.close().unwrap();
    }
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    assert_eq!(scan(&mut index, ScanOp::All, None), (0..2000).collect::<Vec<_>>());
    index.close().unwrap();
}

// S6: an index grown by shuffled inserts and one bulk-loaded from the
// sorted pairs answer every scan identically.
#[test]
fn bulk_load_matches_incremental_build() {
    let dir = tempdir().unwrap();
    let pf = small_engine();

    let mut pairs: Vec<(Vec<u8>, i32)> = Vec::new();
    for key in 0..3000 {
        pairs.push((k(key).to_vec(), key));
        if key % 3 == 0 {
            pairs.push((k(key).to_vec(), key + 100_000));
        }
    }

    let rel_a = dir.path().join("inc");
    BTreeIndex::create(&pf, &rel_a, 0, KeyType::Int, 4).unwrap();
    let mut a = BTreeIndex::open(&pf, &rel_a, 0, KeyType::Int, 4).unwrap();
    let mut shuffled = pairs.clone();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    shuffled.shuffle(&mut rng);
    for (key, rid) in &shuffled {
        a.insert_entry(key, *rid).unwrap();
    }

    let rel_b = dir.path().join("bulk");
    let mut sorted = pairs.clone();
    sorted.sort_by(|(x, _), (y, _)| x.cmp(y));
    BTreeIndex::bulk_load(&pf, &rel_b, 0, KeyType::Int, 4, sorted).unwrap();
    let mut b = BTreeIndex::open(&pf, &rel_b, 0, KeyType::Int, 4).unwrap();

    for key in 0..3000 {
        let mut from_a = scan(&mut a, ScanOp::Equal, Some(&k(key)));
        let mut from_b = scan(&mut b, ScanOp::Equal, Some(&k(key)));
        from_a.sort_unstable();
        from_b.sort_unstable();
        assert_eq!(from_a, from_b, "key {key}");
    }

    // Full ascending scans visit the same key sequence.
    let keys_a: Vec<i32> = scan(&mut a, ScanOp::All, None).iter().map(|r| r % 100_000).collect();
    let keys_b: Vec<i32> = scan(&mut b, ScanOp::All, None).iter().map(|r| r % 100_000).collect();
    assert_eq!(keys_a, keys_b);

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn bulk_load_rejects_unsorted_input() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("unsorted");
    let pf = engine();
    let pairs = vec![(k(5).to_vec(), 5), (k(3).to_vec(), 3)];
    assert!(matches!(
        BTreeIndex::bulk_load(&pf, &rel, 0, KeyType::Int, 4, pairs),
        Err(Error::InvalidValue)
    ));
}

#[test]
fn bulk_load_empty_stream() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("empty");
    let pf = engine();
    BTreeIndex::bulk_load(&pf, &rel, 0, KeyType::Int, 4, Vec::new()).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    assert_eq!(scan(&mut index, ScanOp::All, None), Vec::<i32>::new());
    index.close().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // Property 5: for every key, an equality scan returns exactly the
    // multiset of RIDs inserted for it minus those deleted, under
    // arbitrary interleavings of inserts and deletes.
    #[test]
    fn equality_scans_match_model(
        ops in prop::collection::vec((any::<bool>(), 0i32..20, 0i32..50), 1..200)
    ) {
        let dir = tempdir().unwrap();
        let rel = dir.path().join("prop");
        let pf = engine();
        BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
        let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();

        let mut model: HashMap<(i32, i32), usize> = HashMap::new();
        for (is_insert, key, rid) in ops {
            if is_insert {
                index.insert_entry(&k(key), rid).unwrap();
                *model.entry((key, rid)).or_insert(0) += 1;
            } else if model.get(&(key, rid)).copied().unwrap_or(0) > 0 {
                index.delete_entry(&k(key), rid).unwrap();
                *model.get_mut(&(key, rid)).unwrap() -= 1;
            } else {
                prop_assert!(matches!(
                    index.delete_entry(&k(key), rid),
                    Err(Error::NotFound)
                ));
            }
        }

        for key in 0..20 {
            let mut rids = scan(&mut index, ScanOp::Equal, Some(&k(key)));
            rids.sort_unstable();
            let mut expected: Vec<i32> = model
                .iter()
                .filter(|((mk, _), count)| *mk == key && **count > 0)
                .flat_map(|((_, rid), count)| std::iter::repeat(*rid).take(*count))
                .collect();
            expected.sort_unstable();
            prop_assert_eq!(rids, expected, "key {}", key);
        }
        index.close().unwrap();
    }
}

#[test]
fn dump_renders_the_tree() {
    let dir = tempdir().unwrap();
    let rel = dir.path().join("dump");
    let pf = small_engine();
    BTreeIndex::create(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    let mut index = BTreeIndex::open(&pf, &rel, 0, KeyType::Int, 4).unwrap();
    for i in 0..200 {
        index.insert_entry(&k(i), i).unwrap();
    }
    let mut out = Vec::new();
    index.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("node p0"), "root should have split: {text}");
    assert!(text.contains("leaf"), "tree should list leaves: {text}");
    index.close().unwrap();
}
