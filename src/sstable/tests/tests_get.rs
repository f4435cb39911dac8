//! Point-lookup behavior: hits, misses, versions, snapshots, bloom
//! interaction.

use super::helpers::*;
use crate::sstable::TableGet;
use tempfile::TempDir;

#[test]
fn get_hit_and_miss() {
    let tmp = TempDir::new().unwrap();
    let (path, _) = build_table(tmp.path(), 1, &numbered_records(100), 4096, 10);
    let table = open_table(&path);

    assert_eq!(
        table.get(b"key0042", u64::MAX).unwrap(),
        TableGet::Put {
            value: b"val0042".to_vec(),
            seq: 43,
        }
    );
    assert_eq!(table.get(b"key9999", u64::MAX).unwrap(), TableGet::NotFound);
    assert_eq!(table.get(b"aaaa", u64::MAX).unwrap(), TableGet::NotFound);
    assert_eq!(table.get(b"zzzz", u64::MAX).unwrap(), TableGet::NotFound);
}

#[test]
fn get_returns_newest_version_at_or_below_snapshot() {
    let tmp = TempDir::new().unwrap();
    // Multiple versions of one key, seq-descending as the format requires.
    let records = vec![
        put(b"k", b"v3", 30),
        put(b"k", b"v2", 20),
        put(b"k", b"v1", 10),
    ];
    let (path, _) = build_table(tmp.path(), 1, &records, 4096, 10);
    let table = open_table(&path);

    assert_eq!(
        table.get(b"k", u64::MAX).unwrap(),
        TableGet::Put {
            value: b"v3".to_vec(),
            seq: 30,
        }
    );
    assert_eq!(
        table.get(b"k", 25).unwrap(),
        TableGet::Put {
            value: b"v2".to_vec(),
            seq: 20,
        }
    );
    assert_eq!(
        table.get(b"k", 10).unwrap(),
        TableGet::Put {
            value: b"v1".to_vec(),
            seq: 10,
        }
    );
    assert_eq!(table.get(b"k", 9).unwrap(), TableGet::NotFound);
}

#[test]
fn get_sees_tombstone() {
    let tmp = TempDir::new().unwrap();
    let records = vec![delete(b"gone", 20), put(b"here", b"v", 10)];
    let (path, _) = build_table(tmp.path(), 1, &records, 4096, 10);
    let table = open_table(&path);

    assert_eq!(
        table.get(b"gone", u64::MAX).unwrap(),
        TableGet::Delete { seq: 20 }
    );
}

#[test]
fn get_works_across_block_boundaries() {
    let tmp = TempDir::new().unwrap();
    // Tiny blocks force key versions and neighbors into separate blocks.
    let (path, _) = build_table(tmp.path(), 1, &numbered_records(500), 128, 10);
    let table = open_table(&path);

    for i in (0..500).step_by(37) {
        let key = format!("key{i:04}");
        let expected = format!("val{i:04}").into_bytes();
        assert_eq!(
            table.get(key.as_bytes(), u64::MAX).unwrap(),
            TableGet::Put {
                value: expected,
                seq: (i + 1) as u64,
            },
            "lookup failed for {key}"
        );
    }
}

#[test]
fn bloom_rejects_most_absent_keys() {
    let tmp = TempDir::new().unwrap();
    let (path, _) = build_table(tmp.path(), 1, &numbered_records(1000), 4096, 10);
    let table = open_table(&path);

    // Present keys are never rejected.
    for i in 0..1000 {
        assert!(table.may_contain(format!("key{i:04}").as_bytes()));
    }

    let mut passed = 0usize;
    for i in 0..1000 {
        if table.may_contain(format!("nope-{i}").as_bytes()) {
            passed += 1;
        }
    }
    assert!(passed < 50, "{passed} of 1000 absent keys passed the bloom");
}

#[test]
fn table_without_bloom_always_says_maybe() {
    let tmp = TempDir::new().unwrap();
    let (path, _) = build_table(tmp.path(), 1, &numbered_records(10), 4096, 0);
    let table = open_table(&path);

    assert!(table.may_contain(b"key0001"));
    assert!(table.may_contain(b"definitely-not-present"));
    // Lookups still work without the filter.
    assert!(matches!(
        table.get(b"key0001", u64::MAX).unwrap(),
        TableGet::Put { .. }
    ));
}
