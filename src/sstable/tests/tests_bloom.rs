//! Bloom filter properties: no false negatives, bounded false positives,
//! wire-format roundtrip.

use crate::sstable::bloom::BloomFilter;
use rand::Rng;

#[test]
fn no_false_negatives() {
    let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key-{i}").into_bytes()).collect();

    let mut bloom = BloomFilter::new(keys.len(), 10);
    for key in &keys {
        bloom.insert(key);
    }

    for key in &keys {
        assert!(bloom.may_contain(key), "inserted key must never be absent");
    }
}

#[test]
fn false_positive_rate_is_bounded() {
    let mut rng = rand::rng();
    let keys: Vec<Vec<u8>> = (0..10_000)
        .map(|_| rng.random::<u64>().to_be_bytes().to_vec())
        .collect();

    let mut bloom = BloomFilter::new(keys.len(), 10);
    for key in &keys {
        bloom.insert(key);
    }

    // Query keys from a disjoint namespace; with 10 bits/key the expected
    // false-positive rate is ~1%, so 3% gives comfortable headroom.
    let mut false_positives = 0usize;
    let probes = 10_000usize;
    for i in 0..probes {
        let absent = format!("absent-key-{i}");
        if bloom.may_contain(absent.as_bytes()) {
            false_positives += 1;
        }
    }

    let rate = false_positives as f64 / probes as f64;
    assert!(rate <= 0.03, "false positive rate {rate} exceeds 3%");
}

#[test]
fn probe_count_follows_bits_per_key() {
    // k = round(bits_per_key * ln 2)
    assert_eq!(BloomFilter::new(100, 10).probes(), 7);
    assert_eq!(BloomFilter::new(100, 4).probes(), 3);
    // Clamped to at least one probe.
    assert_eq!(BloomFilter::new(100, 1).probes(), 1);
}

#[test]
fn encode_decode_roundtrip() {
    let mut bloom = BloomFilter::new(500, 10);
    for i in 0..500 {
        bloom.insert(format!("k{i}").as_bytes());
    }

    let mut bytes = Vec::new();
    bloom.encode_to(&mut bytes);
    assert_eq!(bytes.len(), bloom.encoded_len());

    let decoded = BloomFilter::decode(&bytes).unwrap();
    assert_eq!(decoded.probes(), bloom.probes());
    for i in 0..500 {
        assert!(decoded.may_contain(format!("k{i}").as_bytes()));
    }
}

#[test]
fn decode_rejects_truncated_input() {
    let mut bloom = BloomFilter::new(10, 10);
    bloom.insert(b"x");
    let mut bytes = Vec::new();
    bloom.encode_to(&mut bytes);

    bytes.pop();
    assert!(BloomFilter::decode(&bytes).is_err());
    assert!(BloomFilter::decode(&[]).is_err());
}

#[test]
fn hash_pairs_match_direct_insertion() {
    let mut direct = BloomFilter::new(100, 10);
    let mut via_hash = BloomFilter::new(100, 10);

    for i in 0..100 {
        let key = format!("key-{i}");
        direct.insert(key.as_bytes());
        via_hash.insert_hash(BloomFilter::key_hash(key.as_bytes()));
    }

    let mut a = Vec::new();
    let mut b = Vec::new();
    direct.encode_to(&mut a);
    via_hash.encode_to(&mut b);
    assert_eq!(a, b);
}
