//! External Sorter Integration Tests
//!
//! Tests for:
//! - In-memory and spilled round trips
//! - Stability within equal-keyed groups (single-threaded)
//! - Monotonicity of the merged stream
//! - In-memory vs spilled output equivalence
//! - Multi-level incremental merging past the fan-in limit
//! - Multi-threaded spilling and merging
//! - Bulk-arena record storage

use quarry::{
    decode_key, encode_key, SortField, Sorter, SorterConfig, TypedKeyComparator,
};
use std::sync::Arc;

// ============================================================================
// Test Helpers
// ============================================================================

/// Key carrying a payload tag: only the first field is compared
fn tagged_key(key: i64, tag: &str) -> Vec<u8> {
    encode_key(&[SortField::Int(key), SortField::Text(tag.as_bytes().to_vec())])
}

fn untag(record: &[u8]) -> (i64, String) {
    let fields = decode_key(record, 2).unwrap();
    match (&fields[0], &fields[1]) {
        (SortField::Int(k), SortField::Text(t)) => {
            (*k, String::from_utf8(t.clone()).unwrap())
        }
        other => panic!("unexpected fields {other:?}"),
    }
}

fn config(max_pma_bytes: usize, workers: usize) -> SorterConfig {
    let mut cfg = SorterConfig::default();
    cfg.max_pma_bytes = max_pma_bytes;
    cfg.worker_threads = workers;
    cfg
}

fn tagged_sorter(cfg: &SorterConfig) -> Sorter {
    Sorter::new(cfg, Arc::new(TypedKeyComparator::new(1)), 1)
}

fn drain(sorter: &mut Sorter) -> Vec<(i64, String)> {
    let mut out = Vec::new();
    loop {
        match sorter.rowkey() {
            Ok(key) => out.push(untag(key)),
            Err(_) => break,
        }
        if !sorter.advance().unwrap() {
            break;
        }
    }
    out
}

/// Deterministic pseudo-random keys
fn scrambled_keys(n: usize) -> Vec<i64> {
    (0..n as u64)
        .map(|i| ((i.wrapping_mul(2_654_435_761)) % 1_000) as i64)
        .collect()
}

// ============================================================================
// Round Trips
// ============================================================================

#[test]
fn test_in_memory_round_trip() {
    // keys [5, 2, 5, 1, 3] with tags [a..e]; never spills
    let mut sorter = tagged_sorter(&config(usize::MAX, 0));
    for (k, t) in [(5, "a"), (2, "b"), (5, "c"), (1, "d"), (3, "e")] {
        sorter.write(&tagged_key(k, t)).unwrap();
    }
    let eof = sorter.rewind().unwrap();
    assert!(!eof);
    assert_eq!(sorter.spill_count(), 0);
    assert_eq!(
        drain(&mut sorter),
        vec![
            (1, "d".to_string()),
            (2, "b".to_string()),
            (3, "e".to_string()),
            (5, "a".to_string()),
            (5, "c".to_string()),
        ]
    );
}

#[test]
fn test_spilled_round_trip_three_pmas() {
    // threshold sized to hold exactly two records
    let records = [(5, "a"), (2, "b"), (5, "c"), (1, "d"), (3, "e")];
    let one_record = tagged_key(5, "a").len() + 1; // payload + length varint
    let mut sorter = tagged_sorter(&config(2 * one_record, 0));
    for (k, t) in records {
        sorter.write(&tagged_key(k, t)).unwrap();
    }
    let eof = sorter.rewind().unwrap();
    assert!(!eof);
    assert_eq!(sorter.spill_count(), 3, "runs of 2, 2 and 1 records");
    assert_eq!(
        drain(&mut sorter),
        vec![
            (1, "d".to_string()),
            (2, "b".to_string()),
            (3, "e".to_string()),
            (5, "a".to_string()),
            (5, "c".to_string()),
        ]
    );
}

#[test]
fn test_spill_on_every_write_matches_in_memory() {
    let keys = scrambled_keys(200);

    let mut in_memory = tagged_sorter(&config(usize::MAX, 0));
    let mut spilled = tagged_sorter(&config(0, 0));
    for (i, k) in keys.iter().enumerate() {
        let record = tagged_key(*k, &format!("t{i}"));
        in_memory.write(&record).unwrap();
        spilled.write(&record).unwrap();
    }
    in_memory.rewind().unwrap();
    spilled.rewind().unwrap();
    assert_eq!(spilled.spill_count(), keys.len());

    assert_eq!(drain(&mut in_memory), drain(&mut spilled));
}

// ============================================================================
// Ordering Properties
// ============================================================================

#[test]
fn test_stability_within_equal_keys_across_spills() {
    // single-threaded only; multi-threaded stability is not promised
    let mut sorter = tagged_sorter(&config(64, 0));
    let mut expected_tags_per_key = vec![Vec::new(); 5];
    for i in 0..100 {
        let key = (i % 5) as i64;
        let tag = format!("t{i}");
        expected_tags_per_key[key as usize].push(tag.clone());
        sorter.write(&tagged_key(key, &tag)).unwrap();
    }
    sorter.rewind().unwrap();
    assert!(sorter.spill_count() > 1);

    let out = drain(&mut sorter);
    assert_eq!(out.len(), 100);
    for key in 0..5i64 {
        let tags: Vec<String> = out
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, t)| t.clone())
            .collect();
        assert_eq!(tags, expected_tags_per_key[key as usize], "key {key}");
    }
}

#[test]
fn test_monotonic_output() {
    let mut sorter = tagged_sorter(&config(128, 0));
    for (i, k) in scrambled_keys(500).iter().enumerate() {
        sorter.write(&tagged_key(*k, &format!("t{i}"))).unwrap();
    }
    sorter.rewind().unwrap();
    let out = drain(&mut sorter);
    assert_eq!(out.len(), 500);
    for pair in out.windows(2) {
        assert!(pair[0].0 <= pair[1].0, "output must be non-decreasing");
    }
}

// ============================================================================
// Deep Merge Trees
// ============================================================================

#[test]
fn test_multi_level_merge_past_fanin() {
    // one PMA per record forces a hierarchical merge above 16 runs
    let keys = scrambled_keys(50);
    let mut sorter = tagged_sorter(&config(0, 0));
    for (i, k) in keys.iter().enumerate() {
        sorter.write(&tagged_key(*k, &format!("t{i}"))).unwrap();
    }
    sorter.rewind().unwrap();
    assert_eq!(sorter.spill_count(), 50);

    let mut sorted = keys.clone();
    sorted.sort_unstable();
    let out: Vec<i64> = drain(&mut sorter).into_iter().map(|(k, _)| k).collect();
    assert_eq!(out, sorted);
}

#[test]
fn test_multi_threaded_matches_single_threaded() {
    let keys = scrambled_keys(400);

    let run = |workers: usize| {
        let mut sorter = tagged_sorter(&config(256, workers));
        for (i, k) in keys.iter().enumerate() {
            sorter.write(&tagged_key(*k, &format!("t{i}"))).unwrap();
        }
        sorter.rewind().unwrap();
        drain(&mut sorter)
    };

    let mut single = run(0);
    let mut threaded = run(3);
    assert_eq!(single.len(), threaded.len());
    // output order within equal keys is not promised across workers;
    // compare as sorted multisets
    single.sort();
    threaded.sort();
    assert_eq!(single, threaded);
}

#[test]
fn test_multi_threaded_deep_merge() {
    let keys = scrambled_keys(60);
    let mut sorter = tagged_sorter(&config(0, 2));
    for (i, k) in keys.iter().enumerate() {
        sorter.write(&tagged_key(*k, &format!("t{i}"))).unwrap();
    }
    sorter.rewind().unwrap();

    let mut sorted = keys.clone();
    sorted.sort_unstable();
    let out: Vec<i64> = drain(&mut sorter).into_iter().map(|(k, _)| k).collect();
    assert_eq!(out, sorted);
}

// ============================================================================
// Storage Regimes and Reuse
// ============================================================================

#[test]
fn test_bulk_arena_matches_heap_regime() {
    let keys = scrambled_keys(120);

    let run = |bulk: bool| {
        let mut cfg = config(512, 0);
        cfg.bulk_arena = bulk;
        let mut sorter = tagged_sorter(&cfg);
        for (i, k) in keys.iter().enumerate() {
            sorter.write(&tagged_key(*k, &format!("t{i}"))).unwrap();
        }
        sorter.rewind().unwrap();
        drain(&mut sorter)
    };

    assert_eq!(run(false), run(true));
}

#[test]
fn test_reset_allows_reuse() {
    let mut sorter = tagged_sorter(&config(64, 0));
    for i in 0..50 {
        sorter.write(&tagged_key(i, "first")).unwrap();
    }
    sorter.rewind().unwrap();
    assert!(!drain(&mut sorter).is_empty());

    sorter.reset();
    assert_eq!(sorter.spill_count(), 0);
    for (k, t) in [(3, "x"), (1, "y"), (2, "z")] {
        sorter.write(&tagged_key(k, t)).unwrap();
    }
    sorter.rewind().unwrap();
    assert_eq!(
        drain(&mut sorter),
        vec![
            (1, "y".to_string()),
            (2, "z".to_string()),
            (3, "x".to_string()),
        ]
    );
}

#[test]
fn test_large_records_straddle_pages() {
    // records bigger than the I/O page exercise the straddle path
    let mut cfg = config(16 * 1024, 0);
    cfg.page_size = 512;
    let mut sorter = tagged_sorter(&cfg);
    let payload = "x".repeat(2000);
    for k in (0..40i64).rev() {
        sorter
            .write(&tagged_key(k, &format!("{payload}{k}")))
            .unwrap();
    }
    sorter.rewind().unwrap();
    assert!(sorter.spill_count() > 1);

    let out = drain(&mut sorter);
    assert_eq!(out.len(), 40);
    for (i, (k, tag)) in out.iter().enumerate() {
        assert_eq!(*k, i as i64);
        assert_eq!(tag, &format!("{payload}{k}"));
    }
}
