//! # One-to-Many Index End-to-End Tests
//!
//! Forward queries, the counts sidecar, bitmap projections, inverse
//! symmetry (inline and materialized-on-demand), and transitive closure.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use recdb::{Bias, OneToManyIndex};

/// Keys 1000, 1002, … 1010, each mapping to `1 + key % 23` values of the
/// form `key × 100 + 23·t`.
fn stepped_index(dir: &std::path::Path) -> OneToManyIndex {
    let index = OneToManyIndex::new(dir, "edges");
    let writer = index.writer().unwrap();
    let mut value_index = 0u32;
    for (key_index, key) in (1000i64..=1010).step_by(2).enumerate() {
        let count = 1 + key % 23;
        for t in 0..count {
            writer
                .put(key_index as u32, value_index, key, key * 100 + 23 * t)
                .unwrap();
            value_index += 1;
        }
    }
    writer.close().unwrap();
    index
}

#[test]
fn values_arrive_in_ascending_order() {
    let dir = tempdir().unwrap();
    let index = stepped_index(dir.path());
    let reader = index.reader().unwrap();

    let expected: Vec<i64> = (0..(1 + 1004 % 23)).map(|t| 1004 * 100 + 23 * t).collect();
    let mut got = Vec::new();
    let visited = reader
        .values(1004, |value| {
            got.push(value);
            true
        })
        .unwrap();
    assert_eq!(got, expected);
    assert_eq!(visited, expected.len() as u64);

    // An absent key yields nothing.
    assert_eq!(reader.values(1003, |_| true).unwrap(), 0);

    // A rejecting visitor stops the scan but counts the visited row.
    let visited = reader.values(1004, |_| false).unwrap();
    assert_eq!(visited, 1);
}

#[test]
fn nearest_key_bias_semantics() {
    let dir = tempdir().unwrap();
    let index = stepped_index(dir.path());
    let reader = index.reader().unwrap();

    assert_eq!(reader.nearest_key(1003, Bias::Forward).unwrap(), 1004);
    assert_eq!(reader.nearest_key(1003, Bias::None).unwrap(), -1);
    assert_eq!(reader.nearest_key(1003, Bias::Backward).unwrap(), 1002);
    // Equidistant: ties break backward.
    assert_eq!(reader.nearest_key(1003, Bias::Nearest).unwrap(), 1002);
    assert_eq!(reader.nearest_key(999, Bias::Backward).unwrap(), -1);
    assert_eq!(reader.min().unwrap(), 1000);
    assert_eq!(reader.max().unwrap(), 1010);

    let mut nearest = None;
    assert!(reader
        .find_nearest(1005, Bias::Forward, |k, v| nearest = Some((k, v)))
        .unwrap());
    assert_eq!(nearest.unwrap().0, 1006);
}

#[test]
fn counts_sidecar_matches_the_data() {
    let dir = tempdir().unwrap();
    let index = stepped_index(dir.path());
    let reader = index.reader().unwrap();

    let mut total = 0u64;
    for key in (1000i64..=1010).step_by(2) {
        let expected = (1 + key % 23) as u64;
        assert_eq!(reader.count(key).unwrap(), Some((1 + key % 23) as u32));
        assert_eq!(reader.values(key, |_| true).unwrap(), expected);
        total += expected;
    }
    assert_eq!(total, reader.len());
    assert_eq!(reader.count(1003).unwrap(), None);
}

#[test]
fn pairs_iterate_in_compound_key_order() {
    let dir = tempdir().unwrap();
    let index = stepped_index(dir.path());
    let reader = index.reader().unwrap();

    let pairs: Vec<(i64, i64)> = reader.pairs().map(|p| p.unwrap()).collect();
    assert_eq!(pairs.len() as u64, reader.len());
    assert!(pairs.windows(2).all(|w| w[0] <= w[1]), "not sorted: {pairs:?}");
}

/// A random bipartite graph, written with the inverse built inline.
fn random_graph(
    dir: &std::path::Path,
    seed: u64,
) -> (OneToManyIndex, BTreeMap<i64, BTreeSet<i64>>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut edges: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    for key in 0i64..40 {
        let fanout = rng.gen_range(1..12);
        for _ in 0..fanout {
            let value = 5_000 + rng.gen_range(0i64..60);
            edges.entry(key).or_default().insert(value);
        }
    }
    // Canonical positions ascend with the sparse ids.
    let value_ids: BTreeSet<i64> = edges.values().flatten().copied().collect();
    let value_position: BTreeMap<i64, u32> = value_ids
        .iter()
        .enumerate()
        .map(|(i, &v)| (v, i as u32))
        .collect();

    let index = OneToManyIndex::new(dir, "graph");
    let writer = index.writer().unwrap();
    writer.build_inverse().unwrap();
    for (key_index, (&key, values)) in edges.iter().enumerate() {
        for &value in values {
            writer
                .put(key_index as u32, value_position[&value], key, value)
                .unwrap();
        }
    }
    writer.close().unwrap();
    (index, edges)
}

#[test]
fn forward_and_inline_inverse_are_symmetric() {
    let dir = tempdir().unwrap();
    let (index, edges) = random_graph(dir.path(), 7);
    let reader = index.reader().unwrap();
    let inverse = reader.inverse().unwrap();
    assert!(inverse.is_inverse());

    for (&key, values) in &edges {
        let forward: BTreeSet<i64> = reader.value_set(key).unwrap();
        assert_eq!(forward, *values, "key {key}");
        for &value in values {
            let mut keys_of_value = BTreeSet::new();
            inverse
                .values(value, |k| {
                    keys_of_value.insert(k);
                    true
                })
                .unwrap();
            assert!(keys_of_value.contains(&key), "{value} -> {key}");
        }
    }

    // Counts match per key and in total.
    let total: u64 = edges.values().map(|v| v.len() as u64).sum();
    assert_eq!(total, reader.len());
    for (&key, values) in &edges {
        assert_eq!(reader.count(key).unwrap(), Some(values.len() as u32));
    }
}

#[test]
fn value_indices_project_into_a_bitmap() {
    let dir = tempdir().unwrap();
    let (index, edges) = random_graph(dir.path(), 11);
    let reader = index.reader().unwrap();

    let value_ids: BTreeSet<i64> = edges.values().flatten().copied().collect();
    let value_position: BTreeMap<i64, u32> = value_ids
        .iter()
        .enumerate()
        .map(|(i, &v)| (v, i as u32))
        .collect();

    for (key_index, (&key, values)) in edges.iter().enumerate() {
        let bits = reader.value_indices(key).unwrap();
        assert_eq!(bits.len() as usize, values.len(), "key {key}");
        for &value in values {
            assert!(bits.contains(value_position[&value]));
        }
        let by_index = reader.value_indices_by_key_index(key_index as u32).unwrap();
        assert_eq!(bits, by_index);
    }
    assert!(reader.value_indices(-5).unwrap().is_empty());
}

#[test]
fn inverse_is_materialized_on_demand_and_memoized() {
    let dir = tempdir().unwrap();
    // No build_inverse at write time.
    let index = OneToManyIndex::new(dir.path(), "lazy");
    let writer = index.writer().unwrap();
    writer.put(0, 0, 10, 500).unwrap();
    writer.put(0, 1, 10, 600).unwrap();
    writer.put(1, 0, 20, 500).unwrap();
    writer.close().unwrap();
    assert!(!dir.path().join("lazy.m21").exists());

    let reader = index.reader().unwrap();
    let inverse = reader.inverse().unwrap();
    assert!(dir.path().join("lazy.m21").exists());

    let mut keys = Vec::new();
    inverse
        .values(500, |k| {
            keys.push(k);
            true
        })
        .unwrap();
    assert_eq!(keys, vec![10, 20]);

    // Same sibling instance on the second ask.
    let again = reader.inverse().unwrap();
    assert!(std::sync::Arc::ptr_eq(&inverse, &again));
}

#[test]
fn closure_walks_transitively_and_survives_cycles() {
    let dir = tempdir().unwrap();
    let index = OneToManyIndex::new(dir.path(), "chain");
    let writer = index.writer().unwrap();
    writer.put(0, 1, 1, 2).unwrap();
    writer.put(1, 2, 2, 3).unwrap();
    writer.put(2, 3, 3, 4).unwrap();
    writer.put(3, 0, 4, 1).unwrap(); // cycle back to 1
    writer.close().unwrap();

    let reader = index.reader().unwrap();
    let mut seen = Vec::new();
    let discovered = reader
        .closure(1, |node| {
            seen.push(node);
            true
        })
        .unwrap();
    assert_eq!(discovered, 4);
    let as_set: BTreeSet<i64> = seen.iter().copied().collect();
    assert_eq!(as_set, BTreeSet::from([1, 2, 3, 4]));

    // A rejecting visitor stops discovery.
    let discovered = reader.closure(1, |_| false).unwrap();
    assert_eq!(discovered, 1);
}

#[test]
fn an_empty_index_cannot_be_opened_for_reading() {
    let dir = tempdir().unwrap();
    let index = OneToManyIndex::new(dir.path(), "void");
    let writer = index.writer().unwrap();
    writer.close().unwrap();
    assert!(index.reader().is_err());
    assert!(index.is_empty());
}
