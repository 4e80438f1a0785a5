//! # Index Writer/Reader End-to-End Tests
//!
//! Write through an [`IndexWriter`], reopen through an [`IndexReader`],
//! and check that every lookup path (canonical binary search, shadow
//! files, field reads) lands on the records that were written.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::tempdir;

use recdb::{Bias, ByteView, IndexKind, IndexReader, IndexWriter, Schema, ValueType};

fn canonical_only_schema() -> Schema {
    Schema::builder()
        .field("off", ValueType::I64, IndexKind::CanonicalOrdering)
        .field("data", ValueType::I64, IndexKind::None)
        .build()
        .unwrap()
}

fn canonical_and_unique_schema() -> Schema {
    Schema::builder()
        .field("off", ValueType::I64, IndexKind::CanonicalOrdering)
        .field("id", ValueType::I64, IndexKind::Unique)
        .build()
        .unwrap()
}

#[test]
fn primary_read_after_write() {
    let dir = tempdir().unwrap();
    let schema = canonical_only_schema();
    assert_eq!(schema.record_size(), 20);

    let writer = IndexWriter::create(dir.path(), "items", schema.clone()).unwrap();
    for i in 0..1000i64 {
        writer.write(&[i * 23, !i]).unwrap();
    }
    writer.close().unwrap();

    let reader = IndexReader::open(dir.path(), "items", schema).unwrap();
    assert_eq!(reader.len(), 1000);

    let record = reader.get(42).unwrap();
    assert_eq!(record.get_u32(0), 42);
    assert_eq!(record.get_i64(4), 42 * 23);
    assert_eq!(record.get_i64(12), !42);

    assert_eq!(reader.index_of_canonical(23 * 314).unwrap(), 314);
    assert_eq!(reader.search(0, 23 * 314, Bias::None).unwrap(), 314);
    assert_eq!(reader.value_for(314, 0).unwrap(), 23 * 314);
}

#[test]
fn unique_field_round_trips_through_its_shadow_file() {
    let dir = tempdir().unwrap();
    let schema = canonical_and_unique_schema();

    // 1000 distinct pseudo-random ids in shuffled order.
    let mut ids: Vec<i64> = (0..1000).map(|i| i * 7919 + 13).collect();
    ids.shuffle(&mut StdRng::seed_from_u64(99));

    let writer = IndexWriter::create(dir.path(), "nodes", schema.clone()).unwrap();
    for (i, &id) in ids.iter().enumerate() {
        writer.write(&[i as i64 * 10, id]).unwrap();
    }
    writer.close().unwrap();
    assert!(dir.path().join("nodes.ids").exists());

    let reader = IndexReader::open(dir.path(), "nodes", schema).unwrap();
    for (i, &id) in ids.iter().enumerate() {
        assert_eq!(reader.index_of(1, id).unwrap(), i as i64, "id {id}");
        assert_eq!(reader.index_of(0, i as i64 * 10).unwrap(), i as i64);
    }
    assert_eq!(reader.index_of(1, -1).unwrap(), -1);
}

#[test]
fn nearest_searches_against_the_canonical_field() {
    let dir = tempdir().unwrap();
    let schema = canonical_only_schema();
    let writer = IndexWriter::create(dir.path(), "sparse", schema.clone()).unwrap();
    for i in 0..100i64 {
        writer.write(&[i * 10, i]).unwrap();
    }
    writer.close().unwrap();

    let reader = IndexReader::open(dir.path(), "sparse", schema).unwrap();
    assert_eq!(reader.search_canonical(42, Bias::None).unwrap(), -1);
    assert_eq!(reader.search_canonical(42, Bias::Backward).unwrap(), 4);
    assert_eq!(reader.search_canonical(42, Bias::Forward).unwrap(), 5);
    assert_eq!(reader.search_canonical(42, Bias::Nearest).unwrap(), 4);

    let found = reader.find(0, 500, Bias::None).unwrap().unwrap();
    assert_eq!(found.get_u32(0), 50);
    assert!(reader.find(0, 501, Bias::None).unwrap().is_none());
}

#[test]
fn searching_a_non_indexed_field_fails() {
    let dir = tempdir().unwrap();
    let schema = canonical_only_schema();
    let writer = IndexWriter::create(dir.path(), "plain", schema.clone()).unwrap();
    writer.write(&[1, 2]).unwrap();
    writer.close().unwrap();

    let reader = IndexReader::open(dir.path(), "plain", schema).unwrap();
    let err = reader.search(1, 2, Bias::None).unwrap_err();
    assert!(err.to_string().contains("not indexed"), "{err}");
}

#[test]
fn second_thread_fails_fast_without_a_canonical_field() {
    let dir = tempdir().unwrap();
    let schema = Schema::builder()
        .field("id", ValueType::I64, IndexKind::Unique)
        .build()
        .unwrap();
    let writer = Arc::new(IndexWriter::create(dir.path(), "strict", schema).unwrap());
    assert!(!writer.supports_multi_threaded_writes());
    writer.write(&[7]).unwrap();

    let other = Arc::clone(&writer);
    let result = std::thread::spawn(move || other.write(&[8]))
        .join()
        .unwrap();
    let err = result.unwrap_err();
    assert!(
        err.to_string().contains("CANONICAL_ORDERING"),
        "unexpected error: {err}"
    );
}

#[test]
fn multi_threaded_writes_are_sorted_and_renumbered_at_close() {
    let dir = tempdir().unwrap();
    let schema = canonical_and_unique_schema();
    let writer = Arc::new(IndexWriter::create(dir.path(), "par", schema.clone()).unwrap());
    assert!(writer.supports_multi_threaded_writes());

    // Four threads, each writing a strided slice of the key space, so
    // arrival order is thoroughly interleaved.
    std::thread::scope(|scope| {
        for t in 0..4i64 {
            let writer = Arc::clone(&writer);
            scope.spawn(move || {
                for k in 0..250i64 {
                    let i = k * 4 + t;
                    writer.write(&[i * 10, i + 100_000]).unwrap();
                }
            });
        }
    });
    assert_eq!(writer.len(), 1000);
    Arc::into_inner(writer).unwrap().close().unwrap();

    let reader = IndexReader::open(dir.path(), "par", schema).unwrap();
    assert_eq!(reader.len(), 1000);
    // After close the primary is in ascending canonical order and every
    // sequence number equals its position.
    for i in 0..1000u64 {
        let record = reader.get(i).unwrap();
        assert_eq!(record.get_u32(0), i as u32, "seq at {i}");
        assert_eq!(record.get_i64(4), i as i64 * 10, "off at {i}");
    }
    // The unique shadow still resolves to primary positions.
    for i in (0..1000).step_by(97) {
        assert_eq!(reader.index_of(1, i + 100_000).unwrap(), i);
    }
}

#[test]
fn closing_an_empty_index_leaves_empty_files() {
    let dir = tempdir().unwrap();
    let schema = canonical_and_unique_schema();
    let writer = IndexWriter::create(dir.path(), "empty", schema.clone()).unwrap();
    writer.close().unwrap();

    assert_eq!(
        std::fs::metadata(dir.path().join("empty.offsets")).unwrap().len(),
        0
    );
    assert_eq!(
        std::fs::metadata(dir.path().join("empty.ids")).unwrap().len(),
        0
    );
}
