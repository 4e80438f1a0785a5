//! # One-to-Many Index
//!
//! An invertible index from keys to multiple values. Each row is a fixed
//! 24-byte record:
//!
//! ```text
//! [key_index: u32][value_index: u32][key: i64][value: i64]
//! ```
//!
//! Both the sparse `i64` endpoints *and* their dense canonical positions
//! are stored, because bitset-based graph projections need small integer
//! indices that map back to sparse ids without hashing.
//!
//! On close the forward file is sorted by the compound 128-bit
//! `(key, value)` starting at byte 8: one sort pass gives key order with
//! values ascending inside each key run, so every query is a binary
//! search to the first row of a run followed by a sequential scan. A
//! `.counts` sidecar with one 16-byte row per distinct key is emitted in
//! the same pass.
//!
//! The inverse (`value → keys`) lives in a sibling `.m21` file sorted the
//! same way with the tuple flipped. It is written inline when requested
//! before the first `put`, at close when requested later, or materialized
//! on demand by the first `reader.inverse()` call.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use eyre::{ensure, eyre, Result, WrapErr};
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use tracing::debug;
use zerocopy::little_endian::{I64, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::{AnyStorage, Bias, RecordIter, Storage, StorageSpec, ValueType};

/// Width of one forward/inverse row.
pub const EDGE_RECORD_BYTES: u32 = 24;

/// Width of one counts-sidecar row.
pub const COUNT_RECORD_BYTES: u32 = 16;

const KEY_OFFSET: u32 = 8;
const COUNT_KEY_OFFSET: u32 = 4;
const COUNT_COUNT_OFFSET: u32 = 12;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct EdgeRecord {
    key_index: U32,
    value_index: U32,
    key: I64,
    value: I64,
}

const _: () = assert!(std::mem::size_of::<EdgeRecord>() == EDGE_RECORD_BYTES as usize);

impl EdgeRecord {
    fn new(key_index: u32, value_index: u32, key: i64, value: i64) -> Self {
        Self {
            key_index: U32::new(key_index),
            value_index: U32::new(value_index),
            key: I64::new(key),
            value: I64::new(value),
        }
    }

    fn flipped(&self) -> Self {
        Self {
            key_index: self.value_index,
            value_index: self.key_index,
            key: self.value,
            value: self.key,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct CountRecord {
    key_index: U32,
    key: I64,
    count: U32,
}

const _: () = assert!(std::mem::size_of::<CountRecord>() == COUNT_RECORD_BYTES as usize);

fn edge_record(bytes: &[u8]) -> Result<EdgeRecord> {
    EdgeRecord::read_from_bytes(bytes).map_err(|_| eyre!("malformed 24-byte index record"))
}

/// Factory for the related files of one one-to-many index.
#[derive(Debug, Clone)]
pub struct OneToManyIndex {
    dir: PathBuf,
    name: String,
    spec: StorageSpec,
}

impl OneToManyIndex {
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        Self::with_spec(dir, name, StorageSpec::template())
    }

    pub fn with_spec(dir: impl AsRef<Path>, name: &str, template: StorageSpec) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            name: name.to_string(),
            spec: template.with_record_size(EDGE_RECORD_BYTES),
        }
    }

    fn forward_path(&self) -> PathBuf {
        self.dir.join(format!("{}.12m", self.name))
    }

    pub fn exists(&self) -> bool {
        self.forward_path().exists()
    }

    /// Rows in the forward file.
    pub fn len(&self) -> u64 {
        std::fs::metadata(self.forward_path())
            .map(|meta| meta.len() / EDGE_RECORD_BYTES as u64)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn writer(&self) -> Result<OneToManyWriter> {
        let path = self.forward_path();
        let forward = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
        Ok(OneToManyWriter {
            dir: self.dir.clone(),
            name: self.name.clone(),
            spec: self.spec.clone(),
            forward,
            forward_len: AtomicU64::new(0),
            inverse: Mutex::new(None),
            inverse_len: AtomicU64::new(0),
            inverse_requested: AtomicBool::new(false),
        })
    }

    pub fn reader(&self) -> Result<OneToManyReader> {
        OneToManyReader::open(self.dir.clone(), self.name.clone(), self.spec.clone(), false)
    }
}

/// Append-side of a one-to-many index.
#[derive(Debug)]
pub struct OneToManyWriter {
    dir: PathBuf,
    name: String,
    spec: StorageSpec,
    forward: File,
    forward_len: AtomicU64,
    inverse: Mutex<Option<File>>,
    inverse_len: AtomicU64,
    inverse_requested: AtomicBool,
}

impl OneToManyWriter {
    /// Requests the inverse index. Called before the first `put`, the
    /// inverse file is written inline alongside the forward one; called
    /// later, it is rebuilt from the forward file at close.
    pub fn build_inverse(&self) -> Result<()> {
        self.inverse_requested.store(true, Ordering::Release);
        let mut inverse = self.inverse.lock();
        if inverse.is_none() && self.forward_len.load(Ordering::Acquire) == 0 {
            let path = self.inverse_path();
            debug!(index = %self.name, "writing inverse index inline");
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
            *inverse = Some(file);
        }
        Ok(())
    }

    /// Appends one key → value row (and its flip, when the inverse is
    /// inline). Thread-safe.
    pub fn put(&self, key_index: u32, value_index: u32, key: i64, value: i64) -> Result<()> {
        let edge = EdgeRecord::new(key_index, value_index, key, value);
        let row = self.forward_len.fetch_add(1, Ordering::AcqRel);
        self.forward
            .write_all_at(edge.as_bytes(), row * EDGE_RECORD_BYTES as u64)
            .wrap_err("failed to append forward row")?;
        let inverse = self.inverse.lock();
        if let Some(file) = inverse.as_ref() {
            let row = self.inverse_len.fetch_add(1, Ordering::AcqRel);
            file.write_all_at(edge.flipped().as_bytes(), row * EDGE_RECORD_BYTES as u64)
                .wrap_err("failed to append inverse row")?;
        }
        Ok(())
    }

    /// Rows written so far.
    pub fn len(&self) -> u64 {
        self.forward_len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn inverse_path(&self) -> PathBuf {
        self.dir.join(format!("{}.m21", self.name))
    }

    fn sorted_store(&self, file: File) -> Result<AnyStorage> {
        let spec = self
            .spec
            .with_record_size(EDGE_RECORD_BYTES)
            .always_mapped()
            .read_write();
        AnyStorage::create(file, &spec)
    }

    /// Sorts the forward file by compound (key, value), emits the counts
    /// sidecar, and finishes the inverse if one was requested.
    pub fn close(self) -> Result<()> {
        if self.forward_len.load(Ordering::Acquire) == 0 {
            return self.forward.sync_all().wrap_err("failed to sync empty index");
        }
        self.forward.sync_all()?;
        let store = self.sorted_store(self.forward.try_clone()?)?;
        let started = Instant::now();
        store.sort(KEY_OFFSET, ValueType::U128)?;
        debug!(index = %self.name, rows = store.size(), elapsed = ?started.elapsed(), "sorted forward index");

        self.write_counts(&store)?;
        store.sync()?;

        if self.inverse_requested.load(Ordering::Acquire) {
            if let Some(file) = self.inverse.lock().take() {
                file.sync_all()?;
                let inverse = self.sorted_store(file)?;
                let started = Instant::now();
                inverse.sort(KEY_OFFSET, ValueType::U128)?;
                inverse.sync()?;
                debug!(index = %self.name, elapsed = ?started.elapsed(), "sorted inline inverse index");
            } else {
                debug!(index = %self.name, "materializing inverse index at close");
                materialize_inverse(&store, &self.inverse_path(), &self.spec)?;
            }
        }
        Ok(())
    }

    fn write_counts(&self, store: &AnyStorage) -> Result<()> {
        let path = self.dir.join(format!("{}.counts", self.name));
        let file = File::create(&path)
            .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
        let mut out = BufWriter::new(&file);
        // One row per distinct key; rows arrive sorted, so a key change
        // closes the previous run.
        let mut run: Option<(i64, u32, u32)> = None;
        for view in store.iter() {
            let edge = edge_record(&view?)?;
            match &mut run {
                Some((key, _, count)) if *key == edge.key.get() => *count += 1,
                _ => {
                    if let Some((key, key_index, count)) = run.take() {
                        let record = CountRecord {
                            key_index: U32::new(key_index),
                            key: I64::new(key),
                            count: U32::new(count),
                        };
                        out.write_all(record.as_bytes())?;
                    }
                    run = Some((edge.key.get(), edge.key_index.get(), 1));
                }
            }
        }
        if let Some((key, key_index, count)) = run {
            let record = CountRecord {
                key_index: U32::new(key_index),
                key: I64::new(key),
                count: U32::new(count),
            };
            out.write_all(record.as_bytes())?;
        }
        out.flush()?;
        drop(out);
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", path.display()))
    }
}

/// Streams `source`, flips every row, and sorts the result into `path`.
fn materialize_inverse(source: &AnyStorage, path: &Path, spec: &StorageSpec) -> Result<()> {
    let started = Instant::now();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
    {
        let mut out = BufWriter::new(&file);
        for view in source.iter() {
            let edge = edge_record(&view?)?;
            out.write_all(edge.flipped().as_bytes())?;
        }
        out.flush()?;
    }
    file.sync_all()?;
    let store = AnyStorage::create(
        file,
        &spec
            .with_record_size(EDGE_RECORD_BYTES)
            .always_mapped()
            .read_write(),
    )?;
    store.sort(KEY_OFFSET, ValueType::U128)?;
    store.sync()?;
    debug!(path = %path.display(), elapsed = ?started.elapsed(), "materialized inverse index");
    Ok(())
}

/// What a scan visitor decides after seeing a row.
enum Step {
    /// Row does not belong to the run; stop without counting it.
    Halt,
    /// Row visited; keep scanning.
    Advance,
    /// Row visited; the caller is done.
    Finish,
}

/// Query-side of a one-to-many index (or of its inverse).
#[derive(Debug)]
pub struct OneToManyReader {
    dir: PathBuf,
    name: String,
    spec: StorageSpec,
    store: AnyStorage,
    counts: AnyStorage,
    len: u64,
    is_inverse: bool,
    sibling: Mutex<Option<Arc<OneToManyReader>>>,
}

impl OneToManyReader {
    fn open(dir: PathBuf, name: String, spec: StorageSpec, is_inverse: bool) -> Result<Self> {
        let suffix = if is_inverse { "m21" } else { "12m" };
        let index_path = dir.join(format!("{name}.{suffix}"));
        let counts_path = dir.join(format!("{name}.counts"));
        let store = AnyStorage::open_path(
            &index_path,
            &spec.with_record_size(EDGE_RECORD_BYTES).read_only(),
        )?;
        let counts = AnyStorage::open_path(
            &counts_path,
            &spec.with_record_size(COUNT_RECORD_BYTES).read_only(),
        )?;
        let len = store.size();
        ensure!(
            len > 0,
            "one-to-many index '{}' is empty",
            index_path.display()
        );
        Ok(Self {
            dir,
            name,
            spec,
            store,
            counts,
            len,
            is_inverse,
            sibling: Mutex::new(None),
        })
    }

    /// Rows in this direction's file.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this reader serves the value → key direction.
    pub fn is_inverse(&self) -> bool {
        self.is_inverse
    }

    /// Smallest key in the index.
    pub fn min(&self) -> Result<i64> {
        self.store.read_value(0, KEY_OFFSET, ValueType::I64)
    }

    /// Largest key in the index.
    pub fn max(&self) -> Result<i64> {
        self.store
            .read_value(self.len - 1, KEY_OFFSET, ValueType::I64)
    }

    /// The reader over the opposite direction, materializing its file on
    /// first use and memoizing the sibling.
    pub fn inverse(&self) -> Result<Arc<OneToManyReader>> {
        let mut sibling = self.sibling.lock();
        if let Some(existing) = sibling.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let suffix = if self.is_inverse { "12m" } else { "m21" };
        let path = self.dir.join(format!("{}.{suffix}", self.name));
        if !path.exists() {
            materialize_inverse(&self.store, &path, &self.spec)?;
        }
        let reader = Arc::new(Self::open(
            self.dir.clone(),
            self.name.clone(),
            self.spec.clone(),
            !self.is_inverse,
        )?);
        *sibling = Some(Arc::clone(&reader));
        Ok(reader)
    }

    /// Core run scan: binary-search to the first row of the key's run,
    /// then walk forward while the visitor keeps accepting.
    fn scan_run(
        &self,
        start: i64,
        mut visit: impl FnMut(&EdgeRecord) -> Step,
    ) -> Result<u64> {
        if start < 0 {
            return Ok(0);
        }
        let mut visited = 0u64;
        for row in (start as u64)..self.len {
            let view = self.store.read(row)?;
            let edge = edge_record(&view)?;
            drop(view);
            match visit(&edge) {
                Step::Halt => break,
                Step::Advance => visited += 1,
                Step::Finish => {
                    visited += 1;
                    break;
                }
            }
        }
        Ok(visited)
    }

    fn run_start_by_key(&self, key: i64) -> Result<i64> {
        self.store
            .binary_search(key, KEY_OFFSET, ValueType::I64, Bias::Backward)
    }

    fn run_start_by_key_index(&self, key_index: u32) -> Result<i64> {
        self.store
            .binary_search(key_index as i64, 0, ValueType::U32, Bias::Backward)
    }

    /// Visits every value mapped from `key`, in ascending value order,
    /// until `visit` returns false. Returns the number of rows visited.
    pub fn values(&self, key: i64, mut visit: impl FnMut(i64) -> bool) -> Result<u64> {
        let start = self.run_start_by_key(key)?;
        self.scan_run(start, |edge| {
            if edge.key.get() != key {
                Step::Halt
            } else if visit(edge.value.get()) {
                Step::Advance
            } else {
                Step::Finish
            }
        })
    }

    /// Like [`values`](Self::values), also handing the visitor each
    /// value's canonical index.
    pub fn values_with_index(
        &self,
        key: i64,
        mut visit: impl FnMut(u32, i64) -> bool,
    ) -> Result<u64> {
        let start = self.run_start_by_key(key)?;
        self.scan_run(start, |edge| {
            if edge.key.get() != key {
                Step::Halt
            } else if visit(edge.value_index.get(), edge.value.get()) {
                Step::Advance
            } else {
                Step::Finish
            }
        })
    }

    /// Visits values by the key's canonical index instead of the key.
    /// Assumes key indexes ascend with keys, which holds when indexes
    /// were assigned in key order.
    pub fn values_by_key_index(
        &self,
        key_index: u32,
        mut visit: impl FnMut(u32, i64) -> bool,
    ) -> Result<u64> {
        let start = self.run_start_by_key_index(key_index)?;
        self.scan_run(start, |edge| {
            if edge.key_index.get() != key_index {
                Step::Halt
            } else if visit(edge.value_index.get(), edge.value.get()) {
                Step::Advance
            } else {
                Step::Finish
            }
        })
    }

    /// Visits the full 4-tuple of every row in `key`'s run.
    pub fn read(
        &self,
        key: i64,
        mut visit: impl FnMut(u32, u32, i64, i64) -> bool,
    ) -> Result<u64> {
        let start = self.run_start_by_key(key)?;
        self.scan_run(start, |edge| {
            if edge.key.get() != key {
                Step::Halt
            } else if visit(
                edge.key_index.get(),
                edge.value_index.get(),
                edge.key.get(),
                edge.value.get(),
            ) {
                Step::Advance
            } else {
                Step::Finish
            }
        })
    }

    /// Visits the full 4-tuple of every row in a key index's run.
    pub fn read_by_key_index(
        &self,
        key_index: u32,
        mut visit: impl FnMut(u32, u32, i64, i64) -> bool,
    ) -> Result<u64> {
        let start = self.run_start_by_key_index(key_index)?;
        self.scan_run(start, |edge| {
            if edge.key_index.get() != key_index {
                Step::Halt
            } else if visit(
                edge.key_index.get(),
                edge.value_index.get(),
                edge.key.get(),
                edge.value.get(),
            ) {
                Step::Advance
            } else {
                Step::Finish
            }
        })
    }

    /// All value indexes mapped from `key`; empty when the key is absent.
    pub fn value_indices(&self, key: i64) -> Result<RoaringBitmap> {
        let mut bits = RoaringBitmap::new();
        self.values_with_index(key, |value_index, _| {
            bits.insert(value_index);
            true
        })?;
        Ok(bits)
    }

    /// All value indexes mapped from a key index; empty when absent.
    pub fn value_indices_by_key_index(&self, key_index: u32) -> Result<RoaringBitmap> {
        let mut bits = RoaringBitmap::new();
        self.values_by_key_index(key_index, |value_index, _| {
            bits.insert(value_index);
            true
        })?;
        Ok(bits)
    }

    /// All values mapped from `key`, ordered.
    pub fn value_set(&self, key: i64) -> Result<std::collections::BTreeSet<i64>> {
        let mut set = std::collections::BTreeSet::new();
        self.values(key, |value| {
            set.insert(value);
            true
        })?;
        Ok(set)
    }

    /// Occurrence count of `key` from the counts sidecar, or `None` when
    /// absent. Meaningful on the forward direction only; the sidecar
    /// counts forward keys.
    pub fn count(&self, key: i64) -> Result<Option<u32>> {
        let hit = self
            .counts
            .binary_search(key, COUNT_KEY_OFFSET, ValueType::I64, Bias::None)?;
        if hit < 0 {
            return Ok(None);
        }
        let count = self
            .counts
            .read_value(hit as u64, COUNT_COUNT_OFFSET, ValueType::U32)?;
        Ok(Some(count as u32))
    }

    /// The stored key closest to `key` under `bias`, or −1.
    pub fn nearest_key(&self, key: i64, bias: Bias) -> Result<i64> {
        let hit = self
            .store
            .binary_search(key, KEY_OFFSET, ValueType::I64, bias)?;
        if hit < 0 {
            return Ok(-1);
        }
        self.store.read_value(hit as u64, KEY_OFFSET, ValueType::I64)
    }

    /// Hands the nearest row's (key, value) to `found`; false when no
    /// row qualifies.
    pub fn find_nearest(
        &self,
        key: i64,
        bias: Bias,
        found: impl FnOnce(i64, i64),
    ) -> Result<bool> {
        let hit = self
            .store
            .binary_search(key, KEY_OFFSET, ValueType::I64, bias)?;
        if hit < 0 {
            return Ok(false);
        }
        let view = self.store.read(hit as u64)?;
        let edge = edge_record(&view)?;
        found(edge.key.get(), edge.value.get());
        Ok(true)
    }

    /// Full scan of every row's 4-tuple.
    pub fn for_each(&self, mut visit: impl FnMut(u32, u32, i64, i64)) -> Result<()> {
        for view in self.store.iter() {
            let edge = edge_record(&view?)?;
            visit(
                edge.key_index.get(),
                edge.value_index.get(),
                edge.key.get(),
                edge.value.get(),
            );
        }
        Ok(())
    }

    /// Full scan stopping when `visit` returns false; returns rows
    /// visited.
    pub fn for_each_while(
        &self,
        mut visit: impl FnMut(u32, u32, i64, i64) -> bool,
    ) -> Result<u64> {
        let mut visited = 0u64;
        for view in self.store.iter() {
            let edge = edge_record(&view?)?;
            visited += 1;
            if !visit(
                edge.key_index.get(),
                edge.value_index.get(),
                edge.key.get(),
                edge.value.get(),
            ) {
                break;
            }
        }
        Ok(visited)
    }

    /// Lazy iteration over (key, value) pairs in storage order.
    pub fn pairs(&self) -> EdgePairs<'_> {
        EdgePairs {
            inner: self.store.iter(),
        }
    }

    /// Transitive visit along forward edges starting from `key`.
    /// Every newly discovered value is handed to `visit`; discovery
    /// stops when `visit` rejects a node. Cycles are broken by a
    /// visited set. Returns the number of nodes discovered.
    pub fn closure(&self, key: i64, mut visit: impl FnMut(i64) -> bool) -> Result<u64> {
        let mut seen = hashbrown::HashSet::new();
        let mut stack = vec![key];
        let mut discovered = 0u64;
        while let Some(node) = stack.pop() {
            let mut children = Vec::new();
            self.values(node, |value| {
                children.push(value);
                true
            })?;
            for child in children {
                if !seen.insert(child) {
                    continue;
                }
                discovered += 1;
                if !visit(child) {
                    return Ok(discovered);
                }
                stack.push(child);
            }
        }
        Ok(discovered)
    }
}

/// Iterator over (key, value) pairs of a one-to-many index.
pub struct EdgePairs<'a> {
    inner: RecordIter<'a, AnyStorage>,
}

impl Iterator for EdgePairs<'_> {
    type Item = Result<(i64, i64)>;

    fn next(&mut self) -> Option<Self::Item> {
        let view = self.inner.next()?;
        Some(view.and_then(|view| {
            let edge = edge_record(&view)?;
            Ok((edge.key.get(), edge.value.get()))
        }))
    }
}
