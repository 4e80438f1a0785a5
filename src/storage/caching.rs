//! # Caching Descriptor Storage
//!
//! Descriptor I/O that tries to amortize reads: each thread keeps six
//! window buffers, paired off to cover the head, middle and tail thirds
//! of the file. A read that lands inside a live window is served from
//! memory; a miss reloads the pair assigned to that record's third to
//! cover `[record, record + window)`. Pairs rotate so two interleaved
//! access positions in the same third don't thrash one buffer.
//!
//! Staleness is guarded by a single mutation counter: every write bumps
//! it, and a window is only usable while its captured counter still
//! matches. There is no per-window range invalidation: windows are
//! per-thread, so the only staleness a thread can observe is from its own
//! writes, and the counter catches exactly that.

use std::cell::RefCell;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;

use crate::storage::buffers::BufferPool;
use crate::storage::spec::StorageSpec;
use crate::storage::view::Record;
use crate::storage::Storage;

/// Records covered by one window buffer unless overridden.
pub const DEFAULT_CACHE_WINDOW: u64 = 64;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static WINDOWS: RefCell<HashMap<u64, ThreadWindows>> = RefCell::new(HashMap::new());
}

#[derive(Debug)]
pub struct CachingFdStorage {
    id: u64,
    file: File,
    record_size: u32,
    byte_size: u64,
    window_records: u64,
    mutations: AtomicU64,
    buffers: BufferPool,
}

impl CachingFdStorage {
    pub fn open(file: File, spec: &StorageSpec) -> Result<Self> {
        Self::with_window(file, spec, DEFAULT_CACHE_WINDOW)
    }

    /// Opens with an explicit window size in records.
    pub fn with_window(file: File, spec: &StorageSpec, window_records: u64) -> Result<Self> {
        spec.validate()?;
        ensure!(window_records > 0, "cache window must cover at least one record");
        let byte_size = file
            .metadata()
            .wrap_err("failed to stat storage file")?
            .len();
        ensure!(
            byte_size % spec.record_size() as u64 == 0,
            "file size {} is not a multiple of record size {}",
            byte_size,
            spec.record_size()
        );
        Ok(Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            file,
            record_size: spec.record_size(),
            byte_size,
            window_records,
            mutations: AtomicU64::new(0),
            buffers: spec.buffers(),
        })
    }

    fn check_record(&self, record: u64) -> Result<()> {
        ensure!(
            record < self.size(),
            "record {} out of bounds (size={})",
            record,
            self.size()
        );
        Ok(())
    }

    /// 0, 1 or 2: which third of the file `record` falls in.
    fn third(&self, record: u64) -> usize {
        let range = self.size() / 3;
        if range == 0 {
            0
        } else if record >= range * 2 {
            2
        } else if record >= range {
            1
        } else {
            0
        }
    }

    fn touch(&self) {
        self.mutations.fetch_add(1, Ordering::Release);
    }
}

impl Storage for CachingFdStorage {
    fn record_size(&self) -> u32 {
        self.record_size
    }

    fn size_in_bytes(&self) -> u64 {
        self.byte_size
    }

    fn read(&self, record: u64) -> Result<Record<'_>> {
        self.check_record(record)?;
        let mut out = self.buffers.acquire();
        WINDOWS.with(|cell| {
            let mut map = cell.borrow_mut();
            let windows = map
                .entry(self.id)
                .or_insert_with(|| ThreadWindows::new(self.window_records, self.record_size));
            windows.fill(self, record, &mut out)
        })?;
        Ok(Record::Pooled(out))
    }

    fn write_at(&self, byte_offset: u64, bytes: &[u8]) -> Result<()> {
        ensure!(
            byte_offset % self.record_size as u64 == 0,
            "write position {} is not a record boundary",
            byte_offset
        );
        ensure!(
            bytes.len() as u64 % self.record_size as u64 == 0,
            "write length {} is not a multiple of the record size",
            bytes.len()
        );
        self.file
            .write_all_at(bytes, byte_offset)
            .wrap_err_with(|| format!("failed to write {} bytes at {}", bytes.len(), byte_offset))?;
        self.touch();
        Ok(())
    }

    fn write_u32(&self, record: u64, value: u32, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        self.file
            .write_all_at(&value.to_le_bytes(), self.offset_of(record) + field_offset as u64)?;
        self.touch();
        Ok(())
    }

    fn write_i64(&self, record: u64, value: i64, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        self.file
            .write_all_at(&value.to_le_bytes(), self.offset_of(record) + field_offset as u64)?;
        self.touch();
        Ok(())
    }

    fn write_i16(&self, record: u64, value: i16, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        self.file
            .write_all_at(&value.to_le_bytes(), self.offset_of(record) + field_offset as u64)?;
        self.touch();
        Ok(())
    }

    fn swap(&self, a: u64, b: u64) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let left = self.read(a)?;
        let right = self.read(b)?;
        self.file.write_all_at(&left, self.offset_of(b))?;
        self.file.write_all_at(&right, self.offset_of(a))?;
        self.touch();
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data().wrap_err("failed to sync storage file")
    }
}

/// One thread's six windows: pairs (0,1), (2,3), (4,5) for the head,
/// middle and tail thirds.
#[derive(Debug)]
struct ThreadWindows {
    windows: [Window; 6],
    uses: [u64; 3],
}

impl ThreadWindows {
    fn new(window_records: u64, record_size: u32) -> Self {
        let len = (window_records * record_size as u64) as usize;
        Self {
            windows: std::array::from_fn(|_| Window::new(len)),
            uses: [0; 3],
        }
    }

    /// Copies `record` into `out`, loading a window on miss.
    fn fill(&mut self, store: &CachingFdStorage, record: u64, out: &mut [u8]) -> Result<()> {
        let third = store.third(record);
        let mutations = store.mutations.load(Ordering::Acquire);

        // Probe the pairs whose coverage could include this third:
        // the middle pair is always worth a look, the head and tail
        // pairs only for their own and the adjacent third.
        let mut probes = [usize::MAX; 6];
        let mut probe_count = 0;
        if third <= 1 {
            probes[probe_count] = 0;
            probes[probe_count + 1] = 1;
            probe_count += 2;
        }
        probes[probe_count] = 2;
        probes[probe_count + 1] = 3;
        probe_count += 2;
        if third >= 1 {
            probes[probe_count] = 4;
            probes[probe_count + 1] = 5;
            probe_count += 2;
        }
        for &probe in &probes[..probe_count] {
            if self.windows[probe].copy_if_live(store, mutations, record, out) {
                return Ok(());
            }
        }

        // Miss: rotate within the pair owning this third and reload.
        // The fresh window serves this read unconditionally; its captured
        // counter gates only future reads.
        self.uses[third] += 1;
        let target = third * 2 + (self.uses[third] % 2) as usize;
        self.windows[target].load(store, record)?;
        self.windows[target].copy(store, record, out);
        Ok(())
    }
}

#[derive(Debug)]
struct Window {
    buf: Box<[u8]>,
    start: u64,
    count: u64,
    mutation: u64,
}

impl Window {
    fn new(len: usize) -> Self {
        Self {
            buf: vec![0u8; len].into_boxed_slice(),
            start: 0,
            count: 0,
            mutation: u64::MAX,
        }
    }

    fn copy_if_live(
        &self,
        store: &CachingFdStorage,
        mutations: u64,
        record: u64,
        out: &mut [u8],
    ) -> bool {
        if self.mutation != mutations || record < self.start || record >= self.start + self.count {
            return false;
        }
        self.copy(store, record, out);
        true
    }

    fn copy(&self, store: &CachingFdStorage, record: u64, out: &mut [u8]) {
        let offset = ((record - self.start) * store.record_size as u64) as usize;
        out.copy_from_slice(&self.buf[offset..offset + store.record_size as usize]);
    }

    fn load(&mut self, store: &CachingFdStorage, record: u64) -> Result<()> {
        let count = store.window_records.min(store.size() - record);
        let len = (count * store.record_size as u64) as usize;
        store
            .file
            .read_exact_at(&mut self.buf[..len], store.offset_of(record))
            .wrap_err_with(|| format!("failed to load cache window at record {record}"))?;
        self.start = record;
        self.count = count;
        self.mutation = store.mutations.load(Ordering::Acquire);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::view::ByteView;
    use crate::ValueType;
    use std::io::Write;

    fn cached_store(records: u64, window: u64) -> (tempfile::NamedTempFile, CachingFdStorage) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        for i in 0..records {
            let mut rec = vec![0u8; 12];
            rec.put_u32(0, i as u32);
            rec.put_i64(4, i as i64 * 3);
            tmp.write_all(&rec).unwrap();
        }
        tmp.flush().unwrap();
        let stor =
            CachingFdStorage::with_window(tmp.reopen().unwrap(), &StorageSpec::new(12), window)
                .unwrap();
        (tmp, stor)
    }

    #[test]
    fn cached_reads_match_the_file() {
        let (_tmp, store) = cached_store(300, 16);
        for i in 0..300 {
            assert_eq!(store.read_value(i, 4, ValueType::I64).unwrap(), i as i64 * 3);
        }
        // Again, now that windows are warm.
        for i in (0..300).rev() {
            assert_eq!(store.read_value(i, 4, ValueType::I64).unwrap(), i as i64 * 3);
        }
    }

    #[test]
    fn a_write_invalidates_cached_windows() {
        let (_tmp, store) = cached_store(64, 32);
        assert_eq!(store.read_value(10, 4, ValueType::I64).unwrap(), 30);
        store.write_i64(10, 999, 4).unwrap();
        assert_eq!(store.read_value(10, 4, ValueType::I64).unwrap(), 999);
    }

    #[test]
    fn swap_through_the_cache() {
        let (_tmp, store) = cached_store(100, 8);
        store.swap(2, 90).unwrap();
        assert_eq!(store.read_value(2, 4, ValueType::I64).unwrap(), 270);
        assert_eq!(store.read_value(90, 4, ValueType::I64).unwrap(), 6);
    }

    #[test]
    fn sort_and_search_through_the_cache() {
        let (_tmp, store) = cached_store(200, 16);
        for i in 0..100 {
            store.swap(i, 199 - i).unwrap();
        }
        store.sort(4, ValueType::I64).unwrap();
        for i in 0..200u64 {
            let hit = store
                .binary_search(i as i64 * 3, 4, ValueType::I64, crate::Bias::None)
                .unwrap();
            assert_eq!(hit, i as i64);
        }
    }
}
