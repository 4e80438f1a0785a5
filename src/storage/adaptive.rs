//! # Adaptive Storage
//!
//! Starts on cheap descriptor I/O and watches its own access rate
//! through a 128-slot timestamp ring. A store that is hammered (at
//! least half a ring of accesses landing within a second of each other)
//! is promoted to a mapped backend. Mapping failure is remembered in a
//! sticky `mem_limited` flag and never retried. A caller-invoked idle
//! check demotes a disused store, but only down to the caching
//! descriptor backend: a store that was hot once may well be hot again,
//! so some locality is kept.
//!
//! Because the live backend can be swapped at any moment, reads hand out
//! pooled copies rather than mapping slices; a view must never dangle
//! across a flip.

use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use eyre::{Result, WrapErr};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::storage::buffers::BufferPool;
use crate::storage::caching::CachingFdStorage;
use crate::storage::descriptor::FdStorage;
use crate::storage::multi_map::MultiMappedStorage;
use crate::storage::single_map::SingleMappedStorage;
use crate::storage::spec::StorageSpec;
use crate::storage::view::Record;
use crate::storage::{Storage, SINGLE_MAPPING_LIMIT};

#[derive(Debug)]
pub struct AdaptiveStorage {
    state: RwLock<Backend>,
    file: File,
    spec: StorageSpec,
    byte_size: u64,
    stats: AccessStats,
    mem_limited: AtomicBool,
    buffers: BufferPool,
}

#[derive(Debug)]
enum Backend {
    Descriptor(FdStorage),
    Caching(CachingFdStorage),
    SingleMapped(SingleMappedStorage),
    MultiMapped(MultiMappedStorage),
}

impl Backend {
    fn is_mapped(&self) -> bool {
        matches!(self, Backend::SingleMapped(_) | Backend::MultiMapped(_))
    }

    fn as_storage(&self) -> &dyn Storage {
        match self {
            Backend::Descriptor(s) => s,
            Backend::Caching(s) => s,
            Backend::SingleMapped(s) => s,
            Backend::MultiMapped(s) => s,
        }
    }
}

impl AdaptiveStorage {
    pub fn open(file: File, spec: &StorageSpec) -> Result<Self> {
        spec.validate()?;
        let byte_size = file
            .metadata()
            .wrap_err("failed to stat storage file")?
            .len();
        let mem_limited = AtomicBool::new(false);
        let initial = if spec.prefers_mapped() {
            match Self::mapped_backend(&file, spec, byte_size) {
                Ok(backend) => backend,
                Err(err) => {
                    warn!(error = %err, "initial mapping failed, staying on descriptor I/O");
                    mem_limited.store(true, Ordering::Release);
                    Backend::Descriptor(FdStorage::open(file.try_clone()?, spec)?)
                }
            }
        } else {
            Backend::Descriptor(FdStorage::open(file.try_clone()?, spec)?)
        };
        Ok(Self {
            state: RwLock::new(initial),
            buffers: spec.buffers(),
            spec: spec.clone(),
            file,
            byte_size,
            stats: AccessStats::new(),
            mem_limited,
        })
    }

    fn mapped_backend(file: &File, spec: &StorageSpec, byte_size: u64) -> Result<Backend> {
        if byte_size > SINGLE_MAPPING_LIMIT {
            Ok(Backend::MultiMapped(MultiMappedStorage::open(file, spec)?))
        } else {
            Ok(Backend::SingleMapped(SingleMappedStorage::open(file, spec)?))
        }
    }

    /// Whether the live backend is memory-mapped.
    pub fn is_mapped(&self) -> bool {
        self.state.read().is_mapped()
    }

    /// Whether a mapping attempt failed; promotion is never retried once
    /// this is set.
    pub fn is_mem_limited(&self) -> bool {
        self.mem_limited.load(Ordering::Acquire)
    }

    /// Demotes a disused mapped store to the caching descriptor backend.
    /// Intended to be called periodically from a housekeeping thread.
    pub fn maybe_flip_back(&self) -> Result<()> {
        if !self.stats.is_idle() {
            return Ok(());
        }
        let mut state = self.state.write();
        if state.is_mapped() {
            debug!("demoting idle mapped storage to caching descriptor I/O");
            *state = Backend::Caching(CachingFdStorage::open(self.file.try_clone()?, &self.spec)?);
        }
        Ok(())
    }

    fn before_op(&self) {
        if self.stats.touch() && !self.is_mem_limited() {
            self.promote();
        }
    }

    fn promote(&self) {
        let mut state = self.state.write();
        if state.is_mapped() {
            return;
        }
        match Self::mapped_backend(&self.file, &self.spec, self.byte_size) {
            Ok(mapped) => {
                debug!("promoting hot storage to mapped backend");
                *state = mapped;
            }
            Err(err) => {
                warn!(error = %err, "mapping failed during promotion, staying unmapped");
                self.mem_limited.store(true, Ordering::Release);
            }
        }
    }
}

impl Storage for AdaptiveStorage {
    fn record_size(&self) -> u32 {
        self.spec.record_size()
    }

    fn size_in_bytes(&self) -> u64 {
        self.byte_size
    }

    fn read(&self, record: u64) -> Result<Record<'_>> {
        self.before_op();
        let state = self.state.read();
        let view = state.as_storage().read(record)?;
        let mut copy = self.buffers.acquire();
        copy.copy_from_slice(&view);
        drop(view);
        Ok(Record::Pooled(copy))
    }

    fn write_at(&self, byte_offset: u64, bytes: &[u8]) -> Result<()> {
        self.before_op();
        self.state.read().as_storage().write_at(byte_offset, bytes)
    }

    fn write_u32(&self, record: u64, value: u32, field_offset: u32) -> Result<()> {
        self.before_op();
        self.state
            .read()
            .as_storage()
            .write_u32(record, value, field_offset)
    }

    fn write_i64(&self, record: u64, value: i64, field_offset: u32) -> Result<()> {
        self.before_op();
        self.state
            .read()
            .as_storage()
            .write_i64(record, value, field_offset)
    }

    fn write_i16(&self, record: u64, value: i16, field_offset: u32) -> Result<()> {
        self.before_op();
        self.state
            .read()
            .as_storage()
            .write_i16(record, value, field_offset)
    }

    fn swap(&self, a: u64, b: u64) -> Result<()> {
        self.before_op();
        self.state.read().as_storage().swap(a, b)
    }

    fn bulk_swap(&self, a: u64, b: u64, count: u64) -> Result<()> {
        self.before_op();
        self.state.read().as_storage().bulk_swap(a, b, count)
    }

    fn sync(&self) -> Result<()> {
        self.state.read().as_storage().sync()
    }
}

const RING: usize = 128;
const HOT_GAP_MILLIS: u64 = 1_000;
const IDLE_GAP_MILLIS: u64 = 2_000;

/// Circular ring of access timestamps, judged in one snapshot.
#[derive(Debug)]
struct AccessStats {
    cursor: AtomicUsize,
    slots: Box<[AtomicU64]>,
    origin: Instant,
}

impl AccessStats {
    fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            slots: (0..RING).map(|_| AtomicU64::new(0)).collect(),
            origin: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Records an access; true when a full ring just completed and it
    /// qualifies as hot.
    fn touch(&self) -> bool {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.slots[n % RING].store(self.now_millis(), Ordering::Relaxed);
        if n > 0 && n % RING == 0 {
            self.gaps(|gap| gap <= HOT_GAP_MILLIS) >= RING / 2
        } else {
            false
        }
    }

    fn is_idle(&self) -> bool {
        self.gaps(|gap| gap > IDLE_GAP_MILLIS) >= RING / 2
    }

    /// Counts adjacent-slot gaps satisfying `pred` over one snapshot of
    /// the ring; zero until the ring has fully turned over twice.
    fn gaps(&self, pred: impl Fn(u64) -> bool) -> usize {
        if self.cursor.load(Ordering::Relaxed) < RING * 2 {
            return 0;
        }
        let snapshot: Vec<u64> = self
            .slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect();
        snapshot
            .windows(2)
            .filter(|pair| pair[1] >= pair[0] && pred(pair[1] - pair[0]))
            .count()
    }
}
