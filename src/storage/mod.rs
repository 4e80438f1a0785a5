//! # Record Store Layer
//!
//! Disk-backed storage of index-addressed, fixed-length records that can
//! be binary-searched, sorted in place, and swapped: the foundation the
//! index layer builds its primary and shadow files on.
//!
//! ## File model
//!
//! A store is a headerless file of `N` records of `record_size` bytes;
//! record `i` lives at byte offset `i × record_size` and the file size is
//! always an exact multiple of the record size (anything else is rejected
//! at open as corruption). There is no page structure and no metadata:
//! the schema that gives the bytes meaning lives with the caller.
//!
//! ## Backends
//!
//! Four interchangeable implementations of the [`Storage`] contract:
//!
//! | Backend | Strategy | Trade-off |
//! |---------|----------|-----------|
//! | [`FdStorage`] | positional descriptor I/O | lowest memory, slowest |
//! | [`CachingFdStorage`] | descriptor I/O + per-thread windows | locality without mapping |
//! | [`SingleMappedStorage`] | one whole-file mapping | zero-copy, < 2 GiB |
//! | [`MultiMappedStorage`] | record-aligned mapped segments | zero-copy, any size |
//!
//! [`AdaptiveStorage`] wraps the four and migrates between them under
//! load; [`AnyStorage::create`] picks a backend from a [`StorageSpec`].
//!
//! ## Aliasing contract
//!
//! `read` returns a [`Record`] view that may alias the live mapping or a
//! pooled buffer slot. Consume it before the next store call and copy if
//! the bytes must persist.
//!
//! ## Concurrency
//!
//! All operations take `&self`; the safe cross-thread patterns are many
//! readers with no writer, a single writer, or callers serialized through
//! a [`RegionLock`]. Mapped writes are visible to in-process reads
//! without a flush; durability requires [`Storage::sync`].

mod adaptive;
mod buffers;
mod caching;
mod descriptor;
mod mapping;
mod multi_map;
mod region_lock;
mod single_map;
mod sort;
mod spec;
mod value;
mod view;

pub use adaptive::AdaptiveStorage;
pub use buffers::{BufferPool, PooledBuf, DEFAULT_CONCURRENCY};
pub use caching::CachingFdStorage;
pub use descriptor::FdStorage;
pub use multi_map::MultiMappedStorage;
pub use region_lock::{RegionLock, RegionLockedStore, REGION_COUNT};
pub use single_map::SingleMappedStorage;
pub use sort::Bias;
pub use spec::StorageSpec;
pub use value::{Long128, ValueType};
pub use view::{ByteView, Record};

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

/// The largest file a single mapping may cover.
pub const SINGLE_MAPPING_LIMIT: u64 = 2_147_483_648;

/// Disk-backed storage of fixed-length records.
///
/// Implementations must keep record `i` at byte offset
/// `i × record_size()` and the backing file an exact multiple of the
/// record size.
pub trait Storage {
    /// Bytes per logical record; constant for the store's lifetime.
    fn record_size(&self) -> u32;

    /// Size of the backing file, captured at open. Stores do not observe
    /// growth underneath them.
    fn size_in_bytes(&self) -> u64;

    /// Reads one record. The returned view is pooled or aliases the
    /// mapping; consume it before the next read.
    fn read(&self, record: u64) -> Result<Record<'_>>;

    /// Overwrites bytes at an absolute position, which must be a record
    /// boundary; the length must be a whole number of records.
    fn write_at(&self, byte_offset: u64, bytes: &[u8]) -> Result<()>;

    /// Writes a `u32` field at `field_offset` within `record`.
    fn write_u32(&self, record: u64, value: u32, field_offset: u32) -> Result<()>;

    /// Writes an `i64` field at `field_offset` within `record`.
    fn write_i64(&self, record: u64, value: i64, field_offset: u32) -> Result<()>;

    /// Writes an `i16` field at `field_offset` within `record`.
    fn write_i16(&self, record: u64, value: i16, field_offset: u32) -> Result<()>;

    /// Exchanges the contents of records `a` and `b`. A no-op when
    /// `a == b`.
    fn swap(&self, a: u64, b: u64) -> Result<()>;

    /// Flushes written data to disk.
    fn sync(&self) -> Result<()>;

    /// Exchanges `count` consecutive records starting at `a` with `count`
    /// starting at `b`. The ranges must be disjoint.
    fn bulk_swap(&self, a: u64, b: u64, count: u64) -> Result<()> {
        if a == b {
            return Ok(());
        }
        for k in 0..count {
            self.swap(a + k, b + k)?;
        }
        Ok(())
    }

    /// Number of records.
    fn size(&self) -> u64 {
        let bytes = self.size_in_bytes();
        if bytes == 0 {
            0
        } else {
            bytes / self.record_size() as u64
        }
    }

    /// Byte offset of `record`.
    fn offset_of(&self, record: u64) -> u64 {
        record * self.record_size() as u64
    }

    /// Reads the field at `field_offset` of `record`, widened to `i64`.
    fn read_value(&self, record: u64, field_offset: u32, value_type: ValueType) -> Result<i64> {
        let view = self.read(record)?;
        Ok(value_type.read(field_offset as usize, &view))
    }

    /// Sorts the store in place so the value at `(field_offset,
    /// value_type)` is non-decreasing across records. Drives swaps
    /// directly against the store; no auxiliary array of size N.
    fn sort(&self, field_offset: u32, value_type: ValueType) -> Result<()>
    where
        Self: Sized,
    {
        sort::sort(self, field_offset, value_type)
    }

    /// Binary-searches a store already sorted on the same `(field_offset,
    /// value_type)`. Searching an unsorted store is undetected and yields
    /// meaningless indexes.
    fn binary_search(
        &self,
        value: i64,
        field_offset: u32,
        value_type: ValueType,
        bias: Bias,
    ) -> Result<i64>
    where
        Self: Sized,
    {
        sort::search(self, value, field_offset, value_type, bias)
    }

    /// Lazy single-pass iteration over all records.
    fn iter(&self) -> RecordIter<'_, Self>
    where
        Self: Sized,
    {
        self.iter_from(0)
    }

    /// Lazy single-pass iteration starting at `start`.
    fn iter_from(&self, start: u64) -> RecordIter<'_, Self>
    where
        Self: Sized,
    {
        RecordIter {
            store: self,
            cursor: start,
            len: self.size(),
        }
    }
}

/// Single-pass record iterator; the store itself may be re-iterated.
pub struct RecordIter<'a, S: ?Sized> {
    store: &'a S,
    cursor: u64,
    len: u64,
}

impl<'a, S: Storage + ?Sized> Iterator for RecordIter<'a, S> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.len {
            return None;
        }
        let record = self.store.read(self.cursor);
        self.cursor += 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.len - self.cursor.min(self.len)) as usize;
        (remaining, Some(remaining))
    }
}

/// A store created by [`AnyStorage::create`]: the backend the spec and
/// file size selected.
#[derive(Debug)]
pub enum AnyStorage {
    SingleMapped(SingleMappedStorage),
    MultiMapped(MultiMappedStorage),
    Adaptive(AdaptiveStorage),
}

impl AnyStorage {
    /// Selects and opens a backend for `file`.
    ///
    /// `always_mapped` specs get a single mapping below
    /// [`SINGLE_MAPPING_LIMIT`] and record-aligned segments above it;
    /// everything else goes through the adaptive backend.
    pub fn create(file: File, spec: &StorageSpec) -> Result<Self> {
        spec.validate()?;
        let len = file
            .metadata()
            .wrap_err("failed to stat storage file")?
            .len();
        ensure!(
            len % spec.record_size() as u64 == 0,
            "file size {} is not a multiple of record size {}",
            len,
            spec.record_size()
        );
        if spec.is_always_mapped() {
            if len > SINGLE_MAPPING_LIMIT {
                Ok(AnyStorage::MultiMapped(MultiMappedStorage::open(
                    &file, spec,
                )?))
            } else {
                Ok(AnyStorage::SingleMapped(SingleMappedStorage::open(
                    &file, spec,
                )?))
            }
        } else {
            Ok(AnyStorage::Adaptive(AdaptiveStorage::open(file, spec)?))
        }
    }

    /// Opens `path` with access derived from the spec and creates a store
    /// over it.
    pub fn open_path(path: impl AsRef<Path>, spec: &StorageSpec) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(spec.is_writable())
            .open(path)
            .wrap_err_with(|| format!("failed to open storage file '{}'", path.display()))?;
        Self::create(file, spec)
    }

    fn inner(&self) -> &dyn Storage {
        match self {
            AnyStorage::SingleMapped(s) => s,
            AnyStorage::MultiMapped(s) => s,
            AnyStorage::Adaptive(s) => s,
        }
    }
}

impl Storage for AnyStorage {
    fn record_size(&self) -> u32 {
        self.inner().record_size()
    }

    fn size_in_bytes(&self) -> u64 {
        self.inner().size_in_bytes()
    }

    fn read(&self, record: u64) -> Result<Record<'_>> {
        self.inner().read(record)
    }

    fn write_at(&self, byte_offset: u64, bytes: &[u8]) -> Result<()> {
        self.inner().write_at(byte_offset, bytes)
    }

    fn write_u32(&self, record: u64, value: u32, field_offset: u32) -> Result<()> {
        self.inner().write_u32(record, value, field_offset)
    }

    fn write_i64(&self, record: u64, value: i64, field_offset: u32) -> Result<()> {
        self.inner().write_i64(record, value, field_offset)
    }

    fn write_i16(&self, record: u64, value: i16, field_offset: u32) -> Result<()> {
        self.inner().write_i16(record, value, field_offset)
    }

    fn swap(&self, a: u64, b: u64) -> Result<()> {
        self.inner().swap(a, b)
    }

    fn bulk_swap(&self, a: u64, b: u64, count: u64) -> Result<()> {
        self.inner().bulk_swap(a, b, count)
    }

    fn sync(&self) -> Result<()> {
        self.inner().sync()
    }
}
