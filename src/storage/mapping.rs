//! Shared mmap plumbing for the mapped backends: a read-only `Mmap` or a
//! writable `MmapRaw` behind one interface.
//!
//! `MmapRaw` is used for writable mappings because the store contract
//! mutates through `&self`: correctness across threads is the advisory
//! concern of the caller (single writer, or a `RegionLock`), and the raw
//! mapping keeps that contract out of the type system the same way the
//! OS page cache does.

use std::fs::File;
use std::ptr;
use std::slice;

use eyre::{bail, Result, WrapErr};
use memmap2::{Mmap, MmapOptions, MmapRaw};

#[derive(Debug)]
pub(crate) enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapRaw),
}

impl Mapping {
    /// Maps `len` bytes of `file` starting at `offset`.
    pub(crate) fn map(file: &File, offset: u64, len: usize, writable: bool) -> Result<Mapping> {
        if writable {
            let raw = MmapOptions::new()
                .offset(offset)
                .len(len)
                .map_raw(file)
                .wrap_err_with(|| format!("failed to map {len} bytes at offset {offset}"))?;
            Ok(Mapping::ReadWrite(raw))
        } else {
            // SAFETY: the mapping's validity depends on the file not being
            // truncated or rewritten externally. Stores own their files for
            // the duration of the handle and the on-disk format is never
            // shared across processes, the same assumption every mapped
            // database file here rests on.
            let map = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(len)
                    .map(file)
                    .wrap_err_with(|| format!("failed to map {len} bytes at offset {offset}"))?
            };
            Ok(Mapping::ReadOnly(map))
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Mapping::ReadOnly(map) => map.len(),
            Mapping::ReadWrite(raw) => raw.len(),
        }
    }

    /// Borrows `len` bytes at `offset` of the mapping.
    pub(crate) fn slice(&self, offset: usize, len: usize) -> &[u8] {
        match self {
            Mapping::ReadOnly(map) => &map[offset..offset + len],
            // SAFETY: offset + len is bounds-checked by the caller against
            // the store size; the pointer stays valid for the mapping's
            // lifetime, which outlives the returned borrow. Concurrent
            // mutation of the same range is excluded by the store's
            // advisory concurrency contract.
            Mapping::ReadWrite(raw) => {
                debug_assert!(offset + len <= raw.len());
                unsafe { slice::from_raw_parts(raw.as_ptr().add(offset), len) }
            }
        }
    }

    /// Copies `bytes` into the mapping at `offset`.
    pub(crate) fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        match self {
            Mapping::ReadOnly(_) => bail!("storage is read-only"),
            // SAFETY: bounds are checked by the caller; `bytes` cannot
            // alias the destination because pooled buffers and caller
            // slices are never views of this mapping's target range.
            Mapping::ReadWrite(raw) => {
                debug_assert!(offset + bytes.len() <= raw.len());
                unsafe {
                    ptr::copy_nonoverlapping(bytes.as_ptr(), raw.as_mut_ptr().add(offset), bytes.len());
                }
                Ok(())
            }
        }
    }

    /// Copies `len` bytes from `src` to `dst` within this mapping. The
    /// ranges must be disjoint (distinct records always are).
    pub(crate) fn copy_within(&self, src: usize, dst: usize, len: usize) -> Result<()> {
        match self {
            Mapping::ReadOnly(_) => bail!("storage is read-only"),
            // SAFETY: both ranges are bounds-checked by the caller and
            // disjoint per the contract above.
            Mapping::ReadWrite(raw) => {
                debug_assert!(src + len <= raw.len() && dst + len <= raw.len());
                unsafe {
                    ptr::copy_nonoverlapping(raw.as_ptr().add(src), raw.as_mut_ptr().add(dst), len);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn flush(&self) -> Result<()> {
        match self {
            Mapping::ReadOnly(_) => Ok(()),
            Mapping::ReadWrite(raw) => raw.flush().wrap_err("failed to flush mapping"),
        }
    }

    /// Hints the kernel to fault in `len` bytes at `offset` ahead of use.
    #[allow(unused_variables)]
    pub(crate) fn advise_willneed(&self, offset: usize, len: usize) {
        #[cfg(unix)]
        {
            let (ptr, map_len) = match self {
                Mapping::ReadOnly(map) => (map.as_ptr(), map.len()),
                Mapping::ReadWrite(raw) => (raw.as_ptr() as *const u8, raw.len()),
            };
            if offset >= map_len {
                return;
            }
            let len = len.min(map_len - offset);
            // SAFETY: madvise is a hint; the range is clamped to the live
            // mapping above.
            unsafe {
                libc::madvise(
                    ptr.add(offset) as *mut libc::c_void,
                    len,
                    libc::MADV_WILLNEED,
                );
            }
        }
    }
}
