//! # Region Lock
//!
//! A single 64-bit word partitioning a store into 64 independently
//! lockable byte regions, so concurrent cooperating writers do not need
//! one giant I/O lock over the whole file. Acquisition is all-or-nothing:
//! a caller's full set of region bits is taken in one compare-and-set or
//! not at all, which removes lock-ordering cycles when callers nest.
//! Nested entries on the same thread re-enter bits they already hold.
//!
//! The lock is advisory. It serializes callers who use it; it does
//! nothing about callers who bypass it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::storage::Storage;

/// Number of independently lockable regions.
pub const REGION_COUNT: u32 = 64;

thread_local! {
    /// Region bits this thread holds, per lock instance.
    static HELD: RefCell<HashMap<usize, u64>> = RefCell::new(HashMap::new());
}

/// A 64-slot advisory lock word.
#[derive(Debug, Default)]
pub struct RegionLock {
    bits: AtomicU64,
}

impl RegionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `op` while holding every region in `mask`, re-entering any
    /// bits this thread already holds. Spins (with yields) until the
    /// remaining bits can be taken in one compare-and-set.
    pub fn with_regions<T>(&self, mask: u64, op: impl FnOnce() -> T) -> T {
        let key = self as *const Self as usize;
        let already = HELD.with(|held| held.borrow().get(&key).copied().unwrap_or(0));
        let wanted = mask & !already;

        self.acquire(wanted);
        HELD.with(|held| *held.borrow_mut().entry(key).or_insert(0) |= wanted);

        // Release on unwind too, or a panicking op would strand the bits.
        struct Release<'a> {
            lock: &'a RegionLock,
            bits: u64,
            key: usize,
        }
        impl Drop for Release<'_> {
            fn drop(&mut self) {
                if self.bits != 0 {
                    HELD.with(|held| {
                        let mut held = held.borrow_mut();
                        if let Some(mine) = held.get_mut(&self.key) {
                            *mine &= !self.bits;
                            if *mine == 0 {
                                held.remove(&self.key);
                            }
                        }
                    });
                    self.lock.bits.fetch_and(!self.bits, Ordering::Release);
                }
            }
        }
        let _release = Release {
            lock: self,
            bits: wanted,
            key,
        };
        op()
    }

    /// Current lock word; for observability only.
    pub fn held_mask(&self) -> u64 {
        self.bits.load(Ordering::Acquire)
    }

    fn acquire(&self, mask: u64) {
        if mask == 0 {
            return;
        }
        loop {
            let current = self.bits.load(Ordering::Acquire);
            if current & mask == 0 {
                if self
                    .bits
                    .compare_exchange_weak(
                        current,
                        current | mask,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
            } else {
                std::thread::yield_now();
            }
        }
    }
}

/// A store paired with a region lock, for block-granular concurrent
/// access. Region width is `record_size × blocks_per_slot` bytes.
#[derive(Debug)]
pub struct RegionLockedStore<S> {
    store: S,
    lock: RegionLock,
    blocks_per_slot: u32,
}

impl<S: Storage> RegionLockedStore<S> {
    pub fn new(store: S, blocks_per_slot: u32) -> Result<Self> {
        ensure!(blocks_per_slot > 0, "blocks per slot must be greater than zero");
        Ok(Self {
            store,
            lock: RegionLock::new(),
            blocks_per_slot,
        })
    }

    /// Bytes in one block: the store's record size.
    pub fn bytes_per_block(&self) -> u32 {
        self.store.record_size()
    }

    /// Bytes covered by one lockable region.
    pub fn bytes_per_slot(&self) -> u64 {
        self.store.record_size() as u64 * self.blocks_per_slot as u64
    }

    /// Runs `op` with the regions covering `[start_byte, start_byte +
    /// length)` held. Byte ranges beyond the last region fold into slot
    /// 63.
    pub fn enter_byte_range<T>(
        &self,
        start_byte: u64,
        length: u64,
        op: impl FnOnce(&S) -> Result<T>,
    ) -> Result<T> {
        let mask = self.region_mask(start_byte, length);
        self.lock.with_regions(mask, || op(&self.store))
    }

    /// Consumes the wrapper, returning the store.
    pub fn into_inner(self) -> S {
        self.store
    }

    fn region_mask(&self, start_byte: u64, length: u64) -> u64 {
        let width = self.bytes_per_slot();
        let last_slot = (REGION_COUNT - 1) as u64;
        let first = (start_byte / width).min(last_slot);
        let end = start_byte + length.max(1) - 1;
        let last = (end / width).min(last_slot);
        let mut mask = 0u64;
        for slot in first..=last {
            mask |= 1u64 << slot;
        }
        mask
    }
}
