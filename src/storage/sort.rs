//! # In-Place Sort and Biased Binary Search
//!
//! Both algorithms run against the [`Storage`] contract itself: the sort's
//! only mutation primitive is `swap(i, j)`, so no permutation array of
//! size N is ever built, and the search reads one key per probe. This is
//! what lets a multi-gigabyte shadow file be sorted in place through
//! whatever backend happens to hold it.
//!
//! The sort is a median-of-three Hoare quicksort with insertion sort below
//! a small cutoff and smaller-half recursion, so stack depth stays
//! logarithmic. Stability is not required by any caller.
//!
//! The search is duplicate-tolerant: with [`Bias::Backward`] an exact hit
//! lands on the *first* equal record (callers scan forward from there to
//! visit every duplicate), with [`Bias::Forward`] on the *last*.

use eyre::Result;

use crate::storage::value::{Long128, ValueType};
use crate::storage::Storage;

/// What a binary search returns when the sought key is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    /// Exact matches only; absent keys yield −1.
    None,
    /// The smallest index whose key is ≥ the sought value; on an exact
    /// match, the last equal record.
    Forward,
    /// The largest index whose key is ≤ the sought value; on an exact
    /// match, the first equal record.
    Backward,
    /// Whichever neighbor is numerically closer; ties go backward.
    Nearest,
}

/// Ranges at or below this length are finished by insertion sort.
const INSERTION_CUTOFF: u64 = 12;

/// Sorts the whole store so the value at `field_offset` is non-decreasing.
pub(crate) fn sort<S: Storage + ?Sized>(
    store: &S,
    field_offset: u32,
    value_type: ValueType,
) -> Result<()> {
    let len = store.size();
    if len < 2 {
        return Ok(());
    }
    match value_type {
        ValueType::U128 => {
            let key = |record: u64| -> Result<Long128> {
                let view = store.read(record)?;
                Ok(Long128::read(&view, field_offset as usize))
            };
            quicksort(store, &key, 0, len - 1)
        }
        _ => {
            let key = |record: u64| store.read_value(record, field_offset, value_type);
            quicksort(store, &key, 0, len - 1)
        }
    }
}

fn quicksort<S, K, F>(store: &S, key: &F, mut lo: u64, mut hi: u64) -> Result<()>
where
    S: Storage + ?Sized,
    K: Ord + Copy,
    F: Fn(u64) -> Result<K>,
{
    while hi - lo >= INSERTION_CUTOFF {
        let split = partition(store, key, lo, hi)?;
        // Recurse into the smaller half, iterate on the larger.
        if split - lo < hi - split {
            quicksort(store, key, lo, split)?;
            lo = split + 1;
        } else {
            quicksort(store, key, split + 1, hi)?;
            hi = split;
        }
    }
    insertion_sort(store, key, lo, hi)
}

/// Hoare partition over the inclusive range `[lo, hi]`.
///
/// Median-of-three ordering of `lo`, `mid`, `hi` first; afterwards the
/// records at `lo` and `hi` bracket the pivot value, so both scans have
/// in-range sentinels and `j` always lands in `[lo, hi)`.
fn partition<S, K, F>(store: &S, key: &F, lo: u64, hi: u64) -> Result<u64>
where
    S: Storage + ?Sized,
    K: Ord + Copy,
    F: Fn(u64) -> Result<K>,
{
    let mid = lo + (hi - lo) / 2;
    if key(mid)? < key(lo)? {
        store.swap(mid, lo)?;
    }
    if key(hi)? < key(lo)? {
        store.swap(hi, lo)?;
    }
    if key(hi)? < key(mid)? {
        store.swap(hi, mid)?;
    }
    let pivot = key(mid)?;

    let mut i = lo;
    let mut j = hi;
    loop {
        while key(i)? < pivot {
            i += 1;
        }
        while key(j)? > pivot {
            j -= 1;
        }
        if i >= j {
            return Ok(j);
        }
        store.swap(i, j)?;
        i += 1;
        j -= 1;
    }
}

fn insertion_sort<S, K, F>(store: &S, key: &F, lo: u64, hi: u64) -> Result<()>
where
    S: Storage + ?Sized,
    K: Ord + Copy,
    F: Fn(u64) -> Result<K>,
{
    if hi <= lo {
        return Ok(());
    }
    for i in (lo + 1)..=hi {
        let mut j = i;
        while j > lo && key(j - 1)? > key(j)? {
            store.swap(j - 1, j)?;
            j -= 1;
        }
    }
    Ok(())
}

/// Binary search over a store pre-sorted on the same `(offset, type)`.
///
/// Returns a record index or −1 according to `bias`.
pub(crate) fn search<S: Storage + ?Sized>(
    store: &S,
    value: i64,
    field_offset: u32,
    value_type: ValueType,
    bias: Bias,
) -> Result<i64> {
    let len = store.size();
    if len == 0 {
        return Ok(-1);
    }
    let key = |record: u64| store.read_value(record, field_offset, value_type);

    // First index whose key is >= value.
    let mut lo = 0u64;
    let mut hi = len;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if key(mid)? < value {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let floor = lo;
    let exact = floor < len && key(floor)? == value;

    match bias {
        Bias::None => Ok(if exact { floor as i64 } else { -1 }),
        Bias::Backward => {
            if exact {
                Ok(floor as i64)
            } else if floor > 0 {
                Ok((floor - 1) as i64)
            } else {
                Ok(-1)
            }
        }
        Bias::Forward => {
            if exact {
                // Last equal record: first index whose key exceeds value,
                // minus one.
                let mut lo = floor;
                let mut hi = len;
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    if key(mid)? <= value {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                Ok((lo - 1) as i64)
            } else if floor < len {
                Ok(floor as i64)
            } else {
                Ok(-1)
            }
        }
        Bias::Nearest => {
            if exact {
                return Ok(floor as i64);
            }
            let ahead = (floor < len).then_some(floor);
            let behind = (floor > 0).then(|| floor - 1);
            match (behind, ahead) {
                (None, None) => Ok(-1),
                (Some(b), None) => Ok(b as i64),
                (None, Some(a)) => Ok(a as i64),
                (Some(b), Some(a)) => {
                    let behind_gap = value as i128 - key(b)? as i128;
                    let ahead_gap = key(a)? as i128 - value as i128;
                    if ahead_gap < behind_gap {
                        Ok(a as i64)
                    } else {
                        Ok(b as i64)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::descriptor::FdStorage;
    use crate::storage::spec::StorageSpec;
    use crate::storage::view::ByteView;
    use std::io::Write;

    const REC: u32 = 12;

    fn keyed_store(keys: &[i64]) -> (tempfile::NamedTempFile, FdStorage) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        for (i, &k) in keys.iter().enumerate() {
            let mut rec = vec![0u8; REC as usize];
            rec.put_u32(0, i as u32);
            rec.put_i64(4, k);
            tmp.write_all(&rec).unwrap();
        }
        tmp.flush().unwrap();
        let file = tmp.reopen().unwrap();
        let store = FdStorage::open(file, &StorageSpec::new(REC)).unwrap();
        (tmp, store)
    }

    #[test]
    fn sort_orders_keys_and_preserves_records() {
        let keys = [40i64, -3, 17, 17, 0, 99, -3, 8, 23, 5, 1, 2, 3, 4, 60, -50];
        let (_tmp, store) = keyed_store(&keys);
        store.sort(4, ValueType::I64).unwrap();

        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        let mut seen = Vec::new();
        for i in 0..store.size() {
            let rec = store.read(i).unwrap();
            seen.push(rec.get_i64(4));
        }
        assert_eq!(seen, sorted);
    }

    #[test]
    fn sort_handles_heavy_duplicates() {
        let keys: Vec<i64> = (0..200).map(|i| i % 3).collect();
        let (_tmp, store) = keyed_store(&keys);
        store.sort(4, ValueType::I64).unwrap();
        let mut last = i64::MIN;
        for i in 0..store.size() {
            let k = store.read_value(i, 4, ValueType::I64).unwrap();
            assert!(k >= last);
            last = k;
        }
    }

    #[test]
    fn bias_semantics_on_duplicate_run() {
        let (_tmp, store) = keyed_store(&[10, 20, 20, 20, 40]);
        let s = |v, b| store.binary_search(v, 4, ValueType::I64, b).unwrap();

        assert_eq!(s(25, Bias::None), -1);
        assert_eq!(s(25, Bias::Forward), 4);
        assert_eq!(s(25, Bias::Backward), 3);
        assert_eq!(s(25, Bias::Nearest), 3);
        assert_eq!(s(20, Bias::Backward), 1);
        assert_eq!(s(20, Bias::Forward), 3);
    }

    #[test]
    fn bias_at_the_edges() {
        let (_tmp, store) = keyed_store(&[10, 20, 30]);
        let s = |v, b| store.binary_search(v, 4, ValueType::I64, b).unwrap();

        assert_eq!(s(5, Bias::Backward), -1);
        assert_eq!(s(5, Bias::Forward), 0);
        assert_eq!(s(5, Bias::Nearest), 0);
        assert_eq!(s(35, Bias::Forward), -1);
        assert_eq!(s(35, Bias::Backward), 2);
        assert_eq!(s(35, Bias::Nearest), 2);
    }

    #[test]
    fn nearest_ties_break_backward() {
        let (_tmp, store) = keyed_store(&[10, 20]);
        let hit = store.binary_search(15, 4, ValueType::I64, Bias::Nearest).unwrap();
        assert_eq!(hit, 0);
    }
}
