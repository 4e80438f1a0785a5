//! # Descriptor Storage
//!
//! The simplest backend: every read issues a positional read of one
//! record into a pooled buffer, every swap is two reads and two writes.
//! Slow, but memory use stays at a handful of record-sized buffers no
//! matter how large the file is, and files beyond addressable memory work
//! fine.

use std::fs::File;
use std::os::unix::fs::FileExt;

use eyre::{ensure, Result, WrapErr};

use crate::storage::buffers::BufferPool;
use crate::storage::spec::StorageSpec;
use crate::storage::view::Record;
use crate::storage::Storage;

#[derive(Debug)]
pub struct FdStorage {
    file: File,
    record_size: u32,
    byte_size: u64,
    buffers: BufferPool,
}

impl FdStorage {
    pub fn open(file: File, spec: &StorageSpec) -> Result<Self> {
        spec.validate()?;
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
            file,
            record_size: spec.record_size(),
            byte_size,
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
}

impl Storage for FdStorage {
    fn record_size(&self) -> u32 {
        self.record_size
    }

    fn size_in_bytes(&self) -> u64 {
        self.byte_size
    }

    fn read(&self, record: u64) -> Result<Record<'_>> {
        self.check_record(record)?;
        let mut buf = self.buffers.acquire();
        self.file
            .read_exact_at(&mut buf, self.offset_of(record))
            .wrap_err_with(|| format!("failed to read record {record}"))?;
        Ok(Record::Pooled(buf))
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
            .wrap_err_with(|| format!("failed to write {} bytes at {}", bytes.len(), byte_offset))
    }

    fn write_u32(&self, record: u64, value: u32, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        self.file
            .write_all_at(
                &value.to_le_bytes(),
                self.offset_of(record) + field_offset as u64,
            )
            .wrap_err_with(|| format!("failed to write u32 field of record {record}"))
    }

    fn write_i64(&self, record: u64, value: i64, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        self.file
            .write_all_at(
                &value.to_le_bytes(),
                self.offset_of(record) + field_offset as u64,
            )
            .wrap_err_with(|| format!("failed to write i64 field of record {record}"))
    }

    fn write_i16(&self, record: u64, value: i16, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        self.file
            .write_all_at(
                &value.to_le_bytes(),
                self.offset_of(record) + field_offset as u64,
            )
            .wrap_err_with(|| format!("failed to write i16 field of record {record}"))
    }

    fn swap(&self, a: u64, b: u64) -> Result<()> {
        if a == b {
            return Ok(());
        }
        self.check_record(a)?;
        self.check_record(b)?;
        let mut left = self.buffers.acquire();
        let mut right = self.buffers.acquire();
        let offset_a = self.offset_of(a);
        let offset_b = self.offset_of(b);
        self.file.read_exact_at(&mut left, offset_a)?;
        self.file.read_exact_at(&mut right, offset_b)?;
        self.file.write_all_at(&left, offset_b)?;
        self.file.write_all_at(&right, offset_a)?;
        Ok(())
    }

    fn bulk_swap(&self, a: u64, b: u64, count: u64) -> Result<()> {
        if a == b || count == 0 {
            return Ok(());
        }
        if count == 1 {
            return self.swap(a, b);
        }
        let len = (self.record_size as u64 * count) as usize;
        let mut left = self.buffers.allocate(len);
        let mut right = self.buffers.allocate(len);
        let offset_a = self.offset_of(a);
        let offset_b = self.offset_of(b);
        self.file.read_exact_at(&mut left, offset_a)?;
        self.file.read_exact_at(&mut right, offset_b)?;
        self.file.write_all_at(&left, offset_b)?;
        self.file.write_all_at(&right, offset_a)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data().wrap_err("failed to sync storage file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::view::ByteView;
    use std::io::Write;

    fn store_with(records: &[(u32, i64)]) -> (tempfile::NamedTempFile, FdStorage) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        for &(seq, v) in records {
            let mut rec = vec![0u8; 12];
            rec.put_u32(0, seq);
            rec.put_i64(4, v);
            tmp.write_all(&rec).unwrap();
        }
        tmp.flush().unwrap();
        let store = FdStorage::open(tmp.reopen().unwrap(), &StorageSpec::new(12)).unwrap();
        (tmp, store)
    }

    #[test]
    fn read_returns_record_bytes() {
        let (_tmp, store) = store_with(&[(0, 100), (1, 200), (2, 300)]);
        assert_eq!(store.size(), 3);
        let rec = store.read(1).unwrap();
        assert_eq!(rec.get_u32(0), 1);
        assert_eq!(rec.get_i64(4), 200);
    }

    #[test]
    fn swap_is_an_involution() {
        let (_tmp, store) = store_with(&[(0, 1), (1, 2), (2, 3)]);
        store.swap(0, 2).unwrap();
        assert_eq!(store.read_value(0, 4, crate::ValueType::I64).unwrap(), 3);
        store.swap(0, 2).unwrap();
        assert_eq!(store.read_value(0, 4, crate::ValueType::I64).unwrap(), 1);
        store.swap(1, 1).unwrap();
        assert_eq!(store.read_value(1, 4, crate::ValueType::I64).unwrap(), 2);
    }

    #[test]
    fn write_at_rejects_unaligned_positions() {
        let (_tmp, store) = store_with(&[(0, 1), (1, 2)]);
        let rec = vec![0u8; 12];
        assert!(store.write_at(5, &rec).is_err());
        assert!(store.write_at(12, &rec[..7]).is_err());
        assert!(store.write_at(12, &rec).is_ok());
    }

    #[test]
    fn out_of_bounds_read_is_an_error() {
        let (_tmp, store) = store_with(&[(0, 1)]);
        assert!(store.read(1).is_err());
    }

    #[test]
    fn open_rejects_ragged_files() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 13]).unwrap();
        tmp.flush().unwrap();
        assert!(FdStorage::open(tmp.reopen().unwrap(), &StorageSpec::new(12)).is_err());
    }
}
