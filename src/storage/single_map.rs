//! # Single-Mapped Storage
//!
//! The whole file under one mapping. Reads are zero-copy slices of the
//! mapping; a swap is three copies through one pooled scratch buffer.
//! Unusable for files beyond the single-mapping limit; the factory
//! routes those to [`MultiMappedStorage`].
//!
//! [`MultiMappedStorage`]: crate::storage::MultiMappedStorage

use std::fs::File;

use eyre::{ensure, Result};

use crate::storage::buffers::BufferPool;
use crate::storage::mapping::Mapping;
use crate::storage::spec::StorageSpec;
use crate::storage::view::Record;
use crate::storage::Storage;

#[derive(Debug)]
pub struct SingleMappedStorage {
    mapping: Mapping,
    record_size: u32,
    byte_size: u64,
    buffers: BufferPool,
}

impl SingleMappedStorage {
    pub fn open(file: &File, spec: &StorageSpec) -> Result<Self> {
        spec.validate()?;
        let byte_size = file.metadata()?.len();
        ensure!(byte_size > 0, "cannot map an empty storage file");
        ensure!(
            byte_size % spec.record_size() as u64 == 0,
            "file size {} is not a multiple of record size {}",
            byte_size,
            spec.record_size()
        );
        ensure!(
            byte_size <= crate::storage::SINGLE_MAPPING_LIMIT,
            "file of {} bytes exceeds the single-mapping limit",
            byte_size
        );
        let mapping = Mapping::map(file, 0, byte_size as usize, spec.is_writable())?;
        Ok(Self {
            mapping,
            record_size: spec.record_size(),
            byte_size,
            buffers: spec.buffers(),
        })
    }

    /// Hints the kernel to fault in `count` records starting at `record`.
    pub fn prefetch(&self, record: u64, count: u64) {
        if record >= self.size() {
            return;
        }
        self.mapping.advise_willneed(
            self.offset_of(record) as usize,
            (count * self.record_size as u64) as usize,
        );
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

impl Storage for SingleMappedStorage {
    fn record_size(&self) -> u32 {
        self.record_size
    }

    fn size_in_bytes(&self) -> u64 {
        self.byte_size
    }

    fn read(&self, record: u64) -> Result<Record<'_>> {
        self.check_record(record)?;
        let offset = self.offset_of(record) as usize;
        Ok(Record::Mapped(
            self.mapping.slice(offset, self.record_size as usize),
        ))
    }

    fn write_at(&self, byte_offset: u64, bytes: &[u8]) -> Result<()> {
        ensure!(
            byte_offset % self.record_size as u64 == 0,
            "write position {} is not a record boundary",
            byte_offset
        );
        ensure!(
            bytes.len() as u64 % self.record_size as u64 == 0
                && byte_offset + bytes.len() as u64 <= self.byte_size,
            "write of {} bytes at {} does not fit whole records",
            bytes.len(),
            byte_offset
        );
        self.mapping.write(byte_offset as usize, bytes)
    }

    fn write_u32(&self, record: u64, value: u32, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        let offset = self.offset_of(record) as usize + field_offset as usize;
        self.mapping.write(offset, &value.to_le_bytes())
    }

    fn write_i64(&self, record: u64, value: i64, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        let offset = self.offset_of(record) as usize + field_offset as usize;
        self.mapping.write(offset, &value.to_le_bytes())
    }

    fn write_i16(&self, record: u64, value: i16, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        let offset = self.offset_of(record) as usize + field_offset as usize;
        self.mapping.write(offset, &value.to_le_bytes())
    }

    fn swap(&self, a: u64, b: u64) -> Result<()> {
        if a == b {
            return Ok(());
        }
        self.check_record(a)?;
        self.check_record(b)?;
        let record = self.record_size as usize;
        let offset_a = self.offset_of(a) as usize;
        let offset_b = self.offset_of(b) as usize;

        let mut scratch = self.buffers.acquire();
        scratch.copy_from_slice(self.mapping.slice(offset_a, record));
        self.mapping.copy_within(offset_b, offset_a, record)?;
        self.mapping.write(offset_b, &scratch)?;
        Ok(())
    }

    fn bulk_swap(&self, a: u64, b: u64, count: u64) -> Result<()> {
        if a == b || count == 0 {
            return Ok(());
        }
        if count == 1 {
            return self.swap(a, b);
        }
        self.check_record(a + count - 1)?;
        self.check_record(b + count - 1)?;
        let len = (self.record_size as u64 * count) as usize;
        let offset_a = self.offset_of(a) as usize;
        let offset_b = self.offset_of(b) as usize;

        let mut scratch = self.buffers.allocate(len);
        scratch.copy_from_slice(self.mapping.slice(offset_a, len));
        self.mapping.copy_within(offset_b, offset_a, len)?;
        self.mapping.write(offset_b, &scratch)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.mapping.flush()
    }
}
