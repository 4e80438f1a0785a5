//! # Multi-Mapped Storage
//!
//! Mapped access to files too large for one mapping. The file is cut into
//! segments of `floor(limit / record_size) × record_size` bytes, so a
//! record never straddles two mappings and every read is still a single
//! zero-copy slice. Swaps may cross segments; bulk swaps fast-path only
//! when each range sits inside one segment and otherwise fall back to
//! per-record swaps.

use std::fs::File;

use eyre::{ensure, Result};

use crate::storage::buffers::BufferPool;
use crate::storage::mapping::Mapping;
use crate::storage::spec::StorageSpec;
use crate::storage::view::Record;
use crate::storage::{Storage, SINGLE_MAPPING_LIMIT};

#[derive(Debug)]
pub struct MultiMappedStorage {
    partitions: Vec<Mapping>,
    record_size: u32,
    records_per_partition: u64,
    partition_size: u64,
    byte_size: u64,
    buffers: BufferPool,
}

impl MultiMappedStorage {
    pub fn open(file: &File, spec: &StorageSpec) -> Result<Self> {
        let per_partition = SINGLE_MAPPING_LIMIT / spec.record_size().max(1) as u64;
        Self::with_partition_capacity(file, spec, per_partition)
    }

    /// Opens with an explicit partition capacity in records. Exposed so
    /// segment-boundary behavior is testable without multi-gigabyte
    /// files.
    pub fn with_partition_capacity(
        file: &File,
        spec: &StorageSpec,
        records_per_partition: u64,
    ) -> Result<Self> {
        spec.validate()?;
        ensure!(
            records_per_partition > 0,
            "partition capacity must be at least one record"
        );
        let record_size = spec.record_size() as u64;
        let byte_size = file.metadata()?.len();
        ensure!(byte_size > 0, "cannot map an empty storage file");
        ensure!(
            byte_size % record_size == 0,
            "file size {} is not a multiple of record size {}",
            byte_size,
            record_size
        );

        // Record-aligned so a record never straddles two mappings.
        let partition_size = records_per_partition * record_size;
        let mut partitions = Vec::new();
        let mut start = 0u64;
        while start < byte_size {
            let len = partition_size.min(byte_size - start);
            partitions.push(Mapping::map(file, start, len as usize, spec.is_writable())?);
            start += partition_size;
        }

        Ok(Self {
            partitions,
            record_size: spec.record_size(),
            records_per_partition,
            partition_size,
            byte_size,
            buffers: spec.buffers(),
        })
    }

    /// Mapped segment count.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
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

    /// (partition, byte offset within it) of `record`.
    fn locate(&self, record: u64) -> (usize, usize) {
        let partition = (record / self.records_per_partition) as usize;
        let offset = (record % self.records_per_partition) * self.record_size as u64;
        (partition, offset as usize)
    }

    fn copy_records(
        &self,
        src_partition: usize,
        src_offset: usize,
        dst_partition: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        if src_partition == dst_partition {
            self.partitions[src_partition].copy_within(src_offset, dst_offset, len)
        } else {
            let src = self.partitions[src_partition].slice(src_offset, len);
            self.partitions[dst_partition].write(dst_offset, src)
        }
    }
}

impl Storage for MultiMappedStorage {
    fn record_size(&self) -> u32 {
        self.record_size
    }

    fn size_in_bytes(&self) -> u64 {
        self.byte_size
    }

    fn read(&self, record: u64) -> Result<Record<'_>> {
        self.check_record(record)?;
        let (partition, offset) = self.locate(record);
        Ok(Record::Mapped(
            self.partitions[partition].slice(offset, self.record_size as usize),
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
        // A multi-record write may straddle a segment boundary; split it.
        let mut written = 0usize;
        while written < bytes.len() {
            let position = byte_offset + written as u64;
            let partition = (position / self.partition_size) as usize;
            let offset = (position % self.partition_size) as usize;
            let room = self.partitions[partition].len() - offset;
            let chunk = room.min(bytes.len() - written);
            self.partitions[partition].write(offset, &bytes[written..written + chunk])?;
            written += chunk;
        }
        Ok(())
    }

    fn write_u32(&self, record: u64, value: u32, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        let (partition, offset) = self.locate(record);
        self.partitions[partition].write(offset + field_offset as usize, &value.to_le_bytes())
    }

    fn write_i64(&self, record: u64, value: i64, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        let (partition, offset) = self.locate(record);
        self.partitions[partition].write(offset + field_offset as usize, &value.to_le_bytes())
    }

    fn write_i16(&self, record: u64, value: i16, field_offset: u32) -> Result<()> {
        self.check_record(record)?;
        let (partition, offset) = self.locate(record);
        self.partitions[partition].write(offset + field_offset as usize, &value.to_le_bytes())
    }

    fn swap(&self, a: u64, b: u64) -> Result<()> {
        if a == b {
            return Ok(());
        }
        self.check_record(a)?;
        self.check_record(b)?;
        let record = self.record_size as usize;
        let (partition_a, offset_a) = self.locate(a);
        let (partition_b, offset_b) = self.locate(b);

        let mut scratch = self.buffers.acquire();
        scratch.copy_from_slice(self.partitions[partition_a].slice(offset_a, record));
        self.copy_records(partition_b, offset_b, partition_a, offset_a, record)?;
        self.partitions[partition_b].write(offset_b, &scratch)?;
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

        // Fast path only when each range sits entirely inside one
        // segment; otherwise per-record swaps handle the straddling.
        let contiguous = |record: u64| (record % self.records_per_partition) + count
            <= self.records_per_partition;
        if !(contiguous(a) && contiguous(b)) {
            for k in 0..count {
                self.swap(a + k, b + k)?;
            }
            return Ok(());
        }

        let len = (self.record_size as u64 * count) as usize;
        let (partition_a, offset_a) = self.locate(a);
        let (partition_b, offset_b) = self.locate(b);
        let mut scratch = self.buffers.allocate(len);
        scratch.copy_from_slice(self.partitions[partition_a].slice(offset_a, len));
        self.copy_records(partition_b, offset_b, partition_a, offset_a, len)?;
        self.partitions[partition_b].write(offset_b, &scratch)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        for partition in &self.partitions {
            partition.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::view::ByteView;
    use crate::ValueType;
    use std::io::Write;

    /// 100 records, 7 records per segment: plenty of boundaries.
    fn segmented() -> (tempfile::NamedTempFile, MultiMappedStorage) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        for i in 0u64..100 {
            let mut rec = vec![0u8; 12];
            rec.put_u32(0, i as u32);
            rec.put_i64(4, i as i64 * 11);
            tmp.write_all(&rec).unwrap();
        }
        tmp.flush().unwrap();
        let store = MultiMappedStorage::with_partition_capacity(
            &tmp.reopen().unwrap(),
            &StorageSpec::new(12),
            7,
        )
        .unwrap();
        (tmp, store)
    }

    #[test]
    fn records_resolve_across_segments() {
        let (_tmp, store) = segmented();
        assert_eq!(store.partition_count(), 15);
        for i in 0..100 {
            assert_eq!(store.read_value(i, 4, ValueType::I64).unwrap(), i as i64 * 11);
        }
    }

    #[test]
    fn cross_segment_swap() {
        let (_tmp, store) = segmented();
        store.swap(3, 93).unwrap();
        assert_eq!(store.read_value(3, 4, ValueType::I64).unwrap(), 93 * 11);
        assert_eq!(store.read_value(93, 4, ValueType::I64).unwrap(), 3 * 11);
    }

    #[test]
    fn straddling_bulk_swap_falls_back_to_per_record() {
        let (_tmp, store) = segmented();
        // Range [5, 15) crosses the segment boundary at 7.
        store.bulk_swap(5, 50, 10).unwrap();
        for k in 0..10i64 {
            assert_eq!(
                store.read_value(5 + k as u64, 4, ValueType::I64).unwrap(),
                (50 + k) * 11
            );
            assert_eq!(
                store.read_value(50 + k as u64, 4, ValueType::I64).unwrap(),
                (5 + k) * 11
            );
        }
    }

    #[test]
    fn multi_record_write_at_straddles_segments() {
        let (_tmp, store) = segmented();
        let mut bytes = vec![0u8; 12 * 4];
        for k in 0..4 {
            bytes[k * 12..k * 12 + 4].copy_from_slice(&(900 + k as u32).to_le_bytes());
            bytes[k * 12 + 4..k * 12 + 12].copy_from_slice(&(-7i64).to_le_bytes());
        }
        // Record 5 is two records shy of the first boundary.
        store.write_at(5 * 12, &bytes).unwrap();
        for k in 0..4u64 {
            let rec = store.read(5 + k).unwrap();
            assert_eq!(rec.get_u32(0), 900 + k as u32);
            assert_eq!(rec.get_i64(4), -7);
        }
    }

    #[test]
    fn sort_works_across_segments() {
        let (_tmp, store) = segmented();
        // Scramble, then sort back.
        for i in 0..50 {
            store.swap(i, 99 - i).unwrap();
        }
        store.sort(4, ValueType::I64).unwrap();
        for i in 0..100 {
            assert_eq!(store.read_value(i, 4, ValueType::I64).unwrap(), i as i64 * 11);
        }
    }
}
