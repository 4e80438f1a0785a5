//! # Storage Specification
//!
//! Describes the desired characteristics of a store without tying the
//! caller to a concrete backend. A spec with record size zero serves as a
//! template that higher layers stamp with the schema-derived size via
//! [`StorageSpec::with_record_size`].

use eyre::{ensure, Result};

use crate::storage::buffers::{BufferPool, DEFAULT_CONCURRENCY};

/// Backend-independent store configuration.
///
/// `concurrency` is not thread concurrency: it is how many pooled buffers
/// a *single* caller may need alive at once. Sorting compares two records,
/// so it needs at least two.
#[derive(Debug, Clone)]
pub struct StorageSpec {
    record_size: u32,
    prefer_mapped: bool,
    always_mapped: bool,
    writable: bool,
    concurrency: u32,
}

impl StorageSpec {
    /// A spec for records of `record_size` bytes, with defaults:
    /// read-write, mapping preferred but adaptive, concurrency 4.
    pub fn new(record_size: u32) -> Self {
        Self {
            record_size,
            prefer_mapped: true,
            always_mapped: false,
            writable: true,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// A record-size-zero template for later stamping.
    pub fn template() -> Self {
        Self::new(0)
    }

    /// This spec with a different record size.
    pub fn with_record_size(&self, record_size: u32) -> Self {
        let mut copy = self.clone();
        copy.record_size = record_size;
        copy
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn read_write(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Try mapping first; fall back to descriptor I/O under memory
    /// pressure.
    pub fn initially_mapped(mut self) -> Self {
        self.prefer_mapped = true;
        self
    }

    /// Start on descriptor I/O; the adaptive backend may still promote.
    pub fn initially_unmapped(mut self) -> Self {
        self.prefer_mapped = false;
        self
    }

    /// Force a mapped backend and forbid adaptive fallback.
    pub fn always_mapped(mut self) -> Self {
        self.prefer_mapped = true;
        self.always_mapped = true;
        self
    }

    /// Number of pooled buffers a single caller may hold at once.
    pub fn concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_mapped(&self) -> bool {
        self.always_mapped || self.prefer_mapped
    }

    pub fn is_always_mapped(&self) -> bool {
        self.always_mapped
    }

    pub fn prefers_mapped(&self) -> bool {
        self.prefer_mapped
    }

    pub fn max_concurrent_buffers(&self) -> u32 {
        self.concurrency
    }

    pub(crate) fn buffers(&self) -> BufferPool {
        BufferPool::new(self.record_size as usize, self.concurrency)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(self.record_size > 0, "record size must be greater than zero");
        ensure!(
            self.concurrency >= 2,
            "concurrency must be at least 2 (sorting compares two records)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_is_stamped_with_a_size() {
        let spec = StorageSpec::template().read_only().concurrency(8);
        let stamped = spec.with_record_size(24);
        assert_eq!(stamped.record_size(), 24);
        assert!(!stamped.is_writable());
        assert_eq!(stamped.max_concurrent_buffers(), 8);
    }

    #[test]
    fn zero_record_size_fails_validation() {
        assert!(StorageSpec::template().validate().is_err());
        assert!(StorageSpec::new(20).validate().is_ok());
    }

    #[test]
    fn always_mapped_implies_mapped() {
        let spec = StorageSpec::new(8).initially_unmapped().always_mapped();
        assert!(spec.is_mapped());
        assert!(spec.is_always_mapped());
    }

    #[test]
    fn concurrency_below_two_fails_validation() {
        assert!(StorageSpec::new(8).concurrency(1).validate().is_err());
    }
}
