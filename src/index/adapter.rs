//! # Matrix-Map Adapters
//!
//! The one surface where an external collaborator enters this crate: a
//! bitset-based matrix-map (graph) library builds its projections by
//! asking an index for key/value positions and back. The library itself
//! lives elsewhere; these adapters answer its four questions by
//! delegating to [`IndexReader`] searches and record reads.

use eyre::Result;

use crate::index::reader::IndexReader;
use crate::index::schema::SEQUENCE_BYTES;
use crate::storage::ByteView;

/// The lookup surface a bitset matrix-map consumes.
pub trait MatrixMapAdapter {
    /// Canonical position of `key`, or −1.
    fn index_of_key(&self, key: i64) -> Result<i64>;

    /// Canonical position of `value`, or −1.
    fn index_of_value(&self, value: i64) -> Result<i64>;

    /// The key stored at canonical position `index`.
    fn key_for_key_index(&self, index: u32) -> Result<i64>;

    /// The value stored at canonical position `index`.
    fn value_for_value_index(&self, index: u32) -> Result<i64>;
}

/// Adapter over a single reader: keys and values resolve through the
/// same index. With no field given, the canonical field answers
/// searches and the first payload field answers reads.
#[derive(Debug)]
pub struct ReaderMapAdapter<'a> {
    reader: &'a IndexReader,
    field: Option<usize>,
}

impl<'a> ReaderMapAdapter<'a> {
    pub fn new(reader: &'a IndexReader, field: Option<usize>) -> Self {
        Self { reader, field }
    }

    fn index_of(&self, value: i64) -> Result<i64> {
        match self.field {
            Some(field) => self.reader.index_of(field, value),
            None => self.reader.index_of_canonical(value),
        }
    }

    fn value_at(&self, index: u32) -> Result<i64> {
        match self.field {
            Some(field) => self.reader.value_for(index as u64, field),
            None => {
                let record = self.reader.get(index as u64)?;
                Ok(record.get_i64(SEQUENCE_BYTES as usize))
            }
        }
    }
}

impl MatrixMapAdapter for ReaderMapAdapter<'_> {
    fn index_of_key(&self, key: i64) -> Result<i64> {
        self.index_of(key)
    }

    fn index_of_value(&self, value: i64) -> Result<i64> {
        self.index_of(value)
    }

    fn key_for_key_index(&self, index: u32) -> Result<i64> {
        self.value_at(index)
    }

    fn value_for_value_index(&self, index: u32) -> Result<i64> {
        self.value_at(index)
    }
}

/// Adapter over two readers: keys resolve through one index, values
/// through another.
#[derive(Debug)]
pub struct ReaderBiAdapter<'a> {
    keys: ReaderMapAdapter<'a>,
    values: ReaderMapAdapter<'a>,
}

impl<'a> ReaderBiAdapter<'a> {
    pub fn new(
        keys: &'a IndexReader,
        values: &'a IndexReader,
        key_field: Option<usize>,
        value_field: Option<usize>,
    ) -> Self {
        Self {
            keys: ReaderMapAdapter::new(keys, key_field),
            values: ReaderMapAdapter::new(values, value_field),
        }
    }
}

impl MatrixMapAdapter for ReaderBiAdapter<'_> {
    fn index_of_key(&self, key: i64) -> Result<i64> {
        self.keys.index_of(key)
    }

    fn index_of_value(&self, value: i64) -> Result<i64> {
        self.values.index_of(value)
    }

    fn key_for_key_index(&self, index: u32) -> Result<i64> {
        self.keys.value_at(index)
    }

    fn value_for_value_index(&self, index: u32) -> Result<i64> {
        self.values.value_at(index)
    }
}
