//! # Index Reader
//!
//! Read-side of an index directory: the primary `<base>.offsets` store
//! plus one lazily opened store per shadow file. Shadow stores are
//! memoized in a concurrent map, so each opens at most once no matter
//! how many threads query the same field.
//!
//! A search against the canonical field binary-searches the primary
//! directly. A search against any other indexed field binary-searches
//! that field's shadow file and then reads the matched record's leading
//! sequence number, which (because the primary was written
//! single-threaded or renumbered at close) *is* the primary index.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::index::schema::Schema;
use crate::storage::{AnyStorage, Bias, ByteView, Record, Storage, StorageSpec};

#[derive(Debug)]
pub struct IndexReader {
    dir: PathBuf,
    name: String,
    schema: Schema,
    spec: StorageSpec,
    primary: AnyStorage,
    secondary: RwLock<HashMap<usize, Arc<AnyStorage>>>,
}

impl IndexReader {
    /// Opens the index read-only.
    pub fn open(dir: impl AsRef<Path>, name: &str, schema: Schema) -> Result<Self> {
        Self::with_spec(dir, name, schema, StorageSpec::template().read_only())
    }

    /// Opens with an explicit storage spec template (read-write for the
    /// matrix-map build path); its record size is replaced by the
    /// schema's.
    pub fn with_spec(
        dir: impl AsRef<Path>,
        name: &str,
        schema: Schema,
        template: StorageSpec,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let spec = template.with_record_size(schema.record_size());
        let primary = AnyStorage::open_path(dir.join(format!("{name}.offsets")), &spec)?;
        Ok(Self {
            dir,
            name: name.to_string(),
            schema,
            spec,
            primary,
            secondary: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of records in the primary file.
    pub fn len(&self) -> u64 {
        self.primary.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `record`-th primary record.
    pub fn get(&self, record: u64) -> Result<Record<'_>> {
        self.primary.read(record)
    }

    /// Finds the primary index of `value` in `field`, under `bias`.
    pub fn search(&self, field: usize, value: i64, bias: Bias) -> Result<i64> {
        let def = self.schema.field(field)?;
        ensure!(
            def.kind().is_indexed(),
            "field `{}` is not indexed",
            def.name()
        );
        if def.kind().is_canonical() {
            return self
                .primary
                .binary_search(value, def.byte_offset(), def.value_type(), bias);
        }
        let shadow = self.secondary_store(field)?;
        let hit = shadow.binary_search(value, def.byte_offset(), def.value_type(), bias)?;
        if hit < 0 {
            return Ok(-1);
        }
        // The shadow record's sequence number is the primary index.
        let record = shadow.read(hit as u64)?;
        Ok(record.get_u32(0) as i64)
    }

    /// Finds `value` in the canonical-ordering field.
    pub fn search_canonical(&self, value: i64, bias: Bias) -> Result<i64> {
        let Some(def) = self.schema.canonical_field() else {
            eyre::bail!("schema has no CANONICAL_ORDERING field");
        };
        self.primary
            .binary_search(value, def.byte_offset(), def.value_type(), bias)
    }

    /// Exact-match lookup in `field`.
    pub fn index_of(&self, field: usize, value: i64) -> Result<i64> {
        self.search(field, value, Bias::None)
    }

    /// Exact-match lookup in the canonical field.
    pub fn index_of_canonical(&self, value: i64) -> Result<i64> {
        self.search_canonical(value, Bias::None)
    }

    /// The matched primary record, if any.
    pub fn find(&self, field: usize, value: i64, bias: Bias) -> Result<Option<Record<'_>>> {
        let hit = self.search(field, value, bias)?;
        if hit < 0 {
            Ok(None)
        } else {
            Ok(Some(self.get(hit as u64)?))
        }
    }

    /// Reads one field of one primary record.
    pub fn value_for(&self, record: u64, field: usize) -> Result<i64> {
        let def = self.schema.field(field)?;
        self.primary
            .read_value(record, def.byte_offset(), def.value_type())
    }

    fn secondary_store(&self, field: usize) -> Result<Arc<AnyStorage>> {
        if let Some(store) = self.secondary.read().get(&field) {
            return Ok(Arc::clone(store));
        }
        let mut map = self.secondary.write();
        if let Some(store) = map.get(&field) {
            return Ok(Arc::clone(store));
        }
        let def = self.schema.field(field)?;
        let path = self.dir.join(def.shadow_file_name(&self.name));
        let store = Arc::new(AnyStorage::open_path(path, &self.spec)?);
        map.insert(field, Arc::clone(&store));
        Ok(store)
    }
}
