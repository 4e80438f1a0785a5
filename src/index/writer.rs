//! # Index Writer
//!
//! Appends schema-packed records to the primary `<base>.offsets` file and
//! materializes the per-field shadow files when closed.
//!
//! Record positions come from the sequence number: a write claims the
//! next sequence atomically and lands at `seq × record_size`, so
//! concurrent writers never interleave partial records. Multi-threaded
//! writing is only meaningful when the schema has a canonical-ordering
//! field, because without one racing appends would leave records at
//! indeterminate positions with nothing to repair the order by. So the
//! writer records the first writing thread and fails fast when a second
//! one appears and no canonical field exists. With a canonical field it
//! instead flips to multi-threaded mode and, at close, re-sorts the
//! primary by that field and rewrites the sequence numbers to match the
//! final positions.
//!
//! Closing is where indexes are born: the primary is copied once per
//! indexable non-canonical field and each copy is sorted in place by its
//! field. A writer that fails mid-close leaves partial files behind;
//! there is no recovery, callers clean up and rebuild.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::ThreadId;
use std::time::Instant;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::debug;

use crate::index::schema::Schema;
use crate::storage::{AnyStorage, BufferPool, ByteView, Storage, StorageSpec};

#[derive(Debug, Default)]
struct WriteDiscipline {
    first_thread: Option<ThreadId>,
    multi_threaded: bool,
}

#[derive(Debug)]
pub struct IndexWriter {
    dir: PathBuf,
    name: String,
    schema: Schema,
    file: File,
    next_seq: AtomicU32,
    buffers: BufferPool,
    discipline: Mutex<WriteDiscipline>,
    spec: StorageSpec,
}

impl IndexWriter {
    /// Creates (or re-creates) the index under `dir` with base name
    /// `name`.
    pub fn create(dir: impl AsRef<Path>, name: &str, schema: Schema) -> Result<Self> {
        Self::with_spec(dir, name, schema, StorageSpec::template())
    }

    /// Like [`IndexWriter::create`] with an explicit storage spec
    /// template; its record size is replaced by the schema's.
    pub fn with_spec(
        dir: impl AsRef<Path>,
        name: &str,
        schema: Schema,
        template: StorageSpec,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(format!("{name}.offsets"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create index file '{}'", path.display()))?;
        let spec = template
            .with_record_size(schema.record_size())
            .read_write()
            .initially_mapped();
        Ok(Self {
            buffers: BufferPool::new(schema.record_size() as usize, spec.max_concurrent_buffers()),
            dir,
            name: name.to_string(),
            schema,
            file,
            next_seq: AtomicU32::new(0),
            discipline: Mutex::new(WriteDiscipline::default()),
            spec,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Records written so far.
    pub fn len(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a second thread may write to this index.
    pub fn supports_multi_threaded_writes(&self) -> bool {
        self.schema.canonical().is_some()
    }

    /// Appends one record; `values` supplies every schema field in
    /// declaration order. Returns the assigned sequence number.
    pub fn write(&self, values: &[i64]) -> Result<u32> {
        ensure!(
            values.len() == self.schema.len(),
            "schema has {} fields but {} values were supplied",
            self.schema.len(),
            values.len()
        );
        self.note_writing_thread()?;

        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        let mut buf = self.buffers.acquire();
        buf.put_u32(0, seq);
        for (field, &value) in self.schema.fields().iter().zip(values) {
            field
                .value_type()
                .write(field.byte_offset() as usize, value, &mut buf);
        }
        let offset = seq as u64 * self.schema.record_size() as u64;
        self.file
            .write_all_at(&buf, offset)
            .wrap_err_with(|| format!("failed to append record {seq}"))?;
        Ok(seq)
    }

    fn note_writing_thread(&self) -> Result<()> {
        let mut discipline = self.discipline.lock();
        if discipline.multi_threaded {
            return Ok(());
        }
        let current = std::thread::current().id();
        match discipline.first_thread {
            None => discipline.first_thread = Some(current),
            Some(first) if first != current => {
                ensure!(
                    self.schema.canonical().is_some(),
                    "multi-threaded writes require a CANONICAL_ORDERING field"
                );
                discipline.multi_threaded = true;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Finishes the index: repairs ordering if writes came from several
    /// threads, then materializes one sorted shadow file per indexable
    /// non-canonical field.
    pub fn close(self) -> Result<()> {
        let multi_threaded = self.discipline.lock().multi_threaded;
        if self.len() > 0 {
            if multi_threaded {
                self.sort_and_renumber()?;
            }
            self.write_shadow_files()?;
        } else {
            // Nothing to sort; still leave the expected (empty) files.
            for (_, field) in self.schema.shadow_fields() {
                let shadow = self.dir.join(field.shadow_file_name(&self.name));
                File::create(&shadow)
                    .wrap_err_with(|| format!("failed to create '{}'", shadow.display()))?;
            }
        }
        self.file.sync_all().wrap_err("failed to sync primary index file")
    }

    fn sort_and_renumber(&self) -> Result<()> {
        // Multi-threaded mode is only ever entered with a canonical field.
        let Some(field) = self.schema.canonical_field() else {
            return Ok(());
        };
        debug!(index = %self.name, "sorting primary by canonical field after multi-threaded writes");
        let started = Instant::now();
        let spec = self.spec.clone().always_mapped().read_write();
        let store = AnyStorage::create(self.file.try_clone()?, &spec)?;
        store.sort(field.byte_offset(), field.value_type())?;
        for record in 0..store.size() {
            store.write_u32(record, record as u32, 0)?;
        }
        store.sync()?;
        debug!(index = %self.name, elapsed = ?started.elapsed(), "renumbered primary");
        Ok(())
    }

    fn write_shadow_files(&self) -> Result<()> {
        let primary = self.dir.join(format!("{}.offsets", self.name));
        self.file
            .sync_all()
            .wrap_err("failed to sync primary before shadow copies")?;
        for (_, field) in self.schema.shadow_fields() {
            let shadow = self.dir.join(field.shadow_file_name(&self.name));
            let started = Instant::now();
            std::fs::copy(&primary, &shadow).wrap_err_with(|| {
                format!("failed to copy primary into '{}'", shadow.display())
            })?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&shadow)
                .wrap_err_with(|| format!("failed to reopen '{}'", shadow.display()))?;
            let spec = self.spec.clone().always_mapped().read_write().concurrency(2);
            let store = AnyStorage::create(file, &spec)?;
            store.sort(field.byte_offset(), field.value_type())?;
            store.sync()?;
            debug!(
                index = %self.name,
                field = field.name(),
                elapsed = ?started.elapsed(),
                "materialized shadow file"
            );
        }
        Ok(())
    }
}
