//! # recdb - File-Backed Micro-Databases over Fixed-Length Records
//!
//! recdb is an embedded engine for building small, single-purpose
//! databases: a byte-addressable store of fixed-size records in a
//! headerless file, and a schema-driven index layer that materializes one
//! sorted shadow file per searchable field. This implementation
//! prioritizes:
//!
//! - **Zero-copy data access**: mapped backends hand out direct mmap
//!   slices, no intermediate buffers
//! - **Bounded memory**: descriptor backends run on a handful of pooled
//!   record-sized buffers regardless of file size
//! - **In-place everything**: sorting drives swaps against the file
//!   itself; no permutation array of size N ever exists
//!
//! ## Quick Start
//!
//! ```ignore
//! use recdb::{Bias, IndexKind, IndexReader, IndexWriter, Schema, ValueType};
//!
//! let schema = Schema::builder()
//!     .field("offset", ValueType::I64, IndexKind::CanonicalOrdering)
//!     .field("id", ValueType::I64, IndexKind::Unique)
//!     .build()?;
//!
//! let writer = IndexWriter::create(&dir, "nodes", schema.clone())?;
//! writer.write(&[0, 4242])?;
//! writer.write(&[100, 1717])?;
//! writer.close()?;
//!
//! let reader = IndexReader::open(&dir, "nodes", schema)?;
//! let position = reader.index_of(1, 1717)?; // search by unique id
//! let record = reader.get(position as u64)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  IndexWriter / IndexReader / OneToMany    │
//! ├───────────────────────────────────────────┤
//! │        Schema (fields at offsets)         │
//! ├───────────────────────────────────────────┤
//! │   Sort / Binary Search / RegionLock       │
//! ├───────────────────────────────────────────┤
//! │  Storage contract over four backends:     │
//! │  descriptor · caching · mapped · segments │
//! ├───────────────────────────────────────────┤
//! │     Positional file I/O + memory maps     │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! Every file is a headerless sequence of fixed-size records; an index
//! with base name `B` owns a small family of them:
//!
//! ```text
//! B.offsets        primary records, canonical order
//! B.<field>s       per-field sorted copies of the primary
//! B.12m / B.m21    one-to-many forward / inverse rows
//! B.counts         per-key occurrence counts
//! ```
//!
//! ## Concurrency
//!
//! Plain OS threads, blocking I/O, no global state. A shared store is
//! safe under many readers, a single writer, or callers serialized
//! through a [`RegionLock`]. An [`IndexWriter`] accepts writes from
//! several threads only when its schema has a canonical-ordering field
//! to repair the record order at close.
//!
//! ## Module Overview
//!
//! - [`storage`]: the record-store contract, its four backends, the
//!   adaptive wrapper, in-place sort, biased binary search, region locks
//! - [`index`]: schemas, the index writer/reader pair, one-to-many
//!   indexes, and the matrix-map adapter surface

pub mod index;
pub mod storage;

pub use index::{
    IndexKind, IndexReader, IndexWriter, MatrixMapAdapter, OneToManyIndex, OneToManyReader,
    OneToManyWriter, ReaderBiAdapter, ReaderMapAdapter, Schema, SchemaBuilder,
};
pub use storage::{
    AdaptiveStorage, AnyStorage, Bias, BufferPool, ByteView, CachingFdStorage, FdStorage, Long128,
    MultiMappedStorage, Record, RegionLock, RegionLockedStore, SingleMappedStorage, Storage,
    StorageSpec, ValueType,
};
