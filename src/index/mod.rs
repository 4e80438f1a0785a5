//! # Index Layer
//!
//! Schema-driven micro-databases on top of the record store. An
//! [`IndexWriter`] appends packed records to a primary `<base>.offsets`
//! file and, on close, derives one sorted shadow file per indexed field;
//! an [`IndexReader`] answers point and nearest lookups against any of
//! them with a binary search. [`OneToManyIndex`] is the multi-valued
//! variant with a counts sidecar and an on-demand inverse.
//!
//! ## Directory anatomy
//!
//! For an index with base name `graph` and a schema of `offset`
//! (canonical) and `id` (unique):
//!
//! ```text
//! graph.offsets    primary: records in canonical order
//! graph.ids        shadow: same records, sorted by id
//! ```
//!
//! For a one-to-many index named `edges`:
//!
//! ```text
//! edges.12m        forward rows, sorted by (key, value)
//! edges.m21        inverse rows, sorted by (value, key), on demand
//! edges.counts     one row per distinct key
//! ```

mod adapter;
mod one_to_many;
mod reader;
mod schema;
mod writer;

pub use adapter::{MatrixMapAdapter, ReaderBiAdapter, ReaderMapAdapter};
pub use one_to_many::{
    EdgePairs, OneToManyIndex, OneToManyReader, OneToManyWriter, COUNT_RECORD_BYTES,
    EDGE_RECORD_BYTES,
};
pub use reader::IndexReader;
pub use schema::{FieldDef, IndexKind, Schema, SchemaBuilder, SEQUENCE_BYTES, SEQUENCE_OFFSET};
pub use writer::IndexWriter;
