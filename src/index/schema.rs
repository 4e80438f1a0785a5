//! # Index Schema
//!
//! A schema is data, not types: an ordered list of named fields, each
//! with a value type, a byte offset and an index kind. Offsets are
//! assigned at build time: every record leads with a 32-bit sequence
//! number, so the first field lands at byte 4 and each further field
//! follows the previous one. The record size falls out of the field
//! list.
//!
//! At most one field may carry [`IndexKind::CanonicalOrdering`]; it
//! defines the true order of records and is the sort key used to repair
//! ordering after multi-threaded writes. Fields marked
//! [`IndexKind::Unique`] get a sorted shadow file of their own.
//! Schemas are immutable once built.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::storage::ValueType;

/// Byte width of the leading sequence number every record carries.
pub const SEQUENCE_BYTES: u32 = 4;

/// Byte offset of the leading sequence number.
pub const SEQUENCE_OFFSET: u32 = 0;

/// How a field participates in indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Stored but not searchable.
    None,
    /// Defines the true record order; searched against the primary file.
    CanonicalOrdering,
    /// Unique per record; searched via a sorted shadow file.
    Unique,
}

impl IndexKind {
    /// Whether the field can be searched at all.
    pub fn is_indexed(self) -> bool {
        matches!(self, IndexKind::CanonicalOrdering | IndexKind::Unique)
    }

    pub fn is_canonical(self) -> bool {
        self == IndexKind::CanonicalOrdering
    }
}

/// One field of a record: name, type, resolved byte offset, index kind.
#[derive(Debug, Clone)]
pub struct FieldDef {
    name: String,
    value_type: ValueType,
    byte_offset: u32,
    kind: IndexKind,
}

impl FieldDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn byte_offset(&self) -> u32 {
        self.byte_offset
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// File name of this field's shadow file for index base name `base`.
    pub fn shadow_file_name(&self, base: &str) -> String {
        format!("{}.{}s", base, self.name.to_lowercase())
    }
}

/// An immutable, validated field layout.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: SmallVec<[FieldDef; 8]>,
    record_size: u32,
    canonical: Option<usize>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder {
            fields: SmallVec::new(),
            next_offset: SEQUENCE_BYTES,
        }
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Result<&FieldDef> {
        match self.fields.get(index) {
            Some(field) => Ok(field),
            None => bail!(
                "field index {} out of range (schema has {} fields)",
                index,
                self.fields.len()
            ),
        }
    }

    /// Index of the field named `name`.
    pub fn field_named(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Total record width: sequence prefix plus all fields.
    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    /// Index of the canonical-ordering field, if the schema has one.
    pub fn canonical(&self) -> Option<usize> {
        self.canonical
    }

    pub fn canonical_field(&self) -> Option<&FieldDef> {
        self.canonical.map(|i| &self.fields[i])
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields that get shadow files: indexed but not canonical.
    pub(crate) fn shadow_fields(&self) -> impl Iterator<Item = (usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind.is_indexed() && !f.kind.is_canonical())
    }
}

/// Accumulates fields in declaration order, assigning offsets.
#[derive(Debug)]
pub struct SchemaBuilder {
    fields: SmallVec<[FieldDef; 8]>,
    next_offset: u32,
}

impl SchemaBuilder {
    /// Appends a field after the previous one.
    pub fn field(mut self, name: impl Into<String>, value_type: ValueType, kind: IndexKind) -> Self {
        let byte_offset = self.next_offset;
        self.next_offset += value_type.size();
        self.fields.push(FieldDef {
            name: name.into(),
            value_type,
            byte_offset,
            kind,
        });
        self
    }

    pub fn build(self) -> Result<Schema> {
        ensure!(!self.fields.is_empty(), "a schema needs at least one field");
        let mut canonical = None;
        for (index, field) in self.fields.iter().enumerate() {
            ensure!(
                field.value_type != ValueType::U128,
                "field `{}`: u128 is a sort key, not a storable field type",
                field.name
            );
            ensure!(
                !field.name.is_empty(),
                "fields must have non-empty names"
            );
            if field.kind.is_canonical() {
                ensure!(
                    canonical.is_none(),
                    "more than one field has kind CANONICAL_ORDERING: `{}` and `{}`",
                    self.fields[canonical.unwrap_or(0)].name,
                    field.name
                );
                canonical = Some(index);
            }
        }
        let duplicate = self
            .fields
            .iter()
            .enumerate()
            .find(|(i, f)| self.fields[..*i].iter().any(|g| g.name == f.name));
        if let Some((_, field)) = duplicate {
            bail!("duplicate field name `{}`", field.name);
        }
        Ok(Schema {
            record_size: self.next_offset,
            fields: self.fields,
            canonical,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_the_sequence_prefix() {
        let schema = Schema::builder()
            .field("offset", ValueType::I64, IndexKind::CanonicalOrdering)
            .field("id", ValueType::I64, IndexKind::Unique)
            .field("flags", ValueType::U16, IndexKind::None)
            .build()
            .unwrap();
        assert_eq!(schema.record_size(), 4 + 8 + 8 + 2);
        assert_eq!(schema.field(0).unwrap().byte_offset(), 4);
        assert_eq!(schema.field(1).unwrap().byte_offset(), 12);
        assert_eq!(schema.field(2).unwrap().byte_offset(), 20);
        assert_eq!(schema.canonical(), Some(0));
    }

    #[test]
    fn two_canonical_fields_are_rejected() {
        let result = Schema::builder()
            .field("a", ValueType::I64, IndexKind::CanonicalOrdering)
            .field("b", ValueType::I64, IndexKind::CanonicalOrdering)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn u128_fields_are_rejected() {
        let result = Schema::builder()
            .field("key", ValueType::U128, IndexKind::None)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = Schema::builder()
            .field("x", ValueType::I64, IndexKind::None)
            .field("x", ValueType::I32, IndexKind::None)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn shadow_fields_skip_the_canonical_one() {
        let schema = Schema::builder()
            .field("offset", ValueType::I64, IndexKind::CanonicalOrdering)
            .field("id", ValueType::I64, IndexKind::Unique)
            .field("data", ValueType::I64, IndexKind::None)
            .build()
            .unwrap();
        let shadows: Vec<_> = schema.shadow_fields().map(|(i, _)| i).collect();
        assert_eq!(shadows, vec![1]);
    }

    #[test]
    fn shadow_file_names_are_lowercased_and_pluralized() {
        let schema = Schema::builder()
            .field("Id", ValueType::I64, IndexKind::Unique)
            .build()
            .unwrap();
        assert_eq!(
            schema.field(0).unwrap().shadow_file_name("graph"),
            "graph.ids"
        );
    }
}
