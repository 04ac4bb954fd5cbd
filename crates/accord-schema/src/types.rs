//! Schema types and data structures
//!
//! This module provides the core value types of the catalog:
//! - [`SchemaDescriptor`] - a parsed schema plus its fingerprint
//! - [`RecordTypeFamily`] - the stable logical identity of a record type
//! - [`AvroRecord`] / [`SchemaPackage`] - statically declared record types an
//!   application registers at startup

use crate::error::{SchemaError, SchemaResult};
use crate::fingerprint::SchemaFingerprint;
use apache_avro::Schema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Logical identity of a record type (namespace + name)
///
/// A family spans every compatible revision of a type. Within one registry at
/// most one fingerprint may ever be registered per family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordTypeFamily(pub String);

impl RecordTypeFamily {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self(full_name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordTypeFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordTypeFamily {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordTypeFamily {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A parsed schema plus its fingerprint
///
/// Descriptors are immutable and cheap to clone. Equality and hashing use the
/// fingerprint only.
#[derive(Clone)]
pub struct SchemaDescriptor {
    inner: Arc<DescriptorInner>,
}

struct DescriptorInner {
    schema: Schema,
    /// Schema JSON as written, with defaults, docs and aliases
    text: String,
    canonical: String,
    fingerprint: SchemaFingerprint,
    family: Option<RecordTypeFamily>,
}

impl SchemaDescriptor {
    /// Parse raw schema text
    pub fn parse(text: &str) -> SchemaResult<Self> {
        let schema =
            Schema::parse_str(text).map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        Ok(Self::build(schema, text.to_string()))
    }

    fn build(schema: Schema, text: String) -> Self {
        let canonical = schema.canonical_form();
        let fingerprint = SchemaFingerprint::of(&schema);
        let family = family_of(&schema);
        Self {
            inner: Arc::new(DescriptorInner {
                schema,
                text,
                canonical,
                fingerprint,
                family,
            }),
        }
    }

    /// Descriptor for the schema a typed record declares
    pub fn of<T: AvroRecord>() -> SchemaResult<Self> {
        Self::parse(T::schema_text())
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Original schema text; this is what registries store
    ///
    /// Parsing it again yields the same fingerprint and keeps field defaults,
    /// which reader-schema projection needs.
    pub fn text(&self) -> &str {
        &self.inner.text
    }

    /// Parsing Canonical Form; the fingerprint is computed over it
    pub fn canonical_form(&self) -> &str {
        &self.inner.canonical
    }

    pub fn fingerprint(&self) -> SchemaFingerprint {
        self.inner.fingerprint
    }

    /// Family of a named schema (record, enum, fixed); `None` for anonymous schemas
    pub fn family(&self) -> Option<&RecordTypeFamily> {
        self.inner.family.as_ref()
    }
}

impl PartialEq for SchemaDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.inner.fingerprint == other.inner.fingerprint
    }
}

impl Eq for SchemaDescriptor {}

impl std::hash::Hash for SchemaDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.fingerprint.hash(state);
    }
}

impl std::fmt::Debug for SchemaDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaDescriptor")
            .field("fingerprint", &self.inner.fingerprint)
            .field("family", &self.inner.family)
            .finish()
    }
}

fn family_of(schema: &Schema) -> Option<RecordTypeFamily> {
    let name = match schema {
        Schema::Record(r) => &r.name,
        Schema::Enum(e) => &e.name,
        Schema::Fixed(f) => &f.name,
        _ => return None,
    };
    let full_name = match name.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}.{}", ns, name.name),
        _ => name.name.clone(),
    };
    Some(RecordTypeFamily(full_name))
}

/// A typed record bound to a statically declared Avro schema
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct Order { id: i64 }
///
/// impl AvroRecord for Order {
///     fn schema_text() -> &'static str {
///         r#"{"type": "record", "name": "Order", "fields": [{"name": "id", "type": "long"}]}"#
///     }
/// }
/// ```
pub trait AvroRecord: Serialize + DeserializeOwned {
    /// Avro schema JSON for this type
    fn schema_text() -> &'static str;

    /// Key used to look the type's packer up after registration
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// One record type inside a [`SchemaPackage`]
#[derive(Debug, Clone)]
pub struct PackageEntry {
    pub type_name: String,
    pub descriptor: SchemaDescriptor,
}

/// A statically built set of record types registered together
#[derive(Debug, Clone)]
pub struct SchemaPackage {
    key: String,
    entries: Vec<PackageEntry>,
}

impl SchemaPackage {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            entries: Vec::new(),
        }
    }

    /// Add a typed record
    pub fn with_record<T: AvroRecord>(self) -> SchemaResult<Self> {
        self.with_schema(T::type_name(), T::schema_text())
    }

    /// Add a record type by name and raw schema text
    pub fn with_schema(mut self, type_name: impl Into<String>, text: &str) -> SchemaResult<Self> {
        let descriptor = SchemaDescriptor::parse(text)?;
        self.entries.push(PackageEntry {
            type_name: type_name.into(),
            descriptor,
        });
        Ok(self)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    pub fn descriptors(&self) -> Vec<SchemaDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Order {
        id: i64,
    }

    impl AvroRecord for Order {
        fn schema_text() -> &'static str {
            r#"{"type": "record", "name": "Order", "namespace": "shop", "fields": [{"name": "id", "type": "long"}]}"#
        }
    }

    #[test]
    fn test_record_family() {
        let desc = SchemaDescriptor::parse(
            r#"{"type": "record", "name": "User", "namespace": "com.example", "fields": [{"name": "id", "type": "long"}]}"#,
        )
        .unwrap();
        assert_eq!(desc.family(), Some(&RecordTypeFamily::new("com.example.User")));
    }

    #[test]
    fn test_enum_and_fixed_families() {
        let e = SchemaDescriptor::parse(
            r#"{"type": "enum", "name": "Color", "symbols": ["RED", "GREEN"]}"#,
        )
        .unwrap();
        assert_eq!(e.family().map(|f| f.as_str()), Some("Color"));

        let f = SchemaDescriptor::parse(r#"{"type": "fixed", "name": "Md5", "size": 16}"#).unwrap();
        assert_eq!(f.family().map(|f| f.as_str()), Some("Md5"));
    }

    #[test]
    fn test_anonymous_schema_has_no_family() {
        let desc = SchemaDescriptor::parse(r#"{"type": "array", "items": "string"}"#).unwrap();
        assert!(desc.family().is_none());
    }

    #[test]
    fn test_descriptor_equality_uses_fingerprint() {
        let a = SchemaDescriptor::parse(r#"{"type":"record","name":"A","fields":[]}"#).unwrap();
        let b = SchemaDescriptor::parse(r#"{ "type" : "record", "name" : "A", "fields" : [] }"#)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical_form(), b.canonical_form());
    }

    #[test]
    fn test_text_keeps_field_defaults() {
        let desc = SchemaDescriptor::parse(
            r#"{"type": "record", "name": "Ev", "namespace": "shop", "fields": [
                {"name": "id", "type": "long"},
                {"name": "note", "type": ["null", "string"], "default": null}
            ]}"#,
        )
        .unwrap();
        assert!(!desc.canonical_form().contains("default"));

        let reparsed = SchemaDescriptor::parse(desc.text()).unwrap();
        assert_eq!(reparsed.fingerprint(), desc.fingerprint());
        match reparsed.schema() {
            Schema::Record(record) => {
                assert_eq!(record.fields[1].default, Some(serde_json::Value::Null));
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_package_builder() {
        let package = SchemaPackage::new("shop")
            .with_record::<Order>()
            .unwrap()
            .with_schema("refund", r#"{"type":"record","name":"Refund","fields":[]}"#)
            .unwrap();

        assert_eq!(package.key(), "shop");
        assert_eq!(package.entries().len(), 2);
        assert_eq!(package.entries()[0].type_name, Order::type_name());
        assert_eq!(
            package.descriptors()[0].family().map(|f| f.as_str()),
            Some("shop.Order")
        );
    }

    #[test]
    fn test_package_rejects_invalid_schema() {
        let result = SchemaPackage::new("broken").with_schema("x", "{\"type\": \"nope\"}");
        assert!(matches!(result, Err(SchemaError::InvalidSchema(_))));
    }
}
