//! Collection schemas
//!
//! Collections and their secondary indexes are declared up front and applied
//! idempotently when the store is opened. Records are schema-flexible JSON
//! objects; the only structural requirement is the key field.

use serde_json::Value;

/// A named secondary index over one field of a collection.
///
/// A record missing the indexed field is absent from the index but remains
/// in the collection.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    /// Index name, e.g. "by_status"
    pub name: String,
    /// The record field the index is keyed on
    pub field: String,
}

/// Declaration of one record collection.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    /// Collection name, e.g. "packages"
    pub name: String,
    /// Field holding the record identity
    pub key_field: String,
    /// Secondary indexes over this collection
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    /// Create a collection spec with the default key field `id`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: "id".to_string(),
            indexes: Vec::new(),
        }
    }

    /// Override the key field.
    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    /// Declare a secondary index.
    pub fn with_index(mut self, name: impl Into<String>, field: impl Into<String>) -> Self {
        self.indexes.push(IndexSpec {
            name: name.into(),
            field: field.into(),
        });
        self
    }

    /// Extract the record identity, if present.
    pub fn record_id<'a>(&self, record: &'a Value) -> Option<&'a str> {
        record.get(&self.key_field).and_then(Value::as_str)
    }

    /// Look up a declared index by name.
    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// The delivery-operations schema: the collections the application caches.
pub fn delivery_schema() -> Vec<CollectionSpec> {
    vec![
        CollectionSpec::new("packages")
            .with_index("by_status", "status")
            .with_index("by_courier", "courier_id"),
        CollectionSpec::new("activities")
            .with_index("by_package", "package_id")
            .with_index("by_date", "date"),
        CollectionSpec::new("attendance")
            .with_index("by_user", "user_id")
            .with_index("by_date", "date"),
    ]
}

/// Encode an index value for use in a composite key.
///
/// The JSON text of the field is used so that encoding at write time and
/// lookup time is identical for any value type.
pub(crate) fn encode_index_value(value: &Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_extraction() {
        let spec = CollectionSpec::new("packages");
        let record = json!({"id": "PKG1", "status": "process"});
        assert_eq!(spec.record_id(&record), Some("PKG1"));

        let keyless = json!({"status": "process"});
        assert_eq!(spec.record_id(&keyless), None);
    }

    #[test]
    fn test_custom_key_field() {
        let spec = CollectionSpec::new("attendance").with_key_field("record_no");
        let record = json!({"record_no": "A-17"});
        assert_eq!(spec.record_id(&record), Some("A-17"));
    }

    #[test]
    fn test_index_lookup() {
        let spec = CollectionSpec::new("packages").with_index("by_status", "status");
        assert!(spec.index("by_status").is_some());
        assert!(spec.index("by_weight").is_none());
    }

    #[test]
    fn test_index_value_encoding_is_type_stable() {
        assert_eq!(encode_index_value(&json!("process")), b"\"process\"");
        assert_eq!(encode_index_value(&json!(42)), b"42");
        assert_ne!(encode_index_value(&json!("42")), encode_index_value(&json!(42)));
    }

    #[test]
    fn test_delivery_schema_collections() {
        let schema = delivery_schema();
        let names: Vec<&str> = schema.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["packages", "activities", "attendance"]);
    }
}
