// src/document.rs
use crate::error::{Result, StoreLensError};
use crate::value_utils::{canonical_json_string, get_nested_value};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Document identity, derived from the canonical form of its `_id` value.
///
/// Any JSON value can be an `_id` (the daily sales summary uses
/// `{date, category}` objects), so the key is the canonical string rather
/// than the value itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn from_value(value: &Value) -> Self {
        DocumentId(canonical_json_string(value))
    }

    /// Fresh `_id` value (UUID v4 string)
    pub fn generate() -> Value {
        Value::String(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored document: an object body whose first field is `_id`
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    body: Value,
}

impl Document {
    /// Build from a JSON object, generating `_id` when it is missing
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(StoreLensError::InvalidQuery(
                "Document must be a JSON object".to_string(),
            ));
        };

        let id_value = match fields.get("_id") {
            Some(Value::Null) | None => DocumentId::generate(),
            Some(id) => id.clone(),
        };

        let mut body = Map::with_capacity(fields.len() + 1);
        body.insert("_id".to_string(), id_value.clone());
        for (key, value) in fields {
            if key != "_id" {
                body.insert(key, value);
            }
        }

        Ok(Document {
            id: DocumentId::from_value(&id_value),
            body: Value::Object(body),
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Field lookup with dot notation
    pub fn get(&self, field: &str) -> Option<&Value> {
        get_nested_value(&self.body, field)
    }

    pub fn id_value(&self) -> &Value {
        self.body.get("_id").unwrap_or(&Value::Null)
    }

    pub fn as_value(&self) -> &Value {
        &self.body
    }

    pub fn into_value(self) -> Value {
        self.body
    }

    /// Serialized size, used for collection statistics
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.body).map(|v| v.len()).unwrap_or(0)
    }
}
