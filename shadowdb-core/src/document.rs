// src/document.rs
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

use crate::error::{Result, ShadowDbError};
use crate::value::{compare_documents, ObjectId, Value};

/// Name of the identifier field every stored document carries
pub const ID_FIELD: &str = "_id";

/// Insertion-ordered document with unique field names
#[derive(Debug, Clone, Default)]
pub struct Document {
    fields: IndexMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Document {
            fields: IndexMap::new(),
        }
    }

    /// Build a document from a JSON object
    pub fn from_json(json: &JsonValue) -> Result<Self> {
        match Value::from_json(json) {
            Value::Object(doc) => Ok(doc),
            other => Err(ShadowDbError::InvalidArgument(format!(
                "document must be an object, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let map: serde_json::Map<String, JsonValue> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        JsonValue::Object(map)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        self.fields.get_mut(field)
    }

    /// Insert or replace a top-level field; an existing field keeps its position
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    /// Remove a top-level field, preserving the order of the rest
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.shift_remove(field)
    }

    pub fn contains_key(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Value> {
        self.fields.iter()
    }

    pub fn iter_mut(&mut self) -> indexmap::map::IterMut<'_, String, Value> {
        self.fields.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn id(&self) -> Option<&Value> {
        self.fields.get(ID_FIELD)
    }

    /// Generate an ObjectId `_id` in first position when the document has none.
    ///
    /// Returns the document's identifier.
    pub fn ensure_id(&mut self) -> Value {
        if let Some(id) = self.fields.get(ID_FIELD) {
            return id.clone();
        }
        let id = Value::ObjectId(ObjectId::new());
        self.fields.shift_insert(0, ID_FIELD.to_string(), id.clone());
        id
    }

    /// Move `_id` to the first position if present elsewhere
    pub fn move_id_first(&mut self) {
        if let Some(idx) = self.fields.get_index_of(ID_FIELD) {
            self.fields.move_index(idx, 0);
        }
    }
}

impl PartialEq for Document {
    /// Field order is significant, as for the emulated server
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
    }
}

impl Eq for Document {}

impl Ord for Document {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_documents(self, other)
    }
}

impl PartialOrd for Document {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Document {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Value);
    type IntoIter = indexmap::map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Document::from_json(&json).map_err(serde::de::Error::custom)
    }
}

impl From<JsonValue> for Document {
    /// Non-object JSON yields an empty document
    fn from(json: JsonValue) -> Self {
        Document::from_json(&json).unwrap_or_default()
    }
}
