// src/index.rs
// Secondary indexes: ordered key tuples mapped to document ids

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::document::{Document, ID_FIELD};
use crate::error::{codes, Result, ShadowDbError};
use crate::path;
use crate::query::is_operator_document;
use crate::value::Value;
use crate::{log_debug, log_trace};

/// Name of the mandatory primary-key index
pub const ID_INDEX_NAME: &str = "_id_";

/// Direction or kind of one indexed path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrder {
    Ascending,
    Descending,
    Text,
}

impl IndexOrder {
    fn parse(field: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(s) if s == "text" => Ok(IndexOrder::Text),
            v => match v.as_f64() {
                Some(n) if n > 0.0 => Ok(IndexOrder::Ascending),
                Some(n) if n < 0.0 => Ok(IndexOrder::Descending),
                _ => Err(ShadowDbError::command(
                    codes::INVALID_OPTIONS,
                    format!("Values in the index key pattern can't be 0 or non-numbers: {}: {}", field, v),
                )),
            },
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            IndexOrder::Ascending => "1",
            IndexOrder::Descending => "-1",
            IndexOrder::Text => "text",
        }
    }

    fn to_value(self) -> Value {
        match self {
            IndexOrder::Ascending => Value::Int32(1),
            IndexOrder::Descending => Value::Int32(-1),
            IndexOrder::Text => Value::from("text"),
        }
    }
}

/// Options accepted by `create_index`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub unique: bool,
    pub sparse: bool,
    /// Explicit name; derived from the key pattern when absent
    pub name: Option<String>,
}

impl IndexOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Read `unique`, `sparse` and `name` from an options document; other
    /// keys (`background`, ...) are accepted and ignored
    pub fn from_document(options: &Document) -> Result<Self> {
        let name = match options.get("name") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(ShadowDbError::InvalidArgument(format!(
                    "index name must be a string, got {}",
                    other
                )))
            }
        };
        Ok(IndexOptions {
            unique: options.get("unique").map(Value::is_truthy).unwrap_or(false),
            sparse: options.get("sparse").map(Value::is_truthy).unwrap_or(false),
            name,
        })
    }
}

/// Declared shape of an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub keys: Vec<(String, IndexOrder)>,
    pub unique: bool,
    pub sparse: bool,
}

impl IndexDefinition {
    /// Derive the default name: `field_dir` pairs joined by `_`
    pub fn default_name(keys: &[(String, IndexOrder)]) -> String {
        keys.iter()
            .map(|(field, order)| format!("{}_{}", field, order.suffix()))
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn is_text(&self) -> bool {
        self.keys.iter().any(|(_, order)| *order == IndexOrder::Text)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(field, _)| field.as_str())
    }

    /// Render as the document returned by `listIndexes`
    pub fn to_document(&self, namespace: &str) -> Document {
        let mut doc = Document::new();
        doc.insert("v", 1);
        let key: Document = self
            .keys
            .iter()
            .map(|(field, order)| (field.clone(), order.to_value()))
            .collect();
        doc.insert("key", key);
        doc.insert("name", self.name.as_str());
        doc.insert("ns", namespace);
        if self.unique && self.name != ID_INDEX_NAME {
            doc.insert("unique", true);
        }
        if self.sparse {
            doc.insert("sparse", true);
        }
        doc
    }

    fn same_options(&self, other: &IndexDefinition) -> bool {
        self.unique == other.unique && self.sparse == other.sparse
    }
}

/// Parse a key pattern such as `{a: 1, b: -1}`
pub fn parse_key_pattern(pattern: &Document) -> Result<Vec<(String, IndexOrder)>> {
    if pattern.is_empty() {
        return Err(ShadowDbError::command(
            codes::BAD_VALUE,
            "Index keys cannot be empty",
        ));
    }
    pattern
        .iter()
        .map(|(field, value)| Ok((field.clone(), IndexOrder::parse(field, value)?)))
        .collect()
}

/// One materialized index
#[derive(Debug, Clone)]
pub struct Index {
    definition: IndexDefinition,
    entries: BTreeMap<Vec<Value>, BTreeSet<Value>>,
    multikey: bool,
}

impl Index {
    pub fn new(definition: IndexDefinition) -> Self {
        Index {
            definition,
            entries: BTreeMap::new(),
            multikey: false,
        }
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// True once any document produced more than one key tuple
    pub fn is_multikey(&self) -> bool {
        self.multikey
    }

    /// Number of distinct key tuples
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids stored under an exact key tuple
    pub fn lookup(&self, key: &[Value]) -> Option<&BTreeSet<Value>> {
        self.entries.get(key)
    }

    /// Key tuples a document produces
    ///
    /// Arrays along an indexed path fan out into one key per element; an
    /// empty array contributes no key at all. A wholly missing path indexes
    /// as null, except on sparse indexes where the document is skipped.
    pub fn extract_keys(&self, doc: &Document) -> Result<Vec<Vec<Value>>> {
        if self.definition.is_text() {
            return Ok(Vec::new());
        }

        let mut per_field: Vec<Vec<Value>> = Vec::with_capacity(self.definition.keys.len());
        let mut array_fields: Vec<&str> = Vec::new();
        let mut all_missing = true;

        for field in self.definition.fields() {
            let resolved = path::resolve(doc, field);
            if resolved.is_empty() {
                per_field.push(vec![Value::Null]);
                continue;
            }
            all_missing = false;

            let mut values = Vec::new();
            let mut fanned_out = resolved.len() > 1;
            for value in resolved {
                match value {
                    Value::Array(items) => {
                        fanned_out = true;
                        values.extend(items.iter().cloned());
                    }
                    other => values.push(other.clone()),
                }
            }
            if fanned_out {
                array_fields.push(field);
            }
            values.sort();
            values.dedup();
            per_field.push(values);
        }

        if self.definition.sparse && all_missing {
            return Ok(Vec::new());
        }
        if array_fields.len() > 1 {
            return Err(ShadowDbError::command(
                codes::CANNOT_INDEX_PARALLEL_ARRAYS,
                format!(
                    "cannot index parallel arrays [{}] [{}]",
                    array_fields[0], array_fields[1]
                ),
            ));
        }

        let mut keys: Vec<Vec<Value>> = vec![Vec::new()];
        for values in per_field {
            let mut next = Vec::with_capacity(keys.len() * values.len());
            for prefix in &keys {
                for value in &values {
                    let mut key = prefix.clone();
                    key.push(value.clone());
                    next.push(key);
                }
            }
            keys = next;
        }
        Ok(keys)
    }

    fn check_unique(&self, namespace: &str, id: &Value, keys: &[Vec<Value>]) -> Result<()> {
        if !self.definition.unique {
            return Ok(());
        }
        for key in keys {
            if let Some(ids) = self.entries.get(key) {
                if ids.iter().any(|existing| existing != id) {
                    return Err(duplicate_key(namespace, &self.definition.name, key));
                }
            }
        }
        Ok(())
    }

    fn add(&mut self, id: &Value, keys: Vec<Vec<Value>>) {
        if keys.len() > 1 {
            self.multikey = true;
        }
        for key in keys {
            self.entries.entry(key).or_default().insert(id.clone());
        }
    }

    fn remove_keys(&mut self, id: &Value, keys: &[Vec<Value>]) {
        for key in keys {
            if let Some(ids) = self.entries.get_mut(key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.entries.remove(key);
                }
            }
        }
    }

    /// Ids whose leading key component lies within the bounds
    fn scan(&self, lower: &Bound<Value>, upper: &Bound<Value>) -> BTreeSet<Value> {
        let start = match lower {
            Bound::Included(v) | Bound::Excluded(v) => Bound::Included(vec![v.clone()]),
            Bound::Unbounded => Bound::Unbounded,
        };
        let mut out = BTreeSet::new();
        for (key, ids) in self.entries.range((start, Bound::Unbounded)) {
            let Some(lead) = key.first() else { continue };
            if let Bound::Excluded(v) = lower {
                if lead == v {
                    continue;
                }
            }
            let past_upper = match upper {
                Bound::Included(v) => lead > v,
                Bound::Excluded(v) => lead >= v,
                Bound::Unbounded => false,
            };
            if past_upper {
                break;
            }
            out.extend(ids.iter().cloned());
        }
        out
    }
}

fn duplicate_key(namespace: &str, index: &str, key: &[Value]) -> ShadowDbError {
    let rendered = key
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", : ");
    ShadowDbError::DuplicateKey {
        index: format!("{}.${}", namespace, index),
        key: rendered,
    }
}

/// Index Manager - manages all indexes for a collection
#[derive(Debug, Clone)]
pub struct IndexManager {
    namespace: String,
    indexes: Vec<Index>,
}

impl IndexManager {
    /// Create a manager holding only the `_id_` index
    pub fn new(namespace: impl Into<String>) -> Self {
        let id_index = Index::new(IndexDefinition {
            name: ID_INDEX_NAME.to_string(),
            keys: vec![(ID_FIELD.to_string(), IndexOrder::Ascending)],
            unique: true,
            sparse: false,
        });
        IndexManager {
            namespace: namespace.into(),
            indexes: vec![id_index],
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|idx| idx.name() == name)
    }

    /// Index definitions in creation order, `_id_` first
    pub fn definitions(&self) -> impl Iterator<Item = &IndexDefinition> {
        self.indexes.iter().map(Index::definition)
    }

    /// `listIndexes` documents
    pub fn list_indexes(&self) -> Vec<Document> {
        self.definitions()
            .map(|def| def.to_document(&self.namespace))
            .collect()
    }

    /// Paths covered by the text index, if one exists
    pub fn text_fields(&self) -> Option<Vec<String>> {
        self.definitions()
            .find(|def| def.is_text())
            .map(|def| def.fields().map(str::to_string).collect())
    }

    /// Declare an index and build it over `existing` documents
    ///
    /// Returns the index name. Redeclaring an identical index is a no-op.
    pub fn create_index<'a, I>(&mut self, pattern: &Document, options: IndexOptions, existing: I) -> Result<String>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let keys = parse_key_pattern(pattern)?;
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| IndexDefinition::default_name(&keys));
        let definition = IndexDefinition {
            name,
            keys,
            unique: options.unique,
            sparse: options.sparse,
        };

        if definition.keys == [(ID_FIELD.to_string(), IndexOrder::Ascending)] {
            return Ok(ID_INDEX_NAME.to_string());
        }
        if let Some(existing_name) = self.check_conflicts(&definition)? {
            return Ok(existing_name);
        }

        let mut index = Index::new(definition);
        for doc in existing {
            let id = doc.id().cloned().unwrap_or(Value::Null);
            let keys = index.extract_keys(doc)?;
            index.check_unique(&self.namespace, &id, &keys)?;
            index.add(&id, keys);
        }

        let name = index.name().to_string();
        log_debug!("created index {} on {}", name, self.namespace);
        self.indexes.push(index);
        Ok(name)
    }

    /// `Some(name)` when an identical index already exists
    fn check_conflicts(&self, definition: &IndexDefinition) -> Result<Option<String>> {
        for existing in self.definitions() {
            let same_keys = existing.keys == definition.keys;
            let same_name = existing.name == definition.name;
            match (same_keys, same_name) {
                (true, true) if existing.same_options(definition) => {
                    return Ok(Some(existing.name.clone()))
                }
                (true, true) => {
                    return Err(ShadowDbError::IndexConflict(format!(
                        "Index with name: {} already exists with different options",
                        existing.name
                    )))
                }
                (true, false) => {
                    return Err(ShadowDbError::IndexConflict(format!(
                        "Index with name: {} already exists with a different name: {}",
                        definition.name, existing.name
                    )))
                }
                (false, true) => {
                    return Err(ShadowDbError::IndexConflict(format!(
                        "Index with name: {} already exists with a different key pattern",
                        existing.name
                    )))
                }
                (false, false) if existing.is_text() && definition.is_text() => {
                    return Err(ShadowDbError::IndexConflict(format!(
                        "only one text index per collection allowed, found existing text index {}",
                        existing.name
                    )))
                }
                (false, false) => {}
            }
        }
        Ok(None)
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        if name == ID_INDEX_NAME {
            return Err(ShadowDbError::command(
                codes::INVALID_OPTIONS,
                "cannot drop _id index",
            ));
        }
        let before = self.indexes.len();
        self.indexes.retain(|idx| idx.name() != name);
        if self.indexes.len() == before {
            return Err(ShadowDbError::command(
                codes::INDEX_NOT_FOUND,
                format!("index not found with name [{}]", name),
            ));
        }
        Ok(())
    }

    /// Drop every index except `_id_`
    pub fn drop_all(&mut self) {
        self.indexes.retain(|idx| idx.name() == ID_INDEX_NAME);
    }

    /// Remove every entry while keeping the declarations
    pub fn clear(&mut self) {
        for index in &mut self.indexes {
            index.entries.clear();
            index.multikey = false;
        }
    }

    /// Register a document in every index
    ///
    /// Keys are computed and checked against every unique index before any
    /// index is modified, so a failure leaves all indexes untouched.
    pub fn insert(&mut self, doc: &Document) -> Result<()> {
        let id = doc.id().cloned().unwrap_or(Value::Null);
        let mut pending = Vec::with_capacity(self.indexes.len());
        for index in &self.indexes {
            let keys = index.extract_keys(doc)?;
            index.check_unique(&self.namespace, &id, &keys)?;
            pending.push(keys);
        }
        for (index, keys) in self.indexes.iter_mut().zip(pending) {
            index.add(&id, keys);
        }
        log_trace!("indexed document {} in {}", id, self.namespace);
        Ok(())
    }

    /// Reverse the bookkeeping of [`IndexManager::insert`]
    pub fn remove(&mut self, doc: &Document) {
        let id = doc.id().cloned().unwrap_or(Value::Null);
        for index in &mut self.indexes {
            // A stored document always produced valid keys
            if let Ok(keys) = index.extract_keys(doc) {
                index.remove_keys(&id, &keys);
            }
        }
    }

    /// Replace `old` by `new`; on failure the old entries are restored
    pub fn update(&mut self, old: &Document, new: &Document) -> Result<()> {
        self.remove(old);
        if let Err(err) = self.insert(new) {
            self.insert(old)?;
            return Err(err);
        }
        Ok(())
    }

    /// Candidate ids for a filter, from the first index whose leading path
    /// carries a usable predicate
    ///
    /// The result is a superset of the matching ids; callers still run the
    /// matcher on every candidate. `None` means no index applies.
    pub fn candidates(&self, filter: &Document) -> Option<BTreeSet<Value>> {
        for index in &self.indexes {
            let def = index.definition();
            if def.is_text() || def.sparse {
                continue;
            }
            let Some(lead) = def.fields().next() else { continue };
            let Some(condition) = filter.get(lead) else { continue };
            if let Some(ids) = scan_condition(index, condition) {
                log_trace!("index {} yields {} candidates", def.name, ids.len());
                return Some(ids);
            }
        }
        None
    }
}

/// Literals usable as exact index probes
///
/// Null also matches missing fields and arrays match as whole values, and
/// neither is stored as such in the key set.
fn probe_literal(value: &Value) -> Option<&Value> {
    match value {
        Value::Null | Value::Array(_) => None,
        other if is_operator_document(other) => None,
        other => Some(other),
    }
}

fn scan_condition(index: &Index, condition: &Value) -> Option<BTreeSet<Value>> {
    if let Some(literal) = probe_literal(condition) {
        return Some(index.scan(
            &Bound::Included(literal.clone()),
            &Bound::Included(literal.clone()),
        ));
    }

    let ops = condition.as_document().filter(|_| is_operator_document(condition))?;
    let mut lower = Bound::Unbounded;
    let mut upper = Bound::Unbounded;
    let mut usable = false;

    for (op, operand) in ops {
        // each bound may be met by a different element of a multikey array
        if usable && index.is_multikey() {
            break;
        }
        match op.as_str() {
            "$eq" => {
                let literal = probe_literal(operand)?;
                lower = Bound::Included(literal.clone());
                upper = Bound::Included(literal.clone());
                usable = true;
            }
            "$in" => {
                let mut out = BTreeSet::new();
                for choice in operand.as_array()? {
                    let literal = probe_literal(choice)?;
                    out.extend(index.scan(
                        &Bound::Included(literal.clone()),
                        &Bound::Included(literal.clone()),
                    ));
                }
                return Some(out);
            }
            "$gt" | "$gte" if !operand.is_array() => {
                lower = if op == "$gt" {
                    Bound::Excluded(operand.clone())
                } else {
                    Bound::Included(operand.clone())
                };
                usable = true;
            }
            "$lt" | "$lte" if !operand.is_array() => {
                upper = if op == "$lt" {
                    Bound::Excluded(operand.clone())
                } else {
                    Bound::Included(operand.clone())
                };
                usable = true;
            }
            _ => {}
        }
    }

    if usable {
        Some(index.scan(&lower, &upper))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_json(&v).unwrap()
    }

    fn ids(set: BTreeSet<Value>) -> Vec<serde_json::Value> {
        set.into_iter().map(|v| v.to_json()).collect()
    }

    fn manager_with(pattern: serde_json::Value, options: IndexOptions) -> IndexManager {
        let mut mgr = IndexManager::new("test.coll");
        mgr.create_index(&doc(pattern), options, std::iter::empty()).unwrap();
        mgr
    }

    // ========== Declaration ==========

    #[test]
    fn test_default_names() {
        let mut mgr = IndexManager::new("db.c");
        assert_eq!(mgr.create_index(&doc(json!({"a": 1})), IndexOptions::new(), []).unwrap(), "a_1");
        assert_eq!(
            mgr.create_index(&doc(json!({"a": 1, "b": -1})), IndexOptions::new(), []).unwrap(),
            "a_1_b_-1"
        );
        assert_eq!(mgr.create_index(&doc(json!({"f": "text"})), IndexOptions::new(), []).unwrap(), "f_text");
        let names: Vec<String> = mgr.definitions().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["_id_", "a_1", "a_1_b_-1", "f_text"]);
        assert_eq!(mgr.text_fields(), Some(vec!["f".to_string()]));
    }

    #[test]
    fn test_redeclare_identical_is_noop() {
        let mut mgr = manager_with(json!({"a": 1}), IndexOptions::new().unique(true));
        let name = mgr
            .create_index(&doc(json!({"a": 1})), IndexOptions::new().unique(true), [])
            .unwrap();
        assert_eq!(name, "a_1");
        assert_eq!(mgr.definitions().count(), 2);
        assert_eq!(mgr.create_index(&doc(json!({"_id": 1})), IndexOptions::new(), []).unwrap(), "_id_");
    }

    #[test]
    fn test_redeclare_conflicts() {
        let mut mgr = manager_with(json!({"a": 1}), IndexOptions::new());
        let err = mgr
            .create_index(&doc(json!({"a": 1})), IndexOptions::new().unique(true), [])
            .unwrap_err();
        assert_eq!(err.code(), 85);

        let err = mgr
            .create_index(&doc(json!({"b": 1})), IndexOptions::new().name("a_1"), [])
            .unwrap_err();
        assert!(err.to_string().contains("different key pattern"));

        mgr.create_index(&doc(json!({"t": "text"})), IndexOptions::new(), []).unwrap();
        let err = mgr
            .create_index(&doc(json!({"u": "text"})), IndexOptions::new(), [])
            .unwrap_err();
        assert!(err.to_string().contains("only one text index"));
    }

    #[test]
    fn test_invalid_key_pattern() {
        let mut mgr = IndexManager::new("db.c");
        assert!(mgr.create_index(&doc(json!({"a": 0})), IndexOptions::new(), []).is_err());
        assert!(mgr.create_index(&doc(json!({})), IndexOptions::new(), []).is_err());
    }

    #[test]
    fn test_drop_index() {
        let mut mgr = manager_with(json!({"a": 1}), IndexOptions::new());
        assert_eq!(mgr.drop_index("_id_").unwrap_err().code(), 72);
        assert_eq!(mgr.drop_index("nope").unwrap_err().code(), 27);
        mgr.drop_index("a_1").unwrap();
        assert_eq!(mgr.list_indexes().len(), 1);
    }

    #[test]
    fn test_options_from_document() {
        let opts = IndexOptions::from_document(&doc(json!({"unique": true, "sparse": 1, "name": "x", "background": true}))).unwrap();
        assert_eq!(opts, IndexOptions::new().unique(true).sparse(true).name("x"));
        assert!(IndexOptions::from_document(&doc(json!({"name": 3}))).is_err());
    }

    #[test]
    fn test_list_indexes_document() {
        let mgr = manager_with(json!({"a": 1}), IndexOptions::new().unique(true));
        let listed: Vec<serde_json::Value> = mgr.list_indexes().iter().map(Document::to_json).collect();
        assert_eq!(
            listed,
            vec![
                json!({"v": 1, "key": {"_id": 1}, "name": "_id_", "ns": "test.coll"}),
                json!({"v": 1, "key": {"a": 1}, "name": "a_1", "ns": "test.coll", "unique": true}),
            ]
        );
    }

    // ========== Keys ==========

    #[test]
    fn test_extract_keys_multikey_and_missing() {
        let index = Index::new(IndexDefinition {
            name: "a_1".into(),
            keys: vec![("a".into(), IndexOrder::Ascending)],
            unique: false,
            sparse: false,
        });
        assert_eq!(index.extract_keys(&doc(json!({"a": [1, 2, 2]}))).unwrap().len(), 2);
        assert_eq!(index.extract_keys(&doc(json!({"b": 1}))).unwrap(), vec![vec![Value::Null]]);
        assert!(index.extract_keys(&doc(json!({"a": []}))).unwrap().is_empty());
    }

    #[test]
    fn test_parallel_arrays_rejected() {
        let mut mgr = manager_with(json!({"a": 1, "b": 1}), IndexOptions::new());
        mgr.insert(&doc(json!({"_id": 1, "a": [1], "b": 2}))).unwrap();
        let err = mgr.insert(&doc(json!({"_id": 2, "a": [1], "b": [2]}))).unwrap_err();
        assert_eq!(err.code(), 171);
    }

    // ========== Uniqueness ==========

    #[test]
    fn test_unique_violation_message() {
        let mut mgr = manager_with(json!({"a": 1}), IndexOptions::new().unique(true));
        mgr.insert(&doc(json!({"_id": 1, "a": 1}))).unwrap();
        let err = mgr.insert(&doc(json!({"_id": 2, "a": 1}))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "E11000 duplicate key error index: test.coll.$a_1 dup key: { : 1 }"
        );
        // Nothing was added for the failed document
        assert!(mgr.get("_id_").unwrap().lookup(&[Value::Int32(2)]).is_none());
    }

    #[test]
    fn test_unique_missing_fields_collide_unless_sparse() {
        let mut mgr = manager_with(json!({"a": 1}), IndexOptions::new().unique(true));
        mgr.insert(&doc(json!({"_id": 1}))).unwrap();
        assert!(mgr.insert(&doc(json!({"_id": 2}))).is_err());

        let mut sparse = manager_with(json!({"a": 1}), IndexOptions::new().unique(true).sparse(true));
        sparse.insert(&doc(json!({"_id": 1}))).unwrap();
        sparse.insert(&doc(json!({"_id": 2}))).unwrap();
    }

    #[test]
    fn test_unique_sparse_sublist() {
        let mut mgr = manager_with(
            json!({"sparseUnique.sublist": 1}),
            IndexOptions::new().unique(true).sparse(true),
        );
        mgr.insert(&doc(json!({"_id": "_id1", "sparseUnique": [{"sublist": "42"}]}))).unwrap();
        mgr.insert(&doc(json!({"_id": "_id2", "sparseUnique": []}))).unwrap();
        mgr.insert(&doc(json!({"_id": "_id3", "sparseUnique": []}))).unwrap();
        let err = mgr
            .insert(&doc(json!({"_id": "_id4", "sparseUnique": [{"sublist": "42"}]})))
            .unwrap_err();
        assert!(matches!(err, ShadowDbError::DuplicateKey { .. }));
    }

    #[test]
    fn test_update_restores_on_failure() {
        let mut mgr = manager_with(json!({"a": 1}), IndexOptions::new().unique(true));
        let one = doc(json!({"_id": 1, "a": 1}));
        let two = doc(json!({"_id": 2, "a": 2}));
        mgr.insert(&one).unwrap();
        mgr.insert(&two).unwrap();
        assert!(mgr.update(&two, &doc(json!({"_id": 2, "a": 1}))).is_err());
        let a_index = mgr.get("a_1").unwrap();
        assert!(a_index.lookup(&[Value::Int32(2)]).is_some());

        mgr.update(&two, &doc(json!({"_id": 2, "a": 3}))).unwrap();
        let a_index = mgr.get("a_1").unwrap();
        assert!(a_index.lookup(&[Value::Int32(2)]).is_none());
        assert!(a_index.lookup(&[Value::Int32(3)]).is_some());
    }

    #[test]
    fn test_create_over_violating_data_leaves_no_index() {
        let mut mgr = IndexManager::new("db.c");
        let existing = vec![doc(json!({"_id": 1, "a": 1})), doc(json!({"_id": 2, "a": 1}))];
        let err = mgr
            .create_index(&doc(json!({"a": 1})), IndexOptions::new().unique(true), &existing)
            .unwrap_err();
        assert_eq!(err.code(), 11000);
        assert!(mgr.get("a_1").is_none());
    }

    // ========== Candidates ==========

    #[test]
    fn test_candidates() {
        let mut mgr = manager_with(json!({"n": 1}), IndexOptions::new());
        for i in 0..6 {
            mgr.insert(&doc(json!({"_id": i, "n": i % 3}))).unwrap();
        }
        let filter = |f: serde_json::Value| mgr.candidates(&doc(f)).map(ids);

        assert_eq!(filter(json!({"n": 1})), Some(vec![json!(1), json!(4)]));
        assert_eq!(filter(json!({"n": {"$in": [0, 2]}})), Some(vec![json!(0), json!(2), json!(3), json!(5)]));
        assert_eq!(filter(json!({"n": {"$gt": 0, "$lte": 1}})), Some(vec![json!(1), json!(4)]));
        assert_eq!(filter(json!({"_id": {"$gte": 4}})), Some(vec![json!(4), json!(5)]));
        assert_eq!(filter(json!({"n": null})), None);
        assert_eq!(filter(json!({"n": {"$ne": 1}})), None);
        assert_eq!(filter(json!({"other": 1})), None);
    }

    #[test]
    fn test_multikey_candidates_use_single_bound() {
        let mut mgr = manager_with(json!({"a": 1}), IndexOptions::new());
        mgr.insert(&doc(json!({"_id": 1, "a": [0, 5]}))).unwrap();
        mgr.insert(&doc(json!({"_id": 2, "a": 9}))).unwrap();
        let filter = |f: serde_json::Value| mgr.candidates(&doc(f)).map(ids);

        // 5 satisfies $gt and 0 satisfies $lt
        assert_eq!(filter(json!({"a": {"$gt": 1, "$lt": 3}})), Some(vec![json!(1), json!(2)]));
        assert_eq!(filter(json!({"a": {"$lt": 3, "$gt": 1}})), Some(vec![json!(1)]));
        assert_eq!(filter(json!({"a": {"$eq": 0, "$gt": 4}})), Some(vec![json!(1)]));
    }
}
