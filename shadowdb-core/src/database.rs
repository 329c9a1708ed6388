// src/database.rs
// The store: owns every collection of one database and exposes the
// collection-level operations by name

use indexmap::IndexMap;

use crate::aggregation::{Pipeline, PipelineContext};
use crate::collection_core::{CollectionCore, FindAndModifyOptions, InsertManyResult, UpdateResult};
use crate::document::Document;
use crate::error::{Result, ShadowDbError};
use crate::find_options::FindOptions;
use crate::index::IndexOptions;
use crate::logging::{self, LogLevel};
use crate::text::{self, TextSearchOptions, TextSearchResult};
use crate::value::Value;
use crate::{log_debug, log_info};

/// Store-wide settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseConfig {
    /// Applied to the process-wide log level when the store is created
    pub log_level: Option<LogLevel>,
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }
}

/// In-memory database
///
/// Collections are created on first write and listed in creation order.
/// Reads against a collection that does not exist behave as reads against
/// an empty one.
#[derive(Debug, Clone)]
pub struct DatabaseCore {
    name: String,
    collections: IndexMap<String, CollectionCore>,
}

impl DatabaseCore {
    // ========== CONSTRUCTOR ==========

    pub fn new(name: impl Into<String>) -> Self {
        DatabaseCore {
            name: name.into(),
            collections: IndexMap::new(),
        }
    }

    pub fn with_config(name: impl Into<String>, config: &DatabaseConfig) -> Self {
        if let Some(level) = config.log_level {
            logging::set_log_level(level);
        }
        Self::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ========== COLLECTION ACCESS ==========

    pub fn get_or_create_collection(&mut self, name: &str) -> &mut CollectionCore {
        let db_name = &self.name;
        self.collections.entry(name.to_string()).or_insert_with(|| {
            log_info!("creating collection {}.{}", db_name, name);
            CollectionCore::new(db_name, name)
        })
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionCore> {
        self.collections.get(name)
    }

    pub fn collection_mut(&mut self, name: &str) -> Option<&mut CollectionCore> {
        self.collections.get_mut(name)
    }

    /// Drop a collection with its indexes; returns whether it existed
    pub fn drop_collection(&mut self, name: &str) -> bool {
        let existed = self.collections.shift_remove(name).is_some();
        if existed {
            log_info!("dropped collection {}.{}", self.name, name);
        }
        existed
    }

    /// Replace a collection's entire contents, creating it if needed
    pub fn replace_all(&mut self, name: &str, documents: Vec<Document>) -> Result<()> {
        self.get_or_create_collection(name).replace_all(documents)
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    // ========== CRUD OPERATIONS ==========

    pub fn insert(&mut self, collection: &str, doc: Document) -> Result<Value> {
        self.get_or_create_collection(collection).insert_one(doc)
    }

    pub fn insert_many(&mut self, collection: &str, docs: Vec<Document>) -> Result<InsertManyResult> {
        self.get_or_create_collection(collection).insert_many(docs)
    }

    /// Update one (or, with `multi`, every) matching document
    pub fn update(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> Result<UpdateResult> {
        let coll = self.get_or_create_collection(collection);
        if multi {
            coll.update_many(filter, update, upsert)
        } else {
            coll.update_one(filter, update, upsert)
        }
    }

    pub fn find_one_and_update(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindAndModifyOptions,
    ) -> Result<Option<Document>> {
        self.get_or_create_collection(collection)
            .find_one_and_update(filter, update, options)
    }

    /// Remove matching documents; `just_one` stops after the first
    pub fn remove(&mut self, collection: &str, filter: &Document, just_one: bool) -> Result<usize> {
        match self.collections.get_mut(collection) {
            Some(coll) if just_one => coll.delete_one(filter),
            Some(coll) => coll.delete_many(filter),
            None => Ok(0),
        }
    }

    // ========== QUERY OPERATIONS ==========

    pub fn find(&self, collection: &str, filter: &Document, projection: Option<&Document>) -> Result<Vec<Document>> {
        let options = FindOptions {
            projection: projection.cloned(),
            ..FindOptions::default()
        };
        self.find_with_options(collection, filter, &options)
    }

    pub fn find_with_options(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<Vec<Document>> {
        match self.collections.get(collection) {
            Some(coll) => coll.find_with_options(filter, options),
            None => {
                // malformed filters fail even without a collection
                crate::query::Query::parse(filter)?;
                Ok(Vec::new())
            }
        }
    }

    pub fn count(&self, collection: &str, filter: &Document, skip: Option<usize>, limit: Option<usize>) -> Result<usize> {
        match self.collections.get(collection) {
            Some(coll) => coll.count(filter, skip, limit),
            None => {
                crate::query::Query::parse(filter)?;
                Ok(0)
            }
        }
    }

    /// Run an aggregation pipeline with `collection` as its source
    ///
    /// `$out` and `$lookup` resolve their collections against this store.
    pub fn aggregate(&mut self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Document>> {
        let source = self.documents(collection);
        log_debug!("aggregate on {}.{}", self.name, collection);
        pipeline.execute(source, self)
    }

    pub fn aggregate_json(&mut self, collection: &str, pipeline: &serde_json::Value) -> Result<Vec<Document>> {
        let pipeline = Pipeline::from_json(pipeline)?;
        self.aggregate(collection, &pipeline)
    }

    pub fn text_search(&self, collection: &str, search: &str, options: &TextSearchOptions) -> Result<TextSearchResult> {
        match self.collections.get(collection) {
            Some(coll) => coll.text_search(search, options),
            None => text::search(std::iter::empty::<&Document>(), None, search, options),
        }
    }

    // ========== INDEX OPERATIONS ==========

    pub fn create_index(&mut self, collection: &str, keys: &Document, options: IndexOptions) -> Result<String> {
        self.get_or_create_collection(collection).create_index(keys, options)
    }

    pub fn drop_index(&mut self, collection: &str, name: &str) -> Result<()> {
        let namespace = format!("{}.{}", self.name, collection);
        self.collections
            .get_mut(collection)
            .ok_or(ShadowDbError::CollectionNotFound(namespace))?
            .drop_index(name)
    }

    pub fn list_indexes(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|coll| coll.list_indexes())
            .unwrap_or_default()
    }
}

impl PipelineContext for DatabaseCore {
    fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|coll| coll.documents().cloned().collect())
            .unwrap_or_default()
    }

    fn replace_collection(&mut self, collection: &str, documents: Vec<Document>) -> Result<()> {
        log_info!(
            "$out replacing {}.{} with {} documents",
            self.name,
            collection,
            documents.len()
        );
        self.replace_all(collection, documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_json(&v).unwrap()
    }

    fn seeded() -> DatabaseCore {
        let mut db = DatabaseCore::new("test");
        db.insert_many(
            "people",
            vec![
                doc(json!({"_id": 1, "name": "ann", "age": 30})),
                doc(json!({"_id": 2, "name": "bob", "age": 25})),
                doc(json!({"_id": 3, "name": "cid", "age": 35})),
            ],
        )
        .unwrap();
        db
    }

    #[test]
    fn test_collections_created_on_first_write() {
        let mut db = DatabaseCore::new("test");
        assert!(db.list_collections().is_empty());
        db.insert("a", doc(json!({"x": 1}))).unwrap();
        db.get_or_create_collection("b");
        assert_eq!(db.list_collections(), vec!["a".to_string(), "b".to_string()]);
        assert!(db.drop_collection("a"));
        assert!(!db.drop_collection("a"));
    }

    #[test]
    fn test_reads_on_missing_collection() {
        let db = DatabaseCore::new("test");
        assert!(db.find("nope", &Document::new(), None).unwrap().is_empty());
        assert_eq!(db.count("nope", &Document::new(), None, None).unwrap(), 0);
        let err = db.find("nope", &doc(json!({"a": {"$bogus": 1}})), None).unwrap_err();
        assert_eq!(err.code(), 2);
    }

    #[test]
    fn test_find_with_projection() {
        let db = seeded();
        let found = db
            .find("people", &doc(json!({"age": {"$gt": 26}})), Some(&doc(json!({"name": 1}))))
            .unwrap();
        let json: Vec<_> = found.iter().map(Document::to_json).collect();
        assert_eq!(json, vec![json!({"_id": 1, "name": "ann"}), json!({"_id": 3, "name": "cid"})]);
    }

    #[test]
    fn test_remove() {
        let mut db = seeded();
        assert_eq!(db.remove("people", &doc(json!({"age": {"$gte": 25}})), true).unwrap(), 1);
        assert_eq!(db.remove("people", &Document::new(), false).unwrap(), 2);
        assert_eq!(db.remove("missing", &Document::new(), false).unwrap(), 0);
    }

    #[test]
    fn test_aggregate_out_replaces_target() {
        let mut db = seeded();
        db.insert("target", doc(json!({"_id": "stale"}))).unwrap();
        let out = db
            .aggregate_json(
                "people",
                &json!([{"$match": {"age": {"$lt": 35}}}, {"$project": {"name": 1}}, {"$out": "target"}]),
            )
            .unwrap();
        let stored = db.find("target", &Document::new(), None).unwrap();
        assert_eq!(out, stored);
        assert_eq!(stored.len(), 2);
        assert!(db.find("target", &doc(json!({"_id": "stale"})), None).unwrap().is_empty());
    }

    #[test]
    fn test_aggregate_out_into_source() {
        let mut db = seeded();
        db.aggregate_json("people", &json!([{"$match": {"_id": 2}}, {"$out": "people"}]))
            .unwrap();
        assert_eq!(db.count("people", &Document::new(), None, None).unwrap(), 1);
    }

    #[test]
    fn test_lookup_against_store() {
        let mut db = seeded();
        db.insert("pets", doc(json!({"_id": "p1", "owner": 2}))).unwrap();
        let out = db
            .aggregate_json(
                "people",
                &json!([
                    {"$match": {"_id": 2}},
                    {"$lookup": {"from": "pets", "localField": "_id", "foreignField": "owner", "as": "pets"}}
                ]),
            )
            .unwrap();
        assert_eq!(out[0].get("pets").unwrap().to_json(), json!([{"_id": "p1", "owner": 2}]));
    }

    #[test]
    fn test_drop_index_on_missing_collection() {
        let mut db = DatabaseCore::new("test");
        let err = db.drop_index("ghost", "a_1").unwrap_err();
        assert_eq!(err.code(), 26);
    }

    #[test]
    fn test_text_search_requires_index() {
        let db = seeded();
        let err = db.text_search("people", "ann", &TextSearchOptions::default()).unwrap_err();
        assert_eq!(err.code(), 17007);
    }
}
