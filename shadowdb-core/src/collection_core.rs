// src/collection_core.rs
// In-memory collection: documents keyed by _id plus their indexes
//
// FILE STRUCTURE:
// ├── Constructor and accessors
// ├── CRUD Operations
// │   ├── insert_one, insert_many
// │   ├── update_one, update_many, find_one_and_update
// │   └── delete_one, delete_many, replace_all
// ├── Query Operations
// │   ├── find, find_with_options, find_one, count, distinct
// │   └── text_search
// ├── Index Operations
// │   └── create_index, drop_index, list_indexes
// └── Private Helpers

use indexmap::IndexMap;

use crate::document::Document;
use crate::error::Result;
use crate::find_options::{apply_limit_skip, apply_sort, FindOptions};
use crate::index::{IndexManager, IndexOptions};
use crate::projection::Projection;
use crate::query::Query;
use crate::text::{self, TextSearchOptions, TextSearchResult};
use crate::update::{upsert_seed, Update};
use crate::value::Value;
use crate::{log_debug, log_info, log_trace};

/// Result of insert_many operation
#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Value>,
    pub inserted_count: usize,
}

/// Result of update_one / update_many
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched_count: usize,
    pub modified_count: usize,
    pub upserted_id: Option<Value>,
}

/// Options of `find_one_and_update`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindAndModifyOptions {
    /// Which matching document to pick when several match
    pub sort: Option<Vec<(String, i32)>>,
    /// Return the document after the update instead of before
    pub return_new: bool,
    /// Insert a document built from the filter when nothing matches
    pub upsert: bool,
    pub projection: Option<Document>,
}

impl FindAndModifyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sort(mut self, sort: Vec<(String, i32)>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn return_new(mut self, return_new: bool) -> Self {
        self.return_new = return_new;
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn with_projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }
}

/// A named collection
///
/// Documents keep insertion order; an update rewrites a document in place
/// without moving it.
#[derive(Debug, Clone)]
pub struct CollectionCore {
    name: String,
    documents: IndexMap<Value, Document>,
    indexes: IndexManager,
}

impl CollectionCore {
    // ========== CONSTRUCTOR ==========

    /// Create an empty collection in namespace `<database>.<name>`
    pub fn new(database: &str, name: impl Into<String>) -> Self {
        let name = name.into();
        CollectionCore {
            indexes: IndexManager::new(format!("{}.{}", database, name)),
            name,
            documents: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        self.indexes.namespace()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Documents in natural (insertion) order
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn get(&self, id: &Value) -> Option<&Document> {
        self.documents.get(id)
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    // ========== CRUD OPERATIONS ==========

    /// Insert one document, generating an `_id` when absent; returns the id
    pub fn insert_one(&mut self, mut doc: Document) -> Result<Value> {
        let id = doc.ensure_id();
        doc.move_id_first();
        self.indexes.insert(&doc)?;
        self.documents.insert(id.clone(), doc);
        Ok(id)
    }

    /// Insert in order, stopping at the first failure
    ///
    /// Documents inserted before the failing one stay in the collection.
    pub fn insert_many(&mut self, docs: Vec<Document>) -> Result<InsertManyResult> {
        let mut inserted_ids = Vec::with_capacity(docs.len());
        for doc in docs {
            inserted_ids.push(self.insert_one(doc)?);
        }
        Ok(InsertManyResult {
            inserted_count: inserted_ids.len(),
            inserted_ids,
        })
    }

    /// Update the first matching document
    pub fn update_one(&mut self, filter: &Document, update: &Document, upsert: bool) -> Result<UpdateResult> {
        self.update_matching(filter, update, upsert, false)
    }

    /// Update every matching document
    pub fn update_many(&mut self, filter: &Document, update: &Document, upsert: bool) -> Result<UpdateResult> {
        self.update_matching(filter, update, upsert, true)
    }

    /// Atomically pick one document, update it and return it
    ///
    /// Returns the pre-image unless `return_new` is set. A unique index
    /// violation leaves the stored document untouched.
    pub fn find_one_and_update(
        &mut self,
        filter: &Document,
        update: &Document,
        options: &FindAndModifyOptions,
    ) -> Result<Option<Document>> {
        let update = Update::parse(update)?;
        let mut matching = self.find(filter)?;
        if let Some(sort) = &options.sort {
            apply_sort(&mut matching, sort);
        }

        let (before, after) = match matching.into_iter().next() {
            Some(old) => {
                let mut new = old.clone();
                update.apply(&mut new)?;
                self.replace_document(&old, new.clone())?;
                (Some(old), new)
            }
            None if options.upsert => {
                let new = self.build_upsert(filter, &update)?;
                let id = self.insert_one(new)?;
                let stored = self.documents.get(&id).cloned().unwrap_or_default();
                (None, stored)
            }
            None => return Ok(None),
        };

        let picked = if options.return_new { Some(after) } else { before };
        match (picked, &options.projection) {
            (Some(doc), Some(spec)) => Ok(Some(Projection::parse(spec)?.apply(&doc)?)),
            (picked, _) => Ok(picked),
        }
    }

    /// Remove the first matching document; returns the number removed
    pub fn delete_one(&mut self, filter: &Document) -> Result<usize> {
        let ids = self.matching_ids(filter, Some(1))?;
        Ok(self.remove_ids(ids))
    }

    /// Remove every matching document
    pub fn delete_many(&mut self, filter: &Document) -> Result<usize> {
        let ids = self.matching_ids(filter, None)?;
        Ok(self.remove_ids(ids))
    }

    /// Replace the entire contents; on failure the old contents remain
    ///
    /// Index declarations are kept and rebuilt over the new documents.
    pub fn replace_all(&mut self, docs: Vec<Document>) -> Result<()> {
        let mut rebuilt = self.clone();
        rebuilt.documents.clear();
        rebuilt.indexes.clear();
        for doc in docs {
            rebuilt.insert_one(doc)?;
        }
        log_info!(
            "replaced contents of {} with {} documents",
            self.namespace(),
            rebuilt.len()
        );
        *self = rebuilt;
        Ok(())
    }

    /// Remove every document, keeping index declarations
    pub fn clear(&mut self) {
        self.documents.clear();
        self.indexes.clear();
    }

    // ========== QUERY OPERATIONS ==========

    /// Find documents matching a filter, in natural order
    pub fn find(&self, filter: &Document) -> Result<Vec<Document>> {
        log_debug!("find() on {} with {} filter fields", self.name, filter.len());
        let query = Query::parse(filter)?;
        self.scan(&query, None)
    }

    /// Find with sort, skip, limit and projection, applied in that order
    pub fn find_with_options(&self, filter: &Document, options: &FindOptions) -> Result<Vec<Document>> {
        let projection = options.projection.as_ref().map(Projection::parse).transpose()?;
        let mut docs = self.find(filter)?;

        if let Some(sort) = &options.sort {
            apply_sort(&mut docs, sort);
        }
        docs = apply_limit_skip(docs, options.limit, options.skip);

        match projection {
            Some(projection) => docs.iter().map(|doc| projection.apply(doc)).collect(),
            None => Ok(docs),
        }
    }

    pub fn find_one(&self, filter: &Document) -> Result<Option<Document>> {
        let query = Query::parse(filter)?;
        Ok(self.scan(&query, Some(1))?.into_iter().next())
    }

    /// Count matches after skip and limit, like a cursor's `size()`
    pub fn count(&self, filter: &Document, skip: Option<usize>, limit: Option<usize>) -> Result<usize> {
        let matches = self.find(filter)?;
        Ok(apply_limit_skip(matches, limit, skip).len())
    }

    /// Distinct values of `field` among matching documents; arrays are flattened
    pub fn distinct(&self, field: &str, filter: &Document) -> Result<Vec<Value>> {
        let mut seen: Vec<Value> = Vec::new();
        for doc in self.find(filter)? {
            for value in crate::path::resolve(&doc, field) {
                let items = match value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                for item in items {
                    if !seen.contains(&item) {
                        seen.push(item);
                    }
                }
            }
        }
        Ok(seen)
    }

    /// Ranked search over the collection's text index
    pub fn text_search(&self, search: &str, options: &TextSearchOptions) -> Result<TextSearchResult> {
        let fields = self.indexes.text_fields();
        text::search(self.documents.values(), fields.as_deref(), search, options)
    }

    // ========== INDEX OPERATIONS ==========

    /// Declare an index over a key pattern and build it over the current documents
    pub fn create_index(&mut self, keys: &Document, options: IndexOptions) -> Result<String> {
        let name = self.indexes.create_index(keys, options, self.documents.values())?;
        log_info!("index {} ready on {}", name, self.namespace());
        Ok(name)
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        self.indexes.drop_index(name)?;
        log_info!("dropped index {} on {}", name, self.namespace());
        Ok(())
    }

    /// Drop every index except `_id_`
    pub fn drop_indexes(&mut self) {
        self.indexes.drop_all();
    }

    pub fn list_indexes(&self) -> Vec<Document> {
        self.indexes.list_indexes()
    }

    // ========== PRIVATE HELPERS ==========

    /// Matching documents in natural order, narrowed by an index when one applies
    fn scan(&self, query: &Query, limit: Option<usize>) -> Result<Vec<Document>> {
        let candidates = self.indexes.candidates(query.filter());
        match &candidates {
            Some(ids) => log_trace!("{}: {} index candidates", self.name, ids.len()),
            None => log_trace!("{}: full collection scan", self.name),
        }

        let mut results = Vec::new();
        for (id, doc) in &self.documents {
            if limit.is_some_and(|n| results.len() >= n) {
                break;
            }
            if candidates.as_ref().is_some_and(|ids| !ids.contains(id)) {
                continue;
            }
            if query.matches(doc)? {
                results.push(doc.clone());
            }
        }
        Ok(results)
    }

    fn matching_ids(&self, filter: &Document, limit: Option<usize>) -> Result<Vec<Value>> {
        let query = Query::parse(filter)?;
        Ok(self
            .scan(&query, limit)?
            .iter()
            .filter_map(|doc| doc.id().cloned())
            .collect())
    }

    fn remove_ids(&mut self, ids: Vec<Value>) -> usize {
        let mut removed = 0;
        for id in ids {
            if let Some(doc) = self.documents.shift_remove(&id) {
                self.indexes.remove(&doc);
                removed += 1;
            }
        }
        removed
    }

    /// Swap a stored document for its updated version, re-indexing it
    fn replace_document(&mut self, old: &Document, new: Document) -> Result<()> {
        self.indexes.update(old, &new)?;
        if let Some(id) = new.id().cloned() {
            if let Some(slot) = self.documents.get_mut(&id) {
                *slot = new;
            }
        }
        Ok(())
    }

    fn build_upsert(&self, filter: &Document, update: &Update) -> Result<Document> {
        let mut seed = upsert_seed(filter)?;
        match update {
            Update::Replacement(replacement) => {
                let mut doc = replacement.clone();
                if let Some(id) = seed.id().filter(|_| !replacement.contains_key(crate::document::ID_FIELD)) {
                    doc.insert(crate::document::ID_FIELD, id.clone());
                }
                Ok(doc)
            }
            Update::Operators(_) => {
                update.apply(&mut seed)?;
                Ok(seed)
            }
        }
    }

    fn update_matching(&mut self, filter: &Document, update: &Document, upsert: bool, multi: bool) -> Result<UpdateResult> {
        let update = Update::parse(update)?;
        let query = Query::parse(filter)?;
        let matching = self.scan(&query, if multi { None } else { Some(1) })?;

        let mut result = UpdateResult {
            matched_count: matching.len(),
            ..UpdateResult::default()
        };

        if matching.is_empty() && upsert {
            let doc = self.build_upsert(filter, &update)?;
            result.upserted_id = Some(self.insert_one(doc)?);
            return Ok(result);
        }

        for old in matching {
            let mut new = old.clone();
            if update.apply(&mut new)? {
                self.replace_document(&old, new)?;
                result.modified_count += 1;
            }
        }
        Ok(result)
    }
}
