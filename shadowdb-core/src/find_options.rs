// src/find_options.rs
// Find query options: projection, sort, limit, skip

use std::cmp::Ordering;

use crate::document::Document;
use crate::error::{codes, Result, ShadowDbError};
use crate::path;
use crate::value::Value;

/// Options for find queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Projection specification, see [`crate::projection::Projection`]
    pub projection: Option<Document>,

    /// Sort: [(path, direction)], direction: 1 (asc) or -1 (desc)
    pub sort: Option<Vec<(String, i32)>>,

    /// Maximum number of documents to return; 0 means unlimited
    pub limit: Option<usize>,

    /// Number of documents to skip (for pagination)
    pub skip: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Vec<(String, i32)>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// Parse a `{path: 1 | -1}` sort document
pub fn parse_sort(spec: &Document) -> Result<Vec<(String, i32)>> {
    if spec.is_empty() {
        return Err(ShadowDbError::command(
            codes::SORT_REQUIRES_KEY,
            "$sort stage must have at least one sort key",
        ));
    }
    spec.iter()
        .map(|(field, direction)| match direction.as_i64() {
            Some(1) => Ok((field.clone(), 1)),
            Some(-1) => Ok((field.clone(), -1)),
            _ => Err(ShadowDbError::command(
                codes::SORT_KEY_INVALID,
                "$sort key ordering must be 1 (for ascending) or -1 (for descending)",
            )),
        })
        .collect()
}

/// Sort key of one document for one path
///
/// Arrays contribute their smallest element when ascending and their largest
/// when descending; a missing path sorts as null.
fn sort_key(doc: &Document, field: &str, direction: i32) -> Value {
    let mut values: Vec<&Value> = Vec::new();
    for value in path::resolve(doc, field) {
        match value {
            Value::Array(items) if !items.is_empty() => values.extend(items.iter()),
            other => values.push(other),
        }
    }
    let picked = if direction < 0 {
        values.into_iter().max()
    } else {
        values.into_iter().min()
    };
    picked.cloned().unwrap_or(Value::Null)
}

/// Apply sort to documents; stable, so ties keep their input order
/// Supports dot notation for nested fields (e.g., "address.city")
pub fn apply_sort(docs: &mut Vec<Document>, sort: &[(String, i32)]) {
    if sort.is_empty() {
        return;
    }

    let mut keyed: Vec<(Vec<Value>, Document)> = docs
        .drain(..)
        .map(|doc| {
            let keys = sort
                .iter()
                .map(|(field, direction)| sort_key(&doc, field, *direction))
                .collect();
            (keys, doc)
        })
        .collect();

    keyed.sort_by(|(a, _), (b, _)| {
        for ((key_a, key_b), (_, direction)) in a.iter().zip(b.iter()).zip(sort) {
            let cmp = key_a.cmp(key_b);
            if cmp != Ordering::Equal {
                return if *direction < 0 { cmp.reverse() } else { cmp };
            }
        }
        Ordering::Equal
    });

    docs.extend(keyed.into_iter().map(|(_, doc)| doc));
}

/// Apply limit and skip to documents; a limit of 0 means unlimited
pub fn apply_limit_skip<T>(docs: Vec<T>, limit: Option<usize>, skip: Option<usize>) -> Vec<T> {
    let skip_count = skip.unwrap_or(0);
    let iter = docs.into_iter().skip(skip_count);
    match limit {
        Some(limit_count) if limit_count > 0 => iter.take(limit_count).collect(),
        _ => iter.collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(values: Vec<serde_json::Value>) -> Vec<Document> {
        values.iter().map(|v| Document::from_json(v).unwrap()).collect()
    }

    fn names(docs: &[Document]) -> Vec<String> {
        docs.iter()
            .map(|d| d.get("name").and_then(Value::as_str).unwrap_or("").to_string())
            .collect()
    }

    #[test]
    fn test_sort_single_field() {
        let mut d = docs(vec![json!({"name": "b", "age": 30}), json!({"name": "a", "age": 25}), json!({"name": "c", "age": 35})]);
        apply_sort(&mut d, &[("age".to_string(), 1)]);
        assert_eq!(names(&d), vec!["a", "b", "c"]);
        apply_sort(&mut d, &[("age".to_string(), -1)]);
        assert_eq!(names(&d), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_sort_multi_field() {
        let mut d = docs(vec![
            json!({"age": 30, "name": "Bob"}),
            json!({"age": 25, "name": "Alice"}),
            json!({"age": 30, "name": "Carol"}),
        ]);
        apply_sort(&mut d, &[("age".to_string(), 1), ("name".to_string(), -1)]);
        assert_eq!(names(&d), vec!["Alice", "Carol", "Bob"]);
    }

    #[test]
    fn test_sort_mixed_types_and_missing() {
        let mut d = docs(vec![
            json!({"name": "str", "v": "x"}),
            json!({"name": "num", "v": 5}),
            json!({"name": "missing"}),
            json!({"name": "long", "v": {"$numberLong": "3"}}),
            json!({"name": "bool", "v": true}),
        ]);
        apply_sort(&mut d, &[("v".to_string(), 1)]);
        assert_eq!(names(&d), vec!["missing", "long", "num", "str", "bool"]);
    }

    #[test]
    fn test_sort_is_stable() {
        let mut d = docs(vec![
            json!({"name": "first", "k": 1}),
            json!({"name": "second", "k": 1}),
            json!({"name": "third", "k": 0}),
        ]);
        apply_sort(&mut d, &[("k".to_string(), 1)]);
        assert_eq!(names(&d), vec!["third", "first", "second"]);
    }

    #[test]
    fn test_sort_arrays_use_min_or_max() {
        let mut d = docs(vec![json!({"name": "a", "v": [1, 10]}), json!({"name": "b", "v": [5]})]);
        apply_sort(&mut d, &[("v".to_string(), 1)]);
        assert_eq!(names(&d), vec!["a", "b"]);
        apply_sort(&mut d, &[("v".to_string(), -1)]);
        assert_eq!(names(&d), vec!["a", "b"]);
    }

    #[test]
    fn test_sort_dot_notation() {
        let mut d = docs(vec![
            json!({"name": "Charlie", "address": {"zip": 30000}}),
            json!({"name": "Bob"}),
            json!({"name": "Alice", "address": {"zip": 10000}}),
        ]);
        apply_sort(&mut d, &[("address.zip".to_string(), 1)]);
        assert_eq!(names(&d), vec!["Bob", "Alice", "Charlie"]);
    }

    #[test]
    fn test_parse_sort() {
        let spec = Document::from_json(&json!({"a": 1, "b": -1.0})).unwrap();
        assert_eq!(parse_sort(&spec).unwrap(), vec![("a".to_string(), 1), ("b".to_string(), -1)]);

        let err = parse_sort(&Document::from_json(&json!({"a": 2})).unwrap()).unwrap_err();
        assert_eq!(err.code(), 15975);
        let err = parse_sort(&Document::new()).unwrap_err();
        assert_eq!(err.code(), 15976);
    }

    #[test]
    fn test_limit_skip() {
        let n: Vec<i32> = (1..=5).collect();
        assert_eq!(apply_limit_skip(n.clone(), Some(3), None), vec![1, 2, 3]);
        assert_eq!(apply_limit_skip(n.clone(), None, Some(2)), vec![3, 4, 5]);
        assert_eq!(apply_limit_skip(n.clone(), Some(2), Some(1)), vec![2, 3]);
        assert_eq!(apply_limit_skip(n.clone(), Some(0), Some(1)), vec![2, 3, 4, 5]);
        assert!(apply_limit_skip(n, None, Some(10)).is_empty());
    }

    #[test]
    fn test_builder() {
        let opts = FindOptions::new().with_limit(5).with_skip(23).with_sort(vec![("a".to_string(), 1)]);
        assert_eq!(opts.limit, Some(5));
        assert_eq!(opts.skip, Some(23));
        assert!(opts.projection.is_none());
    }
}
