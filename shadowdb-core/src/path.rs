// src/path.rs
//! Dotted-path navigation through nested documents and arrays
//!
//! Resolution broadcasts over arrays: when a segment is reached while the
//! current value is an array, the remaining path is applied to every element
//! that is a sub-document. A numeric segment applied to an array indexes it
//! instead. An empty resolution means the path is *missing*; a resolution
//! containing `Null` means the path is present with an explicit null.

use crate::document::Document;
use crate::error::{codes, Result, ShadowDbError};
use crate::value::Value;

fn split(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

fn as_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Resolve a dotted path to every value it reaches
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use shadowdb_core::{path, Document, Value};
///
/// let doc = Document::from_json(&json!({"a": [{"b": 1}, {"c": 2}, {"b": 3}]})).unwrap();
/// let found = path::resolve(&doc, "a.b");
/// assert_eq!(found, vec![&Value::Int32(1), &Value::Int32(3)]);
/// assert!(path::resolve(&doc, "a.z").is_empty());
/// ```
pub fn resolve<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let segments = split(path);
    let mut out = Vec::new();
    if let Some(first) = doc.get(segments[0]) {
        resolve_segments(first, &segments[1..], &mut out);
    }
    out
}

/// Resolve a dotted path starting from an arbitrary value
pub fn resolve_value<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    resolve_segments(value, &split(path), &mut out);
    out
}

fn resolve_segments<'a>(current: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((segment, rest)) = segments.split_first() else {
        out.push(current);
        return;
    };

    match current {
        Value::Object(doc) => {
            if let Some(next) = doc.get(segment) {
                resolve_segments(next, rest, out);
            }
        }
        Value::Array(items) => {
            if let Some(idx) = as_index(segment) {
                if let Some(item) = items.get(idx) {
                    resolve_segments(item, rest, out);
                }
                return;
            }
            for item in items {
                if let Value::Object(_) = item {
                    resolve_segments(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

/// First value a path reaches, if any
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    resolve(doc, path).into_iter().next()
}

/// True when the path resolves to at least one value (possibly null)
pub fn exists(doc: &Document, path: &str) -> bool {
    !resolve(doc, path).is_empty()
}

/// Write `value` at `path`
///
/// Intermediate sub-documents are created when missing. Arrays along the
/// path are broadcast over (their sub-document elements receive the write);
/// numeric segments address existing elements only, arrays never grow.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use shadowdb_core::{path, Document, Value};
///
/// let mut doc = Document::from_json(&json!({"name": "Alice"})).unwrap();
/// path::set_path(&mut doc, "address.city", Value::from("NYC")).unwrap();
/// assert_eq!(doc.to_json(), json!({"name": "Alice", "address": {"city": "NYC"}}));
/// ```
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let segments = split(path);
    set_in_document(doc, &segments, &value, path)
}

fn set_in_document(doc: &mut Document, segments: &[&str], value: &Value, full: &str) -> Result<()> {
    let (segment, rest) = match segments.split_first() {
        Some(parts) => parts,
        None => return Ok(()),
    };
    if rest.is_empty() {
        doc.insert(*segment, value.clone());
        return Ok(());
    }
    if !doc.contains_key(segment) {
        doc.insert(*segment, Value::Object(Document::new()));
    }
    match doc.get_mut(segment) {
        Some(child) => set_in_value(child, rest, value, full),
        None => Ok(()),
    }
}

fn set_in_value(current: &mut Value, segments: &[&str], value: &Value, full: &str) -> Result<()> {
    match current {
        Value::Object(doc) => set_in_document(doc, segments, value, full),
        Value::Array(items) => {
            let (segment, rest) = match segments.split_first() {
                Some(parts) => parts,
                None => return Ok(()),
            };
            if let Some(idx) = as_index(segment) {
                if let Some(item) = items.get_mut(idx) {
                    if rest.is_empty() {
                        *item = value.clone();
                        return Ok(());
                    }
                    return set_in_value(item, rest, value, full);
                }
                return Ok(());
            }
            for item in items.iter_mut() {
                if let Value::Object(_) = item {
                    set_in_value(item, segments, value, full)?;
                }
            }
            Ok(())
        }
        other => Err(ShadowDbError::command(
            codes::PATH_NOT_VIABLE,
            format!(
                "Cannot create field '{}' in element {{ : {} }} while setting '{}'",
                segments.first().copied().unwrap_or_default(),
                other,
                full
            ),
        )),
    }
}

/// Remove the value at `path`; missing paths are a no-op
///
/// Returns true when something was removed.
pub fn unset_path(doc: &mut Document, path: &str) -> bool {
    let segments = split(path);
    unset_in_document(doc, &segments)
}

fn unset_in_document(doc: &mut Document, segments: &[&str]) -> bool {
    match segments.split_first() {
        None => false,
        Some((segment, [])) => doc.remove(segment).is_some(),
        Some((segment, rest)) => match doc.get_mut(segment) {
            Some(child) => unset_in_value(child, rest),
            None => false,
        },
    }
}

fn unset_in_value(current: &mut Value, segments: &[&str]) -> bool {
    match current {
        Value::Object(doc) => unset_in_document(doc, segments),
        Value::Array(items) => {
            let Some((segment, rest)) = segments.split_first() else {
                return false;
            };
            if let Some(idx) = as_index(segment) {
                // Unsetting an array slot leaves a null in place
                return match items.get_mut(idx) {
                    Some(item) if rest.is_empty() => {
                        *item = Value::Null;
                        true
                    }
                    Some(item) => unset_in_value(item, rest),
                    None => false,
                };
            }
            let mut removed = false;
            for item in items.iter_mut() {
                removed |= unset_in_value(item, segments);
            }
            removed
        }
        _ => false,
    }
}
