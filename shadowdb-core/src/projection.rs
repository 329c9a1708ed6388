// src/projection.rs
//! Projection engine
//!
//! A projection specification is parsed once into a path tree and then
//! applied to every result document. Inclusion and exclusion cannot be mixed,
//! except that `_id` may always be excluded.

use indexmap::IndexMap;

use crate::document::{Document, ID_FIELD};
use crate::error::{Result, ShadowDbError};
use crate::query::operators::element_matches;
use crate::value::Value;

/// `$slice` arguments: first/last `n`, or `[skip, limit]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SliceSpec {
    Count(i64),
    Range { skip: i64, limit: usize },
}

impl SliceSpec {
    fn parse(path: &str, operand: &Value) -> Result<Self> {
        if let Some(n) = operand.as_i64() {
            return Ok(SliceSpec::Count(n));
        }
        match operand.as_array().map(Vec::as_slice) {
            Some([skip, limit]) => match (skip.as_i64(), limit.as_i64()) {
                (Some(skip), Some(limit)) if limit > 0 => Ok(SliceSpec::Range {
                    skip,
                    limit: limit as usize,
                }),
                _ => Err(ShadowDbError::InvalidProjection(format!(
                    "$slice limit must be positive for field {}",
                    path
                ))),
            },
            _ => Err(ShadowDbError::InvalidProjection(format!(
                "$slice only supports numbers and [skip, limit] arrays, field {}",
                path
            ))),
        }
    }

    /// Slice an array; other values pass through untouched
    pub fn apply(&self, value: &Value) -> Value {
        let Value::Array(items) = value else {
            return value.clone();
        };
        let len = items.len() as i64;
        let (start, count) = match *self {
            SliceSpec::Count(n) if n >= 0 => (0, n),
            SliceSpec::Count(n) => (len.saturating_add(n).max(0), n.saturating_neg()),
            SliceSpec::Range { skip, limit } => {
                let start = if skip < 0 { len.saturating_add(skip).max(0) } else { skip.min(len) };
                (start, i64::try_from(limit).unwrap_or(i64::MAX))
            }
        };
        let end = start.saturating_add(count).min(len);
        Value::Array(items[start as usize..end as usize].to_vec())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Include,
    Exclude,
    ElemMatch(Document),
    Slice(SliceSpec),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf(Action),
    Branch(IndexMap<String, Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Inclusion,
    Exclusion,
}

/// A parsed projection specification
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use shadowdb_core::projection::Projection;
/// use shadowdb_core::Document;
///
/// let spec = Document::from_json(&json!({"a.b.c": 1, "a.b.d": 1})).unwrap();
/// let projection = Projection::parse(&spec).unwrap();
///
/// let doc = Document::from_json(&json!({"_id": 1, "foo": 2, "a": {"b": {"c": 50, "d": 10, "bar": 0}}})).unwrap();
/// let out = projection.apply(&doc).unwrap();
/// assert_eq!(out.to_json(), json!({"_id": 1, "a": {"b": {"c": 50, "d": 10}}}));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    mode: Mode,
    fields: IndexMap<String, Node>,
    /// Explicit `_id` flag; `None` means the default (kept)
    id: Option<bool>,
}

/// Interpret a numeric/boolean projection value
fn flag(path: &str, value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        // `_id: -1` is honoured as an exclusion
        v if v.is_number() && path == ID_FIELD && v.as_f64() == Some(-1.0) => Some(false),
        v if v.is_number() => Some(v.is_truthy()),
        _ => None,
    }
}

fn parse_action(path: &str, value: &Value) -> Result<Action> {
    if let Some(include) = flag(path, value) {
        return Ok(if include { Action::Include } else { Action::Exclude });
    }

    let unsupported = || {
        ShadowDbError::InvalidProjection(format!(
            "unsupported projection value for field {}: {}",
            path, value
        ))
    };
    let op = value.as_document().filter(|d| d.len() == 1).ok_or_else(unsupported)?;
    match op.iter().next() {
        Some((name, operand)) if name == "$elemMatch" => {
            if path.contains('.') {
                return Err(ShadowDbError::InvalidProjection(format!(
                    "cannot use $elemMatch projection on a nested field: {}",
                    path
                )));
            }
            operand
                .as_document()
                .map(|filter| Action::ElemMatch(filter.clone()))
                .ok_or_else(|| {
                    ShadowDbError::InvalidProjection("elemMatch: Invalid argument, object required".to_string())
                })
        }
        Some((name, operand)) if name == "$slice" => Ok(Action::Slice(SliceSpec::parse(path, operand)?)),
        _ => Err(unsupported()),
    }
}

fn insert_path(fields: &mut IndexMap<String, Node>, full: &str, segments: &[&str], action: Action) -> Result<()> {
    let collision = || ShadowDbError::InvalidProjection(format!("Path collision at {}", full));
    let Some((head, rest)) = segments.split_first() else {
        return Ok(());
    };
    if rest.is_empty() {
        if fields.contains_key(*head) {
            return Err(collision());
        }
        fields.insert(head.to_string(), Node::Leaf(action));
        return Ok(());
    }
    let node = fields
        .entry(head.to_string())
        .or_insert_with(|| Node::Branch(IndexMap::new()));
    match node {
        Node::Branch(children) => insert_path(children, full, rest, action),
        Node::Leaf(_) => Err(collision()),
    }
}

impl Projection {
    /// Parse and validate a projection specification
    pub fn parse(spec: &Document) -> Result<Self> {
        let mut id = None;
        let mut actions = Vec::with_capacity(spec.len());
        for (path, value) in spec {
            if path == ID_FIELD {
                if let Some(include) = flag(path, value) {
                    id = Some(include);
                    continue;
                }
            }
            actions.push((path.as_str(), parse_action(path, value)?));
        }

        let included = actions
            .iter()
            .find(|(_, a)| matches!(a, Action::Include | Action::ElemMatch(_)))
            .map(|(p, _)| *p);
        let excluded = actions
            .iter()
            .find(|(_, a)| matches!(a, Action::Exclude))
            .map(|(p, _)| *p);
        if let (Some(inc), Some(exc)) = (included, excluded) {
            return Err(ShadowDbError::InvalidProjection(format!(
                "Cannot do exclusion on field {} in inclusion projection (includes {})",
                exc, inc
            )));
        }

        let mode = if included.is_some() {
            Mode::Inclusion
        } else {
            Mode::Exclusion
        };
        let mut fields = IndexMap::new();
        for (path, action) in actions {
            let segments: Vec<&str> = path.split('.').collect();
            insert_path(&mut fields, path, &segments, action)?;
        }
        Ok(Projection { mode, fields, id })
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        Self::parse(&Document::from_json(json)?)
    }

    /// True when the projection keeps documents unchanged
    pub fn is_identity(&self) -> bool {
        self.fields.is_empty() && self.id != Some(false)
    }

    /// Project a document
    pub fn apply(&self, doc: &Document) -> Result<Document> {
        let keep_id = self.id != Some(false);
        let mut out = match self.mode {
            Mode::Inclusion => include_document(doc, &self.fields)?,
            Mode::Exclusion => exclude_document(doc, &self.fields),
        };
        match (self.mode, keep_id) {
            (Mode::Inclusion, true) => {
                if let Some(id) = doc.id() {
                    if !out.contains_key(ID_FIELD) {
                        out.insert(ID_FIELD, id.clone());
                        out.move_id_first();
                    }
                }
            }
            (_, false) => {
                out.remove(ID_FIELD);
            }
            _ => {}
        }
        Ok(out)
    }
}

/// Convenience wrapper: parse `spec` and apply it to `doc`
pub fn project(doc: &Document, spec: &Document) -> Result<Document> {
    Projection::parse(spec)?.apply(doc)
}

fn first_element_match(value: &Value, filter: &Document) -> Result<Option<Value>> {
    let Value::Array(items) = value else {
        return Ok(None);
    };
    for item in items {
        if element_matches(item, filter)? {
            return Ok(Some(Value::Array(vec![item.clone()])));
        }
    }
    Ok(None)
}

fn include_document(doc: &Document, fields: &IndexMap<String, Node>) -> Result<Document> {
    let mut out = Document::new();
    for (key, value) in doc {
        let Some(node) = fields.get(key) else { continue };
        match node {
            Node::Leaf(Action::Include) => {
                out.insert(key.clone(), value.clone());
            }
            Node::Leaf(Action::ElemMatch(filter)) => {
                if let Some(first) = first_element_match(value, filter)? {
                    out.insert(key.clone(), first);
                }
            }
            Node::Leaf(Action::Slice(slice)) => {
                out.insert(key.clone(), slice.apply(value));
            }
            Node::Leaf(Action::Exclude) => {}
            Node::Branch(children) => {
                if let Some(projected) = include_value(value, children)? {
                    out.insert(key.clone(), projected);
                }
            }
        }
    }
    Ok(out)
}

fn include_value(value: &Value, fields: &IndexMap<String, Node>) -> Result<Option<Value>> {
    match value {
        Value::Object(sub) => Ok(Some(Value::Object(include_document(sub, fields)?))),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(projected) = include_value(item, fields)? {
                    out.push(projected);
                }
            }
            Ok(Some(Value::Array(out)))
        }
        _ => Ok(None),
    }
}

fn exclude_document(doc: &Document, fields: &IndexMap<String, Node>) -> Document {
    let mut out = Document::new();
    for (key, value) in doc {
        match fields.get(key) {
            None | Some(Node::Leaf(Action::Include)) => {
                out.insert(key.clone(), value.clone());
            }
            Some(Node::Leaf(Action::Slice(slice))) => {
                out.insert(key.clone(), slice.apply(value));
            }
            Some(Node::Leaf(_)) => {}
            Some(Node::Branch(children)) => {
                out.insert(key.clone(), exclude_value(value, children));
            }
        }
    }
    out
}

fn exclude_value(value: &Value, fields: &IndexMap<String, Node>) -> Value {
    match value {
        Value::Object(sub) => Value::Object(exclude_document(sub, fields)),
        Value::Array(items) => Value::Array(items.iter().map(|item| exclude_value(item, fields)).collect()),
        other => other.clone(),
    }
}
