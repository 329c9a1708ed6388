// src/query.rs
//! Filter matching for the query language
//!
//! Field-level operators live in the [`operators`] submodule and are looked
//! up by name through its registry. This module walks the filter document:
//! top-level logical operators (`$and`, `$or`, `$nor`) recurse into nested
//! filters, every other key is a dotted field path whose condition is either a
//! literal (implicit `$eq`) or an operator document.

pub mod operators;

use crate::document::Document;
use crate::error::{Result, ShadowDbError};
use crate::path;
use crate::value::Value;

use operators::{EqOperator, OperatorMatcher, OPERATOR_REGISTRY};

/// True when `value` is a document whose first key is an operator
///
/// `{ "$gt": 1 }` is an operator document, `{ "b": 1 }` is a literal.
pub fn is_operator_document(value: &Value) -> bool {
    value
        .as_document()
        .and_then(|doc| doc.keys().next())
        .map(|k| k.starts_with('$'))
        .unwrap_or(false)
}

fn logical_clauses<'a>(op: &str, operand: &'a Value) -> Result<Vec<&'a Document>> {
    let items = operand
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| ShadowDbError::MatchError(format!("{} must be a nonempty array", op)))?;
    items
        .iter()
        .map(|item| {
            item.as_document().ok_or_else(|| {
                ShadowDbError::MatchError(format!("{} entries need to be full objects", op))
            })
        })
        .collect()
}

/// Apply a field condition to the values a path resolved to
pub(crate) fn match_condition(resolved: &[&Value], condition: &Value) -> Result<bool> {
    let Some(ops) = condition.as_document().filter(|_| is_operator_document(condition)) else {
        return EqOperator.matches(resolved, condition, &Document::new());
    };

    for (name, operand) in ops {
        let operator = OPERATOR_REGISTRY
            .get(name.as_str())
            .ok_or_else(|| ShadowDbError::MatchError(format!("unknown operator: {}", name)))?;
        if !operator.matches(resolved, operand, ops)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Check whether a document satisfies a filter
///
/// An empty filter matches everything. Malformed filters (unknown operators,
/// wrong operand shapes) fail with [`ShadowDbError::MatchError`].
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use shadowdb_core::query::matches_filter;
/// use shadowdb_core::Document;
///
/// let doc = Document::from_json(&json!({"name": "Alice", "age": 30})).unwrap();
/// let filter = Document::from_json(&json!({"age": {"$gte": 18}})).unwrap();
/// assert!(matches_filter(&doc, &filter).unwrap());
/// ```
pub fn matches_filter(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in logical_clauses("$and", condition)? {
                    if !matches_filter(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in logical_clauses("$or", condition)? {
                    if matches_filter(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut any = false;
                for clause in logical_clauses("$nor", condition)? {
                    if matches_filter(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                !any
            }
            "$comment" => true,
            op if op.starts_with('$') => {
                return Err(ShadowDbError::MatchError(format!(
                    "unknown top level operator: {}",
                    op
                )))
            }
            field => match_condition(&path::resolve(doc, field), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Walk a filter and reject unknown operators without touching any document
fn validate_filter(filter: &Document) -> Result<()> {
    for (key, condition) in filter {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                for clause in logical_clauses(key, condition)? {
                    validate_filter(clause)?;
                }
            }
            "$comment" => {}
            op if op.starts_with('$') => {
                return Err(ShadowDbError::MatchError(format!(
                    "unknown top level operator: {}",
                    op
                )))
            }
            _ => validate_condition(condition)?,
        }
    }
    Ok(())
}

fn validate_condition(condition: &Value) -> Result<()> {
    if !is_operator_document(condition) {
        return Ok(());
    }
    let Some(ops) = condition.as_document() else {
        return Ok(());
    };
    for (name, operand) in ops {
        if !OPERATOR_REGISTRY.contains_key(name.as_str()) {
            return Err(ShadowDbError::MatchError(format!("unknown operator: {}", name)));
        }
        match name.as_str() {
            "$not" => {
                if !is_operator_document(operand) {
                    return Err(ShadowDbError::MatchError(
                        "$not needs an operator document".to_string(),
                    ));
                }
                validate_condition(operand)?
            }
            "$elemMatch" => {
                if let Some(sub) = operand.as_document() {
                    if sub.keys().all(|k| k.starts_with('$')) {
                        validate_condition(operand)?;
                    } else {
                        validate_filter(sub)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// A parsed, validated filter
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use shadowdb_core::query::Query;
/// use shadowdb_core::Document;
///
/// let query = Query::from_json(&json!({"status": "active"})).unwrap();
/// let doc = Document::from_json(&json!({"status": "active"})).unwrap();
/// assert!(query.matches(&doc).unwrap());
///
/// assert!(Query::from_json(&json!({"a": {"$bogus": 1}})).is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    filter: Document,
}

impl Query {
    /// Empty query; matches every document
    pub fn new() -> Self {
        Query {
            filter: Document::new(),
        }
    }

    pub fn parse(filter: &Document) -> Result<Self> {
        validate_filter(filter)?;
        Ok(Query {
            filter: filter.clone(),
        })
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        Self::parse(&Document::from_json(json)?)
    }

    pub fn matches(&self, document: &Document) -> Result<bool> {
        matches_filter(document, &self.filter)
    }

    pub fn filter(&self) -> &Document {
        &self.filter
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
