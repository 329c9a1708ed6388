// src/update.rs
// Update documents: replacement and field operators ($set, $inc, $push, ...)

use crate::document::{Document, ID_FIELD};
use crate::error::{codes, Result, ShadowDbError};
use crate::path;
use crate::query::operators::element_matches;
use crate::query::{is_operator_document, match_condition};
use crate::value::{Number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOperator {
    Set,
    Unset,
    Inc,
    Push,
    AddToSet,
    Pull,
    Pop,
    Rename,
}

impl UpdateOperator {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$set" => UpdateOperator::Set,
            "$unset" => UpdateOperator::Unset,
            "$inc" => UpdateOperator::Inc,
            "$push" => UpdateOperator::Push,
            "$addToSet" => UpdateOperator::AddToSet,
            "$pull" => UpdateOperator::Pull,
            "$pop" => UpdateOperator::Pop,
            "$rename" => UpdateOperator::Rename,
            _ => return None,
        })
    }
}

/// A parsed update specification
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Whole-document replacement; `_id` is carried over
    Replacement(Document),
    Operators(Vec<(UpdateOperator, Document)>),
}

fn bad_value(message: String) -> ShadowDbError {
    ShadowDbError::command(codes::BAD_VALUE, message)
}

fn immutable_id() -> ShadowDbError {
    ShadowDbError::command(
        codes::IMMUTABLE_FIELD,
        "Performing an update on the path '_id' would modify the immutable field '_id'",
    )
}

fn touches_id(field: &str) -> bool {
    field == ID_FIELD || field.starts_with("_id.")
}

/// `$each` list or a single item
fn each_items(value: &Value) -> (Vec<Value>, Option<&Document>) {
    match value.as_document() {
        Some(modifiers) if modifiers.contains_key("$each") => {
            let items = match modifiers.get("$each") {
                Some(Value::Array(items)) => items.clone(),
                Some(other) => vec![other.clone()],
                None => Vec::new(),
            };
            (items, Some(modifiers))
        }
        _ => (vec![value.clone()], None),
    }
}

/// Current array at `field`, or an empty one when the field is missing
fn array_at(doc: &Document, field: &str, op: &str) -> Result<Option<Vec<Value>>> {
    match path::get_path(doc, field) {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items.clone())),
        Some(other) => Err(bad_value(format!(
            "{}: the field '{}' must be an array but is of type {}",
            op,
            field,
            other.type_name()
        ))),
    }
}

fn increment(current: &Value, by: &Value) -> Option<Value> {
    match (current.as_number()?, by.as_number()?) {
        (Number::Int(a), Number::Int(b)) => {
            let sum = a.checked_add(b)?;
            let narrow = matches!(current, Value::Int32(_)) && matches!(by, Value::Int32(_));
            Some(match i32::try_from(sum) {
                Ok(small) if narrow => Value::Int32(small),
                _ => Value::Int64(sum),
            })
        }
        (a, b) => Some(Value::Double(a.as_f64() + b.as_f64())),
    }
}

/// Does an array element match a `$pull` condition
fn pull_matches(item: &Value, condition: &Value) -> Result<bool> {
    match condition {
        Value::Object(filter) if !filter.is_empty() => {
            if is_operator_document(condition) {
                match_condition(&[item], condition)
            } else {
                element_matches(item, filter)
            }
        }
        other => Ok(item == other),
    }
}

impl Update {
    /// Parse an update document
    ///
    /// A document whose keys all start with `$` is an operator update; one
    /// with no `$` keys is a replacement. Mixing both is rejected.
    pub fn parse(spec: &Document) -> Result<Self> {
        let operator_keys = spec.keys().filter(|k| k.starts_with('$')).count();
        if operator_keys == 0 {
            return Ok(Update::Replacement(spec.clone()));
        }
        if operator_keys != spec.len() {
            return Err(bad_value(
                "update document cannot mix operators and plain fields".to_string(),
            ));
        }

        let mut ops = Vec::with_capacity(spec.len());
        for (name, operand) in spec {
            let op = UpdateOperator::from_name(name)
                .ok_or_else(|| bad_value(format!("Unknown modifier: {}", name)))?;
            let fields = operand.as_document().ok_or_else(|| {
                bad_value(format!("Modifiers operate on fields but we found {} instead", operand.type_name()))
            })?;
            for field in fields.keys() {
                if touches_id(field) && op != UpdateOperator::Set {
                    return Err(immutable_id());
                }
            }
            ops.push((op, fields.clone()));
        }
        Ok(Update::Operators(ops))
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        Self::parse(&Document::from_json(json)?)
    }

    /// Apply to `doc` in place; returns whether anything changed
    pub fn apply(&self, doc: &mut Document) -> Result<bool> {
        let before = doc.clone();
        match self {
            Update::Replacement(replacement) => {
                let id = doc.id().cloned();
                if let (Some(old), Some(new)) = (&id, replacement.id()) {
                    if old != new {
                        return Err(immutable_id());
                    }
                }
                let mut next = replacement.clone();
                if let Some(id) = id {
                    next.insert(ID_FIELD, id);
                }
                next.move_id_first();
                *doc = next;
            }
            Update::Operators(ops) => {
                for (op, fields) in ops {
                    for (field, operand) in fields {
                        apply_operator(doc, *op, field, operand)?;
                    }
                }
                if before.id() != doc.id() {
                    return Err(immutable_id());
                }
            }
        }
        Ok(*doc != before)
    }
}

fn apply_operator(doc: &mut Document, op: UpdateOperator, field: &str, operand: &Value) -> Result<()> {
    match op {
        UpdateOperator::Set => path::set_path(doc, field, operand.clone()),
        UpdateOperator::Unset => {
            path::unset_path(doc, field);
            Ok(())
        }
        UpdateOperator::Inc => {
            if !operand.is_number() {
                return Err(ShadowDbError::command(
                    codes::TYPE_MISMATCH,
                    format!("Cannot increment with non-numeric argument: {{{}: {}}}", field, operand),
                ));
            }
            let next = match path::get_path(doc, field) {
                None => operand.clone(),
                Some(current) => increment(current, operand).ok_or_else(|| {
                    ShadowDbError::command(
                        codes::TYPE_MISMATCH,
                        format!(
                            "Cannot apply $inc to a value of non-numeric type. Field '{}' has non-numeric type {}",
                            field,
                            current.type_name()
                        ),
                    )
                })?,
            };
            path::set_path(doc, field, next)
        }
        UpdateOperator::Push => {
            let (items, modifiers) = each_items(operand);
            let mut array = array_at(doc, field, "$push")?.unwrap_or_default();
            let position = modifiers
                .and_then(|m| m.get("$position"))
                .and_then(Value::as_i64)
                .map(|p| (p.max(0) as usize).min(array.len()));
            match position {
                Some(at) => {
                    array.splice(at..at, items);
                }
                None => array.extend(items),
            }
            if let Some(slice) = modifiers.and_then(|m| m.get("$slice")).and_then(Value::as_i64) {
                if slice < 0 {
                    let keep = slice.unsigned_abs() as usize;
                    if array.len() > keep {
                        array.drain(..array.len() - keep);
                    }
                } else {
                    array.truncate(slice as usize);
                }
            }
            path::set_path(doc, field, Value::Array(array))
        }
        UpdateOperator::AddToSet => {
            let (items, _) = each_items(operand);
            let mut array = array_at(doc, field, "$addToSet")?.unwrap_or_default();
            for item in items {
                if !array.contains(&item) {
                    array.push(item);
                }
            }
            path::set_path(doc, field, Value::Array(array))
        }
        UpdateOperator::Pull => {
            let Some(array) = array_at(doc, field, "$pull")? else {
                return Ok(());
            };
            let mut kept = Vec::with_capacity(array.len());
            for item in array {
                if !pull_matches(&item, operand)? {
                    kept.push(item);
                }
            }
            path::set_path(doc, field, Value::Array(kept))
        }
        UpdateOperator::Pop => {
            let Some(mut array) = array_at(doc, field, "$pop")? else {
                return Ok(());
            };
            match operand.as_i64() {
                Some(-1) if !array.is_empty() => {
                    array.remove(0);
                }
                Some(1) => {
                    array.pop();
                }
                Some(-1) => {}
                _ => return Err(bad_value(format!("$pop expects 1 or -1, found: {}", operand))),
            }
            path::set_path(doc, field, Value::Array(array))
        }
        UpdateOperator::Rename => {
            let target = operand
                .as_str()
                .ok_or_else(|| bad_value(format!("The 'to' field for $rename must be a string: {}", operand)))?;
            if touches_id(target) {
                return Err(immutable_id());
            }
            if let Some(value) = path::get_path(doc, field).cloned() {
                path::unset_path(doc, field);
                path::set_path(doc, target, value)?;
            }
            Ok(())
        }
    }
}

/// Starting document for an upsert: the filter's equality conditions
pub fn upsert_seed(filter: &Document) -> Result<Document> {
    let mut seed = Document::new();
    for (field, condition) in filter {
        if field.starts_with('$') {
            continue;
        }
        let value = match condition.as_document() {
            Some(ops) if is_operator_document(condition) => match ops.get("$eq") {
                Some(v) => v.clone(),
                None => continue,
            },
            _ => condition.clone(),
        };
        path::set_path(&mut seed, field, value)?;
    }
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_json(&v).unwrap()
    }

    fn apply(d: serde_json::Value, u: serde_json::Value) -> Result<serde_json::Value> {
        let mut d = doc(d);
        Update::from_json(&u)?.apply(&mut d)?;
        Ok(d.to_json())
    }

    #[test]
    fn test_set_and_unset() {
        assert_eq!(
            apply(json!({"_id": 1, "a": 1}), json!({"$set": {"a": 2, "b.c": 3}})).unwrap(),
            json!({"_id": 1, "a": 2, "b": {"c": 3}})
        );
        assert_eq!(
            apply(json!({"_id": 1, "a": 1, "b": 2}), json!({"$unset": {"a": ""}})).unwrap(),
            json!({"_id": 1, "b": 2})
        );
    }

    #[test]
    fn test_inc() {
        assert_eq!(apply(json!({"n": 1}), json!({"$inc": {"n": 2}})).unwrap(), json!({"n": 3}));
        assert_eq!(apply(json!({}), json!({"$inc": {"n": 1.5}})).unwrap(), json!({"n": 1.5}));
        let err = apply(json!({"n": "x"}), json!({"$inc": {"n": 1}})).unwrap_err();
        assert_eq!(err.code(), 14);
        let err = apply(json!({"n": 1}), json!({"$inc": {"n": "1"}})).unwrap_err();
        assert_eq!(err.code(), 14);
    }

    #[test]
    fn test_push_with_modifiers() {
        assert_eq!(apply(json!({"a": [1]}), json!({"$push": {"a": 2}})).unwrap(), json!({"a": [1, 2]}));
        assert_eq!(
            apply(json!({"a": [1, 2]}), json!({"$push": {"a": {"$each": [3, 4], "$position": 0, "$slice": 3}}}))
                .unwrap(),
            json!({"a": [3, 4, 1]})
        );
        assert_eq!(apply(json!({}), json!({"$push": {"a": 1}})).unwrap(), json!({"a": [1]}));
        assert_eq!(apply(json!({"a": 1}), json!({"$push": {"a": 1}})).unwrap_err().code(), 2);
    }

    #[test]
    fn test_add_to_set_and_pull() {
        assert_eq!(
            apply(json!({"t": ["a"]}), json!({"$addToSet": {"t": {"$each": ["a", "b"]}}})).unwrap(),
            json!({"t": ["a", "b"]})
        );
        assert_eq!(
            apply(json!({"s": [1, 5, 9]}), json!({"$pull": {"s": {"$gte": 5}}})).unwrap(),
            json!({"s": [1]})
        );
        assert_eq!(
            apply(json!({"s": [{"k": 1}, {"k": 2}]}), json!({"$pull": {"s": {"k": 2}}})).unwrap(),
            json!({"s": [{"k": 1}]})
        );
    }

    #[test]
    fn test_pop_and_rename() {
        assert_eq!(apply(json!({"a": [1, 2, 3]}), json!({"$pop": {"a": -1}})).unwrap(), json!({"a": [2, 3]}));
        assert_eq!(
            apply(json!({"a": 1, "b": 2}), json!({"$rename": {"a": "c"}})).unwrap(),
            json!({"b": 2, "c": 1})
        );
    }

    #[test]
    fn test_id_is_immutable() {
        let err = apply(json!({"_id": 1}), json!({"$set": {"_id": 2}})).unwrap_err();
        assert_eq!(err.code(), 66);
        let err = apply(json!({"_id": 1}), json!({"_id": 2, "a": 1})).unwrap_err();
        assert_eq!(err.code(), 66);
        let err = Update::from_json(&json!({"$inc": {"_id": 1}})).unwrap_err();
        assert_eq!(err.code(), 66);
        assert!(apply(json!({"_id": 1}), json!({"$set": {"_id": 1}})).is_ok());
    }

    #[test]
    fn test_replacement_keeps_id() {
        assert_eq!(
            apply(json!({"_id": 1, "a": 1}), json!({"b": 2})).unwrap(),
            json!({"_id": 1, "b": 2})
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Update::from_json(&json!({"$bogus": {"a": 1}})).unwrap_err().code(), 2);
        assert!(Update::from_json(&json!({"$set": {"a": 1}, "b": 2})).is_err());
        assert!(Update::from_json(&json!({"$set": 1})).is_err());
    }

    #[test]
    fn test_apply_reports_change() {
        let mut d = doc(json!({"a": 1}));
        assert!(!Update::from_json(&json!({"$set": {"a": 1}})).unwrap().apply(&mut d).unwrap());
        assert!(Update::from_json(&json!({"$set": {"a": 2}})).unwrap().apply(&mut d).unwrap());
    }

    #[test]
    fn test_upsert_seed() {
        let filter = doc(json!({"a": 1, "b.c": {"$eq": 2}, "d": {"$gt": 1}, "$or": [{"x": 1}]}));
        assert_eq!(upsert_seed(&filter).unwrap().to_json(), json!({"a": 1, "b": {"c": 2}}));
    }
}
