// src/query/operators.rs
//! Field-level query operators
//!
//! Every operator implements [`OperatorMatcher`] and is registered by name in
//! [`OPERATOR_REGISTRY`]. An operator receives the *resolution* of the field
//! path it is applied to: every value the path reaches after array
//! broadcasting. An empty resolution means the field is missing.
//!
//! ```text
//! { "tags": { "$all": ["a", "b"], "$size": 2 } }
//!    │         │                     │
//!    │         └─ AllOperator        └─ SizeOperator
//!    └─ path::resolve(doc, "tags")
//! ```

use crate::document::Document;
use crate::error::{Result, ShadowDbError};
use crate::value::Value;
use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::num::NonZeroUsize;

use super::{match_condition, matches_filter};

// ============================================================================
// REGEX CACHE
// ============================================================================

const REGEX_CACHE_CAPACITY: usize = 128;

lazy_static! {
    /// Compiled patterns keyed by "options/pattern"
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> = Mutex::new(LruCache::new(
        NonZeroUsize::new(REGEX_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN)
    ));
}

/// Translate server regex options (i, m, s, x) into inline flags
fn build_regex_pattern(pattern: &str, options: &str) -> String {
    let flags: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();
    if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    }
}

pub(crate) fn compile_regex(pattern: &str, options: &str) -> Result<Regex> {
    let cache_key = format!("{}/{}", options, pattern);
    if let Some(regex) = REGEX_CACHE.lock().get(&cache_key) {
        return Ok(regex.clone());
    }

    let regex = Regex::new(&build_regex_pattern(pattern, options)).map_err(|e| {
        ShadowDbError::MatchError(format!("invalid regular expression '{}': {}", pattern, e))
    })?;
    REGEX_CACHE.lock().put(cache_key, regex.clone());
    Ok(regex)
}

// ============================================================================
// TRAIT DEFINITION
// ============================================================================

/// A query operator applicable to a field path
///
/// # Examples
///
/// ```
/// use shadowdb_core::query::operators::{EqOperator, OperatorMatcher};
/// use shadowdb_core::{Document, Value};
///
/// let alice = Value::from("Alice");
/// let matched = EqOperator
///     .matches(&[&alice], &Value::from("Alice"), &Document::new())
///     .unwrap();
/// assert!(matched);
/// ```
pub trait OperatorMatcher: Send + Sync {
    /// Operator name including the leading `$`
    fn name(&self) -> &'static str;

    /// Evaluate the operator
    ///
    /// - `resolved`: values reached by the field path (empty when missing)
    /// - `operand`: the operator's argument from the filter
    /// - `siblings`: the whole operator document, for operators that read
    ///   companion keys (`$regex` reads `$options`)
    fn matches(&self, resolved: &[&Value], operand: &Value, siblings: &Document) -> Result<bool>;
}

/// Values an element-wise operator inspects: each resolved value, then the
/// elements of any resolved array
fn candidates<'a>(resolved: &[&'a Value]) -> Vec<&'a Value> {
    let mut out: Vec<&'a Value> = Vec::with_capacity(resolved.len());
    for value in resolved {
        out.push(value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn values_equal(resolved: &[&Value], operand: &Value) -> bool {
    // Equality with null also matches a missing field
    if operand.is_null() && resolved.is_empty() {
        return true;
    }
    candidates(resolved).into_iter().any(|v| v == operand)
}

fn require_array<'a>(operand: &'a Value, op: &str) -> Result<&'a Vec<Value>> {
    operand
        .as_array()
        .ok_or_else(|| ShadowDbError::MatchError(format!("{} needs an array", op)))
}

// ============================================================================
// COMPARISON OPERATORS
// ============================================================================

/// `$eq`; also the implicit operator of `{ field: literal }`
///
/// Matches when any resolved value, or any element of a resolved array,
/// equals the operand. A whole array also matches an equal array operand.
pub struct EqOperator;

impl OperatorMatcher for EqOperator {
    fn name(&self) -> &'static str {
        "$eq"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        Ok(values_equal(resolved, operand))
    }
}

/// `$ne`: negation of `$eq`, so a missing field matches
pub struct NeOperator;

impl OperatorMatcher for NeOperator {
    fn name(&self) -> &'static str {
        "$ne"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        Ok(!values_equal(resolved, operand))
    }
}

/// Shared body of the ordering operators
///
/// Ordering follows the canonical cross-type order. A resolved array is only
/// compared as a whole when the operand is itself an array; otherwise its
/// elements are compared individually.
fn compare_with_predicate<F>(resolved: &[&Value], operand: &Value, predicate: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    resolved.iter().any(|value| match value {
        Value::Array(items) => {
            (operand.is_array() && predicate(Value::cmp(value, operand)))
                || items.iter().any(|item| predicate(item.cmp(operand)))
        }
        other => predicate(other.cmp(&operand)),
    })
}

pub struct GtOperator;

impl OperatorMatcher for GtOperator {
    fn name(&self) -> &'static str {
        "$gt"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        Ok(compare_with_predicate(resolved, operand, |ord| ord == Ordering::Greater))
    }
}

pub struct GteOperator;

impl OperatorMatcher for GteOperator {
    fn name(&self) -> &'static str {
        "$gte"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        Ok(compare_with_predicate(resolved, operand, |ord| ord != Ordering::Less))
    }
}

pub struct LtOperator;

impl OperatorMatcher for LtOperator {
    fn name(&self) -> &'static str {
        "$lt"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        Ok(compare_with_predicate(resolved, operand, |ord| ord == Ordering::Less))
    }
}

pub struct LteOperator;

impl OperatorMatcher for LteOperator {
    fn name(&self) -> &'static str {
        "$lte"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        Ok(compare_with_predicate(resolved, operand, |ord| ord != Ordering::Greater))
    }
}

// ============================================================================
// ARRAY OPERATORS
// ============================================================================

/// `$in`: equality against any listed value
pub struct InOperator;

impl OperatorMatcher for InOperator {
    fn name(&self) -> &'static str {
        "$in"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        let choices = require_array(operand, "$in")?;
        Ok(choices.iter().any(|choice| values_equal(resolved, choice)))
    }
}

/// `$nin`: negation of `$in`
pub struct NinOperator;

impl OperatorMatcher for NinOperator {
    fn name(&self) -> &'static str {
        "$nin"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        let choices = require_array(operand, "$nin")?;
        Ok(!choices.iter().any(|choice| values_equal(resolved, choice)))
    }
}

/// `$all`: every listed element must match, either by equality or, for
/// `{ "$elemMatch": .. }` elements, as an element match
pub struct AllOperator;

impl OperatorMatcher for AllOperator {
    fn name(&self) -> &'static str {
        "$all"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, siblings: &Document) -> Result<bool> {
        let required = require_array(operand, "$all")?;
        if required.is_empty() {
            return Ok(false);
        }
        for item in required {
            let elem_match = item
                .as_document()
                .filter(|d| d.len() == 1)
                .and_then(|d| d.get("$elemMatch"));
            let satisfied = match elem_match {
                Some(sub_filter) => ElemMatchOperator.matches(resolved, sub_filter, siblings)?,
                None => values_equal(resolved, item),
            };
            if !satisfied {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// `$elemMatch`: at least one array element satisfies the nested filter
///
/// Sub-document elements are matched as documents; when the nested filter
/// consists only of operators (`{ "$gte": 80, "$lt": 85 }`) each element is
/// matched as a plain value instead.
pub struct ElemMatchOperator;

impl ElemMatchOperator {
    fn is_value_filter(filter: &Document) -> bool {
        !filter.is_empty()
            && filter
                .keys()
                .all(|k| k.starts_with('$') && !matches!(k.as_str(), "$and" | "$or" | "$nor"))
    }
}

/// Check a single array element against an `$elemMatch` filter
pub(crate) fn element_matches(item: &Value, filter: &Document) -> Result<bool> {
    if ElemMatchOperator::is_value_filter(filter) {
        return match_condition(&[item], &Value::Object(filter.clone()));
    }
    match item {
        Value::Object(sub) => matches_filter(sub, filter),
        _ => Ok(false),
    }
}

impl OperatorMatcher for ElemMatchOperator {
    fn name(&self) -> &'static str {
        "$elemMatch"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        let filter = operand
            .as_document()
            .ok_or_else(|| ShadowDbError::MatchError("$elemMatch needs an Object".to_string()))?;

        for value in resolved {
            let Value::Array(items) = value else { continue };
            for item in items {
                if element_matches(item, filter)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// `$size`: a resolved array has exactly the given length
pub struct SizeOperator;

impl OperatorMatcher for SizeOperator {
    fn name(&self) -> &'static str {
        "$size"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        let expected = operand
            .as_i64()
            .filter(|n| *n >= 0)
            .ok_or_else(|| ShadowDbError::MatchError("$size needs a number".to_string()))?;
        Ok(resolved
            .iter()
            .any(|v| matches!(v, Value::Array(items) if items.len() as i64 == expected)))
    }
}

// ============================================================================
// ELEMENT OPERATORS
// ============================================================================

/// `$exists`: present-and-null counts as present
pub struct ExistsOperator;

impl OperatorMatcher for ExistsOperator {
    fn name(&self) -> &'static str {
        "$exists"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        Ok(!resolved.is_empty() == operand.is_truthy())
    }
}

/// `$type`: numeric type code, string alias, or the "number" family
pub struct TypeOperator;

impl TypeOperator {
    fn type_matches(value: &Value, wanted: &Value) -> Result<bool> {
        match wanted {
            Value::String(alias) if alias == "number" => Ok(value.is_number()),
            Value::String(alias) => Ok(value.type_name() == alias),
            other => match other.as_i64() {
                Some(code) => Ok(value.type_code() as i64 == code),
                None => Err(ShadowDbError::MatchError(format!(
                    "$type needs a type code or alias, got {}",
                    other
                ))),
            },
        }
    }
}

impl OperatorMatcher for TypeOperator {
    fn name(&self) -> &'static str {
        "$type"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        for value in candidates(resolved) {
            if Self::type_matches(value, operand)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ============================================================================
// EVALUATION OPERATORS
// ============================================================================

/// `$regex`, honouring a sibling `$options`
pub struct RegexOperator;

impl OperatorMatcher for RegexOperator {
    fn name(&self) -> &'static str {
        "$regex"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, siblings: &Document) -> Result<bool> {
        let pattern = operand
            .as_str()
            .ok_or_else(|| ShadowDbError::MatchError("$regex has to be a string".to_string()))?;
        let options = siblings
            .get("$options")
            .and_then(Value::as_str)
            .unwrap_or("");
        let regex = compile_regex(pattern, options)?;
        Ok(candidates(resolved)
            .into_iter()
            .any(|v| v.as_str().map(|s| regex.is_match(s)).unwrap_or(false)))
    }
}

/// `$options` is consumed by `$regex`; on its own it is malformed
pub struct OptionsOperator;

impl OperatorMatcher for OptionsOperator {
    fn name(&self) -> &'static str {
        "$options"
    }

    fn matches(&self, _resolved: &[&Value], _operand: &Value, siblings: &Document) -> Result<bool> {
        if siblings.contains_key("$regex") {
            Ok(true)
        } else {
            Err(ShadowDbError::MatchError("$options needs a $regex".to_string()))
        }
    }
}

/// `$mod: [divisor, remainder]`
pub struct ModOperator;

impl OperatorMatcher for ModOperator {
    fn name(&self) -> &'static str {
        "$mod"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        let args = require_array(operand, "$mod")?;
        let (divisor, remainder) = match args.as_slice() {
            [d, r] => (d.as_f64(), r.as_f64()),
            _ => (None, None),
        };
        let (divisor, remainder) = match (divisor, remainder) {
            (Some(d), Some(r)) if d.trunc() != 0.0 => (d.trunc() as i64, r.trunc() as i64),
            _ => {
                return Err(ShadowDbError::MatchError(
                    "malformed mod, needs [divisor, remainder] with a non-zero divisor".to_string(),
                ))
            }
        };
        Ok(candidates(resolved).into_iter().any(|v| {
            v.as_f64()
                .map(|n| (n.trunc() as i64) % divisor == remainder)
                .unwrap_or(false)
        }))
    }
}

// ============================================================================
// LOGICAL OPERATORS
// ============================================================================

/// `$not`: negates an operator document applied to the same field
pub struct NotOperator;

impl OperatorMatcher for NotOperator {
    fn name(&self) -> &'static str {
        "$not"
    }

    fn matches(&self, resolved: &[&Value], operand: &Value, _siblings: &Document) -> Result<bool> {
        match operand {
            Value::Object(inner) if inner.keys().all(|k| k.starts_with('$')) && !inner.is_empty() => {
                Ok(!match_condition(resolved, operand)?)
            }
            _ => Err(ShadowDbError::MatchError(
                "$not needs an operator document".to_string(),
            )),
        }
    }
}

// ============================================================================
// OPERATOR REGISTRY
// ============================================================================

lazy_static! {
    /// Field-level operators by name. Top-level `$and`/`$or`/`$nor` are
    /// handled by the filter walker since they apply to whole documents.
    pub static ref OPERATOR_REGISTRY: HashMap<&'static str, Box<dyn OperatorMatcher>> = {
        let operators: Vec<Box<dyn OperatorMatcher>> = vec![
            Box::new(EqOperator),
            Box::new(NeOperator),
            Box::new(GtOperator),
            Box::new(GteOperator),
            Box::new(LtOperator),
            Box::new(LteOperator),
            Box::new(InOperator),
            Box::new(NinOperator),
            Box::new(AllOperator),
            Box::new(ElemMatchOperator),
            Box::new(SizeOperator),
            Box::new(ExistsOperator),
            Box::new(TypeOperator),
            Box::new(RegexOperator),
            Box::new(OptionsOperator),
            Box::new(ModOperator),
            Box::new(NotOperator),
        ];
        operators.into_iter().map(|op| (op.name(), op)).collect()
    };
}
