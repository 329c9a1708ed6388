// src/expression.rs
//! Aggregation expressions
//!
//! An expression specification is parsed once into an [`Expr`] tree. Operand
//! counts are validated while parsing, so a wrong-arity operator fails the
//! whole pipeline before any document is read. Evaluation distinguishes a
//! field that resolves to nothing ([`Evaluated::Missing`]) from an explicit
//! null.
//!
//! ```text
//! { "$concat": [ "$item.type", " ", "$item.category" ] }
//!      │            │           │        │
//!      Op(Concat)   FieldRef    Literal  FieldRef
//! ```

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use std::cmp::Ordering;

use crate::document::Document;
use crate::error::{codes, Result, ShadowDbError};
use crate::value::{Number, Value};

/// Result of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    Value(Value),
    Missing,
}

impl Evaluated {
    pub fn is_missing(&self) -> bool {
        matches!(self, Evaluated::Missing)
    }

    /// Missing or explicit null
    pub fn is_nullish(&self) -> bool {
        matches!(self, Evaluated::Missing | Evaluated::Value(Value::Null))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Evaluated::Value(v) => v.is_truthy(),
            Evaluated::Missing => false,
        }
    }

    pub fn into_option(self) -> Option<Value> {
        match self {
            Evaluated::Value(v) => Some(v),
            Evaluated::Missing => None,
        }
    }

    /// Collapse to a value, turning Missing into null
    pub fn or_null(self) -> Value {
        self.into_option().unwrap_or(Value::Null)
    }

    fn as_value(&self) -> Option<&Value> {
        match self {
            Evaluated::Value(v) => Some(v),
            Evaluated::Missing => None,
        }
    }
}

impl From<Value> for Evaluated {
    fn from(value: Value) -> Self {
        Evaluated::Value(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Comparison::Eq => ord == Ordering::Equal,
            Comparison::Ne => ord != Ordering::Equal,
            Comparison::Gt => ord == Ordering::Greater,
            Comparison::Gte => ord != Ordering::Less,
            Comparison::Lt => ord == Ordering::Less,
            Comparison::Lte => ord != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePart {
    Year,
    Month,
    DayOfYear,
    DayOfMonth,
    DayOfWeek,
    Week,
    Hour,
    Minute,
    Second,
    Millisecond,
}

impl DatePart {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$year" => DatePart::Year,
            "$month" => DatePart::Month,
            "$dayOfYear" => DatePart::DayOfYear,
            "$dayOfMonth" => DatePart::DayOfMonth,
            "$dayOfWeek" => DatePart::DayOfWeek,
            "$week" => DatePart::Week,
            "$hour" => DatePart::Hour,
            "$minute" => DatePart::Minute,
            "$second" => DatePart::Second,
            "$millisecond" => DatePart::Millisecond,
            _ => return None,
        })
    }

    /// Extract the calendar field from a UTC timestamp
    pub fn extract(self, dt: &DateTime<Utc>) -> i32 {
        match self {
            DatePart::Year => dt.year(),
            DatePart::Month => dt.month() as i32,
            DatePart::DayOfYear => dt.ordinal() as i32,
            DatePart::DayOfMonth => dt.day() as i32,
            DatePart::DayOfWeek => dt.weekday().num_days_from_sunday() as i32 + 1,
            DatePart::Week => {
                // Weeks start on Sunday; days before the first Sunday are week 0
                let day0 = dt.ordinal0() as i32;
                let weekday0 = dt.weekday().num_days_from_sunday() as i32;
                (day0 + 7 - weekday0) / 7
            }
            DatePart::Hour => dt.hour() as i32,
            DatePart::Minute => dt.minute() as i32,
            DatePart::Second => dt.second() as i32,
            DatePart::Millisecond => (dt.timestamp_subsec_millis() % 1000) as i32,
        }
    }
}

/// Operator node of the expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Concat(Vec<Expr>),
    IfNull(Box<[Expr; 2]>),
    Strcasecmp(Box<[Expr; 2]>),
    Cmp(Box<[Expr; 2]>),
    Substr(Box<[Expr; 3]>),
    ToUpper(Box<Expr>),
    ToLower(Box<Expr>),
    Size(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Compare(Comparison, Box<[Expr; 2]>),
    Add(Vec<Expr>),
    Subtract(Box<[Expr; 2]>),
    Multiply(Vec<Expr>),
    Divide(Box<[Expr; 2]>),
    Mod(Box<[Expr; 2]>),
    Cond(Box<[Expr; 3]>),
    Date(DatePart, Box<Expr>),
}

/// Parsed aggregation expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `"$a.b"`; stored without the leading `$`
    FieldRef(String),
    /// `"$$ROOT"` / `"$$CURRENT"`
    Root,
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Op(Operator),
}

fn arity_error(name: &str, expected: usize, got: usize) -> ShadowDbError {
    ShadowDbError::command(
        codes::WRONG_OPERAND_COUNT,
        format!(
            "Expression {} takes exactly {} arguments. {} were passed in.",
            name, expected, got
        ),
    )
}

/// A bare operand is a one-element operand list
fn raw_args(operand: &Value) -> Vec<&Value> {
    match operand {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn parse_args(operand: &Value) -> Result<Vec<Expr>> {
    raw_args(operand).into_iter().map(Expr::parse).collect()
}

fn fixed_args<const N: usize>(name: &str, operand: &Value) -> Result<Box<[Expr; N]>> {
    let args = parse_args(operand)?;
    let count = args.len();
    let fixed: [Expr; N] = args
        .try_into()
        .map_err(|_| arity_error(name, N, count))?;
    Ok(Box::new(fixed))
}

fn single_arg(name: &str, operand: &Value) -> Result<Box<Expr>> {
    let [arg] = *fixed_args::<1>(name, operand)?;
    Ok(Box::new(arg))
}

fn parse_cond(operand: &Value) -> Result<Box<[Expr; 3]>> {
    let Value::Object(spec) = operand else {
        return fixed_args::<3>("$cond", operand);
    };
    let part = |key: &str| -> Result<Expr> {
        spec.get(key).map(Expr::parse).unwrap_or_else(|| {
            Err(ShadowDbError::command(
                codes::COND_MISSING_PARAMETER,
                format!("Missing '{}' parameter to $cond", key),
            ))
        })
    };
    if let Some(extra) = spec.keys().find(|k| !matches!(k.as_str(), "if" | "then" | "else")) {
        return Err(ShadowDbError::command(
            codes::COND_MISSING_PARAMETER,
            format!("Unrecognized parameter to $cond: {}", extra),
        ));
    }
    Ok(Box::new([part("if")?, part("then")?, part("else")?]))
}

impl Operator {
    fn parse(name: &str, operand: &Value) -> Result<Expr> {
        let op = match name {
            "$literal" => return Ok(Expr::Literal(operand.clone())),
            "$concat" => Operator::Concat(parse_args(operand)?),
            "$ifNull" => Operator::IfNull(fixed_args(name, operand)?),
            "$strcasecmp" => Operator::Strcasecmp(fixed_args(name, operand)?),
            "$cmp" => Operator::Cmp(fixed_args(name, operand)?),
            "$substr" => Operator::Substr(fixed_args(name, operand)?),
            "$toUpper" => Operator::ToUpper(single_arg(name, operand)?),
            "$toLower" => Operator::ToLower(single_arg(name, operand)?),
            "$size" => Operator::Size(single_arg(name, operand)?),
            "$and" => Operator::And(parse_args(operand)?),
            "$or" => Operator::Or(parse_args(operand)?),
            "$not" => Operator::Not(single_arg(name, operand)?),
            "$eq" => Operator::Compare(Comparison::Eq, fixed_args(name, operand)?),
            "$ne" => Operator::Compare(Comparison::Ne, fixed_args(name, operand)?),
            "$gt" => Operator::Compare(Comparison::Gt, fixed_args(name, operand)?),
            "$gte" => Operator::Compare(Comparison::Gte, fixed_args(name, operand)?),
            "$lt" => Operator::Compare(Comparison::Lt, fixed_args(name, operand)?),
            "$lte" => Operator::Compare(Comparison::Lte, fixed_args(name, operand)?),
            "$add" => Operator::Add(parse_args(operand)?),
            "$subtract" => Operator::Subtract(fixed_args(name, operand)?),
            "$multiply" => Operator::Multiply(parse_args(operand)?),
            "$divide" => Operator::Divide(fixed_args(name, operand)?),
            "$mod" => Operator::Mod(fixed_args(name, operand)?),
            "$cond" => Operator::Cond(parse_cond(operand)?),
            other => match DatePart::from_name(other) {
                Some(part) => Operator::Date(part, single_arg(name, operand)?),
                None => {
                    return Err(ShadowDbError::command(
                        codes::UNKNOWN_EXPRESSION,
                        format!("Unrecognized expression '{}'", other),
                    ))
                }
            },
        };
        Ok(Expr::Op(op))
    }
}

impl Expr {
    /// Build an expression tree from its document form
    ///
    /// # Examples
    ///
    /// ```
    /// use shadowdb_core::expression::Expr;
    /// use shadowdb_core::Value;
    /// use serde_json::json;
    ///
    /// assert!(Expr::parse(&Value::from(json!({"$toUpper": "$type"}))).is_ok());
    ///
    /// let err = Expr::parse(&Value::from(json!({"$strcasecmp": ["$a"]}))).unwrap_err();
    /// assert_eq!(err.code(), 16020);
    /// ```
    pub fn parse(spec: &Value) -> Result<Expr> {
        match spec {
            Value::String(s) if s.starts_with("$$") => Self::parse_variable(&s[2..]),
            Value::String(s) if s.starts_with('$') => Ok(Expr::FieldRef(s[1..].to_string())),
            Value::Object(doc) => match doc.keys().next() {
                Some(first) if first.starts_with('$') => {
                    if doc.len() != 1 {
                        return Err(ShadowDbError::command(
                            codes::EXPRESSION_ONE_FIELD,
                            "an expression operator specification must contain exactly one field",
                        ));
                    }
                    match doc.iter().next() {
                        Some((name, operand)) => Operator::parse(name, operand),
                        None => Ok(Expr::Object(Vec::new())),
                    }
                }
                _ => {
                    let fields = doc
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), Expr::parse(v)?)))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Expr::Object(fields))
                }
            },
            Value::Array(items) => Ok(Expr::Array(items.iter().map(Expr::parse).collect::<Result<_>>()?)),
            other => Ok(Expr::Literal(other.clone())),
        }
    }

    fn parse_variable(variable: &str) -> Result<Expr> {
        let (name, rest) = match variable.split_once('.') {
            Some((name, rest)) => (name, Some(rest)),
            None => (variable, None),
        };
        match (name, rest) {
            ("ROOT" | "CURRENT", None) => Ok(Expr::Root),
            ("ROOT" | "CURRENT", Some(path)) => Ok(Expr::FieldRef(path.to_string())),
            _ => Err(ShadowDbError::command(
                codes::UNDEFINED_VARIABLE,
                format!("Use of undefined variable: {}", name),
            )),
        }
    }

    /// Evaluate against one document
    pub fn evaluate(&self, doc: &Document) -> Result<Evaluated> {
        match self {
            Expr::Literal(v) => Ok(Evaluated::Value(v.clone())),
            Expr::FieldRef(path) => Ok(resolve_field(doc, path)),
            Expr::Root => Ok(Evaluated::Value(Value::Object(doc.clone()))),
            Expr::Object(fields) => {
                let mut out = Document::new();
                for (key, expr) in fields {
                    if let Evaluated::Value(v) = expr.evaluate(doc)? {
                        out.insert(key.clone(), v);
                    }
                }
                Ok(Evaluated::Value(Value::Object(out)))
            }
            Expr::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| Ok(item.evaluate(doc)?.or_null()))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Evaluated::Value(Value::Array(values)))
            }
            Expr::Op(op) => op.evaluate(doc),
        }
    }

    /// Evaluate to a plain value; Missing becomes null
    pub fn evaluate_value(&self, doc: &Document) -> Result<Value> {
        Ok(self.evaluate(doc)?.or_null())
    }
}

/// Resolve a field path for expression purposes
///
/// Unlike query resolution, traversing an array of sub-documents collects
/// the reached values into a new array.
pub fn resolve_field(doc: &Document, path: &str) -> Evaluated {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((first, rest)) = segments.split_first() else {
        return Evaluated::Missing;
    };
    match doc.get(first).and_then(|v| walk_field(v, rest)) {
        Some(v) => Evaluated::Value(v),
        None => Evaluated::Missing,
    }
}

fn walk_field(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((segment, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(doc) => doc.get(segment).and_then(|v| walk_field(v, rest)),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter(|item| matches!(item, Value::Object(_) | Value::Array(_)))
                .filter_map(|item| walk_field(item, segments))
                .collect(),
        )),
        _ => None,
    }
}

fn type_error(code: i32, message: String) -> ShadowDbError {
    ShadowDbError::command(code, message)
}

/// String coercion shared by `$toUpper`, `$toLower`, `$substr` and `$strcasecmp`
fn coerce_to_string(op: &str, value: &Evaluated) -> Result<String> {
    match value {
        Evaluated::Missing | Evaluated::Value(Value::Null) => Ok(String::new()),
        Evaluated::Value(Value::String(s)) => Ok(s.clone()),
        Evaluated::Value(v @ (Value::Int32(_) | Value::Int64(_) | Value::Double(_))) => Ok(v.to_string()),
        Evaluated::Value(Value::DateTime(ms)) => Ok(Utc
            .timestamp_millis_opt(*ms)
            .single()
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            .unwrap_or_default()),
        Evaluated::Value(other) => Err(type_error(
            codes::STRING_COERCION,
            format!("{}: can't convert from BSON type {} to String", op, other.type_name()),
        )),
    }
}

fn require_number(op: &str, value: &Value) -> Result<Number> {
    value.as_number().ok_or_else(|| {
        type_error(
            codes::NON_NUMERIC_OPERAND,
            format!("{} only supports numeric types, not {}", op, value.type_name()),
        )
    })
}

/// Integer result narrowed to Int32 when both inputs were Int32 and it fits
fn integer_result(value: i64, narrow: bool) -> Value {
    match i32::try_from(value) {
        Ok(small) if narrow => Value::Int32(small),
        _ => Value::Int64(value),
    }
}

fn both_int32(a: &Value, b: &Value) -> bool {
    matches!(a, Value::Int32(_)) && matches!(b, Value::Int32(_))
}

fn add_pair(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::DateTime(ms), n) | (n, Value::DateTime(ms)) if n.is_number() => {
            let offset = n.as_f64().unwrap_or(0.0).round() as i64;
            return Ok(Value::DateTime(ms + offset));
        }
        _ => {}
    }
    match (require_number("$add", a)?, require_number("$add", b)?) {
        (Number::Int(x), Number::Int(y)) => Ok(match x.checked_add(y) {
            Some(sum) => integer_result(sum, both_int32(a, b)),
            None => Value::Double(x as f64 + y as f64),
        }),
        (x, y) => Ok(Value::Double(x.as_f64() + y.as_f64())),
    }
}

fn multiply_pair(a: &Value, b: &Value) -> Result<Value> {
    match (require_number("$multiply", a)?, require_number("$multiply", b)?) {
        (Number::Int(x), Number::Int(y)) => Ok(match x.checked_mul(y) {
            Some(product) => integer_result(product, both_int32(a, b)),
            None => Value::Double(x as f64 * y as f64),
        }),
        (x, y) => Ok(Value::Double(x.as_f64() * y.as_f64())),
    }
}

fn subtract(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::DateTime(x), Value::DateTime(y)) => return Ok(Value::Int64(x - y)),
        (Value::DateTime(x), n) if n.is_number() => {
            return Ok(Value::DateTime(x - n.as_f64().unwrap_or(0.0).round() as i64))
        }
        _ => {}
    }
    match (require_number("$subtract", a)?, require_number("$subtract", b)?) {
        (Number::Int(x), Number::Int(y)) => Ok(match x.checked_sub(y) {
            Some(diff) => integer_result(diff, both_int32(a, b)),
            None => Value::Double(x as f64 - y as f64),
        }),
        (x, y) => Ok(Value::Double(x.as_f64() - y.as_f64())),
    }
}

fn three_way(ord: Ordering) -> Value {
    Value::Int32(match ord {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

fn missing_argument(op: &str) -> ShadowDbError {
    ShadowDbError::command(
        codes::WRONG_OPERAND_COUNT,
        format!("{}: argument is missing", op),
    )
}

/// Comparison operand: Missing sorts below every value
fn compare_evaluated(a: &Evaluated, b: &Evaluated) -> Ordering {
    match (a.as_value(), b.as_value()) {
        (Some(x), Some(y)) => x.cmp(y),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
    }
}

/// `$and`/`$or` operands: a single operand evaluating to an array folds over
/// its elements
fn logical_operands(args: &[Expr], doc: &Document) -> Result<Vec<bool>> {
    if let [only] = args {
        if let Evaluated::Value(Value::Array(items)) = only.evaluate(doc)? {
            return Ok(items.iter().map(Value::is_truthy).collect());
        }
    }
    args.iter().map(|arg| Ok(arg.evaluate(doc)?.is_truthy())).collect()
}

impl Operator {
    fn evaluate(&self, doc: &Document) -> Result<Evaluated> {
        let value = match self {
            Operator::Concat(args) => {
                let mut out = String::new();
                for arg in args {
                    match arg.evaluate(doc)? {
                        Evaluated::Missing | Evaluated::Value(Value::Null) => {
                            return Ok(Evaluated::Value(Value::Null))
                        }
                        Evaluated::Value(Value::String(s)) => out.push_str(&s),
                        Evaluated::Value(other) => {
                            return Err(type_error(
                                codes::CONCAT_REQUIRES_STRINGS,
                                format!("$concat only supports strings, not {}", other.type_name()),
                            ))
                        }
                    }
                }
                Value::String(out)
            }
            Operator::IfNull(args) => {
                let [expr, fallback] = args.as_ref();
                let first = expr.evaluate(doc)?;
                return if first.is_nullish() {
                    fallback.evaluate(doc)
                } else {
                    Ok(first)
                };
            }
            Operator::Strcasecmp(args) => {
                let [a, b] = args.as_ref();
                let (a, b) = (a.evaluate(doc)?, b.evaluate(doc)?);
                if a.is_missing() || b.is_missing() {
                    return Err(missing_argument("$strcasecmp"));
                }
                let left = coerce_to_string("$strcasecmp", &a)?.to_uppercase();
                let right = coerce_to_string("$strcasecmp", &b)?.to_uppercase();
                three_way(left.cmp(&right))
            }
            Operator::Cmp(args) => {
                let [a, b] = args.as_ref();
                let (a, b) = (a.evaluate(doc)?, b.evaluate(doc)?);
                if a.is_missing() || b.is_missing() {
                    return Err(missing_argument("$cmp"));
                }
                three_way(compare_evaluated(&a, &b))
            }
            Operator::Substr(args) => {
                let [string, start, length] = args.as_ref();
                let text = coerce_to_string("$substr", &string.evaluate(doc)?)?;
                let start = require_number("$substr", &start.evaluate_value(doc)?)?.as_f64();
                let length = require_number("$substr", &length.evaluate_value(doc)?)?.as_f64();
                let chars: Vec<char> = text.chars().collect();
                if start < 0.0 || length < 0.0 || start as usize >= chars.len() {
                    Value::String(String::new())
                } else {
                    let from = start as usize;
                    let to = from.saturating_add(length as usize).min(chars.len());
                    Value::String(chars[from..to].iter().collect())
                }
            }
            Operator::ToUpper(arg) => {
                Value::String(coerce_to_string("$toUpper", &arg.evaluate(doc)?)?.to_uppercase())
            }
            Operator::ToLower(arg) => {
                Value::String(coerce_to_string("$toLower", &arg.evaluate(doc)?)?.to_lowercase())
            }
            Operator::Size(arg) => match arg.evaluate(doc)? {
                Evaluated::Missing => return Ok(Evaluated::Missing),
                Evaluated::Value(Value::Array(items)) => integer_result(items.len() as i64, true),
                Evaluated::Value(other) => {
                    return Err(type_error(
                        codes::SIZE_REQUIRES_ARRAY,
                        format!("The argument to $size must be an Array, but was of type: {}", other.type_name()),
                    ))
                }
            },
            Operator::And(args) => Value::Bool(logical_operands(args, doc)?.into_iter().all(|b| b)),
            Operator::Or(args) => Value::Bool(logical_operands(args, doc)?.into_iter().any(|b| b)),
            Operator::Not(arg) => Value::Bool(!arg.evaluate(doc)?.is_truthy()),
            Operator::Compare(cmp, args) => {
                let [a, b] = args.as_ref();
                let ord = compare_evaluated(&a.evaluate(doc)?, &b.evaluate(doc)?);
                Value::Bool(cmp.holds(ord))
            }
            Operator::Add(args) => {
                let mut total = Value::Int32(0);
                for arg in args {
                    let v = arg.evaluate(doc)?;
                    if v.is_nullish() {
                        return Ok(Evaluated::Value(Value::Null));
                    }
                    total = add_pair(&total, &v.or_null())?;
                }
                total
            }
            Operator::Multiply(args) => {
                let mut total = Value::Int32(1);
                for arg in args {
                    let v = arg.evaluate(doc)?;
                    if v.is_nullish() {
                        return Ok(Evaluated::Value(Value::Null));
                    }
                    total = multiply_pair(&total, &v.or_null())?;
                }
                total
            }
            Operator::Subtract(args) => {
                let [a, b] = args.as_ref();
                let (a, b) = (a.evaluate(doc)?, b.evaluate(doc)?);
                if a.is_nullish() || b.is_nullish() {
                    Value::Null
                } else {
                    subtract(&a.or_null(), &b.or_null())?
                }
            }
            Operator::Divide(args) => {
                let [a, b] = args.as_ref();
                let (a, b) = (a.evaluate(doc)?, b.evaluate(doc)?);
                if a.is_nullish() || b.is_nullish() {
                    Value::Null
                } else {
                    let dividend = require_number("$divide", &a.or_null())?.as_f64();
                    let divisor = require_number("$divide", &b.or_null())?.as_f64();
                    if divisor == 0.0 {
                        return Err(type_error(codes::DIVIDE_BY_ZERO, "can't $divide by zero".to_string()));
                    }
                    Value::Double(dividend / divisor)
                }
            }
            Operator::Mod(args) => {
                let [a, b] = args.as_ref();
                let (a, b) = (a.evaluate(doc)?, b.evaluate(doc)?);
                if a.is_nullish() || b.is_nullish() {
                    Value::Null
                } else {
                    let (left, right) = (a.or_null(), b.or_null());
                    match (require_number("$mod", &left)?, require_number("$mod", &right)?) {
                        (_, Number::Int(0)) => {
                            return Err(type_error(codes::MOD_BY_ZERO, "can't $mod by zero".to_string()))
                        }
                        (Number::Int(x), Number::Int(y)) => integer_result(x % y, both_int32(&left, &right)),
                        (_, y) if y.as_f64() == 0.0 => {
                            return Err(type_error(codes::MOD_BY_ZERO, "can't $mod by zero".to_string()))
                        }
                        (x, y) => Value::Double(x.as_f64() % y.as_f64()),
                    }
                }
            }
            Operator::Cond(args) => {
                let [condition, then, otherwise] = args.as_ref();
                return if condition.evaluate(doc)?.is_truthy() {
                    then.evaluate(doc)
                } else {
                    otherwise.evaluate(doc)
                };
            }
            Operator::Date(part, arg) => {
                let evaluated = arg.evaluate(doc)?;
                let date = evaluated
                    .as_value()
                    .and_then(Value::as_datetime)
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .ok_or_else(|| {
                        let type_name = evaluated.as_value().map(Value::type_name).unwrap_or("missing");
                        type_error(
                            codes::DATE_OPERAND_REQUIRED,
                            format!("can't convert from BSON type {} to Date", type_name),
                        )
                    })?;
                Value::Int32(part.extract(&date))
            }
        };
        Ok(Evaluated::Value(value))
    }
}
