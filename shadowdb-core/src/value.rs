// src/value.rs
//! Tagged document values
//!
//! `Value` is the closed set of types a stored document may contain. It carries
//! the server's canonical cross-type ordering, so `Ord`, `Eq` and `Hash` all
//! agree with query semantics: numbers compare by value regardless of width
//! (`12 == 12L == 12.0`) and distinct types sort by their canonical rank.
//!
//! ```text
//! MinKey < Null < Numbers < String < Object < Array < Binary < ObjectId < Bool < Date < MaxKey
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::document::Document;
use crate::error::{Result, ShadowDbError};

// ============================================================================
// OBJECT ID
// ============================================================================

lazy_static! {
    /// Five random bytes fixed for the lifetime of the process
    static ref PROCESS_UNIQUE: [u8; 5] = {
        let entropy = uuid::Uuid::new_v4();
        let bytes = entropy.as_bytes();
        [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]]
    };
    static ref OID_COUNTER: AtomicU32 = {
        let entropy = uuid::Uuid::new_v4();
        let b = entropy.as_bytes();
        AtomicU32::new(u32::from_be_bytes([0, b[5], b[6], b[7]]))
    };
}

/// 12-byte object identifier: 4-byte timestamp, 5 process bytes, 3-byte counter
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        let secs = Utc::now().timestamp() as u32;
        let counter = OID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&PROCESS_UNIQUE[..]);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        ObjectId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// Parse a 24-character hex string
    pub fn parse_hex(s: &str) -> Result<Self> {
        let raw = decode_hex(s)
            .ok_or_else(|| ShadowDbError::InvalidArgument(format!("invalid ObjectId '{}'", s)))?;
        let bytes: [u8; 12] = raw
            .try_into()
            .map_err(|_| ShadowDbError::InvalidArgument(format!("invalid ObjectId '{}'", s)))?;
        Ok(ObjectId(bytes))
    }

    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }

    /// Seconds since the epoch encoded in the first four bytes
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId(\"{}\")", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

// ============================================================================
// VALUE
// ============================================================================

/// A document value
#[derive(Debug, Clone)]
pub enum Value {
    MinKey,
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Object(Document),
    /// Milliseconds since the Unix epoch, UTC
    DateTime(i64),
    ObjectId(ObjectId),
    Binary(Vec<u8>),
    MaxKey,
}

/// Numeric view used for cross-width comparison and arithmetic
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

impl Value {
    /// Position in the canonical cross-type order
    pub fn canonical_rank(&self) -> u8 {
        match self {
            Value::MinKey => 0,
            Value::Null => 1,
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) => 2,
            Value::String(_) => 3,
            Value::Object(_) => 4,
            Value::Array(_) => 5,
            Value::Binary(_) => 6,
            Value::ObjectId(_) => 7,
            Value::Bool(_) => 8,
            Value::DateTime(_) => 9,
            Value::MaxKey => 10,
        }
    }

    /// Server type code, as accepted by `$type`
    pub fn type_code(&self) -> i32 {
        match self {
            Value::Double(_) => 1,
            Value::String(_) => 2,
            Value::Object(_) => 3,
            Value::Array(_) => 4,
            Value::Binary(_) => 5,
            Value::ObjectId(_) => 7,
            Value::Bool(_) => 8,
            Value::DateTime(_) => 9,
            Value::Null => 10,
            Value::Int32(_) => 16,
            Value::Int64(_) => 18,
            Value::MinKey => -1,
            Value::MaxKey => 127,
        }
    }

    /// Server type alias, as accepted by `$type`
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::Binary(_) => "binData",
            Value::ObjectId(_) => "objectId",
            Value::Bool(_) => "bool",
            Value::DateTime(_) => "date",
            Value::Null => "null",
            Value::Int32(_) => "int",
            Value::Int64(_) => "long",
            Value::MinKey => "minKey",
            Value::MaxKey => "maxKey",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int32(_) | Value::Int64(_) | Value::Double(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Int32(i) => Some(Number::Int(*i as i64)),
            Value::Int64(i) => Some(Number::Int(*i)),
            Value::Double(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_number().map(Number::as_f64)
    }

    /// Integral value of an integer tag, or of a double with no fractional part
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(i) => Some(*i as i64),
            Value::Int64(i) => Some(*i),
            Value::Double(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Object(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_document_mut(&mut self) -> Option<&mut Document> {
        match self {
            Value::Object(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<i64> {
        match self {
            Value::DateTime(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Boolean coercion used by `$and`/`$or`/`$cond`: false, null and zero are falsy
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int32(i) => *i != 0,
            Value::Int64(i) => *i != 0,
            Value::Double(f) => *f != 0.0,
            _ => true,
        }
    }

    /// DateTime from a chrono UTC timestamp
    pub fn from_datetime(dt: DateTime<Utc>) -> Value {
        Value::DateTime(dt.timestamp_millis())
    }

    // ========== JSON CONVERSION ==========

    /// Convert from JSON, decoding extended-JSON wrappers such as `{"$oid": ..}`
    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match i32::try_from(i) {
                        Ok(small) => Value::Int32(small),
                        Err(_) => Value::Int64(i),
                    }
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => {
                if map.len() == 1 {
                    if let Some(special) = decode_extended(map) {
                        return special;
                    }
                }
                Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Convert to relaxed extended JSON
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::MinKey => serde_json::json!({"$minKey": 1}),
            Value::MaxKey => serde_json::json!({"$maxKey": 1}),
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int32(i) => JsonValue::from(*i),
            Value::Int64(i) => JsonValue::from(*i),
            Value::Double(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(doc) => doc.to_json(),
            Value::DateTime(ms) => serde_json::json!({"$date": ms}),
            Value::ObjectId(oid) => serde_json::json!({"$oid": oid.to_hex()}),
            Value::Binary(bytes) => serde_json::json!({"$binary": encode_hex(bytes)}),
        }
    }
}

fn decode_extended(map: &serde_json::Map<String, JsonValue>) -> Option<Value> {
    let (key, inner) = map.iter().next()?;
    match key.as_str() {
        "$oid" => ObjectId::parse_hex(inner.as_str()?).ok().map(Value::ObjectId),
        "$date" => match inner {
            JsonValue::Number(n) => n.as_i64().map(Value::DateTime),
            JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| Value::DateTime(dt.timestamp_millis())),
            _ => None,
        },
        "$numberLong" => inner.as_str()?.parse::<i64>().ok().map(Value::Int64),
        "$binary" => decode_hex(inner.as_str()?).map(Value::Binary),
        "$minKey" => Some(Value::MinKey),
        "$maxKey" => Some(Value::MaxKey),
        _ => None,
    }
}

// ============================================================================
// ORDERING
// ============================================================================

fn compare_f64(a: f64, b: f64) -> Ordering {
    // NaN sorts below every other number
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Greater;
    }
    if f >= 9_223_372_036_854_775_807.0 {
        return Ordering::Less;
    }
    if f < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let truncated = f.trunc();
    match i.cmp(&(truncated as i64)) {
        Ordering::Equal => {
            if f > truncated {
                Ordering::Less
            } else if f < truncated {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

pub fn compare_numbers(a: Number, b: Number) -> Ordering {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x.cmp(&y),
        (Number::Float(x), Number::Float(y)) => compare_f64(x, y),
        (Number::Int(x), Number::Float(y)) => compare_int_float(x, y),
        (Number::Float(x), Number::Int(y)) => compare_int_float(y, x).reverse(),
    }
}

pub(crate) fn compare_documents(a: &Document, b: &Document) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        let ord = va
            .canonical_rank()
            .cmp(&vb.canonical_rank())
            .then_with(|| ka.cmp(kb))
            .then_with(|| va.cmp(vb));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.canonical_rank().cmp(&other.canonical_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => compare_documents(a, b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Value::ObjectId(a), Value::ObjectId(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => compare_numbers(x, y),
                // MinKey, Null and MaxKey are singletons within their rank
                _ => Ordering::Equal,
            },
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_rank().hash(state);
        match self {
            Value::MinKey | Value::Null | Value::MaxKey => {}
            Value::Bool(b) => b.hash(state),
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) => match self.as_number() {
                Some(Number::Int(i)) => i.hash(state),
                Some(Number::Float(f)) => {
                    if f.is_nan() {
                        u64::MAX.hash(state);
                    } else if f.fract() == 0.0 && f.abs() < 9.2e18 {
                        (f as i64).hash(state);
                    } else {
                        f.to_bits().hash(state);
                    }
                }
                None => {}
            },
            Value::String(s) => s.hash(state),
            Value::Array(items) => {
                items.len().hash(state);
                for item in items {
                    item.hash(state);
                }
            }
            Value::Object(doc) => {
                doc.len().hash(state);
                for (k, v) in doc.iter() {
                    k.hash(state);
                    v.hash(state);
                }
            }
            Value::DateTime(ms) => ms.hash(state),
            Value::ObjectId(oid) => oid.hash(state),
            Value::Binary(bytes) => bytes.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        Value::from_json(&json)
    }
}

impl From<&JsonValue> for Value {
    fn from(json: &JsonValue) -> Self {
        Value::from_json(json)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int32(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int64(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Double(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc)
    }
}

impl From<ObjectId> for Value {
    fn from(oid: ObjectId) -> Self {
        Value::ObjectId(oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_numeric_equality_across_widths() {
        assert_eq!(Value::Int32(12), Value::Int64(12));
        assert_eq!(Value::Int64(12), Value::Double(12.0));
        assert_ne!(Value::Int32(12), Value::Double(12.5));
        assert_eq!(hash_of(&Value::Int32(12)), hash_of(&Value::Double(12.0)));
        assert_eq!(hash_of(&Value::Int64(-3)), hash_of(&Value::Double(-3.0)));
    }

    #[test]
    fn test_int_float_ordering() {
        assert!(Value::Int32(3) < Value::Double(3.5));
        assert!(Value::Double(2.5) < Value::Int64(3));
        assert!(Value::Int64(i64::MAX) < Value::Double(1e19));
        assert!(Value::Double(f64::NAN) < Value::Int32(i32::MIN));
    }

    #[test]
    fn test_canonical_type_order() {
        let ordered = vec![
            Value::MinKey,
            Value::Null,
            Value::Int32(100),
            Value::from("a"),
            Value::from(json!({"a": 1})),
            Value::from(json!([1])),
            Value::Binary(vec![1]),
            Value::ObjectId(ObjectId::from_bytes([0; 12])),
            Value::Bool(false),
            Value::DateTime(0),
            Value::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{:?} < {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_object_equality_is_order_sensitive() {
        let a = Value::from(json!({"x": 1, "y": 2}));
        let b = Value::from(json!({"y": 2, "x": 1}));
        assert_ne!(a, b);
        assert_eq!(a, Value::from(json!({"x": 1.0, "y": 2})));
    }

    #[test]
    fn test_from_json_numbers() {
        assert!(matches!(Value::from(json!(5)), Value::Int32(5)));
        assert!(matches!(Value::from(json!(5_000_000_000i64)), Value::Int64(_)));
        assert!(matches!(Value::from(json!(1.5)), Value::Double(_)));
    }

    #[test]
    fn test_extended_json() {
        let oid = ObjectId::new();
        let v = Value::from(json!({"$oid": oid.to_hex()}));
        assert_eq!(v, Value::ObjectId(oid));

        let d = Value::from(json!({"$date": 1400000000000i64}));
        assert_eq!(d, Value::DateTime(1_400_000_000_000));

        let iso = Value::from(json!({"$date": "2014-05-13T16:53:20Z"}));
        assert_eq!(iso, Value::DateTime(1_400_000_000_000));

        let long = Value::from(json!({"$numberLong": "12"}));
        assert!(matches!(long, Value::Int64(12)));

        // Two keys: ordinary object
        let plain = Value::from(json!({"$date": 1, "x": 2}));
        assert!(matches!(plain, Value::Object(_)));
    }

    #[test]
    fn test_to_json() {
        let v = Value::from(json!({"a": [1, "b", null], "d": {"$date": 5}}));
        assert_eq!(v.to_json(), json!({"a": [1, "b", null], "d": {"$date": 5}}));
    }

    #[test]
    fn test_object_id_generation() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_hex().len(), 24);
        assert_eq!(ObjectId::parse_hex(&a.to_hex()).unwrap(), a);
        assert!(ObjectId::parse_hex("zz").is_err());
        assert!(a.timestamp() > 1_600_000_000);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int32(0).is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::from("").is_truthy());
        assert!(Value::Array(vec![]).is_truthy());
    }
}
