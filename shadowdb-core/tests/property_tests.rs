//! Property-based tests for the engine's invariants
//!
//! Uses proptest to check index uniqueness, projection validation, pipeline
//! stage contracts and the canonical value order over generated inputs.

use proptest::prelude::*;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use shadowdb_core::expression::Expr;
use shadowdb_core::projection::Projection;
use shadowdb_core::{DatabaseCore, Document, IndexOptions, ShadowDbError, Value};

// ============================================================================
// Test Strategies
// ============================================================================

/// Scalar JSON values covering every scalar type family
fn scalar_strategy() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i32>().prop_map(serde_json::Value::from),
        (i64::from(i32::MAX) + 1..i64::MAX).prop_map(serde_json::Value::from),
        (-1.0e6f64..1.0e6).prop_map(serde_json::Value::from),
        "[a-z]{0,8}".prop_map(serde_json::Value::from),
    ]
}

/// Scalars plus small arrays and objects
fn value_strategy() -> impl Strategy<Value = serde_json::Value> {
    scalar_strategy().prop_recursive(2, 12, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
            prop::collection::btree_map("[a-c]", inner, 0..3)
                .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
        ]
    })
}

fn field_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,6}".prop_filter("not the id field", |f| f != "id")
}

fn doc(v: serde_json::Value) -> Document {
    Document::from_json(&v).unwrap()
}

fn hash_of(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

// ============================================================================
// Index Properties
// ============================================================================

proptest! {
    /// Documents missing the key never collide on a unique sparse index
    #[test]
    fn prop_sparse_unique_ignores_missing(count in 2usize..20) {
        let mut db = DatabaseCore::new("prop");
        db.create_index("c", &doc(json!({"k": 1})), IndexOptions::new().unique(true).sparse(true)).unwrap();
        for i in 0..count {
            let res = db.insert("c", doc(json!({"other": i})));
            prop_assert!(res.is_ok());
        }
        prop_assert_eq!(db.count("c", &Document::new(), None, None).unwrap(), count);
    }

    /// Equal present keys always collide on a unique sparse index
    #[test]
    fn prop_sparse_unique_rejects_equal_keys(key in scalar_strategy()) {
        let mut db = DatabaseCore::new("prop");
        db.create_index("c", &doc(json!({"k": 1})), IndexOptions::new().unique(true).sparse(true)).unwrap();
        db.insert("c", doc(json!({"k": key.clone()}))).unwrap();
        let err = db.insert("c", doc(json!({"k": key}))).unwrap_err();
        prop_assert!(matches!(err, ShadowDbError::DuplicateKey { .. }), "expected DuplicateKey");
        prop_assert_eq!(db.count("c", &Document::new(), None, None).unwrap(), 1);
    }
}

proptest! {
    /// Range filters return the same documents with and without an index
    #[test]
    fn prop_indexed_range_matches_scan(
        rows in prop::collection::vec(
            prop_oneof![
                (-5i32..5).prop_map(serde_json::Value::from),
                prop::collection::vec(-5i32..5, 0..4).prop_map(serde_json::Value::from),
            ],
            0..12,
        ),
        low in -5i32..5,
        high in -5i32..5,
        strict in any::<bool>(),
    ) {
        let (gt, lt) = if strict { ("$gt", "$lt") } else { ("$gte", "$lte") };
        let filters = [
            json!({"a": {gt: low, lt: high}}),
            json!({"a": {lt: high, gt: low}}),
            json!({"a": {"$eq": low, gt: high}}),
        ];
        let mut db = DatabaseCore::new("prop");
        for (i, a) in rows.iter().enumerate() {
            db.insert("c", doc(json!({"_id": i, "a": a}))).unwrap();
        }
        let unindexed: Vec<Vec<Document>> = filters
            .iter()
            .map(|f| db.find("c", &doc(f.clone()), None).unwrap())
            .collect();

        db.create_index("c", &doc(json!({"a": 1})), IndexOptions::new()).unwrap();
        for (f, expected) in filters.iter().zip(&unindexed) {
            let mut indexed = db.find("c", &doc(f.clone()), None).unwrap();
            let mut expected = expected.clone();
            indexed.sort();
            expected.sort();
            prop_assert_eq!(indexed, expected);
        }
    }
}

// ============================================================================
// Projection Properties
// ============================================================================

proptest! {
    /// Mixing inclusion and exclusion outside `_id` is always rejected
    #[test]
    fn prop_mixed_projection_rejected(
        included in field_strategy(),
        excluded in field_strategy(),
        include_flag in prop_oneof![Just(json!(1)), Just(json!(true)), Just(json!(2.5))],
        exclude_flag in prop_oneof![Just(json!(0)), Just(json!(false))],
    ) {
        prop_assume!(included != excluded);
        prop_assume!(!included.starts_with(&excluded) && !excluded.starts_with(&included));
        let spec = doc(json!({included: include_flag, excluded: exclude_flag}));
        let err = Projection::parse(&spec).unwrap_err();
        prop_assert!(matches!(err, ShadowDbError::InvalidProjection(_)), "expected InvalidProjection");
    }
}

// ============================================================================
// Pipeline Properties
// ============================================================================

proptest! {
    /// `[x]` unwinds to one document with the field replaced by `x`
    #[test]
    fn prop_unwind_singleton(x in value_strategy(), extra in scalar_strategy()) {
        let mut db = DatabaseCore::new("prop");
        db.insert("c", doc(json!({"_id": 1, "arr": [x.clone()], "extra": extra.clone()}))).unwrap();
        db.insert("c", doc(json!({"_id": 2, "arr": []}))).unwrap();
        let out = db.aggregate_json("c", &json!([{"$unwind": "$arr"}])).unwrap();
        prop_assert_eq!(out.len(), 1);
        prop_assert_eq!(out[0].clone(), doc(json!({"_id": 1, "arr": x, "extra": extra})));
    }

    /// Every left document appears exactly once after `$lookup`
    #[test]
    fn prop_lookup_preserves_left(
        left in prop::collection::vec(0i32..5, 0..12),
        right in prop::collection::vec(0i32..5, 0..12),
    ) {
        let mut db = DatabaseCore::new("prop");
        for (i, k) in left.iter().enumerate() {
            db.insert("left", doc(json!({"_id": i, "k": k}))).unwrap();
        }
        for (i, k) in right.iter().enumerate() {
            db.insert("right", doc(json!({"_id": i, "k": k}))).unwrap();
        }
        let out = db
            .aggregate_json(
                "left",
                &json!([{"$lookup": {"from": "right", "localField": "k", "foreignField": "k", "as": "joined"}}]),
            )
            .unwrap();

        prop_assert_eq!(out.len(), left.len());
        for (i, (k, joined)) in left.iter().zip(&out).enumerate() {
            prop_assert_eq!(joined.id().cloned(), Some(Value::from(i as i64)));
            let matches = right.iter().filter(|r| *r == k).count();
            let got = joined.get("joined").and_then(Value::as_array).map(Vec::len);
            prop_assert_eq!(got, Some(matches));
        }
    }

    /// `$out` leaves exactly the pipeline output in the target
    #[test]
    fn prop_out_round_trip(
        values in prop::collection::vec(scalar_strategy(), 0..10),
        prior in 0usize..5,
    ) {
        let mut db = DatabaseCore::new("prop");
        for (i, v) in values.iter().enumerate() {
            db.insert("src", doc(json!({"_id": i, "v": v}))).unwrap();
        }
        for i in 0..prior {
            db.insert("dst", doc(json!({"_id": format!("old{}", i)}))).unwrap();
        }
        let out = db
            .aggregate_json("src", &json!([{"$sort": {"v": 1}}, {"$out": "dst"}]))
            .unwrap();
        let stored = db.find("dst", &Document::new(), None).unwrap();

        let mut expected = out.clone();
        let mut actual = stored;
        expected.sort();
        actual.sort();
        prop_assert_eq!(expected, actual);
        prop_assert_eq!(out.len(), values.len());
    }
}

// ============================================================================
// Expression Properties
// ============================================================================

proptest! {
    /// `$strcasecmp` fails on arity exactly when it does not get two operands
    #[test]
    fn prop_strcasecmp_arity(args in prop::collection::vec("[a-z]{0,4}", 0..5), a in "[a-z]{0,4}") {
        let expr = Expr::parse(&Value::from_json(&json!({"$strcasecmp": args.clone()})));
        let input = doc(json!({"a": a}));
        match expr.and_then(|e| e.evaluate(&input)) {
            Ok(_) => prop_assert_eq!(args.len(), 2),
            Err(err) => {
                prop_assert_ne!(args.len(), 2);
                prop_assert_eq!(err.code(), 16020);
            }
        }
    }
}

// ============================================================================
// Ordering Properties
// ============================================================================

proptest! {
    /// The canonical order is antisymmetric and agrees with equality
    #[test]
    fn prop_order_consistent(a in value_strategy(), b in value_strategy()) {
        let (a, b) = (Value::from_json(&a), Value::from_json(&b));
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
        if a == b {
            prop_assert_eq!(hash_of(&a), hash_of(&b));
        }
    }

    /// Equal numbers compare and hash equal across numeric types
    #[test]
    fn prop_numeric_widths_agree(n in any::<i32>()) {
        let int32 = Value::Int32(n);
        let int64 = Value::Int64(i64::from(n));
        let double = Value::Double(f64::from(n));
        prop_assert_eq!(&int32, &int64);
        prop_assert_eq!(&int64, &double);
        prop_assert_eq!(hash_of(&int32), hash_of(&double));
    }
}
