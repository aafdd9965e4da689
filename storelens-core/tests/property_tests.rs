//! Property-based tests for the pipeline evaluator and aggregation functions.
//!
//! These check invariants that must hold for any input data and any
//! insertion order.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use storelens_core::functions;
use storelens_core::Database;

// ============================================================================
// Test Strategies
// ============================================================================

/// Strategy: (order key, price in cents) pairs
fn items_strategy() -> impl Strategy<Value = Vec<(u8, i64)>> {
    prop::collection::vec((0u8..6, 0i64..100_000), 0..40)
}

/// Strategy: finite prices
fn prices_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.0f64..10_000.0, 1..50)
}

fn orders_from(items: &[(u8, i64)]) -> Vec<Value> {
    let mut by_order: BTreeMap<u8, Vec<Value>> = BTreeMap::new();
    for (order, cents) in items {
        by_order.entry(*order).or_default().push(json!({"price": cents}));
    }
    by_order
        .into_iter()
        .map(|(order, items)| json!({"order": order, "items": items}))
        .collect()
}

fn sums_by_order(db: &Database) -> BTreeMap<u64, i64> {
    db.collection("orders")
        .aggregate(&json!([
            {"$unwind": "$items"},
            {"$group": {"_id": "$order", "total": {"$sum": "$items.price"}}}
        ]))
        .unwrap()
        .into_iter()
        .map(|row| (row["_id"].as_u64().unwrap(), row["total"].as_i64().unwrap()))
        .collect()
}

// ============================================================================
// Group Property Tests
// ============================================================================

proptest! {
    /// Group + sum over unwound items equals summing by hand, whatever the
    /// insertion order of the orders.
    #[test]
    fn prop_group_sum_matches_direct_iteration(
        (items, shuffled) in items_strategy().prop_flat_map(|items| {
            let orders = orders_from(&items);
            (Just(items), Just(orders).prop_shuffle())
        })
    ) {
        let db = Database::in_memory();
        if !shuffled.is_empty() {
            db.collection("orders").insert_many(shuffled).unwrap();
        }

        let mut expected: BTreeMap<u64, i64> = BTreeMap::new();
        for (order, cents) in &items {
            *expected.entry(*order as u64).or_default() += cents;
        }
        prop_assert_eq!(sums_by_order(&db), expected);
    }

    /// One output document per distinct key; none for empty input.
    #[test]
    fn prop_group_emits_one_row_per_key(keys in prop::collection::vec(0u8..10, 0..30)) {
        let db = Database::in_memory();
        let docs: Vec<Value> = keys.iter().map(|k| json!({"k": k})).collect();
        if !docs.is_empty() {
            db.collection("rows").insert_many(docs).unwrap();
        }
        let rows = db
            .collection("rows")
            .aggregate(&json!([{"$group": {"_id": "$k", "n": {"$sum": 1}}}]))
            .unwrap();
        let distinct: BTreeSet<u8> = keys.iter().copied().collect();
        prop_assert_eq!(rows.len(), distinct.len());
        let counted: u64 = rows.iter().map(|r| r["n"].as_u64().unwrap()).sum();
        prop_assert_eq!(counted, keys.len() as u64);
    }
}

// ============================================================================
// Sort & Bucket Property Tests
// ============================================================================

proptest! {
    /// Documents with equal sort keys keep their input order.
    #[test]
    fn prop_sort_is_stable(keys in prop::collection::vec(0u8..4, 1..40)) {
        let db = Database::in_memory();
        let docs: Vec<Value> = keys
            .iter()
            .enumerate()
            .map(|(seq, k)| json!({"k": k, "seq": seq}))
            .collect();
        db.collection("rows").insert_many(docs).unwrap();
        let rows = db
            .collection("rows")
            .aggregate(&json!([{"$sort": {"k": -1}}]))
            .unwrap();
        for pair in rows.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(a["k"].as_u64() >= b["k"].as_u64());
            if a["k"] == b["k"] {
                prop_assert!(a["seq"].as_u64() < b["seq"].as_u64());
            }
        }
    }

    /// Buckets never exceed the requested count and cover every document.
    #[test]
    fn prop_bucket_auto_covers_input(
        values in prop::collection::vec(0i64..50, 1..60),
        buckets in 1usize..8,
    ) {
        let db = Database::in_memory();
        let docs: Vec<Value> = values.iter().map(|v| json!({"v": v})).collect();
        db.collection("rows").insert_many(docs).unwrap();
        let rows = db
            .collection("rows")
            .aggregate(&json!([{"$bucketAuto": {"groupBy": "$v", "buckets": buckets}}]))
            .unwrap();
        prop_assert!(rows.len() <= buckets);
        let counted: u64 = rows.iter().map(|r| r["count"].as_u64().unwrap()).sum();
        prop_assert_eq!(counted, values.len() as u64);
        for pair in rows.windows(2) {
            prop_assert_eq!(&pair[0]["_id"]["max"], &pair[1]["_id"]["min"]);
        }
    }
}

// ============================================================================
// Function Library Property Tests
// ============================================================================

proptest! {
    /// The median lies between the minimum and maximum.
    #[test]
    fn prop_median_within_bounds(prices in prices_strategy()) {
        let median = functions::median(&prices).unwrap();
        let lo = prices.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(median >= lo && median <= hi);
    }

    /// Sum is independent of input order.
    #[test]
    fn prop_sum_order_independent(
        (values, shuffled) in prop::collection::vec(-1_000i64..1_000, 0..30)
            .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
    ) {
        let a: Vec<Value> = values.iter().map(|v| json!(v)).collect();
        let b: Vec<Value> = shuffled.iter().map(|v| json!(v)).collect();
        prop_assert_eq!(functions::sum(&a), functions::sum(&b));
        prop_assert_eq!(functions::sum(&a), json!(values.iter().sum::<i64>()));
    }

    /// Ratio is undefined exactly when the denominator is zero.
    #[test]
    fn prop_ratio_undefined_only_for_zero(a in -1e6f64..1e6, b in -1e6f64..1e6) {
        let result = functions::ratio(a, b);
        if b == 0.0 {
            prop_assert!(result.is_err());
        } else {
            prop_assert_eq!(result.unwrap(), a / b);
        }
    }
}
