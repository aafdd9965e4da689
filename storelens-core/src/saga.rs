// storelens-core/src/saga.rs
//! Order workflows spanning several collections
//!
//! Writes to different collections are not atomic. Each workflow records
//! what it has done so far in a [`SagaProgress`]; when a later step fails the
//! error is a `PartialFailure` carrying those counts. `place_order` undoes
//! its own inserts before reporting.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::database::{AggregateOptions, Database};
use crate::dates;
use crate::error::{Progress, Result, StoreLensError};
use crate::model::{
    check_delivery_after_approval, retention_cutoff, Order, OrderStatus, Review, ORDERS,
    ORDER_ITEMS, PRODUCTS,
};
use crate::storage::{DeleteResult, UpdateOptions, UpdateResult};

/// Orders whose items sum above this are flagged `expensive`
pub const EXPENSIVE_ORDER_THRESHOLD: f64 = 1000.0;

/// Terminal states whose orders are purged once past retention
pub const PURGEABLE_STATUSES: [OrderStatus; 2] = [OrderStatus::Canceled, OrderStatus::Unavailable];

/// Counts per step of one workflow run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SagaProgress {
    pub workflow: &'static str,
    pub steps: Progress,
}

impl SagaProgress {
    fn new(workflow: &'static str) -> Self {
        SagaProgress {
            workflow,
            steps: Progress::new(),
        }
    }

    fn record(&mut self, step: &str, count: u64) {
        self.steps.record(step, count);
    }

    /// Count recorded for a step; 0 when the step never ran
    pub fn count(&self, step: &str) -> u64 {
        self.steps.get(step).unwrap_or(0)
    }

    fn fail(self, source: StoreLensError) -> StoreLensError {
        StoreLensError::partial(self.workflow, self.steps, source)
    }
}

/// Treat "nothing matched" as zero affected documents
fn or_none_deleted(result: Result<DeleteResult>) -> Result<DeleteResult> {
    match result {
        Err(e) if e.is_not_found() => Ok(DeleteResult::default()),
        other => other,
    }
}

fn or_none_updated(result: Result<UpdateResult>) -> Result<UpdateResult> {
    match result {
        Err(e) if e.is_not_found() => Ok(UpdateResult::default()),
        other => other,
    }
}

/// `inserted` count of a failed ordered insert
fn inserted_before_failure(err: &StoreLensError) -> u64 {
    match err {
        StoreLensError::PartialFailure { progress, .. } => progress.get("inserted").unwrap_or(0),
        _ => 0,
    }
}

fn string_values(docs: &[Value], field: &str) -> Vec<Value> {
    docs.iter()
        .filter_map(|doc| doc.get(field).cloned())
        .collect()
}

// ============================================================================
// ORDER LIFECYCLE
// ============================================================================

/// Insert an order into `orders` and its items into `order_items`
///
/// Every item must reference an existing product. When the items cannot all
/// be inserted, the items already written and the order are removed again.
pub fn place_order(db: &Database, order: &Order) -> Result<SagaProgress> {
    order.validate()?;
    if order.items.is_empty() {
        return Err(StoreLensError::ConstraintViolation(format!(
            "order {} has no items",
            order.order_id
        )));
    }

    let product_ids: BTreeSet<&str> = order.items.iter().map(|i| i.product_id.as_str()).collect();
    let known = db
        .collection(PRODUCTS)
        .count_documents(&json!({"product_id": {"$in": product_ids}}))?;
    if known < product_ids.len() as u64 {
        return Err(StoreLensError::ConstraintViolation(format!(
            "order {} references unknown products",
            order.order_id
        )));
    }

    let mut progress = SagaProgress::new("place_order");
    let orders = db.collection(ORDERS);
    orders.insert_one(order.to_document()?)?;
    progress.record("orders", 1);

    let items = order
        .items
        .iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    match db.collection(ORDER_ITEMS).insert_many(items) {
        Ok(ids) => progress.record("order_items", ids.len() as u64),
        Err(e) => {
            progress.record("order_items", inserted_before_failure(&e));
            let compensated = compensate_order(db, &order.order_id);
            progress.record("compensated", compensated);
            warn!(
                order_id = %order.order_id,
                error = %e,
                compensated,
                "order placement rolled back"
            );
            return Err(progress.fail(e));
        }
    }

    info!(
        order_id = %order.order_id,
        items = order.items.len(),
        total = order.total_value(),
        "order placed"
    );
    Ok(progress)
}

/// Remove what a failed placement wrote; returns the number of documents removed
fn compensate_order(db: &Database, order_id: &str) -> u64 {
    let filter = json!({"order_id": order_id});
    let mut removed = 0;
    match or_none_deleted(db.collection(ORDER_ITEMS).delete_many(&filter)) {
        Ok(result) => removed += result.deleted,
        Err(e) => warn!(order_id, error = %e, "could not remove order items"),
    }
    match or_none_deleted(db.collection(ORDERS).delete_one(&filter)) {
        Ok(result) => removed += result.deleted,
        Err(e) => warn!(order_id, error = %e, "could not remove order"),
    }
    removed
}

/// Move an order to `next`, stamping the status timestamp with the current time
pub fn advance_order_status(db: &Database, order_id: &str, next: OrderStatus) -> Result<UpdateResult> {
    advance_order_status_at(db, order_id, next, Utc::now())
}

/// Move an order to `next` as of `at`
///
/// The move must follow the order lifecycle, and a delivery may not be
/// stamped before the approval. The update only applies while the order is
/// still in the status that was checked, so a concurrent change surfaces as
/// `NotFound` instead of being overwritten.
pub fn advance_order_status_at(
    db: &Database,
    order_id: &str,
    next: OrderStatus,
    at: DateTime<Utc>,
) -> Result<UpdateResult> {
    let orders = db.collection(ORDERS);
    let current_doc = orders
        .find_one(&json!({"order_id": order_id}))?
        .ok_or_else(|| StoreLensError::NotFound(format!("order {}", order_id)))?;
    let current = current_doc
        .get("order_status")
        .and_then(Value::as_str)
        .and_then(OrderStatus::from_str)
        .ok_or_else(|| {
            StoreLensError::ConstraintViolation(format!(
                "order {} has an unknown status {}",
                order_id,
                current_doc.get("order_status").unwrap_or(&Value::Null)
            ))
        })?;
    current.check_transition(next)?;

    let stamp = dates::format_timestamp(&at);
    if next == OrderStatus::Delivered {
        check_delivery_after_approval(
            current_doc.get("order_approved_at").and_then(Value::as_str),
            Some(&stamp),
        )?;
    }

    let mut set = Map::new();
    set.insert("order_status".to_string(), json!(next.as_str()));
    if let Some(field) = next.timestamp_field() {
        set.insert(field.to_string(), json!(stamp));
    }
    let result = orders.update_one(
        &json!({"order_id": order_id, "order_status": current.as_str()}),
        &json!({"$set": set, "$currentDate": {"last_modified": true}}),
    )?;
    info!(order_id, from = %current, to = %next, "order status advanced");
    Ok(result)
}

/// Delete orders purchased more than `retention_years` before `now` that
/// ended canceled or unavailable, together with all their items
///
/// Items go first so a failure never leaves items without their order.
pub fn purge_old_orders(db: &Database, now: DateTime<Utc>, retention_years: u32) -> Result<SagaProgress> {
    let cutoff = retention_cutoff(&now, retention_years);
    let statuses: Vec<&str> = PURGEABLE_STATUSES.iter().map(OrderStatus::as_str).collect();
    let orders = db.collection(ORDERS);
    let stale = orders.find(&json!({
        "order_purchase_timestamp": {"$lt": cutoff},
        "order_status": {"$in": statuses},
    }))?;
    let order_ids = string_values(&stale, "order_id");

    let mut progress = SagaProgress::new("purge_old_orders");
    progress.record("orders_selected", order_ids.len() as u64);
    if order_ids.is_empty() {
        info!(%cutoff, "no orders to purge");
        return Ok(progress);
    }

    let filter = json!({"order_id": {"$in": order_ids}});
    let items = or_none_deleted(db.collection(ORDER_ITEMS).delete_many(&filter))
        .map_err(|e| progress.clone().fail(e))?;
    progress.record("order_items_deleted", items.deleted);

    let deleted = or_none_deleted(orders.delete_many(&filter)).map_err(|e| progress.clone().fail(e))?;
    progress.record("orders_deleted", deleted.deleted);

    info!(
        %cutoff,
        orders = deleted.deleted,
        items = items.deleted,
        "old orders purged"
    );
    Ok(progress)
}

// ============================================================================
// FLAGS & PRICES
// ============================================================================

/// Mark every order of customers who spent more than `spending_threshold`
/// with `is_priority_customer_order`
pub fn flag_priority_customers(db: &Database, spending_threshold: f64) -> Result<SagaProgress> {
    let pipeline = json!([
        {"$lookup": {
            "from": ORDER_ITEMS,
            "localField": "order_id",
            "foreignField": "order_id",
            "as": "items"
        }},
        {"$unwind": "$items"},
        {"$group": {"_id": "$customer_id", "total_spent": {"$sum": "$items.price"}}},
        {"$match": {"total_spent": {"$gt": spending_threshold}}},
        {"$sort": {"_id": 1}}
    ]);
    let customers = db.aggregate(ORDERS, &pipeline, &AggregateOptions::default())?.documents;
    let customer_ids = string_values(&customers, "_id");

    let mut progress = SagaProgress::new("flag_priority_customers");
    progress.record("customers", customer_ids.len() as u64);
    if customer_ids.is_empty() {
        return Ok(progress);
    }

    let result = or_none_updated(db.collection(ORDERS).update_many(
        &json!({"customer_id": {"$in": customer_ids}}),
        &json!({
            "$set": {"is_priority_customer_order": true},
            "$currentDate": {"last_updated_priority_flag": true}
        }),
    ))
    .map_err(|e| progress.clone().fail(e))?;
    progress.record("orders_matched", result.matched);
    progress.record("orders_modified", result.modified);
    info!(
        customers = progress.count("customers"),
        orders = result.modified,
        "priority customers flagged"
    );
    Ok(progress)
}

/// Flag orders whose items add up to more than `threshold` as `expensive`
pub fn flag_expensive_orders(db: &Database, threshold: f64) -> Result<SagaProgress> {
    let pipeline = json!([
        {"$group": {"_id": "$order_id", "total": {"$sum": "$price"}}},
        {"$match": {"total": {"$gt": threshold}}},
        {"$sort": {"_id": 1}}
    ]);
    let totals = db.aggregate(ORDER_ITEMS, &pipeline, &AggregateOptions::default())?.documents;
    let order_ids = string_values(&totals, "_id");

    let mut progress = SagaProgress::new("flag_expensive_orders");
    progress.record("orders_over_threshold", order_ids.len() as u64);
    if order_ids.is_empty() {
        return Ok(progress);
    }

    let result = or_none_updated(db.collection(ORDERS).update_many(
        &json!({"order_id": {"$in": order_ids}}),
        &json!({"$set": {"expensive": true}}),
    ))
    .map_err(|e| progress.clone().fail(e))?;
    progress.record("orders_modified", result.modified);
    Ok(progress)
}

/// Multiply the price of every item whose product is in `category`
pub fn reprice_category(db: &Database, category: &str, factor: f64) -> Result<SagaProgress> {
    if !(factor >= 0.0) || !factor.is_finite() {
        return Err(StoreLensError::ConstraintViolation(format!(
            "price factor must be a non-negative number, got {}",
            factor
        )));
    }
    let products = db
        .collection(PRODUCTS)
        .find(&json!({"product_category_name": category}))?;
    let product_ids = string_values(&products, "product_id");

    let mut progress = SagaProgress::new("reprice_category");
    progress.record("products", product_ids.len() as u64);
    if product_ids.is_empty() {
        return Ok(progress);
    }

    let result = or_none_updated(db.collection(ORDER_ITEMS).update_many(
        &json!({"product_id": {"$in": product_ids}}),
        &json!({"$mul": {"price": factor}}),
    ))
    .map_err(|e| progress.clone().fail(e))?;
    progress.record("items_matched", result.matched);
    progress.record("items_modified", result.modified);
    info!(category, factor, items = result.modified, "category repriced");
    Ok(progress)
}

// ============================================================================
// PRODUCT TAGS & REVIEWS
// ============================================================================

pub fn tag_product(db: &Database, product_id: &str, tag: &str) -> Result<UpdateResult> {
    db.collection(PRODUCTS).update_one(
        &json!({"product_id": product_id}),
        &json!({"$addToSet": {"tags": tag}}),
    )
}

pub fn untag_product(db: &Database, product_id: &str, tag: &str) -> Result<UpdateResult> {
    db.collection(PRODUCTS).update_one(
        &json!({"product_id": product_id}),
        &json!({"$pull": {"tags": tag}}),
    )
}

/// Append a review; a reviewer reviews a product at most once
pub fn add_review(db: &Database, product_id: &str, review: &Review) -> Result<UpdateResult> {
    review.validate()?;
    let products = db.collection(PRODUCTS);
    let product = products
        .find_one(&json!({"product_id": product_id}))?
        .ok_or_else(|| StoreLensError::NotFound(format!("product {}", product_id)))?;
    let already = product
        .get("reviews")
        .and_then(Value::as_array)
        .is_some_and(|reviews| {
            reviews
                .iter()
                .any(|r| r.get("reviewer_id").and_then(Value::as_str) == Some(&review.reviewer_id))
        });
    if already {
        return Err(StoreLensError::ConstraintViolation(format!(
            "{} already reviewed product {}",
            review.reviewer_id, product_id
        )));
    }
    products.update_one(
        &json!({"product_id": product_id}),
        &json!({"$push": {"reviews": serde_json::to_value(review)?}}),
    )
}

/// Change rating and comment of one reviewer's review
pub fn edit_review(
    db: &Database,
    product_id: &str,
    reviewer_id: &str,
    rating: u8,
    comment: &str,
) -> Result<UpdateResult> {
    Review::new(reviewer_id, rating, comment).validate()?;
    db.collection(PRODUCTS).update_with_options(
        &json!({"product_id": product_id, "reviews.reviewer_id": reviewer_id}),
        &json!({"$set": {
            "reviews.$[r].rating": rating,
            "reviews.$[r].comment": comment,
            "reviews.$[r].timestamp": dates::now_string()
        }}),
        &UpdateOptions::one().with_array_filters(vec![json!({"r.reviewer_id": reviewer_id})]),
    )
}

pub fn remove_review(db: &Database, product_id: &str, reviewer_id: &str) -> Result<UpdateResult> {
    db.collection(PRODUCTS).update_one(
        &json!({"product_id": product_id, "reviews.reviewer_id": reviewer_id}),
        &json!({"$pull": {"reviews": {"reviewer_id": reviewer_id}}}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexDefinition;

    fn db_with_products() -> Database {
        let db = Database::in_memory();
        db.create_index(
            ORDER_ITEMS,
            IndexDefinition::new(&[("order_id", 1), ("order_item_id", 1)]).unique(true),
        )
        .unwrap();
        db.collection(PRODUCTS)
            .insert_many(vec![
                json!({"product_id": "p1", "product_category_name": "perfumaria"}),
                json!({"product_id": "p2", "product_category_name": "esporte_lazer"}),
            ])
            .unwrap();
        db
    }

    #[test]
    fn test_place_order_writes_both_collections() {
        let db = db_with_products();
        let order = Order::new("o1", "c1")
            .with_item("p1", "s1", 58.9, 13.29)
            .with_item("p2", "s1", 35.0, 10.0);
        let progress = place_order(&db, &order).unwrap();
        assert_eq!(progress.count("orders"), 1);
        assert_eq!(progress.count("order_items"), 2);
        assert_eq!(
            db.collection(ORDER_ITEMS).count_documents(&json!({"order_id": "o1"})).unwrap(),
            2
        );
    }

    #[test]
    fn test_place_order_rejects_unknown_product() {
        let db = db_with_products();
        let order = Order::new("o1", "c1").with_item("p9", "s1", 1.0, 1.0);
        let err = place_order(&db, &order).unwrap_err();
        assert!(err.to_string().contains("unknown products"));
        assert_eq!(db.collection(ORDERS).count_documents(&json!({})).unwrap(), 0);
    }

    #[test]
    fn test_place_order_compensates_on_item_failure() {
        let db = db_with_products();
        let mut order = Order::new("o1", "c1")
            .with_item("p1", "s1", 10.0, 1.0)
            .with_item("p2", "s1", 20.0, 1.0);
        // Duplicate (order_id, order_item_id) breaks the unique index
        order.items[1].order_item_id = 1;

        let err = place_order(&db, &order).unwrap_err();
        match &err {
            StoreLensError::PartialFailure { operation, progress, .. } => {
                assert_eq!(operation, "place_order");
                assert_eq!(progress.get("orders"), Some(1));
                assert_eq!(progress.get("order_items"), Some(1));
                assert_eq!(progress.get("compensated"), Some(2));
            }
            other => panic!("expected PartialFailure, got {:?}", other),
        }
        assert_eq!(db.collection(ORDERS).count_documents(&json!({})).unwrap(), 0);
        assert_eq!(db.collection(ORDER_ITEMS).count_documents(&json!({})).unwrap(), 0);
    }

    #[test]
    fn test_advance_status_stamps_timestamps() {
        let db = db_with_products();
        place_order(&db, &Order::new("o1", "c1").with_item("p1", "s1", 10.0, 1.0)).unwrap();

        let approved = dates::parse_timestamp("2018-01-02T10:00:00Z").unwrap();
        let delivered = dates::parse_timestamp("2018-01-05T10:00:00Z").unwrap();
        advance_order_status_at(&db, "o1", OrderStatus::Approved, approved).unwrap();
        advance_order_status_at(&db, "o1", OrderStatus::Delivered, delivered).unwrap();

        let doc = db.collection(ORDERS).find_one(&json!({"order_id": "o1"})).unwrap().unwrap();
        assert_eq!(doc["order_status"], "delivered");
        assert_eq!(doc["order_approved_at"], "2018-01-02T10:00:00Z");
        assert_eq!(doc["order_delivered_customer_date"], "2018-01-05T10:00:00Z");
        assert!(doc["last_modified"].is_string());
    }

    #[test]
    fn test_advance_status_rejects_backward_and_early_delivery() {
        let db = db_with_products();
        place_order(&db, &Order::new("o1", "c1").with_item("p1", "s1", 10.0, 1.0)).unwrap();
        let approved = dates::parse_timestamp("2018-01-05T10:00:00Z").unwrap();
        advance_order_status_at(&db, "o1", OrderStatus::Approved, approved).unwrap();

        let err = advance_order_status(&db, "o1", OrderStatus::Created).unwrap_err();
        assert!(matches!(err, StoreLensError::ConstraintViolation(_)));

        let early = dates::parse_timestamp("2018-01-01T10:00:00Z").unwrap();
        let err = advance_order_status_at(&db, "o1", OrderStatus::Delivered, early).unwrap_err();
        assert!(err.to_string().contains("precedes approval"));

        let err = advance_order_status(&db, "missing", OrderStatus::Approved).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_reprice_category() {
        let db = db_with_products();
        place_order(
            &db,
            &Order::new("o1", "c1")
                .with_item("p1", "s1", 100.0, 1.0)
                .with_item("p2", "s1", 50.0, 1.0),
        )
        .unwrap();
        let progress = reprice_category(&db, "perfumaria", 1.5).unwrap();
        assert_eq!(progress.count("products"), 1);
        assert_eq!(progress.count("items_modified"), 1);

        let item = db
            .collection(ORDER_ITEMS)
            .find_one(&json!({"product_id": "p1"}))
            .unwrap()
            .unwrap();
        assert_eq!(item["price"], json!(150.0));
        assert!(reprice_category(&db, "perfumaria", -1.0).is_err());
        assert_eq!(reprice_category(&db, "none", 2.0).unwrap().count("products"), 0);
    }

    #[test]
    fn test_flag_expensive_orders() {
        let db = db_with_products();
        place_order(&db, &Order::new("o1", "c1").with_item("p1", "s1", 999.0, 1.0).with_item("p2", "s1", 2.0, 1.0)).unwrap();
        place_order(&db, &Order::new("o2", "c1").with_item("p1", "s1", 10.0, 1.0)).unwrap();

        let progress = flag_expensive_orders(&db, EXPENSIVE_ORDER_THRESHOLD).unwrap();
        assert_eq!(progress.count("orders_modified"), 1);
        let flagged = db.collection(ORDERS).find(&json!({"expensive": true})).unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0]["order_id"], "o1");
    }

    #[test]
    fn test_flag_priority_customers() {
        let db = db_with_products();
        place_order(&db, &Order::new("o1", "c1").with_item("p1", "s1", 300.0, 1.0)).unwrap();
        place_order(&db, &Order::new("o2", "c1").with_item("p2", "s1", 300.0, 1.0)).unwrap();
        place_order(&db, &Order::new("o3", "c2").with_item("p2", "s1", 100.0, 1.0)).unwrap();

        let progress = flag_priority_customers(&db, 500.0).unwrap();
        assert_eq!(progress.count("customers"), 1);
        assert_eq!(progress.count("orders_modified"), 2);
        let flagged = db
            .collection(ORDERS)
            .count_documents(&json!({"is_priority_customer_order": true}))
            .unwrap();
        assert_eq!(flagged, 2);
    }

    #[test]
    fn test_tags_and_reviews() {
        let db = db_with_products();
        tag_product(&db, "p1", "promo").unwrap();
        let again = tag_product(&db, "p1", "promo").unwrap();
        assert_eq!(again, UpdateResult { matched: 1, modified: 0 });

        add_review(&db, "p1", &Review::new("u1", 2, "meh")).unwrap();
        let err = add_review(&db, "p1", &Review::new("u1", 5, "again")).unwrap_err();
        assert!(err.to_string().contains("already reviewed"));

        edit_review(&db, "p1", "u1", 4, "better").unwrap();
        let product = db.collection(PRODUCTS).find_one(&json!({"product_id": "p1"})).unwrap().unwrap();
        assert_eq!(product["tags"], json!(["promo"]));
        assert_eq!(product["reviews"][0]["rating"], 4);
        assert_eq!(product["reviews"][0]["comment"], "better");

        assert!(edit_review(&db, "p1", "u9", 3, "x").unwrap_err().is_not_found());
        remove_review(&db, "p1", "u1").unwrap();
        untag_product(&db, "p1", "promo").unwrap();
        let product = db.collection(PRODUCTS).find_one(&json!({"product_id": "p1"})).unwrap().unwrap();
        assert_eq!(product["reviews"], json!([]));
        assert_eq!(product["tags"], json!([]));
    }
}
