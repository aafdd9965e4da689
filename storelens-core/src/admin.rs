// storelens-core/src/admin.rs
//! Standard provisioning of the e-commerce collections

use serde::Serialize;
use tracing::{debug, info};

use crate::database::Database;
use crate::error::Result;
use crate::index::{IndexDefinition, IndexUsage};
use crate::model::{standard_validators, CUSTOMERS, ORDERS, ORDER_ITEMS, PRODUCTS};
use crate::sharding::ShardKey;

/// Name of the index every collection carries
pub const ID_INDEX: &str = "_id_";

/// Outcome of one `create_index` call during provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedIndex {
    pub collection: String,
    pub index: String,
    /// False when an identical index already existed
    pub created: bool,
}

/// Index set used by the reports and workflows
pub fn standard_indexes() -> Vec<(&'static str, IndexDefinition)> {
    vec![
        (ORDERS, IndexDefinition::new(&[("order_id", 1)]).unique(true)),
        (ORDERS, IndexDefinition::new(&[("customer_id", 1)])),
        (
            ORDERS,
            IndexDefinition::new(&[("customer_id", 1), ("order_status", 1)]),
        ),
        (
            ORDERS,
            IndexDefinition::new(&[("order_status", 1), ("order_purchase_timestamp", -1)])
                .named("status_timestamp_idx"),
        ),
        (PRODUCTS, IndexDefinition::new(&[("product_id", 1)]).unique(true)),
        (PRODUCTS, IndexDefinition::text(&["product_category_name"])),
        (ORDER_ITEMS, IndexDefinition::new(&[("order_id", 1)])),
        (ORDER_ITEMS, IndexDefinition::new(&[("product_id", 1)])),
        (
            ORDER_ITEMS,
            IndexDefinition::new(&[("order_id", 1), ("order_item_id", 1)]).unique(true),
        ),
        (CUSTOMERS, IndexDefinition::new(&[("customer_id", 1)]).unique(true)),
    ]
}

/// Create the standard index set; existing identical indexes are kept
pub fn provision_standard_indexes(db: &Database) -> Result<Vec<ProvisionedIndex>> {
    let mut provisioned = Vec::new();
    for (collection, definition) in standard_indexes() {
        let index = definition.name.clone();
        let created = db.create_index(collection, definition)?;
        debug!(collection, index = %index, created, "standard index");
        provisioned.push(ProvisionedIndex {
            collection: collection.to_string(),
            index,
            created,
        });
    }
    info!(
        created = provisioned.iter().filter(|p| p.created).count(),
        "standard indexes provisioned"
    );
    Ok(provisioned)
}

/// Install the collection validators
pub fn provision_validators(db: &Database, strict_orders: bool) -> Result<()> {
    for (collection, validator) in standard_validators(strict_orders) {
        db.set_validator(collection, Some(validator))?;
    }
    Ok(())
}

/// Enable sharding and shard every standard collection on hashed `_id`
pub fn provision_sharding(db: &Database) -> Result<()> {
    db.enable_sharding();
    for collection in [ORDERS, ORDER_ITEMS, CUSTOMERS, PRODUCTS] {
        db.shard_collection(collection, ShardKey::Hashed("_id".to_string()))?;
    }
    info!(db = db.name(), shards = db.config().shard_count, "sharding provisioned");
    Ok(())
}

/// Indexes of a collection never used since creation, `_id_` excluded
pub fn unused_indexes(db: &Database, collection: &str) -> Result<Vec<IndexUsage>> {
    Ok(db
        .index_stats(collection)?
        .into_iter()
        .filter(|usage| usage.ops == 0 && usage.name != ID_INDEX)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provision_is_idempotent() {
        let db = Database::in_memory();
        let first = provision_standard_indexes(&db).unwrap();
        assert_eq!(first.len(), 10);
        assert!(first.iter().all(|p| p.created));

        let second = provision_standard_indexes(&db).unwrap();
        assert!(second.iter().all(|p| !p.created));

        let names: Vec<String> = db
            .list_indexes(ORDERS)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"status_timestamp_idx".to_string()));
        assert!(names.contains(&"customer_id_1_order_status_1".to_string()));
    }

    #[test]
    fn test_unique_order_items_enforced() {
        let db = Database::in_memory();
        provision_standard_indexes(&db).unwrap();
        let items = db.collection(ORDER_ITEMS);
        items
            .insert_one(json!({"order_id": "o1", "order_item_id": 1, "product_id": "p1"}))
            .unwrap();
        let err = items
            .insert_one(json!({"order_id": "o1", "order_item_id": 1, "product_id": "p2"}))
            .unwrap_err();
        assert!(err.to_string().to_lowercase().contains("duplicate"));
    }

    #[test]
    fn test_unused_indexes_drop_out_once_used() {
        let db = Database::in_memory();
        provision_standard_indexes(&db).unwrap();
        db.collection(ORDERS)
            .insert_one(json!({"order_id": "o1", "customer_id": "c1"}))
            .unwrap();

        let before = unused_indexes(&db, ORDERS).unwrap();
        assert!(before.iter().any(|u| u.name == "order_id_1"));
        assert!(before.iter().all(|u| u.name != ID_INDEX));

        db.collection(ORDERS).find(&json!({"order_id": "o1"})).unwrap();
        let after = unused_indexes(&db, ORDERS).unwrap();
        assert!(after.iter().all(|u| u.name != "order_id_1"));
    }

    #[test]
    fn test_provision_sharding_creates_hashed_id_indexes() {
        let db = Database::in_memory();
        provision_sharding(&db).unwrap();
        assert!(db.is_sharding_enabled());
        for collection in [ORDERS, ORDER_ITEMS, CUSTOMERS, PRODUCTS] {
            assert_eq!(
                db.shard_key(collection),
                Some(ShardKey::Hashed("_id".to_string()))
            );
            let names: Vec<String> = db
                .list_indexes(collection)
                .unwrap()
                .into_iter()
                .map(|d| d.name)
                .collect();
            assert!(names.contains(&"_id_hashed".to_string()));
        }
    }

    #[test]
    fn test_provision_validators_rejects_bad_state() {
        let db = Database::in_memory();
        provision_validators(&db, true).unwrap();
        let err = db
            .collection(CUSTOMERS)
            .insert_one(json!({
                "customer_id": "c1",
                "customer_unique_id": "u1",
                "customer_city": "campinas",
                "customer_state": "sao paulo"
            }))
            .unwrap_err();
        assert!(err.to_string().contains("customer_state"));
    }
}
