// Shared fixtures for the integration tests
#![allow(dead_code)]

use serde_json::{json, Value};
use storelens_core::{admin, dataset, Database};

/// Small normalized dataset: four orders, seven items, four products, four
/// customer records of three people. All timestamps fall on 12:00 UTC.
pub fn fixture() -> Value {
    json!({
        "customers": [
            {"customer_id": "c1", "customer_unique_id": "u1", "customer_city": "sao paulo", "customer_state": "SP"},
            {"customer_id": "c2", "customer_unique_id": "u2", "customer_city": "rio de janeiro", "customer_state": "RJ"},
            {"customer_id": "c3", "customer_unique_id": "u1", "customer_city": "campinas", "customer_state": "SP"},
            {"customer_id": "c4", "customer_unique_id": "u4", "customer_city": "curitiba", "customer_state": "PR"}
        ],
        "products": [
            {"product_id": "p1", "product_category_name": "electronics", "product_weight_g": 500.0, "tags": [], "reviews": []},
            {"product_id": "p2", "product_category_name": "books", "product_weight_g": 300.0, "tags": [], "reviews": []},
            {"product_id": "p3", "product_category_name": "toys", "product_weight_g": 200.0, "tags": [], "reviews": []},
            {"product_id": "p4", "product_category_name": "garden", "product_weight_g": 1500.0, "tags": [], "reviews": []}
        ],
        "orders": [
            {
                "order_id": "o1", "customer_id": "c1", "order_status": "delivered",
                "order_purchase_timestamp": "2023-01-10T12:00:00Z",
                "order_approved_at": "2023-01-11T12:00:00Z",
                "order_delivered_carrier_date": "2023-01-12T12:00:00Z",
                "order_delivered_customer_date": "2023-01-15T12:00:00Z",
                "order_estimated_delivery_date": "2023-01-20T12:00:00Z"
            },
            {
                "order_id": "o2", "customer_id": "c2", "order_status": "shipped",
                "order_purchase_timestamp": "2023-01-20T12:00:00Z",
                "order_approved_at": "2023-01-20T12:00:00Z",
                "order_delivered_carrier_date": "2023-01-22T12:00:00Z",
                "order_delivered_customer_date": null,
                "order_estimated_delivery_date": "2023-02-01T12:00:00Z"
            },
            {
                "order_id": "o3", "customer_id": "c3", "order_status": "delivered",
                "order_purchase_timestamp": "2023-02-05T12:00:00Z",
                "order_approved_at": "2023-02-06T12:00:00Z",
                "order_delivered_carrier_date": "2023-02-08T12:00:00Z",
                "order_delivered_customer_date": "2023-02-25T12:00:00Z",
                "order_estimated_delivery_date": "2023-02-15T12:00:00Z"
            },
            {
                "order_id": "o4", "customer_id": "c4", "order_status": "canceled",
                "order_purchase_timestamp": "2023-02-10T12:00:00Z",
                "order_approved_at": null,
                "order_delivered_carrier_date": null,
                "order_delivered_customer_date": null,
                "order_estimated_delivery_date": "2023-02-28T12:00:00Z"
            }
        ],
        "order_items": [
            {"order_id": "o1", "order_item_id": 1, "product_id": "p1", "seller_id": "s1", "price": 100.0, "freight_value": 10.0, "shipping_limit_date": "2023-01-12T12:00:00Z"},
            {"order_id": "o1", "order_item_id": 2, "product_id": "p2", "seller_id": "s2", "price": 50.0, "freight_value": 5.0, "shipping_limit_date": "2023-01-12T12:00:00Z"},
            {"order_id": "o2", "order_item_id": 1, "product_id": "p1", "seller_id": "s1", "price": 200.0, "freight_value": 20.0, "shipping_limit_date": "2023-01-22T12:00:00Z"},
            {"order_id": "o3", "order_item_id": 1, "product_id": "p3", "seller_id": "s3", "price": 30.0, "freight_value": 15.0, "shipping_limit_date": "2023-02-07T12:00:00Z"},
            {"order_id": "o3", "order_item_id": 2, "product_id": "p4", "seller_id": "s2", "price": 20.0, "freight_value": 2.0, "shipping_limit_date": "2023-02-07T12:00:00Z"},
            {"order_id": "o3", "order_item_id": 3, "product_id": "p1", "seller_id": "s1", "price": 100.0, "freight_value": 30.0, "shipping_limit_date": "2023-02-07T12:00:00Z"},
            {"order_id": "o4", "order_item_id": 1, "product_id": "p2", "seller_id": "s2", "price": 15.0, "freight_value": 3.0, "shipping_limit_date": "2023-02-12T12:00:00Z"}
        ]
    })
}

/// Fixture loaded into a database carrying the standard index set
pub fn fixture_db() -> Database {
    let db = Database::in_memory();
    admin::provision_standard_indexes(&db).unwrap();
    dataset::load_value(&db, fixture()).unwrap();
    db
}

/// Same fixture without secondary indexes
pub fn bare_fixture_db() -> Database {
    let db = Database::in_memory();
    dataset::load_value(&db, fixture()).unwrap();
    db
}

/// Field values of `rows`, in row order
pub fn column(rows: &[Value], field: &str) -> Vec<Value> {
    rows.iter().map(|row| row[field].clone()).collect()
}
