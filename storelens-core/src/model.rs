// storelens-core/src/model.rs
//! E-commerce data model
//!
//! Typed views of the documents stored in `orders`, `order_items`,
//! `customers` and `products`, the order status lifecycle and the standard
//! collection validators.
//!
//! Items live in `order_items` (one document per item, keyed by
//! `(order_id, order_item_id)`); an [`Order`] carries them only while it is
//! being placed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::dates;
use crate::error::{Result, StoreLensError};

pub const ORDERS: &str = "orders";
pub const ORDER_ITEMS: &str = "order_items";
pub const CUSTOMERS: &str = "customers";
pub const PRODUCTS: &str = "products";
pub const DAILY_CATEGORY_SALES_SUMMARY: &str = "daily_category_sales_summary";

// ============================================================================
// ORDER STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Created,
    Approved,
    Shipped,
    Delivered,
    Canceled,
    Returned,
    Unavailable,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Created,
        OrderStatus::Approved,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Canceled,
        OrderStatus::Returned,
        OrderStatus::Unavailable,
    ];

    pub fn from_str(s: &str) -> Option<OrderStatus> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Approved => "approved",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Returned => "returned",
            OrderStatus::Unavailable => "unavailable",
        }
    }

    /// Canceled, returned and unavailable orders never change again
    pub fn is_absorbing(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Returned | OrderStatus::Unavailable
        )
    }

    /// Position on the forward path; `None` for absorbing states
    fn rank(&self) -> Option<u8> {
        match self {
            OrderStatus::Created => Some(0),
            OrderStatus::Approved => Some(1),
            OrderStatus::Shipped => Some(2),
            OrderStatus::Delivered => Some(3),
            _ => None,
        }
    }

    /// Forward moves along created → approved → shipped → delivered (steps
    /// may be skipped), or from any non-absorbing state into an absorbing one
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_absorbing() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (Some(current), Some(target)) => target > current,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn check_transition(&self, next: OrderStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(StoreLensError::ConstraintViolation(format!(
                "order status cannot move from {} to {}",
                self, next
            )))
        }
    }

    /// Timestamp field stamped when an order enters this status
    pub fn timestamp_field(&self) -> Option<&'static str> {
        match self {
            OrderStatus::Approved => Some("order_approved_at"),
            OrderStatus::Shipped => Some("order_delivered_carrier_date"),
            OrderStatus::Delivered => Some("order_delivered_customer_date"),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DOCUMENT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub order_id: String,
    pub order_item_id: u32,
    pub product_id: String,
    pub seller_id: String,
    pub price: f64,
    pub freight_value: f64,
    pub shipping_limit_date: String,
}

impl Item {
    pub fn validate(&self) -> Result<()> {
        if !(self.price >= 0.0) || !(self.freight_value >= 0.0) {
            return Err(StoreLensError::ConstraintViolation(format!(
                "item {} of order {} has a negative price or freight value",
                self.order_item_id, self.order_id
            )));
        }
        if dates::parse_timestamp(&self.shipping_limit_date).is_none() {
            return Err(StoreLensError::ConstraintViolation(format!(
                "item {} of order {} has an invalid shipping_limit_date",
                self.order_item_id, self.order_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub customer_id: String,
    pub order_status: OrderStatus,
    pub order_purchase_timestamp: String,
    #[serde(default)]
    pub order_approved_at: Option<String>,
    #[serde(default)]
    pub order_delivered_carrier_date: Option<String>,
    #[serde(default)]
    pub order_delivered_customer_date: Option<String>,
    #[serde(default)]
    pub order_estimated_delivery_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expensive: Option<bool>,
    /// Set on every order of a customer whose spending passed the threshold
    #[serde(
        default,
        rename = "is_priority_customer_order",
        skip_serializing_if = "Option::is_none"
    )]
    pub priority: Option<bool>,
}

impl Order {
    /// New order in `created` state, purchased now
    pub fn new(order_id: &str, customer_id: &str) -> Self {
        Order {
            order_id: order_id.to_string(),
            customer_id: customer_id.to_string(),
            order_status: OrderStatus::Created,
            order_purchase_timestamp: dates::now_string(),
            order_approved_at: None,
            order_delivered_carrier_date: None,
            order_delivered_customer_date: None,
            order_estimated_delivery_date: None,
            items: Vec::new(),
            expensive: None,
            priority: None,
        }
    }

    pub fn purchased_at(mut self, timestamp: &str) -> Self {
        self.order_purchase_timestamp = timestamp.to_string();
        for item in &mut self.items {
            item.shipping_limit_date = timestamp.to_string();
        }
        self
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.order_status = status;
        self
    }

    /// Append an item, numbering it after the existing ones
    pub fn with_item(mut self, product_id: &str, seller_id: &str, price: f64, freight_value: f64) -> Self {
        let order_item_id = self.items.len() as u32 + 1;
        self.items.push(Item {
            order_id: self.order_id.clone(),
            order_item_id,
            product_id: product_id.to_string(),
            seller_id: seller_id.to_string(),
            price,
            freight_value,
            shipping_limit_date: self.order_purchase_timestamp.clone(),
        });
        self
    }

    /// Sum of item prices
    pub fn total_value(&self) -> f64 {
        self.items.iter().map(|item| item.price).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.order_id.is_empty() || self.customer_id.is_empty() {
            return Err(StoreLensError::ConstraintViolation(
                "order_id and customer_id are required".to_string(),
            ));
        }
        if dates::parse_timestamp(&self.order_purchase_timestamp).is_none() {
            return Err(StoreLensError::ConstraintViolation(format!(
                "order {} has an invalid order_purchase_timestamp",
                self.order_id
            )));
        }
        for item in &self.items {
            if item.order_id != self.order_id {
                return Err(StoreLensError::ConstraintViolation(format!(
                    "item {} references order {} instead of {}",
                    item.order_item_id, item.order_id, self.order_id
                )));
            }
            item.validate()?;
        }
        check_delivery_after_approval(
            self.order_approved_at.as_deref(),
            self.order_delivered_customer_date.as_deref(),
        )
    }

    /// Order document without embedded items
    pub fn to_document(&self) -> Result<Value> {
        let mut doc = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut doc {
            map.shift_remove("items");
        }
        Ok(doc)
    }

    pub fn from_document(doc: &Value) -> Result<Self> {
        Ok(serde_json::from_value(doc.clone())?)
    }
}

/// `order_delivered_customer_date` must not precede `order_approved_at`
pub fn check_delivery_after_approval(approved: Option<&str>, delivered: Option<&str>) -> Result<()> {
    let parse = |s: Option<&str>| s.and_then(dates::parse_timestamp);
    match (parse(approved), parse(delivered)) {
        (Some(approved), Some(delivered)) if delivered < approved => {
            Err(StoreLensError::ConstraintViolation(format!(
                "delivery date {} precedes approval date {}",
                dates::format_timestamp(&delivered),
                dates::format_timestamp(&approved)
            )))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: String,
    pub customer_unique_id: String,
    pub customer_city: String,
    pub customer_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_zip_code_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub reviewer_id: String,
    pub rating: u8,
    #[serde(default)]
    pub comment: String,
    pub timestamp: String,
}

impl Review {
    pub fn new(reviewer_id: &str, rating: u8, comment: &str) -> Self {
        Review {
            reviewer_id: reviewer_id.to_string(),
            rating,
            comment: comment.to_string(),
            timestamp: dates::now_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=5).contains(&self.rating) {
            return Err(StoreLensError::ConstraintViolation(format!(
                "rating must be between 1 and 5, got {}",
                self.rating
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    #[serde(default)]
    pub product_category_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_weight_g: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub reviews: Vec<Review>,
}

/// Timestamp `years` before `now`, rendered the way documents store it
pub fn retention_cutoff(now: &DateTime<Utc>, years: u32) -> String {
    dates::format_timestamp(&dates::years_before(now, years))
}

// ============================================================================
// VALIDATORS
// ============================================================================

/// `$jsonSchema` for `orders`; `strict` also pins the status to the
/// lifecycle values
pub fn orders_validator(strict: bool) -> Value {
    let status = if strict {
        json!({
            "bsonType": "string",
            "enum": OrderStatus::ALL.iter().map(OrderStatus::as_str).collect::<Vec<_>>(),
        })
    } else {
        json!({"bsonType": "string"})
    };
    json!({
        "$jsonSchema": {
            "bsonType": "object",
            "required": ["order_id", "customer_id", "order_status"],
            "properties": {
                "order_id": {"bsonType": "string"},
                "customer_id": {"bsonType": "string"},
                "order_status": status,
                "order_purchase_timestamp": {"bsonType": ["date", "null"]},
                "order_approved_at": {"bsonType": ["date", "null"]},
                "order_delivered_carrier_date": {"bsonType": ["date", "null"]},
                "order_delivered_customer_date": {"bsonType": ["date", "null"]},
                "order_estimated_delivery_date": {"bsonType": ["date", "null"]},
                "items": {
                    "bsonType": "array",
                    "items": {
                        "bsonType": "object",
                        "required": ["product_id", "seller_id", "price"],
                        "properties": {
                            "price": {"bsonType": "double", "minimum": 0},
                            "freight_value": {"bsonType": "double", "minimum": 0}
                        }
                    }
                }
            }
        }
    })
}

pub fn order_items_validator() -> Value {
    json!({
        "$jsonSchema": {
            "bsonType": "object",
            "required": [
                "order_id", "order_item_id", "product_id", "seller_id",
                "shipping_limit_date", "price", "freight_value"
            ],
            "properties": {
                "order_id": {"bsonType": "string"},
                "order_item_id": {"bsonType": "int", "minimum": 1},
                "product_id": {"bsonType": "string"},
                "seller_id": {"bsonType": "string"},
                "shipping_limit_date": {"bsonType": "date"},
                "price": {"bsonType": "double", "minimum": 0},
                "freight_value": {"bsonType": "double", "minimum": 0}
            }
        }
    })
}

pub fn customers_validator() -> Value {
    json!({
        "$jsonSchema": {
            "bsonType": "object",
            "required": ["customer_id", "customer_unique_id", "customer_city", "customer_state"],
            "properties": {
                "customer_id": {"bsonType": "string"},
                "customer_unique_id": {"bsonType": "string"},
                "customer_city": {"bsonType": "string"},
                "customer_state": {"bsonType": "string", "pattern": "^[A-Z]{2}$"}
            }
        }
    })
}

pub fn products_validator() -> Value {
    json!({
        "$jsonSchema": {
            "bsonType": "object",
            "required": ["product_id"],
            "properties": {
                "product_id": {"bsonType": "string"},
                "product_category_name": {"bsonType": ["string", "null"]},
                "product_weight_g": {"bsonType": ["int", "double", "null"]},
                "tags": {"bsonType": "array", "items": {"bsonType": "string"}},
                "reviews": {
                    "bsonType": "array",
                    "items": {
                        "bsonType": "object",
                        "required": ["reviewer_id", "rating"],
                        "properties": {
                            "rating": {"bsonType": "int", "minimum": 1, "maximum": 5}
                        }
                    }
                }
            }
        }
    })
}

/// Validator of each standard collection, keyed by collection name
pub fn standard_validators(strict_orders: bool) -> Vec<(&'static str, Value)> {
    vec![
        (ORDERS, orders_validator(strict_orders)),
        (ORDER_ITEMS, order_items_validator()),
        (CUSTOMERS, customers_validator()),
        (PRODUCTS, products_validator()),
    ]
}
