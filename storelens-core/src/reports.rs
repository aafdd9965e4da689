// storelens-core/src/reports.rs
//! Named analytical reports
//!
//! Every report is one pipeline run through the generic evaluator against
//! the normalized layout: orders in `orders`, one document per item in
//! `order_items`, joined with `$lookup`. Each pipeline's output order is
//! fixed by a sort whose keys identify a row uniquely, so a report over the
//! same data always yields the same rows in the same order.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::aggregation::MergeCounts;
use crate::database::{AggregateOptions, Database};
use crate::error::{Result, StoreLensError};
use crate::find_options::FindOptions;
use crate::model::{CUSTOMERS, DAILY_CATEGORY_SALES_SUMMARY, ORDERS, ORDER_ITEMS, PRODUCTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportName {
    RevenueByCategory,
    OrderValueByStatus,
    TopSellers,
    MultiCategoryCustomers,
    DeliveryTimeByCategory,
    FreightRatio,
    MonthlyTrends,
    DeliveryDelay,
    ProductsBoughtTogether,
    PriceDistribution,
    DailyCategorySales,
    TopStatesByRevenue,
    DeliveryTimeByState,
    OrderValueAndItemCount,
    OrderPriceBuckets,
    RepeatCustomers,
    TopRatedProducts,
}

impl ReportName {
    pub const ALL: [ReportName; 17] = [
        ReportName::RevenueByCategory,
        ReportName::OrderValueByStatus,
        ReportName::TopSellers,
        ReportName::MultiCategoryCustomers,
        ReportName::DeliveryTimeByCategory,
        ReportName::FreightRatio,
        ReportName::MonthlyTrends,
        ReportName::DeliveryDelay,
        ReportName::ProductsBoughtTogether,
        ReportName::PriceDistribution,
        ReportName::DailyCategorySales,
        ReportName::TopStatesByRevenue,
        ReportName::DeliveryTimeByState,
        ReportName::OrderValueAndItemCount,
        ReportName::OrderPriceBuckets,
        ReportName::RepeatCustomers,
        ReportName::TopRatedProducts,
    ];

    pub fn from_str(s: &str) -> Option<ReportName> {
        Self::ALL.into_iter().find(|name| name.as_str() == s)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportName::RevenueByCategory => "revenue-by-category",
            ReportName::OrderValueByStatus => "order-value-by-status",
            ReportName::TopSellers => "top-sellers",
            ReportName::MultiCategoryCustomers => "multi-category-customers",
            ReportName::DeliveryTimeByCategory => "delivery-time-by-category",
            ReportName::FreightRatio => "freight-ratio",
            ReportName::MonthlyTrends => "monthly-trends",
            ReportName::DeliveryDelay => "delivery-delay",
            ReportName::ProductsBoughtTogether => "products-bought-together",
            ReportName::PriceDistribution => "price-distribution",
            ReportName::DailyCategorySales => "daily-category-sales",
            ReportName::TopStatesByRevenue => "top-states-by-revenue",
            ReportName::DeliveryTimeByState => "delivery-time-by-state",
            ReportName::OrderValueAndItemCount => "order-value-and-item-count",
            ReportName::OrderPriceBuckets => "order-price-buckets",
            ReportName::RepeatCustomers => "repeat-customers",
            ReportName::TopRatedProducts => "top-rated-products",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ReportName::RevenueByCategory => "Item revenue per product category",
            ReportName::OrderValueByStatus => "Average order value and order count per status",
            ReportName::TopSellers => "Sellers with the highest item sales",
            ReportName::MultiCategoryCustomers => "Customers buying from more than N categories",
            ReportName::DeliveryTimeByCategory => "Average approval-to-delivery days per category",
            ReportName::FreightRatio => "Items with the highest freight-to-price ratio",
            ReportName::MonthlyTrends => "Revenue and order count per purchase month",
            ReportName::DeliveryDelay => "Delivered orders grouped by delay against the estimate",
            ReportName::ProductsBoughtTogether => "Product pairs most often in the same order",
            ReportName::PriceDistribution => "Min, max, average and median item price per category",
            ReportName::DailyCategorySales => "Daily revenue per category, merged into the summary",
            ReportName::TopStatesByRevenue => "Customer states with the highest revenue",
            ReportName::DeliveryTimeByState => "Average purchase-to-delivery days per state",
            ReportName::OrderValueAndItemCount => "Order totals and item counts",
            ReportName::OrderPriceBuckets => "Orders split into equal-count price ranges",
            ReportName::RepeatCustomers => "People with more than one order",
            ReportName::TopRatedProducts => "Products with the best average review rating",
        }
    }

    /// Collection the pipeline starts from
    pub fn source(&self) -> &'static str {
        match self {
            ReportName::RevenueByCategory
            | ReportName::TopSellers
            | ReportName::FreightRatio
            | ReportName::ProductsBoughtTogether
            | ReportName::PriceDistribution => ORDER_ITEMS,
            ReportName::TopRatedProducts => PRODUCTS,
            _ => ORDERS,
        }
    }
}

impl fmt::Display for ReportName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report parameters; reports ignore the ones they do not use
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportParams {
    pub limit: Option<usize>,
    /// Price threshold of `freight-ratio`
    pub threshold: Option<f64>,
    /// Bucket count of `order-price-buckets`
    pub buckets: Option<usize>,
    pub min_categories: Option<usize>,
    /// Restrict `order-value-and-item-count` to one order
    pub order_id: Option<String>,
}

impl ReportParams {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_buckets(mut self, buckets: usize) -> Self {
        self.buckets = Some(buckets);
        self
    }

    pub fn with_min_categories(mut self, min: usize) -> Self {
        self.min_categories = Some(min);
        self
    }

    pub fn with_order_id(mut self, order_id: &str) -> Self {
        self.order_id = Some(order_id.to_string());
        self
    }

    fn limit_or(&self, default: usize) -> Result<usize> {
        match self.limit {
            Some(0) => Err(StoreLensError::InvalidQuery(
                "limit must be positive".to_string(),
            )),
            Some(limit) => Ok(limit),
            None => Ok(default),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub rows_scanned: u64,
    pub rows_returned: u64,
    /// First index used by any store call of the run
    pub index_used: Option<String>,
    pub duration: Duration,
    /// Divisions by zero that yielded null
    pub undefined_ratios: u64,
    pub merge: MergeCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportOutput {
    pub report: ReportName,
    pub rows: Vec<Value>,
    pub stats: ExecutionStats,
}

// ============================================================================
// RUNNER
// ============================================================================

pub struct ReportRunner<'a> {
    db: &'a Database,
}

impl<'a> ReportRunner<'a> {
    pub fn new(db: &'a Database) -> Self {
        ReportRunner { db }
    }

    pub fn run(&self, report: ReportName, params: &ReportParams) -> Result<ReportOutput> {
        self.run_with(report, params, &AggregateOptions::default())
    }

    /// Run with aggregate options such as a cancellation flag
    pub fn run_with(
        &self,
        report: ReportName,
        params: &ReportParams,
        options: &AggregateOptions,
    ) -> Result<ReportOutput> {
        let pipeline = report_pipeline(report, params)?;
        let output = self.db.aggregate(report.source(), &pipeline, options)?;
        let mut rows_scanned = output.summary.docs_examined;

        let rows = if report == ReportName::DailyCategorySales {
            let summary = self.db.collection(DAILY_CATEGORY_SALES_SUMMARY).find_with_options(
                &json!({}),
                FindOptions::new().with_sort(vec![
                    ("_id.date".to_string(), 1),
                    ("_id.category".to_string(), 1),
                ]),
            )?;
            rows_scanned += summary.stats.docs_examined;
            summary.documents
        } else {
            output.documents
        };

        let stats = ExecutionStats {
            rows_scanned,
            rows_returned: rows.len() as u64,
            index_used: output.summary.indexes_used.first().cloned(),
            duration: output.duration,
            undefined_ratios: output.summary.undefined_ratios,
            merge: output.summary.merge,
        };
        info!(
            report = report.as_str(),
            rows = stats.rows_returned,
            scanned = stats.rows_scanned,
            millis = stats.duration.as_millis() as u64,
            "report finished"
        );
        Ok(ReportOutput {
            report,
            rows,
            stats,
        })
    }
}

// ============================================================================
// PIPELINES
// ============================================================================

fn lookup(from: &str, local: &str, foreign: &str, as_field: &str) -> Value {
    json!({"$lookup": {"from": from, "localField": local, "foreignField": foreign, "as": as_field}})
}

fn order_items_of_orders() -> Vec<Value> {
    vec![lookup(ORDER_ITEMS, "order_id", "order_id", "items"), json!({"$unwind": "$items"})]
}

fn products_of_items(local: &str) -> Vec<Value> {
    vec![
        lookup(PRODUCTS, local, "product_id", "product_info"),
        json!({"$unwind": "$product_info"}),
    ]
}

/// Pipeline of a report as JSON stages
pub fn report_pipeline(report: ReportName, params: &ReportParams) -> Result<Value> {
    let mut stages: Vec<Value> = Vec::new();
    match report {
        ReportName::RevenueByCategory => {
            stages.extend(products_of_items("product_id"));
            stages.extend([
                json!({"$group": {
                    "_id": "$product_info.product_category_name",
                    "total_revenue": {"$sum": "$price"}
                }}),
                json!({"$project": {"_id": 0, "category": "$_id", "revenue": "$total_revenue"}}),
                json!({"$sort": {"revenue": -1, "category": 1}}),
            ]);
        }
        ReportName::OrderValueByStatus => {
            stages.extend(order_items_of_orders());
            stages.extend([
                json!({"$group": {
                    "_id": {"order_id": "$order_id", "status": "$order_status"},
                    "order_total_value": {"$sum": "$items.price"}
                }}),
                json!({"$group": {
                    "_id": "$_id.status",
                    "average_order_value": {"$avg": "$order_total_value"},
                    "number_of_orders": {"$sum": 1}
                }}),
                json!({"$project": {
                    "_id": 0,
                    "order_status": "$_id",
                    "avg_value": {"$round": ["$average_order_value", 2]},
                    "order_count": "$number_of_orders"
                }}),
                json!({"$sort": {"order_count": -1, "order_status": 1}}),
            ]);
        }
        ReportName::TopSellers => {
            stages.extend([
                json!({"$group": {"_id": "$seller_id", "total_sales_value": {"$sum": "$price"}}}),
                json!({"$sort": {"total_sales_value": -1, "_id": 1}}),
                json!({"$limit": params.limit_or(5)?}),
                json!({"$project": {"_id": 0, "seller_id": "$_id", "sales_value": "$total_sales_value"}}),
            ]);
        }
        ReportName::MultiCategoryCustomers => {
            stages.extend(order_items_of_orders());
            stages.extend(products_of_items("items.product_id"));
            stages.extend([
                json!({"$group": {
                    "_id": "$customer_id",
                    "distinct_categories": {"$addToSet": "$product_info.product_category_name"}
                }}),
                json!({"$project": {
                    "_id": 0,
                    "customer_id": "$_id",
                    "categories_purchased": "$distinct_categories",
                    "number_of_distinct_categories": {"$size": "$distinct_categories"}
                }}),
                json!({"$match": {
                    "number_of_distinct_categories": {"$gt": params.min_categories.unwrap_or(3)}
                }}),
                json!({"$sort": {"number_of_distinct_categories": -1, "customer_id": 1}}),
            ]);
        }
        ReportName::DeliveryTimeByCategory => {
            stages.push(json!({"$match": {
                "order_status": "delivered",
                "order_approved_at": {"$ne": null},
                "order_delivered_customer_date": {"$ne": null}
            }}));
            stages.extend(order_items_of_orders());
            stages.extend(products_of_items("items.product_id"));
            stages.extend([
                json!({"$project": {
                    "_id": 0,
                    "product_category": "$product_info.product_category_name",
                    "delivery_time_days": {"$dateDiff": {
                        "startDate": "$order_approved_at",
                        "endDate": "$order_delivered_customer_date",
                        "unit": "day"
                    }}
                }}),
                json!({"$group": {
                    "_id": "$product_category",
                    "average_delivery_days": {"$avg": "$delivery_time_days"},
                    "count": {"$sum": 1}
                }}),
                json!({"$match": {"average_delivery_days": {"$ne": null}}}),
                json!({"$project": {
                    "_id": 0,
                    "category": "$_id",
                    "avg_delivery_time_days": {"$round": ["$average_delivery_days", 1]},
                    "number_of_items_evaluated": "$count"
                }}),
                json!({"$sort": {"avg_delivery_time_days": 1, "category": 1}}),
            ]);
        }
        ReportName::FreightRatio => {
            stages.extend([
                json!({"$match": {"price": {"$gt": params.threshold.unwrap_or(20.0)}}}),
                json!({"$addFields": {"freight_to_price_ratio": {"$cond": [
                    {"$eq": ["$price", 0]},
                    null,
                    {"$divide": ["$freight_value", "$price"]}
                ]}}}),
                json!({"$match": {"freight_to_price_ratio": {"$ne": null}}}),
                json!({"$sort": {"freight_to_price_ratio": -1, "order_id": 1, "order_item_id": 1}}),
                json!({"$limit": params.limit_or(10)?}),
                lookup(PRODUCTS, "product_id", "product_id", "product_info"),
                json!({"$unwind": {"path": "$product_info", "preserveNullAndEmptyArrays": true}}),
                json!({"$project": {
                    "_id": 0,
                    "order_id": "$order_id",
                    "order_item_id": "$order_item_id",
                    "product_id": "$product_id",
                    "product_category": {"$ifNull": ["$product_info.product_category_name", null]},
                    "price": "$price",
                    "freight_value": "$freight_value",
                    "freight_to_price_ratio": {"$round": ["$freight_to_price_ratio", 4]}
                }}),
            ]);
        }
        ReportName::MonthlyTrends => {
            stages.extend([
                json!({"$match": {"order_purchase_timestamp": {"$ne": null}}}),
                lookup(ORDER_ITEMS, "order_id", "order_id", "items"),
                json!({"$project": {
                    "year_month": {"$dateToString": {"format": "%Y-%m", "date": "$order_purchase_timestamp"}},
                    "order_id": "$order_id",
                    "items_price": "$items.price"
                }}),
                json!({"$unwind": "$items_price"}),
                json!({"$group": {
                    "_id": {"year_month": "$year_month", "order_id": "$order_id"},
                    "monthly_order_value": {"$sum": "$items_price"}
                }}),
                json!({"$group": {
                    "_id": "$_id.year_month",
                    "total_monthly_revenue": {"$sum": "$monthly_order_value"},
                    "total_monthly_orders": {"$sum": 1}
                }}),
                json!({"$project": {
                    "_id": 0,
                    "month": "$_id",
                    "revenue": {"$round": ["$total_monthly_revenue", 2]},
                    "number_of_orders": "$total_monthly_orders"
                }}),
                json!({"$sort": {"month": 1}}),
            ]);
        }
        ReportName::DeliveryDelay => {
            stages.extend([
                json!({"$match": {
                    "order_status": "delivered",
                    "order_estimated_delivery_date": {"$ne": null},
                    "order_delivered_customer_date": {"$ne": null}
                }}),
                json!({"$project": {
                    "order_id": 1,
                    "delivery_diff_days": {"$dateDiff": {
                        "startDate": "$order_estimated_delivery_date",
                        "endDate": "$order_delivered_customer_date",
                        "unit": "day"
                    }}
                }}),
                json!({"$addFields": {"delivery_performance": {"$switch": {
                    "branches": [
                        {"case": {"$lt": ["$delivery_diff_days", 0]}, "then": "Delivered Early"},
                        {"case": {"$eq": ["$delivery_diff_days", 0]}, "then": "Delivered On Time (Estimate Day)"},
                        {"case": {"$gt": ["$delivery_diff_days", 7]}, "then": "Delivered Very Late ( > 7 days)"},
                        {"case": {"$gt": ["$delivery_diff_days", 0]}, "then": "Delivered Late (1-7 days)"}
                    ],
                    "default": "Unknown"
                }}}}),
                json!({"$group": {
                    "_id": "$delivery_performance",
                    "count": {"$sum": 1},
                    "average_delay_or_advance_days": {"$avg": "$delivery_diff_days"}
                }}),
                json!({"$project": {
                    "_id": 0,
                    "performance_category": "$_id",
                    "number_of_orders": "$count",
                    "avg_diff_days": {"$round": ["$average_delay_or_advance_days", 2]}
                }}),
                json!({"$sort": {"number_of_orders": -1, "performance_category": 1}}),
            ]);
        }
        ReportName::ProductsBoughtTogether => {
            stages.extend([
                json!({"$group": {"_id": "$order_id", "products_in_order": {"$addToSet": "$product_id"}}}),
                json!({"$match": {"products_in_order.1": {"$exists": true}}}),
                json!({"$unwind": "$products_in_order"}),
                json!({"$lookup": {
                    "from": ORDER_ITEMS,
                    "let": {"current_order_id": "$_id", "current_product": "$products_in_order"},
                    "pipeline": [
                        {"$match": {"$expr": {"$and": [
                            {"$eq": ["$order_id", "$$current_order_id"]},
                            {"$ne": ["$product_id", "$$current_product"]},
                            {"$lt": ["$$current_product", "$product_id"]}
                        ]}}},
                        {"$project": {"_id": 0, "paired_product_id": "$product_id"}}
                    ],
                    "as": "paired_products"
                }}),
                json!({"$unwind": "$paired_products"}),
                json!({"$group": {
                    "_id": {
                        "product1": "$products_in_order",
                        "product2": "$paired_products.paired_product_id"
                    },
                    "count": {"$sum": 1}
                }}),
                json!({"$sort": {"count": -1, "_id.product1": 1, "_id.product2": 1}}),
                json!({"$limit": params.limit_or(10)?}),
                json!({"$project": {"_id": 0, "product_pair": "$_id", "times_ordered_together": "$count"}}),
            ]);
        }
        ReportName::PriceDistribution => {
            stages.extend(products_of_items("product_id"));
            stages.extend([
                json!({"$match": {
                    "product_info.product_category_name": {"$nin": [null, ""]},
                    "price": {"$type": "number", "$gte": 0}
                }}),
                json!({"$group": {
                    "_id": "$product_info.product_category_name",
                    "min_price": {"$min": "$price"},
                    "max_price": {"$max": "$price"},
                    "avg_price": {"$avg": "$price"},
                    "median_price": {"$median": {"input": "$price", "method": "approximate"}},
                    "count": {"$sum": 1}
                }}),
                json!({"$project": {
                    "_id": 0,
                    "category": "$_id",
                    "min_price": 1,
                    "max_price": 1,
                    "avg_price": {"$round": ["$avg_price", 2]},
                    "median_price": 1,
                    "count": 1
                }}),
                json!({"$sort": {"category": 1}}),
            ]);
        }
        ReportName::DailyCategorySales => {
            stages.push(json!({"$match": {"order_purchase_timestamp": {"$ne": null}}}));
            stages.extend(order_items_of_orders());
            stages.extend(products_of_items("items.product_id"));
            stages.extend([
                json!({"$project": {
                    "sale_date": {"$dateToString": {"format": "%Y-%m-%d", "date": "$order_purchase_timestamp"}},
                    "category": "$product_info.product_category_name",
                    "price": "$items.price"
                }}),
                json!({"$group": {
                    "_id": {"date": "$sale_date", "category": "$category"},
                    "daily_revenue": {"$sum": "$price"},
                    "items_sold": {"$sum": 1}
                }}),
                json!({"$sort": {"_id.date": 1, "_id.category": 1}}),
                json!({"$merge": {
                    "into": DAILY_CATEGORY_SALES_SUMMARY,
                    "on": "_id",
                    "whenMatched": "replace",
                    "whenNotMatched": "insert"
                }}),
            ]);
        }
        ReportName::TopStatesByRevenue => {
            stages.extend(order_items_of_orders());
            stages.extend([
                lookup(CUSTOMERS, "customer_id", "customer_id", "c"),
                json!({"$unwind": "$c"}),
                json!({"$group": {
                    "_id": "$c.customer_state",
                    "revenue": {"$sum": "$items.price"},
                    "orders": {"$addToSet": "$order_id"}
                }}),
                json!({"$project": {
                    "_id": 0,
                    "state": "$_id",
                    "revenue": 1,
                    "orderCount": {"$size": "$orders"}
                }}),
                json!({"$sort": {"revenue": -1, "state": 1}}),
                json!({"$limit": params.limit_or(10)?}),
            ]);
        }
        ReportName::DeliveryTimeByState => {
            stages.extend([
                json!({"$match": {"order_delivered_customer_date": {"$ne": null}}}),
                lookup(CUSTOMERS, "customer_id", "customer_id", "c"),
                json!({"$unwind": "$c"}),
                json!({"$project": {
                    "state": "$c.customer_state",
                    "days": {"$divide": [
                        {"$dateDiff": {
                            "startDate": "$order_purchase_timestamp",
                            "endDate": "$order_delivered_customer_date",
                            "unit": "hour"
                        }},
                        24
                    ]}
                }}),
                json!({"$group": {"_id": "$state", "avgDays": {"$avg": "$days"}}}),
                json!({"$project": {"_id": 0, "state": "$_id", "avg_days": {"$round": ["$avgDays", 2]}}}),
                json!({"$sort": {"avg_days": 1, "state": 1}}),
                json!({"$limit": params.limit_or(10)?}),
            ]);
        }
        ReportName::OrderValueAndItemCount => {
            if let Some(order_id) = &params.order_id {
                stages.push(json!({"$match": {"order_id": order_id}}));
            }
            stages.extend(order_items_of_orders());
            stages.extend([
                json!({"$group": {
                    "_id": "$order_id",
                    "customer_id": {"$first": "$customer_id"},
                    "totalOrderValue": {"$sum": "$items.price"},
                    "totalItems": {"$sum": 1}
                }}),
                json!({"$sort": {"totalOrderValue": -1, "_id": 1}}),
                json!({"$limit": params.limit_or(10)?}),
                lookup(CUSTOMERS, "customer_id", "customer_id", "customerDetails"),
                json!({"$unwind": {"path": "$customerDetails", "preserveNullAndEmptyArrays": true}}),
                json!({"$project": {
                    "_id": 0,
                    "order_id": "$_id",
                    "customer_id": 1,
                    "totalOrderValue": 1,
                    "totalItems": 1,
                    "customerCity": {"$ifNull": ["$customerDetails.customer_city", null]},
                    "customerState": {"$ifNull": ["$customerDetails.customer_state", null]}
                }}),
            ]);
        }
        ReportName::OrderPriceBuckets => {
            let buckets = params.buckets.unwrap_or(4);
            if buckets == 0 {
                return Err(StoreLensError::InvalidQuery(
                    "buckets must be positive".to_string(),
                ));
            }
            stages.extend(order_items_of_orders());
            stages.extend([
                json!({"$group": {
                    "_id": "$order_id",
                    "order_status": {"$first": "$order_status"},
                    "totalPrice": {"$sum": "$items.price"},
                    "itemCnt": {"$sum": 1}
                }}),
                json!({"$sort": {"totalPrice": 1, "_id": 1}}),
                json!({"$bucketAuto": {
                    "groupBy": "$totalPrice",
                    "buckets": buckets,
                    "output": {
                        "orders": {"$push": {
                            "orderId": "$_id",
                            "total": "$totalPrice",
                            "order_status": "$order_status"
                        }},
                        "count": {"$sum": 1},
                        "avgItems": {"$avg": "$itemCnt"}
                    }
                }}),
                json!({"$project": {
                    "_id": 0,
                    "rangeMin": "$_id.min",
                    "rangeMax": "$_id.max",
                    "count": 1,
                    "avgItems": 1,
                    "orders": {"$slice": ["$orders", params.limit_or(10)?]}
                }}),
                json!({"$sort": {"rangeMin": 1}}),
            ]);
        }
        ReportName::RepeatCustomers => {
            stages.extend([
                lookup(CUSTOMERS, "customer_id", "customer_id", "c"),
                json!({"$unwind": "$c"}),
                json!({"$group": {
                    "_id": "$c.customer_unique_id",
                    "orders": {"$addToSet": "$order_id"},
                    "states": {"$addToSet": "$c.customer_state"}
                }}),
                json!({"$project": {
                    "_id": 0,
                    "customer_unique_id": "$_id",
                    "order_count": {"$size": "$orders"},
                    "orders": 1,
                    "states": 1
                }}),
                json!({"$match": {"order_count": {"$gt": 1}}}),
                json!({"$sort": {"order_count": -1, "customer_unique_id": 1}}),
                json!({"$limit": params.limit_or(10)?}),
            ]);
        }
        ReportName::TopRatedProducts => {
            stages.extend([
                json!({"$match": {"reviews.0": {"$exists": true}}}),
                json!({"$project": {
                    "_id": 0,
                    "product_id": 1,
                    "product_category_name": 1,
                    "avg_rating": {"$round": [{"$avg": "$reviews.rating"}, 2]},
                    "review_count": {"$size": "$reviews"}
                }}),
                json!({"$sort": {"avg_rating": -1, "review_count": -1, "product_id": 1}}),
                json!({"$limit": params.limit_or(10)?}),
            ]);
        }
    }
    Ok(Value::Array(stages))
}
