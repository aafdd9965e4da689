// Report runner tests over the shared fixture
mod common;

use common::{column, fixture_db};
use serde_json::json;
use storelens_core::model::{CUSTOMERS, DAILY_CATEGORY_SALES_SUMMARY, PRODUCTS};
use storelens_core::saga;
use storelens_core::{
    Database, Order, ReportName, ReportParams, ReportRunner, StoreLensError,
};

fn run(db: &Database, report: ReportName, params: ReportParams) -> Vec<serde_json::Value> {
    ReportRunner::new(db).run(report, &params).unwrap().rows
}

// ========== REVENUE & SELLER TESTS ==========

#[test]
fn test_revenue_by_category() {
    let db = fixture_db();
    let rows = run(&db, ReportName::RevenueByCategory, ReportParams::default());
    assert_eq!(
        rows,
        vec![
            json!({"category": "electronics", "revenue": 400.0}),
            json!({"category": "books", "revenue": 65.0}),
            json!({"category": "toys", "revenue": 30.0}),
            json!({"category": "garden", "revenue": 20.0}),
        ]
    );
}

#[test]
fn test_top_sellers_default_and_limit() {
    let db = fixture_db();
    let rows = run(&db, ReportName::TopSellers, ReportParams::default());
    assert_eq!(
        rows,
        vec![
            json!({"seller_id": "s1", "sales_value": 400.0}),
            json!({"seller_id": "s2", "sales_value": 85.0}),
            json!({"seller_id": "s3", "sales_value": 30.0}),
        ]
    );

    let rows = run(&db, ReportName::TopSellers, ReportParams::default().with_limit(1));
    assert_eq!(column(&rows, "seller_id"), vec![json!("s1")]);
}

#[test]
fn test_order_value_by_status() {
    let db = fixture_db();
    let rows = run(&db, ReportName::OrderValueByStatus, ReportParams::default());
    assert_eq!(
        column(&rows, "order_status"),
        vec![json!("delivered"), json!("canceled"), json!("shipped")]
    );
    assert_eq!(rows[0]["order_count"], json!(2));
    assert_eq!(rows[0]["avg_value"].as_f64(), Some(150.0));
    assert_eq!(rows[2]["avg_value"].as_f64(), Some(200.0));
}

#[test]
fn test_top_states_by_revenue() {
    let db = fixture_db();
    let rows = run(&db, ReportName::TopStatesByRevenue, ReportParams::default());
    assert_eq!(column(&rows, "state"), vec![json!("SP"), json!("RJ"), json!("PR")]);
    assert_eq!(rows[0]["revenue"].as_f64(), Some(300.0));
    assert_eq!(rows[0]["orderCount"], json!(2));
}

#[test]
fn test_top_state_ranks_larger_order_first() {
    let db = Database::in_memory();
    db.collection(PRODUCTS)
        .insert_one(json!({"product_id": "p1", "product_category_name": "books"}))
        .unwrap();
    db.collection(CUSTOMERS)
        .insert_many(vec![
            json!({"customer_id": "ca", "customer_unique_id": "ua", "customer_city": "x", "customer_state": "MG"}),
            json!({"customer_id": "cb", "customer_unique_id": "ub", "customer_city": "y", "customer_state": "BA"}),
        ])
        .unwrap();
    saga::place_order(&db, &Order::new("A", "ca").with_item("p1", "s1", 199.9, 0.0)).unwrap();
    saga::place_order(&db, &Order::new("B", "cb").with_item("p1", "s1", 300.9, 0.0)).unwrap();

    let rows = run(&db, ReportName::TopStatesByRevenue, ReportParams::default());
    assert_eq!(rows[0]["state"], json!("BA"));
    assert_eq!(rows[1]["state"], json!("MG"));
}

// ========== DELIVERY TESTS ==========

#[test]
fn test_delivery_time_by_category() {
    let db = fixture_db();
    let rows = run(&db, ReportName::DeliveryTimeByCategory, ReportParams::default());
    assert_eq!(
        column(&rows, "category"),
        vec![json!("books"), json!("electronics"), json!("garden"), json!("toys")]
    );
    assert_eq!(rows[0]["avg_delivery_time_days"].as_f64(), Some(4.0));
    assert_eq!(rows[1]["avg_delivery_time_days"].as_f64(), Some(11.5));
    assert_eq!(rows[1]["number_of_items_evaluated"], json!(2));
}

#[test]
fn test_delivery_delay_categories() {
    let db = fixture_db();
    let rows = run(&db, ReportName::DeliveryDelay, ReportParams::default());
    assert_eq!(
        column(&rows, "performance_category"),
        vec![json!("Delivered Early"), json!("Delivered Very Late ( > 7 days)")]
    );
    assert_eq!(rows[0]["avg_diff_days"].as_f64(), Some(-5.0));
    assert_eq!(rows[1]["avg_diff_days"].as_f64(), Some(10.0));
}

#[test]
fn test_delivery_time_by_state() {
    let db = fixture_db();
    let rows = run(&db, ReportName::DeliveryTimeByState, ReportParams::default());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["state"], json!("SP"));
    assert_eq!(rows[0]["avg_days"].as_f64(), Some(12.5));
}

// ========== ITEM-LEVEL TESTS ==========

#[test]
fn test_freight_ratio_orders_ties_by_item() {
    let db = fixture_db();
    let rows = run(&db, ReportName::FreightRatio, ReportParams::default());
    let keys: Vec<(String, u64)> = rows
        .iter()
        .map(|r| (r["order_id"].as_str().unwrap().to_string(), r["order_item_id"].as_u64().unwrap()))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("o3".to_string(), 1),
            ("o3".to_string(), 3),
            ("o1".to_string(), 1),
            ("o1".to_string(), 2),
            ("o2".to_string(), 1),
        ]
    );
    assert_eq!(rows[0]["freight_to_price_ratio"].as_f64(), Some(0.5));
    assert_eq!(rows[0]["product_category"], json!("toys"));

    let rows = run(&db, ReportName::FreightRatio, ReportParams::default().with_threshold(150.0));
    assert_eq!(column(&rows, "order_id"), vec![json!("o2")]);
}

#[test]
fn test_price_distribution_median() {
    let db = fixture_db();
    let rows = run(&db, ReportName::PriceDistribution, ReportParams::default());
    assert_eq!(
        column(&rows, "category"),
        vec![json!("books"), json!("electronics"), json!("garden"), json!("toys")]
    );
    assert_eq!(rows[0]["median_price"].as_f64(), Some(32.5));
    assert_eq!(rows[1]["median_price"].as_f64(), Some(100.0));
    assert_eq!(rows[1]["min_price"].as_f64(), Some(100.0));
    assert_eq!(rows[1]["max_price"].as_f64(), Some(200.0));
    assert_eq!(rows[1]["count"], json!(3));
}

#[test]
fn test_products_bought_together() {
    let db = fixture_db();
    let rows = run(&db, ReportName::ProductsBoughtTogether, ReportParams::default());
    let pairs: Vec<_> = column(&rows, "product_pair");
    assert_eq!(
        pairs,
        vec![
            json!({"product1": "p1", "product2": "p2"}),
            json!({"product1": "p1", "product2": "p3"}),
            json!({"product1": "p1", "product2": "p4"}),
            json!({"product1": "p3", "product2": "p4"}),
        ]
    );
    assert!(rows.iter().all(|r| r["times_ordered_together"] == json!(1)));
}

// ========== CUSTOMER TESTS ==========

#[test]
fn test_multi_category_customers_threshold() {
    let db = fixture_db();
    assert!(run(&db, ReportName::MultiCategoryCustomers, ReportParams::default()).is_empty());

    let rows = run(
        &db,
        ReportName::MultiCategoryCustomers,
        ReportParams::default().with_min_categories(2),
    );
    assert_eq!(column(&rows, "customer_id"), vec![json!("c3")]);
    assert_eq!(rows[0]["number_of_distinct_categories"], json!(3));
}

#[test]
fn test_repeat_customers_group_by_person() {
    let db = fixture_db();
    let rows = run(&db, ReportName::RepeatCustomers, ReportParams::default());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["customer_unique_id"], json!("u1"));
    assert_eq!(rows[0]["order_count"], json!(2));
}

// ========== ORDER TESTS ==========

#[test]
fn test_monthly_trends() {
    let db = fixture_db();
    let rows = run(&db, ReportName::MonthlyTrends, ReportParams::default());
    assert_eq!(
        rows,
        vec![
            json!({"month": "2023-01", "revenue": 350.0, "number_of_orders": 2}),
            json!({"month": "2023-02", "revenue": 165.0, "number_of_orders": 2}),
        ]
    );
}

#[test]
fn test_order_value_and_item_count_ordering() {
    let db = fixture_db();
    let rows = run(&db, ReportName::OrderValueAndItemCount, ReportParams::default());
    assert_eq!(
        column(&rows, "order_id"),
        vec![json!("o2"), json!("o1"), json!("o3"), json!("o4")]
    );
    assert_eq!(rows[2]["totalItems"], json!(3));
    assert_eq!(rows[2]["customerCity"], json!("campinas"));
}

#[test]
fn test_placed_order_value_and_item_count() {
    let db = fixture_db();
    let prices = [12.5, 7.25, 80.0, 0.25];
    let mut order = Order::new("o-new", "c2").purchased_at("2024-03-01T09:30:00Z");
    for (i, price) in prices.iter().enumerate() {
        let product = ["p1", "p2", "p3", "p4"][i];
        order = order.with_item(product, "s9", *price, 1.0);
    }
    saga::place_order(&db, &order).unwrap();

    let output = ReportRunner::new(&db)
        .run(
            ReportName::OrderValueAndItemCount,
            &ReportParams::default().with_order_id("o-new"),
        )
        .unwrap();
    assert_eq!(output.rows.len(), 1);
    let row = &output.rows[0];
    assert_eq!(row["totalItems"], json!(prices.len()));
    let total = row["totalOrderValue"].as_f64().unwrap();
    assert!((total - prices.iter().sum::<f64>()).abs() < 1e-9);
    assert_eq!(output.stats.index_used.as_deref(), Some("order_id_1"));
    assert_eq!(output.stats.rows_returned, 1);
}

#[test]
fn test_order_price_buckets_cover_all_orders() {
    let db = fixture_db();
    let rows = run(&db, ReportName::OrderPriceBuckets, ReportParams::default().with_buckets(2));
    assert_eq!(rows.len(), 2);
    let counted: u64 = rows.iter().map(|r| r["count"].as_u64().unwrap()).sum();
    assert_eq!(counted, 4);
    let mins: Vec<f64> = rows.iter().map(|r| r["rangeMin"].as_f64().unwrap()).collect();
    assert!(mins.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(mins[0], 15.0);
}

// ========== DAILY SUMMARY TESTS ==========

#[test]
fn test_daily_category_sales_merge_is_idempotent() {
    let db = fixture_db();
    let runner = ReportRunner::new(&db);

    let first = runner
        .run(ReportName::DailyCategorySales, &ReportParams::default())
        .unwrap();
    assert_eq!(first.rows.len(), 7);
    assert_eq!(first.stats.merge.inserted, 7);
    assert_eq!(
        first.rows[0]["_id"],
        json!({"date": "2023-01-10", "category": "books"})
    );
    assert_eq!(first.rows[0]["daily_revenue"].as_f64(), Some(50.0));

    let second = runner
        .run(ReportName::DailyCategorySales, &ReportParams::default())
        .unwrap();
    assert_eq!(second.rows, first.rows);
    assert_eq!(second.stats.merge.inserted, 0);
    assert_eq!(second.stats.merge.matched, 7);
    assert_eq!(
        db.collection(DAILY_CATEGORY_SALES_SUMMARY)
            .count_documents(&json!({}))
            .unwrap(),
        7
    );
}

// ========== PRODUCT REVIEW TESTS ==========

#[test]
fn test_top_rated_products() {
    let db = fixture_db();
    use storelens_core::Review;
    saga::add_review(&db, "p1", &Review::new("r1", 4, "good")).unwrap();
    saga::add_review(&db, "p1", &Review::new("r2", 5, "great")).unwrap();
    saga::add_review(&db, "p2", &Review::new("r1", 5, "classic")).unwrap();

    let rows = run(&db, ReportName::TopRatedProducts, ReportParams::default());
    assert_eq!(column(&rows, "product_id"), vec![json!("p2"), json!("p1")]);
    assert_eq!(rows[1]["avg_rating"].as_f64(), Some(4.5));
    assert_eq!(rows[1]["review_count"], json!(2));
}

// ========== GENERAL TESTS ==========

#[test]
fn test_every_report_runs_on_empty_database() {
    let db = Database::in_memory();
    for report in ReportName::ALL {
        let output = ReportRunner::new(&db)
            .run(report, &ReportParams::default())
            .unwrap();
        assert!(output.rows.is_empty(), "{} returned rows", report);
    }
}

#[test]
fn test_reports_are_deterministic() {
    let db = fixture_db();
    for report in ReportName::ALL {
        let first = run(&db, report, ReportParams::default());
        let second = run(&db, report, ReportParams::default());
        assert_eq!(first, second, "{} changed between runs", report);
    }
}

#[test]
fn test_cancelled_report_discards_rows() {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use storelens_core::AggregateOptions;

    let db = fixture_db();
    let flag = Arc::new(AtomicBool::new(true));
    let err = ReportRunner::new(&db)
        .run_with(
            ReportName::RevenueByCategory,
            &ReportParams::default(),
            &AggregateOptions::default().with_cancel_flag(flag),
        )
        .unwrap_err();
    assert!(matches!(err, StoreLensError::Cancelled(0)));
}

#[test]
fn test_stats_count_scanned_rows() {
    let db = fixture_db();
    let output = ReportRunner::new(&db)
        .run(ReportName::TopSellers, &ReportParams::default())
        .unwrap();
    assert_eq!(output.stats.rows_scanned, 7);
    assert_eq!(output.stats.rows_returned, 3);
    assert_eq!(output.stats.index_used, None);
    assert_eq!(output.stats.undefined_ratios, 0);
}
