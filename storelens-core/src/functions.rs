//! Aggregation function library
//!
//! Pure functions over value slices. Group accumulators, expression
//! operators and the report runner all route through these so the
//! empty-input and division rules live in one place:
//!
//! | function | empty input |
//! |----------|-------------|
//! | `sum`, `count` | `0` |
//! | `avg`, `min`, `max`, `median`, `percentile`, `std_dev_pop` | null / `None` |

use crate::dates::{self, TimeUnit};
use crate::error::{Result, StoreLensError};
use crate::value_utils::{canonical_json_string, number_value, total_cmp};
use serde_json::Value;
use std::collections::HashSet;

/// Numeric members of `values`; everything else is ignored
pub fn numeric_values(values: &[Value]) -> Vec<f64> {
    values.iter().filter_map(Value::as_f64).collect()
}

/// Sum of the numeric members. Stays an integer while every addend is one.
pub fn sum(values: &[Value]) -> Value {
    let mut sum_int: i64 = 0;
    let mut sum_float: f64 = 0.0;
    let mut has_float = false;

    for value in values {
        if let Value::Number(n) = value {
            if let Some(i) = n.as_i64() {
                match sum_int.checked_add(i) {
                    Some(total) => sum_int = total,
                    None => {
                        sum_float += i as f64;
                        has_float = true;
                    }
                }
            } else if let Some(f) = n.as_f64() {
                sum_float += f;
                has_float = true;
            }
        }
    }

    if has_float {
        number_value(sum_float + sum_int as f64)
    } else {
        Value::from(sum_int)
    }
}

pub fn avg(values: &[Value]) -> Value {
    let nums = numeric_values(values);
    if nums.is_empty() {
        return Value::Null;
    }
    number_value(nums.iter().sum::<f64>() / nums.len() as f64)
}

/// Smallest non-null value under the total value order
pub fn min(values: &[Value]) -> Value {
    values
        .iter()
        .filter(|v| !v.is_null())
        .min_by(|a, b| total_cmp(a, b))
        .cloned()
        .unwrap_or(Value::Null)
}

pub fn max(values: &[Value]) -> Value {
    values
        .iter()
        .filter(|v| !v.is_null())
        .max_by(|a, b| total_cmp(a, b))
        .cloned()
        .unwrap_or(Value::Null)
}

pub fn count(values: &[Value]) -> Value {
    Value::from(values.len() as u64)
}

/// Distinct values in first-seen order. Objects compare regardless of key order.
pub fn add_to_set(values: &[Value]) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter(|v| seen.insert(canonical_json_string(v)))
        .cloned()
        .collect()
}

/// Median: middle value, or the mean of the two middle values
pub fn median(nums: &[f64]) -> Option<f64> {
    if nums.is_empty() {
        return None;
    }
    let sorted = sorted_copy(nums);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Nearest-rank percentile, `p` in `[0, 1]`
pub fn percentile(nums: &[f64], p: f64) -> Result<Option<f64>> {
    if !(0.0..=1.0).contains(&p) {
        return Err(StoreLensError::AggregationError(format!(
            "percentile must be between 0 and 1, got {}",
            p
        )));
    }
    if nums.is_empty() {
        return Ok(None);
    }
    let sorted = sorted_copy(nums);
    let rank = (p * sorted.len() as f64).ceil() as usize;
    Ok(Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)]))
}

pub fn std_dev_pop(nums: &[f64]) -> Option<f64> {
    if nums.is_empty() {
        return None;
    }
    let n = nums.len() as f64;
    let mean = nums.iter().sum::<f64>() / n;
    let variance = nums.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

/// `a / b`; a zero denominator is reported, never turned into 0
pub fn ratio(a: f64, b: f64) -> Result<f64> {
    if b == 0.0 {
        return Err(StoreLensError::DivisionUndefined(format!(
            "{} / 0 is undefined",
            a
        )));
    }
    Ok(a / b)
}

/// Signed whole units between two timestamp values; `None` when either
/// side is not a date
pub fn date_diff(start: &Value, end: &Value, unit: TimeUnit) -> Option<i64> {
    let start = dates::value_to_timestamp(start)?;
    let end = dates::value_to_timestamp(end)?;
    Some(dates::whole_units_between(&start, &end, unit))
}

fn sorted_copy(nums: &[f64]) -> Vec<f64> {
    let mut sorted = nums.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_inputs() {
        assert_eq!(sum(&[]), json!(0));
        assert_eq!(count(&[]), json!(0));
        assert_eq!(avg(&[]), Value::Null);
        assert_eq!(min(&[]), Value::Null);
        assert_eq!(max(&[]), Value::Null);
        assert_eq!(median(&[]), None);
        assert_eq!(std_dev_pop(&[]), None);
        assert_eq!(percentile(&[], 0.5).unwrap(), None);
    }

    #[test]
    fn test_sum_keeps_integers() {
        assert_eq!(sum(&[json!(1), json!(2), json!("x"), json!(null)]), json!(3));
        let total = sum(&[json!(1), json!(2.5)]);
        assert_eq!(total.as_f64(), Some(3.5));
    }

    #[test]
    fn test_avg_ignores_non_numeric() {
        assert_eq!(avg(&[json!(10), json!("n/a"), json!(20)]).as_f64(), Some(15.0));
    }

    #[test]
    fn test_min_max_skip_nulls() {
        let values = [json!(null), json!(7), json!(3.5), json!(12)];
        assert_eq!(min(&values), json!(3.5));
        assert_eq!(max(&values), json!(12));
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[30.0, 10.0, 20.0]), Some(20.0));
        assert_eq!(median(&[40.0, 10.0, 30.0, 20.0]), Some(25.0));
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let nums = [15.0, 20.0, 35.0, 40.0, 50.0];
        assert_eq!(percentile(&nums, 0.0).unwrap(), Some(15.0));
        assert_eq!(percentile(&nums, 0.3).unwrap(), Some(20.0));
        assert_eq!(percentile(&nums, 0.4).unwrap(), Some(20.0));
        assert_eq!(percentile(&nums, 1.0).unwrap(), Some(50.0));
        assert!(percentile(&nums, 1.5).is_err());
    }

    #[test]
    fn test_add_to_set_dedupes_objects() {
        let values = [json!({"a": 1, "b": 2}), json!("x"), json!({"b": 2, "a": 1}), json!("x")];
        assert_eq!(add_to_set(&values), vec![json!({"a": 1, "b": 2}), json!("x")]);
    }

    #[test]
    fn test_std_dev_pop() {
        let sd = std_dev_pop(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((sd - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_ratio_zero_denominator() {
        assert_eq!(ratio(15.0, 60.0).unwrap(), 0.25);
        let err = ratio(15.0, 0.0).unwrap_err();
        assert!(matches!(err, StoreLensError::DivisionUndefined(_)));
    }

    #[test]
    fn test_date_diff_signed_days() {
        let a = json!("2018-01-01 00:00:00");
        let b = json!("2018-01-11 06:00:00");
        assert_eq!(date_diff(&a, &b, TimeUnit::Day), Some(10));
        assert_eq!(date_diff(&b, &a, TimeUnit::Day), Some(-10));
        assert_eq!(date_diff(&a, &json!(null), TimeUnit::Day), None);
    }
}
