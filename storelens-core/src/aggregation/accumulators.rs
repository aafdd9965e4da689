// src/aggregation/accumulators.rs
// $group / $bucketAuto accumulators

use crate::error::{Result, StoreLensError};
use crate::expression::{EvalOptions, Expr};
use crate::functions;
use crate::value_utils::number_value;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(Expr),
    Avg(Expr),
    Min(Expr),
    Max(Expr),
    /// `{$count: {}}`
    Count,
    First(Expr),
    Last(Expr),
    Push(Expr),
    AddToSet(Expr),
    Median(Expr),
    Percentile { input: Expr, p: Vec<f64> },
    StdDevPop(Expr),
}

fn accumulator_error(msg: impl Into<String>) -> StoreLensError {
    StoreLensError::AggregationError(msg.into())
}

/// `{input: <expr>, method: "approximate", p: [..]}` argument of the
/// statistical accumulators
fn statistic_input<'a>(spec: &'a Value, op: &str) -> Result<&'a Map<String, Value>> {
    let obj = spec
        .as_object()
        .ok_or_else(|| accumulator_error(format!("{} requires an object argument", op)))?;
    if !obj.contains_key("input") {
        return Err(accumulator_error(format!("{} requires 'input'", op)));
    }
    match obj.get("method") {
        None => {}
        Some(Value::String(method)) if method == "approximate" => {}
        Some(other) => {
            return Err(accumulator_error(format!(
                "{} 'method' must be \"approximate\", got {}",
                op, other
            )))
        }
    }
    Ok(obj)
}

impl Accumulator {
    /// Parse `{<operator>: <argument>}`
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| accumulator_error("Accumulator must be an object"))?;
        if obj.len() != 1 {
            return Err(accumulator_error("Accumulator must have exactly one operator"));
        }
        let Some((op, arg)) = obj.iter().next() else {
            return Err(accumulator_error("Accumulator must have exactly one operator"));
        };

        let accumulator = match op.as_str() {
            "$sum" => Accumulator::Sum(Expr::parse(arg)?),
            "$avg" => Accumulator::Avg(Expr::parse(arg)?),
            "$min" => Accumulator::Min(Expr::parse(arg)?),
            "$max" => Accumulator::Max(Expr::parse(arg)?),
            "$count" => {
                if !arg.as_object().is_some_and(Map::is_empty) {
                    return Err(accumulator_error("$count takes an empty object: {$count: {}}"));
                }
                Accumulator::Count
            }
            "$first" => Accumulator::First(Expr::parse(arg)?),
            "$last" => Accumulator::Last(Expr::parse(arg)?),
            "$push" => Accumulator::Push(Expr::parse(arg)?),
            "$addToSet" => Accumulator::AddToSet(Expr::parse(arg)?),
            "$stdDevPop" => Accumulator::StdDevPop(Expr::parse(arg)?),
            "$median" => {
                let obj = statistic_input(arg, "$median")?;
                Accumulator::Median(Expr::parse(&obj["input"])?)
            }
            "$percentile" => {
                let obj = statistic_input(arg, "$percentile")?;
                let p = obj
                    .get("p")
                    .and_then(Value::as_array)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| accumulator_error("$percentile 'p' must be a non-empty array"))?
                    .iter()
                    .map(|v| {
                        v.as_f64()
                            .filter(|p| (0.0..=1.0).contains(p))
                            .ok_or_else(|| {
                                accumulator_error(format!(
                                    "$percentile 'p' values must be numbers in [0, 1], got {}",
                                    v
                                ))
                            })
                    })
                    .collect::<Result<Vec<f64>>>()?;
                Accumulator::Percentile {
                    input: Expr::parse(&obj["input"])?,
                    p,
                }
            }
            other => return Err(accumulator_error(format!("Unknown accumulator: {}", other))),
        };
        Ok(accumulator)
    }

    fn input(&self) -> Option<&Expr> {
        match self {
            Accumulator::Count => None,
            Accumulator::Sum(e)
            | Accumulator::Avg(e)
            | Accumulator::Min(e)
            | Accumulator::Max(e)
            | Accumulator::First(e)
            | Accumulator::Last(e)
            | Accumulator::Push(e)
            | Accumulator::AddToSet(e)
            | Accumulator::Median(e)
            | Accumulator::StdDevPop(e) => Some(e),
            Accumulator::Percentile { input, .. } => Some(input),
        }
    }

    pub fn start(&self) -> AccumulatorState {
        AccumulatorState::default()
    }

    /// Feed one document into a running state
    pub fn accumulate(
        &self,
        state: &mut AccumulatorState,
        doc: &Value,
        vars: &[(String, Value)],
        opts: EvalOptions<'_>,
    ) -> Result<()> {
        state.seen += 1;
        match self {
            Accumulator::Count => {}
            // Only the first value is ever needed
            Accumulator::First(_) if state.seen > 1 => {}
            Accumulator::Last(expr) => {
                let value = expr.evaluate_with(doc, vars, opts)?;
                state.values.clear();
                state.values.push(value);
            }
            _ => {
                if let Some(expr) = self.input() {
                    let value = expr.evaluate_with(doc, vars, opts)?;
                    match value {
                        // `{$sum: "$items.price"}` adds up the array of each document
                        Value::Array(items) if matches!(self, Accumulator::Sum(_)) => {
                            state.values.push(functions::sum(&items));
                        }
                        value => state.values.push(value),
                    }
                }
            }
        }
        Ok(())
    }

    /// Final value of a group
    pub fn finish(&self, state: AccumulatorState) -> Result<Value> {
        let values = state.values;
        let value = match self {
            Accumulator::Count => Value::from(state.seen),
            Accumulator::Sum(_) => functions::sum(&values),
            Accumulator::Avg(_) => functions::avg(&values),
            Accumulator::Min(_) => functions::min(&values),
            Accumulator::Max(_) => functions::max(&values),
            Accumulator::First(_) | Accumulator::Last(_) => {
                values.into_iter().next().unwrap_or(Value::Null)
            }
            Accumulator::Push(_) => Value::Array(values),
            Accumulator::AddToSet(_) => Value::Array(functions::add_to_set(&values)),
            Accumulator::Median(_) => functions::median(&functions::numeric_values(&values))
                .map(number_value)
                .unwrap_or(Value::Null),
            Accumulator::Percentile { p, .. } => {
                let nums = functions::numeric_values(&values);
                let mut out = Vec::with_capacity(p.len());
                for p in p {
                    out.push(
                        functions::percentile(&nums, *p)?
                            .map(number_value)
                            .unwrap_or(Value::Null),
                    );
                }
                Value::Array(out)
            }
            Accumulator::StdDevPop(_) => functions::std_dev_pop(&functions::numeric_values(&values))
                .map(number_value)
                .unwrap_or(Value::Null),
        };
        Ok(value)
    }
}

/// Running state of one accumulator for one group
#[derive(Debug, Clone, Default)]
pub struct AccumulatorState {
    seen: u64,
    values: Vec<Value>,
}

/// Named accumulators of a `$group` or `$bucketAuto` output
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatorSet {
    fields: Vec<(String, Accumulator)>,
}

impl AccumulatorSet {
    pub fn new(fields: Vec<(String, Accumulator)>) -> Self {
        AccumulatorSet { fields }
    }

    /// Parse every entry of `spec` except the keys in `skip`
    pub fn from_json(spec: &Map<String, Value>, skip: &[&str]) -> Result<Self> {
        let mut fields = Vec::new();
        for (name, value) in spec {
            if skip.contains(&name.as_str()) {
                continue;
            }
            if name.contains('.') {
                return Err(accumulator_error(format!(
                    "The field name '{}' cannot contain '.'",
                    name
                )));
            }
            fields.push((name.clone(), Accumulator::from_json(value)?));
        }
        Ok(AccumulatorSet { fields })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn start(&self) -> Vec<AccumulatorState> {
        self.fields.iter().map(|(_, acc)| acc.start()).collect()
    }

    pub fn accumulate(
        &self,
        states: &mut [AccumulatorState],
        doc: &Value,
        vars: &[(String, Value)],
        opts: EvalOptions<'_>,
    ) -> Result<()> {
        for ((_, acc), state) in self.fields.iter().zip(states.iter_mut()) {
            acc.accumulate(state, doc, vars, opts)?;
        }
        Ok(())
    }

    /// Write the final values into `out` in declaration order
    pub fn finish_into(&self, states: Vec<AccumulatorState>, out: &mut Map<String, Value>) -> Result<()> {
        for ((name, acc), state) in self.fields.iter().zip(states) {
            out.insert(name.clone(), acc.finish(state)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::EvalStats;
    use serde_json::json;

    fn run(spec: Value, docs: &[Value]) -> Value {
        let acc = Accumulator::from_json(&spec).unwrap();
        let stats = EvalStats::default();
        let mut state = acc.start();
        for doc in docs {
            acc.accumulate(&mut state, doc, &[], EvalOptions::lenient(&stats)).unwrap();
        }
        acc.finish(state).unwrap()
    }

    fn prices(values: &[f64]) -> Vec<Value> {
        values.iter().map(|p| json!({"price": p})).collect()
    }

    #[test]
    fn test_accumulator_empty_group_values() {
        assert_eq!(run(json!({"$sum": "$price"}), &[]), json!(0));
        assert_eq!(run(json!({"$count": {}}), &[]), json!(0));
        assert_eq!(run(json!({"$avg": "$price"}), &[]), Value::Null);
        assert_eq!(run(json!({"$min": "$price"}), &[]), Value::Null);
        assert_eq!(run(json!({"$max": "$price"}), &[]), Value::Null);
    }

    #[test]
    fn test_accumulator_sum_constant_counts() {
        let docs = prices(&[1.0, 2.0, 3.0]);
        assert_eq!(run(json!({"$sum": 1}), &docs), json!(3));
        assert_eq!(run(json!({"$count": {}}), &docs), json!(3));
    }

    #[test]
    fn test_accumulator_sum_of_array_field() {
        let docs = vec![json!({"items": [{"price": 10}, {"price": 5}]}), json!({"items": [{"price": 1}]})];
        assert_eq!(run(json!({"$sum": "$items.price"}), &docs), json!(16));
    }

    #[test]
    fn test_accumulator_median_and_percentile() {
        assert_eq!(
            run(json!({"$median": {"input": "$price", "method": "approximate"}}), &prices(&[30.0, 10.0, 20.0])),
            json!(20.0)
        );
        assert_eq!(
            run(json!({"$median": {"input": "$price", "method": "approximate"}}), &prices(&[10.0, 20.0, 30.0, 40.0])),
            json!(25.0)
        );
        assert_eq!(
            run(
                json!({"$percentile": {"input": "$price", "p": [0.5, 0.9], "method": "approximate"}}),
                &prices(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0])
            ),
            json!([5.0, 9.0])
        );
    }

    #[test]
    fn test_accumulator_first_last_push_set() {
        let docs = vec![json!({"s": "a"}), json!({"s": "b"}), json!({"s": "a"})];
        assert_eq!(run(json!({"$first": "$s"}), &docs), json!("a"));
        assert_eq!(run(json!({"$last": "$s"}), &docs), json!("a"));
        assert_eq!(run(json!({"$push": "$s"}), &docs), json!(["a", "b", "a"]));
        assert_eq!(run(json!({"$addToSet": "$s"}), &docs), json!(["a", "b"]));
    }

    #[test]
    fn test_accumulator_std_dev_pop() {
        let value = run(json!({"$stdDevPop": "$price"}), &prices(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]));
        assert_eq!(value, json!(2.0));
    }

    #[test]
    fn test_accumulator_invalid_specs() {
        let err = Accumulator::from_json(&json!({"$median": "$price"})).unwrap_err();
        assert!(err.to_string().contains("requires an object argument"));

        let err = Accumulator::from_json(&json!({"$percentile": {"input": "$p", "p": [1.5]}})).unwrap_err();
        assert!(err.to_string().contains("in [0, 1]"));

        let err = Accumulator::from_json(&json!({"$stdDevSamp": "$p"})).unwrap_err();
        assert!(err.to_string().contains("Unknown accumulator"));

        let err = Accumulator::from_json(&json!({"$sum": 1, "$avg": 1})).unwrap_err();
        assert!(err.to_string().contains("exactly one operator"));

        let err = Accumulator::from_json(&json!({"$count": 1})).unwrap_err();
        assert!(err.to_string().contains("$count"));
    }
}
