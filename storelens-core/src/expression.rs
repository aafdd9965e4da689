// src/expression.rs
//! Aggregation expression language
//!
//! Expressions are parsed once into an [`Expr`] tree and evaluated per
//! document. Supported forms:
//!
//! - field paths: `"$price"`, `"$items.price"` (maps over arrays)
//! - variables: `"$$this"`, `"$$value.total"`, `"$$ROOT"`, `$let` / `$lookup` bindings
//! - object and array literals, `{"$literal": ...}`
//! - operators (arithmetic, comparison, boolean, array, string, date, statistics)
//!
//! Missing fields evaluate to `null`. `$divide` and `$mod` by zero yield
//! `null` and bump [`EvalStats::undefined_ratios`], unless the evaluation is
//! strict, in which case they fail with `DivisionUndefined`.

use crate::dates::{self, TimeUnit};
use crate::error::{Result, StoreLensError};
use crate::functions;
use crate::value_utils::{as_number, is_truthy, number_value, resolve_path, total_cmp, values_equal};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.%LZ";
const MILLIS_PER_DAY: i64 = 86_400_000;

/// Counters shared by every evaluation of one pipeline run
#[derive(Debug, Default)]
pub struct EvalStats {
    undefined_ratios: AtomicU64,
}

impl EvalStats {
    pub fn undefined_ratios(&self) -> u64 {
        self.undefined_ratios.load(AtomicOrdering::Relaxed)
    }

    fn record_undefined(&self) {
        self.undefined_ratios.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvalOptions<'a> {
    pub strict: bool,
    pub stats: &'a EvalStats,
}

impl<'a> EvalOptions<'a> {
    pub fn lenient(stats: &'a EvalStats) -> Self {
        EvalOptions { strict: false, stats }
    }
}

/// Named operators whose arguments are a plain list of expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Round,
    Floor,
    Ceil,
    Abs,
    Size,
    ArrayElemAt,
    Slice,
    Concat,
    ToLower,
    ToUpper,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    In,
    IfNull,
    Sum,
    Avg,
    Min,
    Max,
    StdDevPop,
}

impl Op {
    fn from_name(name: &str) -> Option<Op> {
        let op = match name {
            "$add" => Op::Add,
            "$subtract" => Op::Subtract,
            "$multiply" => Op::Multiply,
            "$divide" => Op::Divide,
            "$mod" => Op::Mod,
            "$round" => Op::Round,
            "$floor" => Op::Floor,
            "$ceil" => Op::Ceil,
            "$abs" => Op::Abs,
            "$size" => Op::Size,
            "$arrayElemAt" => Op::ArrayElemAt,
            "$slice" => Op::Slice,
            "$concat" => Op::Concat,
            "$toLower" => Op::ToLower,
            "$toUpper" => Op::ToUpper,
            "$eq" => Op::Eq,
            "$ne" => Op::Ne,
            "$gt" => Op::Gt,
            "$gte" => Op::Gte,
            "$lt" => Op::Lt,
            "$lte" => Op::Lte,
            "$and" => Op::And,
            "$or" => Op::Or,
            "$not" => Op::Not,
            "$in" => Op::In,
            "$ifNull" => Op::IfNull,
            "$sum" => Op::Sum,
            "$avg" => Op::Avg,
            "$min" => Op::Min,
            "$max" => Op::Max,
            "$stdDevPop" => Op::StdDevPop,
            _ => return None,
        };
        Some(op)
    }

    fn name(&self) -> &'static str {
        match self {
            Op::Add => "$add",
            Op::Subtract => "$subtract",
            Op::Multiply => "$multiply",
            Op::Divide => "$divide",
            Op::Mod => "$mod",
            Op::Round => "$round",
            Op::Floor => "$floor",
            Op::Ceil => "$ceil",
            Op::Abs => "$abs",
            Op::Size => "$size",
            Op::ArrayElemAt => "$arrayElemAt",
            Op::Slice => "$slice",
            Op::Concat => "$concat",
            Op::ToLower => "$toLower",
            Op::ToUpper => "$toUpper",
            Op::Eq => "$eq",
            Op::Ne => "$ne",
            Op::Gt => "$gt",
            Op::Gte => "$gte",
            Op::Lt => "$lt",
            Op::Lte => "$lte",
            Op::And => "$and",
            Op::Or => "$or",
            Op::Not => "$not",
            Op::In => "$in",
            Op::IfNull => "$ifNull",
            Op::Sum => "$sum",
            Op::Avg => "$avg",
            Op::Min => "$min",
            Op::Max => "$max",
            Op::StdDevPop => "$stdDevPop",
        }
    }

    /// Allowed argument counts (inclusive)
    fn arity(&self) -> (usize, usize) {
        match self {
            Op::Subtract | Op::Divide | Op::Mod | Op::ArrayElemAt | Op::In => (2, 2),
            Op::Eq | Op::Ne | Op::Gt | Op::Gte | Op::Lt | Op::Lte => (2, 2),
            Op::Round => (1, 2),
            Op::Slice => (2, 3),
            Op::Floor | Op::Ceil | Op::Abs | Op::Size | Op::ToLower | Op::ToUpper | Op::Not => {
                (1, 1)
            }
            Op::IfNull => (2, usize::MAX),
            _ => (0, usize::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    Var {
        name: String,
        path: Option<String>,
    },
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Call {
        op: Op,
        args: Vec<Expr>,
    },
    Cond {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// `$switch`: first branch whose case is truthy
    Switch {
        branches: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },
    Let {
        vars: Vec<(String, Expr)>,
        body: Box<Expr>,
    },
    Reduce {
        input: Box<Expr>,
        initial: Box<Expr>,
        body: Box<Expr>,
    },
    Filter {
        input: Box<Expr>,
        alias: String,
        condition: Box<Expr>,
    },
    Map {
        input: Box<Expr>,
        alias: String,
        body: Box<Expr>,
    },
    DateDiff {
        start: Box<Expr>,
        end: Box<Expr>,
        unit: Box<Expr>,
    },
    DateToString {
        date: Box<Expr>,
        format: String,
    },
    DateTrunc {
        date: Box<Expr>,
        unit: TimeUnit,
    },
    Median(Box<Expr>),
    Percentile {
        input: Box<Expr>,
        p: Vec<f64>,
    },
}

// ============================================================================
// PARSING
// ============================================================================

fn expr_error(msg: impl Into<String>) -> StoreLensError {
    StoreLensError::AggregationError(msg.into())
}

fn required<'a>(obj: &'a Map<String, Value>, key: &str, op: &str) -> Result<&'a Value> {
    obj.get(key)
        .ok_or_else(|| expr_error(format!("{} requires '{}'", op, key)))
}

fn as_object<'a>(spec: &'a Value, op: &str) -> Result<&'a Map<String, Value>> {
    spec.as_object()
        .ok_or_else(|| expr_error(format!("{} requires an object argument", op)))
}

fn parse_alias(obj: &Map<String, Value>, op: &str) -> Result<String> {
    match obj.get("as") {
        None => Ok("this".to_string()),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(_) => Err(expr_error(format!("{} 'as' must be a variable name", op))),
    }
}

fn boxed(spec: &Value) -> Result<Box<Expr>> {
    Ok(Box::new(Expr::parse(spec)?))
}

impl Expr {
    pub fn parse(spec: &Value) -> Result<Expr> {
        match spec {
            Value::String(s) if s.starts_with("$$") => {
                let rest = &s[2..];
                let (name, path) = match rest.split_once('.') {
                    Some((name, path)) => (name, Some(path.to_string())),
                    None => (rest, None),
                };
                if name.is_empty() {
                    return Err(expr_error(format!("Invalid variable reference: {}", s)));
                }
                Ok(Expr::Var {
                    name: name.to_string(),
                    path,
                })
            }
            Value::String(s) if s.starts_with('$') => {
                if s.len() == 1 {
                    return Err(expr_error("Field path cannot be empty"));
                }
                Ok(Expr::Field(s[1..].to_string()))
            }
            Value::Array(items) => Ok(Expr::Array(
                items.iter().map(Expr::parse).collect::<Result<Vec<_>>>()?,
            )),
            Value::Object(obj) => {
                let operator_keys = obj.keys().filter(|k| k.starts_with('$')).count();
                if operator_keys == 0 {
                    let fields = obj
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), Expr::parse(v)?)))
                        .collect::<Result<Vec<_>>>()?;
                    return Ok(Expr::Object(fields));
                }
                if obj.len() != 1 {
                    return Err(expr_error(
                        "Expression object must have exactly one operator",
                    ));
                }
                let (name, arg) = obj
                    .iter()
                    .next()
                    .ok_or_else(|| expr_error("Empty expression object"))?;
                Self::parse_operator(name, arg)
            }
            other => Ok(Expr::Literal(other.clone())),
        }
    }

    fn parse_operator(name: &str, arg: &Value) -> Result<Expr> {
        match name {
            "$literal" => Ok(Expr::Literal(arg.clone())),
            "$cond" => match arg {
                Value::Array(parts) if parts.len() == 3 => Ok(Expr::Cond {
                    condition: boxed(&parts[0])?,
                    then: boxed(&parts[1])?,
                    otherwise: boxed(&parts[2])?,
                }),
                Value::Object(obj) => Ok(Expr::Cond {
                    condition: boxed(required(obj, "if", name)?)?,
                    then: boxed(required(obj, "then", name)?)?,
                    otherwise: boxed(required(obj, "else", name)?)?,
                }),
                _ => Err(expr_error("$cond requires [if, then, else] or {if, then, else}")),
            },
            "$switch" => {
                let obj = as_object(arg, name)?;
                let branches = required(obj, "branches", name)?
                    .as_array()
                    .ok_or_else(|| expr_error("$switch 'branches' must be an array"))?
                    .iter()
                    .map(|branch| {
                        let branch = as_object(branch, "$switch branch")?;
                        Ok((
                            Expr::parse(required(branch, "case", "$switch branch")?)?,
                            Expr::parse(required(branch, "then", "$switch branch")?)?,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                if branches.is_empty() {
                    return Err(expr_error("$switch requires at least one branch"));
                }
                let default = obj.get("default").map(boxed).transpose()?;
                Ok(Expr::Switch { branches, default })
            }
            "$let" => {
                let obj = as_object(arg, name)?;
                let vars = as_object(required(obj, "vars", name)?, "$let vars")?
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Expr::parse(v)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::Let {
                    vars,
                    body: boxed(required(obj, "in", name)?)?,
                })
            }
            "$reduce" => {
                let obj = as_object(arg, name)?;
                Ok(Expr::Reduce {
                    input: boxed(required(obj, "input", name)?)?,
                    initial: boxed(required(obj, "initialValue", name)?)?,
                    body: boxed(required(obj, "in", name)?)?,
                })
            }
            "$filter" => {
                let obj = as_object(arg, name)?;
                Ok(Expr::Filter {
                    input: boxed(required(obj, "input", name)?)?,
                    alias: parse_alias(obj, name)?,
                    condition: boxed(required(obj, "cond", name)?)?,
                })
            }
            "$map" => {
                let obj = as_object(arg, name)?;
                Ok(Expr::Map {
                    input: boxed(required(obj, "input", name)?)?,
                    alias: parse_alias(obj, name)?,
                    body: boxed(required(obj, "in", name)?)?,
                })
            }
            "$dateDiff" => {
                let obj = as_object(arg, name)?;
                Ok(Expr::DateDiff {
                    start: boxed(required(obj, "startDate", name)?)?,
                    end: boxed(required(obj, "endDate", name)?)?,
                    unit: boxed(required(obj, "unit", name)?)?,
                })
            }
            "$dateToString" => {
                let obj = as_object(arg, name)?;
                let format = match obj.get("format") {
                    None => DEFAULT_DATE_FORMAT.to_string(),
                    Some(Value::String(f)) => f.clone(),
                    Some(_) => return Err(expr_error("$dateToString format must be a string")),
                };
                Ok(Expr::DateToString {
                    date: boxed(required(obj, "date", name)?)?,
                    format,
                })
            }
            "$dateTrunc" => {
                let obj = as_object(arg, name)?;
                let unit = required(obj, "unit", name)?
                    .as_str()
                    .and_then(TimeUnit::from_str)
                    .ok_or_else(|| expr_error("$dateTrunc unit must be a time unit name"))?;
                Ok(Expr::DateTrunc {
                    date: boxed(required(obj, "date", name)?)?,
                    unit,
                })
            }
            "$median" => {
                let obj = as_object(arg, name)?;
                Ok(Expr::Median(boxed(required(obj, "input", name)?)?))
            }
            "$percentile" => {
                let obj = as_object(arg, name)?;
                let p = parse_percentiles(required(obj, "p", name)?)?;
                Ok(Expr::Percentile {
                    input: boxed(required(obj, "input", name)?)?,
                    p,
                })
            }
            _ => {
                let op = Op::from_name(name)
                    .ok_or_else(|| expr_error(format!("Unknown expression operator: {}", name)))?;
                let args = match arg {
                    Value::Array(items) => items
                        .iter()
                        .map(Expr::parse)
                        .collect::<Result<Vec<_>>>()?,
                    single => vec![Expr::parse(single)?],
                };
                let (min, max) = op.arity();
                if args.len() < min || args.len() > max {
                    return Err(expr_error(format!(
                        "{} takes {} argument(s), got {}",
                        op.name(),
                        if min == max { min.to_string() } else { format!("{}..", min) },
                        args.len()
                    )));
                }
                Ok(Expr::Call { op, args })
            }
        }
    }

    /// Field path of a bare `"$field"` reference
    pub fn as_field_path(&self) -> Option<&str> {
        match self {
            Expr::Field(path) => Some(path),
            _ => None,
        }
    }

    /// `(field, variable)` pairs this expression requires to be equal
    ///
    /// Recognises `{$eq: ["$field", "$$var"]}` (either order), also inside
    /// `$and`. Lookups use these to turn a correlated sub-pipeline into an
    /// indexed equality filter.
    pub fn var_equalities(&self) -> Vec<(String, String)> {
        match self {
            Expr::Call { op: Op::Eq, args } => match (&args[0], &args[1]) {
                (Expr::Field(field), Expr::Var { name, path: None })
                | (Expr::Var { name, path: None }, Expr::Field(field)) => {
                    vec![(field.clone(), name.clone())]
                }
                _ => Vec::new(),
            },
            Expr::Call { op: Op::And, args } => {
                args.iter().flat_map(Expr::var_equalities).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn parse_percentiles(spec: &Value) -> Result<Vec<f64>> {
    let items = spec
        .as_array()
        .ok_or_else(|| expr_error("$percentile p must be an array of numbers"))?;
    items
        .iter()
        .map(|item| {
            let p = item
                .as_f64()
                .ok_or_else(|| expr_error("$percentile p must be an array of numbers"))?;
            if !(0.0..=1.0).contains(&p) {
                return Err(expr_error(format!("percentile {} is outside [0, 1]", p)));
            }
            Ok(p)
        })
        .collect()
}

// ============================================================================
// EVALUATION
// ============================================================================

#[derive(Clone)]
struct Scope<'a> {
    root: &'a Value,
    vars: Vec<(String, Value)>,
}

impl<'a> Scope<'a> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        if name == "ROOT" || name == "CURRENT" {
            return Some(self.root);
        }
        self.vars
            .iter()
            .rev()
            .find(|(var, _)| var == name)
            .map(|(_, value)| value)
    }

    fn bind(&self, bindings: Vec<(String, Value)>) -> Scope<'a> {
        let mut vars = self.vars.clone();
        vars.extend(bindings);
        Scope {
            root: self.root,
            vars,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn from_value(value: &Value) -> Option<Num> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(Num::Int)
                .or_else(|| n.as_f64().map(Num::Float)),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Num::Int(i) => Value::from(i),
            Num::Float(f) => number_value(f),
        }
    }

    fn combine(self, other: Num, int_op: fn(i64, i64) -> Option<i64>, float_op: fn(f64, f64) -> f64) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => int_op(a, b)
                .map(Num::Int)
                .unwrap_or_else(|| Num::Float(float_op(a as f64, b as f64))),
            (a, b) => Num::Float(float_op(a.as_f64(), b.as_f64())),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn numeric_arg(value: &Value, op: Op) -> Result<Num> {
    Num::from_value(value).ok_or_else(|| {
        expr_error(format!(
            "{} only supports numeric types, not {}",
            op.name(),
            type_name(value)
        ))
    })
}

fn date_arg(value: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
    match value {
        Value::String(s) => dates::parse_timestamp(s),
        _ => None,
    }
}

/// Round half to even at `places` decimal digits
fn round_half_even(x: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    let scaled = x * factor;
    let rounded = if (scaled - scaled.trunc()).abs() == 0.5 {
        2.0 * (scaled / 2.0).round()
    } else {
        scaled.round()
    };
    rounded / factor
}

impl Expr {
    /// Evaluate against a document with no extra variables
    pub fn evaluate(&self, doc: &Value, opts: EvalOptions<'_>) -> Result<Value> {
        self.evaluate_with(doc, &[], opts)
    }

    pub fn evaluate_with(
        &self,
        doc: &Value,
        vars: &[(String, Value)],
        opts: EvalOptions<'_>,
    ) -> Result<Value> {
        let scope = Scope {
            root: doc,
            vars: vars.to_vec(),
        };
        self.eval(&scope, opts)
    }

    fn eval(&self, scope: &Scope<'_>, opts: EvalOptions<'_>) -> Result<Value> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Field(path) => Ok(resolve_path(scope.root, path).unwrap_or(Value::Null)),
            Expr::Var { name, path } => {
                let value = scope
                    .lookup(name)
                    .ok_or_else(|| expr_error(format!("Use of undefined variable: {}", name)))?;
                Ok(match path {
                    Some(path) => resolve_path(value, path).unwrap_or(Value::Null),
                    None => value.clone(),
                })
            }
            Expr::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, expr) in fields {
                    out.insert(key.clone(), expr.eval(scope, opts)?);
                }
                Ok(Value::Object(out))
            }
            Expr::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| item.eval(scope, opts))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Expr::Call { op, args } => {
                let values = args
                    .iter()
                    .map(|arg| arg.eval(scope, opts))
                    .collect::<Result<Vec<_>>>()?;
                apply_op(*op, values, opts)
            }
            Expr::Cond {
                condition,
                then,
                otherwise,
            } => {
                if is_truthy(&condition.eval(scope, opts)?) {
                    then.eval(scope, opts)
                } else {
                    otherwise.eval(scope, opts)
                }
            }
            Expr::Switch { branches, default } => {
                for (case, then) in branches {
                    if is_truthy(&case.eval(scope, opts)?) {
                        return then.eval(scope, opts);
                    }
                }
                match default {
                    Some(default) => default.eval(scope, opts),
                    None => Err(expr_error(
                        "$switch could not find a matching branch for an input, and no default was specified",
                    )),
                }
            }
            Expr::Let { vars, body } => {
                let bindings = vars
                    .iter()
                    .map(|(name, expr)| Ok((name.clone(), expr.eval(scope, opts)?)))
                    .collect::<Result<Vec<_>>>()?;
                body.eval(&scope.bind(bindings), opts)
            }
            Expr::Reduce {
                input,
                initial,
                body,
            } => {
                let Some(items) = array_input(input.eval(scope, opts)?, "$reduce")? else {
                    return Ok(Value::Null);
                };
                let mut acc = initial.eval(scope, opts)?;
                for item in items {
                    let inner = scope.bind(vec![
                        ("value".to_string(), acc),
                        ("this".to_string(), item),
                    ]);
                    acc = body.eval(&inner, opts)?;
                }
                Ok(acc)
            }
            Expr::Filter {
                input,
                alias,
                condition,
            } => {
                let Some(items) = array_input(input.eval(scope, opts)?, "$filter")? else {
                    return Ok(Value::Null);
                };
                let mut kept = Vec::new();
                for item in items {
                    let inner = scope.bind(vec![(alias.clone(), item.clone())]);
                    if is_truthy(&condition.eval(&inner, opts)?) {
                        kept.push(item);
                    }
                }
                Ok(Value::Array(kept))
            }
            Expr::Map { input, alias, body } => {
                let Some(items) = array_input(input.eval(scope, opts)?, "$map")? else {
                    return Ok(Value::Null);
                };
                let mapped = items
                    .into_iter()
                    .map(|item| body.eval(&scope.bind(vec![(alias.clone(), item)]), opts))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(mapped))
            }
            Expr::DateDiff { start, end, unit } => {
                let unit_value = unit.eval(scope, opts)?;
                let unit = unit_value
                    .as_str()
                    .and_then(TimeUnit::from_str)
                    .ok_or_else(|| expr_error(format!("$dateDiff unit is invalid: {}", unit_value)))?;
                let start = start.eval(scope, opts)?;
                let end = end.eval(scope, opts)?;
                if start.is_null() || end.is_null() {
                    return Ok(Value::Null);
                }
                functions::date_diff(&start, &end, unit)
                    .map(Value::from)
                    .ok_or_else(|| expr_error("$dateDiff requires date operands"))
            }
            Expr::DateToString { date, format } => {
                let value = date.eval(scope, opts)?;
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let dt = dates::value_to_timestamp(&value).ok_or_else(|| {
                    expr_error(format!("$dateToString requires a date, found {}", value))
                })?;
                Ok(Value::String(dates::format_with_pattern(&dt, format)?))
            }
            Expr::DateTrunc { date, unit } => {
                let value = date.eval(scope, opts)?;
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let dt = dates::value_to_timestamp(&value)
                    .ok_or_else(|| expr_error("$dateTrunc requires a date"))?;
                Ok(dates::timestamp_value(&dates::truncate(&dt, *unit)))
            }
            Expr::Median(input) => {
                let nums = numbers_of(input.eval(scope, opts)?);
                Ok(functions::median(&nums).map(number_value).unwrap_or(Value::Null))
            }
            Expr::Percentile { input, p } => {
                let nums = numbers_of(input.eval(scope, opts)?);
                let mut out = Vec::with_capacity(p.len());
                for rank in p {
                    out.push(
                        functions::percentile(&nums, *rank)?
                            .map(number_value)
                            .unwrap_or(Value::Null),
                    );
                }
                Ok(Value::Array(out))
            }
        }
    }
}

fn array_input(value: Value, op: &str) -> Result<Option<Vec<Value>>> {
    match value {
        Value::Null => Ok(None),
        Value::Array(items) => Ok(Some(items)),
        other => Err(expr_error(format!(
            "{} input must be an array, found {}",
            op,
            type_name(&other)
        ))),
    }
}

fn numbers_of(value: Value) -> Vec<f64> {
    match value {
        Value::Array(items) => functions::numeric_values(&items),
        other => as_number(&other).into_iter().collect(),
    }
}

/// Operand list for `$sum`/`$avg`/...: a single array argument is unpacked
fn statistic_operands(values: Vec<Value>) -> Vec<Value> {
    if values.len() == 1 {
        if let Value::Array(items) = &values[0] {
            return items.clone();
        }
    }
    values
}

fn undefined(opts: EvalOptions<'_>, dividend: &Value, op: Op) -> Result<Value> {
    if opts.strict {
        return Err(StoreLensError::DivisionUndefined(format!(
            "{} of {} by zero",
            op.name(),
            dividend
        )));
    }
    opts.stats.record_undefined();
    Ok(Value::Null)
}

fn apply_op(op: Op, values: Vec<Value>, opts: EvalOptions<'_>) -> Result<Value> {
    let null_in = |vals: &[Value]| vals.iter().any(Value::is_null);

    match op {
        Op::Add => {
            if null_in(&values) {
                return Ok(Value::Null);
            }
            let mut date: Option<chrono::DateTime<chrono::Utc>> = None;
            let mut total = Num::Int(0);
            for value in &values {
                if let Some(dt) = date_arg(value) {
                    if date.is_some() {
                        return Err(expr_error("$add supports at most one date"));
                    }
                    date = Some(dt);
                } else {
                    total = total.combine(numeric_arg(value, op)?, i64::checked_add, |a, b| a + b);
                }
            }
            Ok(match date {
                Some(dt) => {
                    let shifted = dt + chrono::Duration::milliseconds(total.as_f64() as i64);
                    dates::timestamp_value(&shifted)
                }
                None => total.into_value(),
            })
        }
        Op::Subtract => {
            if null_in(&values) {
                return Ok(Value::Null);
            }
            match (date_arg(&values[0]), date_arg(&values[1])) {
                (Some(a), Some(b)) => Ok(Value::from((a - b).num_milliseconds())),
                (Some(a), None) => {
                    let millis = numeric_arg(&values[1], op)?.as_f64() as i64;
                    Ok(dates::timestamp_value(&(a - chrono::Duration::milliseconds(millis))))
                }
                (None, Some(_)) => Err(expr_error("$subtract cannot subtract a date from a number")),
                (None, None) => {
                    let a = numeric_arg(&values[0], op)?;
                    let b = numeric_arg(&values[1], op)?;
                    Ok(a.combine(b, i64::checked_sub, |x, y| x - y).into_value())
                }
            }
        }
        Op::Multiply => {
            if null_in(&values) {
                return Ok(Value::Null);
            }
            let mut product = Num::Int(1);
            for value in &values {
                product = product.combine(numeric_arg(value, op)?, i64::checked_mul, |a, b| a * b);
            }
            Ok(product.into_value())
        }
        Op::Divide | Op::Mod => {
            if null_in(&values) {
                return Ok(Value::Null);
            }
            let a = numeric_arg(&values[0], op)?;
            let b = numeric_arg(&values[1], op)?;
            if b.as_f64() == 0.0 {
                return undefined(opts, &values[0], op);
            }
            if op == Op::Divide {
                return Ok(number_value(a.as_f64() / b.as_f64()));
            }
            Ok(match (a, b) {
                (Num::Int(x), Num::Int(y)) => Value::from(x.wrapping_rem(y)),
                (x, y) => number_value(x.as_f64() % y.as_f64()),
            })
        }
        Op::Round => {
            if null_in(&values) {
                return Ok(Value::Null);
            }
            let places = match values.get(1) {
                Some(p) => p
                    .as_i64()
                    .filter(|p| (-20..=100).contains(p))
                    .ok_or_else(|| expr_error("$round place must be an integer in [-20, 100]"))?
                    as i32,
                None => 0,
            };
            Ok(match numeric_arg(&values[0], op)? {
                Num::Int(i) if places >= 0 => Value::from(i),
                Num::Int(i) => Value::from(round_half_even(i as f64, places) as i64),
                Num::Float(f) => number_value(round_half_even(f, places)),
            })
        }
        Op::Floor | Op::Ceil | Op::Abs => {
            if values[0].is_null() {
                return Ok(Value::Null);
            }
            Ok(match numeric_arg(&values[0], op)? {
                Num::Int(i) if op == Op::Abs => Value::from(i.saturating_abs()),
                Num::Int(i) => Value::from(i),
                Num::Float(f) => number_value(match op {
                    Op::Floor => f.floor(),
                    Op::Ceil => f.ceil(),
                    _ => f.abs(),
                }),
            })
        }
        Op::Size => match &values[0] {
            Value::Array(items) => Ok(Value::from(items.len() as u64)),
            other => Err(expr_error(format!(
                "$size requires an array, found {}",
                type_name(other)
            ))),
        },
        Op::ArrayElemAt => {
            if null_in(&values) {
                return Ok(Value::Null);
            }
            let items = values[0]
                .as_array()
                .ok_or_else(|| expr_error("$arrayElemAt requires an array"))?;
            let index = values[1]
                .as_i64()
                .ok_or_else(|| expr_error("$arrayElemAt index must be an integer"))?;
            let position = if index < 0 {
                items.len() as i64 + index
            } else {
                index
            };
            Ok(usize::try_from(position)
                .ok()
                .and_then(|p| items.get(p))
                .cloned()
                .unwrap_or(Value::Null))
        }
        Op::Slice => {
            if values[0].is_null() {
                return Ok(Value::Null);
            }
            let items = values[0]
                .as_array()
                .ok_or_else(|| expr_error("$slice requires an array"))?;
            let ints: Vec<i64> = values[1..]
                .iter()
                .map(|v| v.as_i64().ok_or_else(|| expr_error("$slice bounds must be integers")))
                .collect::<Result<Vec<_>>>()?;
            let len = items.len() as i64;
            let (start, count) = match ints.as_slice() {
                [n] if *n >= 0 => (0, *n),
                [n] => (len.saturating_add(*n).max(0), n.saturating_neg()),
                [pos, n] => {
                    if *n <= 0 {
                        return Err(expr_error("$slice count must be positive"));
                    }
                    let start = if *pos < 0 { len.saturating_add(*pos).max(0) } else { (*pos).min(len) };
                    (start, *n)
                }
                _ => return Err(expr_error("$slice takes 2 or 3 arguments")),
            };
            let end = start.saturating_add(count).min(len);
            Ok(Value::Array(items[start as usize..end as usize].to_vec()))
        }
        Op::Concat => {
            if null_in(&values) {
                return Ok(Value::Null);
            }
            let mut out = String::new();
            for value in &values {
                match value {
                    Value::String(s) => out.push_str(s),
                    other => {
                        return Err(expr_error(format!(
                            "$concat only supports strings, not {}",
                            type_name(other)
                        )))
                    }
                }
            }
            Ok(Value::String(out))
        }
        Op::ToLower | Op::ToUpper => {
            let text = match &values[0] {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(Value::String(if op == Op::ToLower {
                text.to_lowercase()
            } else {
                text.to_uppercase()
            }))
        }
        Op::Eq | Op::Ne | Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            let ord = total_cmp(&values[0], &values[1]);
            Ok(Value::Bool(match op {
                Op::Eq => ord == Ordering::Equal,
                Op::Ne => ord != Ordering::Equal,
                Op::Gt => ord == Ordering::Greater,
                Op::Gte => ord != Ordering::Less,
                Op::Lt => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }))
        }
        Op::And => Ok(Value::Bool(values.iter().all(is_truthy))),
        Op::Or => Ok(Value::Bool(values.iter().any(is_truthy))),
        Op::Not => Ok(Value::Bool(!is_truthy(&values[0]))),
        Op::In => {
            let items = values[1].as_array().ok_or_else(|| {
                expr_error(format!(
                    "$in requires an array as a second argument, found {}",
                    type_name(&values[1])
                ))
            })?;
            Ok(Value::Bool(items.iter().any(|item| values_equal(item, &values[0]))))
        }
        Op::IfNull => {
            let last = values.len() - 1;
            Ok(values
                .iter()
                .take(last)
                .find(|v| !v.is_null())
                .unwrap_or(&values[last])
                .clone())
        }
        Op::Sum => Ok(functions::sum(&statistic_operands(values))),
        Op::Avg => Ok(functions::avg(&statistic_operands(values))),
        Op::Min => Ok(functions::min(&statistic_operands(values))),
        Op::Max => Ok(functions::max(&statistic_operands(values))),
        Op::StdDevPop => {
            let nums = functions::numeric_values(&statistic_operands(values));
            Ok(functions::std_dev_pop(&nums)
                .map(number_value)
                .unwrap_or(Value::Null))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(spec: Value, doc: Value) -> Result<Value> {
        let stats = EvalStats::default();
        Expr::parse(&spec)?.evaluate(&doc, EvalOptions::lenient(&stats))
    }

    #[test]
    fn test_field_paths_and_literals() {
        let doc = json!({"price": 10, "items": [{"price": 1}, {"price": 2}]});
        assert_eq!(eval(json!("$price"), doc.clone()).unwrap(), json!(10));
        assert_eq!(eval(json!("$items.price"), doc.clone()).unwrap(), json!([1, 2]));
        assert_eq!(eval(json!("$missing"), doc.clone()).unwrap(), Value::Null);
        assert_eq!(eval(json!({"$literal": "$price"}), doc).unwrap(), json!("$price"));
    }

    #[test]
    fn test_arithmetic_keeps_integers() {
        let doc = json!({"a": 7, "b": 2, "c": 0.5});
        assert_eq!(eval(json!({"$add": ["$a", "$b", 1]}), doc.clone()).unwrap(), json!(10));
        assert_eq!(eval(json!({"$subtract": ["$a", "$b"]}), doc.clone()).unwrap(), json!(5));
        assert_eq!(eval(json!({"$multiply": ["$a", "$c"]}), doc.clone()).unwrap(), json!(3.5));
        assert_eq!(eval(json!({"$divide": ["$a", "$b"]}), doc.clone()).unwrap(), json!(3.5));
        assert_eq!(eval(json!({"$mod": ["$a", "$b"]}), doc.clone()).unwrap(), json!(1));
        assert_eq!(eval(json!({"$add": ["$a", "$missing"]}), doc).unwrap(), Value::Null);
    }

    #[test]
    fn test_divide_by_zero_is_counted() {
        let stats = EvalStats::default();
        let expr = Expr::parse(&json!({"$divide": ["$freight", "$price"]})).unwrap();
        let doc = json!({"freight": 15, "price": 0});
        let result = expr.evaluate(&doc, EvalOptions::lenient(&stats)).unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(stats.undefined_ratios(), 1);

        let strict = EvalOptions { strict: true, stats: &stats };
        let err = expr.evaluate(&doc, strict).unwrap_err();
        assert!(matches!(err, StoreLensError::DivisionUndefined(_)));
    }

    #[test]
    fn test_round_half_to_even() {
        let doc = json!({});
        assert_eq!(eval(json!({"$round": [2.5, 0]}), doc.clone()).unwrap().as_f64(), Some(2.0));
        assert_eq!(eval(json!({"$round": [3.5]}), doc.clone()).unwrap().as_f64(), Some(4.0));
        assert_eq!(eval(json!({"$round": [12.3456, 2]}), doc.clone()).unwrap().as_f64(), Some(12.35));
        assert_eq!(eval(json!({"$round": [1234, -2]}), doc.clone()).unwrap(), json!(1200));
        assert_eq!(eval(json!({"$round": [null, 2]}), doc).unwrap(), Value::Null);
    }

    #[test]
    fn test_cond_both_forms() {
        let doc = json!({"price": 0, "freight": 3});
        let array_form = json!({"$cond": [{"$eq": ["$price", 0]}, null, {"$divide": ["$freight", "$price"]}]});
        assert_eq!(eval(array_form, doc.clone()).unwrap(), Value::Null);

        let object_form = json!({"$cond": {"if": {"$gt": ["$freight", 2]}, "then": "high", "else": "low"}});
        assert_eq!(eval(object_form, doc).unwrap(), json!("high"));
    }

    #[test]
    fn test_size_requires_array() {
        assert_eq!(eval(json!({"$size": "$tags"}), json!({"tags": ["a", "b"]})).unwrap(), json!(2));
        let err = eval(json!({"$size": "$tags"}), json!({})).unwrap_err();
        assert!(err.to_string().contains("$size requires an array"));
    }

    #[test]
    fn test_reduce_item_stats() {
        let doc = json!({"items": [
            {"price": 250, "freight_value": 10},
            {"price": 50, "freight_value": 5.5},
            {"price": 300, "freight_value": 20}
        ]});
        let spec = json!({"$reduce": {
            "input": "$items",
            "initialValue": {"totalFreight": 0, "expensiveCnt": 0},
            "in": {
                "totalFreight": {"$add": ["$$value.totalFreight", "$$this.freight_value"]},
                "expensiveCnt": {"$add": ["$$value.expensiveCnt", {"$cond": [{"$gt": ["$$this.price", 200]}, 1, 0]}]}
            }
        }});
        let result = eval(spec, doc).unwrap();
        assert_eq!(result["totalFreight"].as_f64(), Some(35.5));
        assert_eq!(result["expensiveCnt"], json!(2));
    }

    #[test]
    fn test_filter_map_and_let() {
        let doc = json!({"items": [{"price": 250}, {"price": 50}]});
        let filtered = eval(
            json!({"$filter": {"input": "$items", "as": "it", "cond": {"$gt": ["$$it.price", 200]}}}),
            doc.clone(),
        )
        .unwrap();
        assert_eq!(filtered, json!([{"price": 250}]));

        let mapped = eval(json!({"$map": {"input": "$items", "in": {"$multiply": ["$$this.price", 2]}}}), doc.clone()).unwrap();
        assert_eq!(mapped, json!([500, 100]));

        let scoped = eval(
            json!({"$let": {"vars": {"total": {"$sum": "$items.price"}}, "in": {"$gt": ["$$total", 100]}}}),
            doc,
        )
        .unwrap();
        assert_eq!(scoped, json!(true));
    }

    #[test]
    fn test_undefined_variable() {
        let err = eval(json!("$$order_id"), json!({})).unwrap_err();
        assert!(err.to_string().contains("undefined variable"));
    }

    #[test]
    fn test_dates() {
        let doc = json!({
            "approved": "2018-01-01 10:00:00",
            "delivered": "2018-01-09 09:00:00"
        });
        let diff = json!({"$dateDiff": {"startDate": "$approved", "endDate": "$delivered", "unit": "day"}});
        assert_eq!(eval(diff, doc.clone()).unwrap(), json!(7));

        let month = json!({"$dateToString": {"format": "%Y-%m", "date": "$approved"}});
        assert_eq!(eval(month, doc.clone()).unwrap(), json!("2018-01"));

        let days = json!({"$divide": [{"$subtract": ["$delivered", "$approved"]}, 86400000]});
        let value = eval(days, doc.clone()).unwrap().as_f64().unwrap();
        assert!((value - 7.958333).abs() < 1e-5);

        let missing = json!({"$dateDiff": {"startDate": "$approved", "endDate": "$nope", "unit": "day"}});
        assert_eq!(eval(missing, doc).unwrap(), Value::Null);
    }

    #[test]
    fn test_statistics_over_arrays() {
        let doc = json!({"prices": [10, 20, 30, 40]});
        assert_eq!(eval(json!({"$sum": "$prices"}), doc.clone()).unwrap(), json!(100));
        assert_eq!(eval(json!({"$avg": "$prices"}), doc.clone()).unwrap().as_f64(), Some(25.0));
        assert_eq!(eval(json!({"$median": {"input": "$prices", "method": "approximate"}}), doc.clone()).unwrap().as_f64(), Some(25.0));
        assert_eq!(
            eval(json!({"$percentile": {"input": "$prices", "p": [0.5, 0.9], "method": "approximate"}}), doc).unwrap(),
            json!([20.0, 40.0])
        );
    }

    #[test]
    fn test_array_and_string_operators() {
        let doc = json!({"tags": ["a", "b", "c"], "name": "Informatica"});
        assert_eq!(eval(json!({"$arrayElemAt": ["$tags", -1]}), doc.clone()).unwrap(), json!("c"));
        assert_eq!(eval(json!({"$slice": ["$tags", 2]}), doc.clone()).unwrap(), json!(["a", "b"]));
        assert_eq!(eval(json!({"$slice": ["$tags", 1, 5]}), doc.clone()).unwrap(), json!(["b", "c"]));
        assert_eq!(eval(json!({"$in": ["b", "$tags"]}), doc.clone()).unwrap(), json!(true));
        assert_eq!(eval(json!({"$toLower": "$name"}), doc.clone()).unwrap(), json!("informatica"));
        assert_eq!(eval(json!({"$concat": ["$name", "-", "x"]}), doc.clone()).unwrap(), json!("Informatica-x"));
        assert_eq!(eval(json!({"$ifNull": ["$missing", "n/a"]}), doc).unwrap(), json!("n/a"));
    }

    #[test]
    fn test_slice_with_extreme_bounds() {
        let doc = json!({"tags": ["a", "b", "c"]});
        assert_eq!(
            eval(json!({"$slice": ["$tags", 1, i64::MAX]}), doc.clone()).unwrap(),
            json!(["b", "c"])
        );
        assert_eq!(eval(json!({"$slice": ["$tags", i64::MIN]}), doc.clone()).unwrap(), json!(["a", "b", "c"]));
        assert_eq!(eval(json!({"$slice": ["$tags", i64::MIN, 2]}), doc.clone()).unwrap(), json!(["a", "b"]));
        assert_eq!(eval(json!({"$slice": ["$tags", i64::MAX]}), doc).unwrap(), json!(["a", "b", "c"]));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse(&json!({"$bogus": 1})).unwrap_err().to_string().contains("Unknown expression operator"));
        assert!(Expr::parse(&json!({"$divide": [1]})).unwrap_err().to_string().contains("takes 2 argument"));
        assert!(Expr::parse(&json!({"$add": [1], "$sub": 2})).is_err());
    }

    #[test]
    fn test_switch() {
        let spec = json!({"$switch": {
            "branches": [
                {"case": {"$lt": ["$d", 0]}, "then": "early"},
                {"case": {"$eq": ["$d", 0]}, "then": "on time"}
            ],
            "default": "late"
        }});
        assert_eq!(eval(spec.clone(), json!({"d": -2})).unwrap(), json!("early"));
        assert_eq!(eval(spec.clone(), json!({"d": 0})).unwrap(), json!("on time"));
        assert_eq!(eval(spec, json!({"d": 3})).unwrap(), json!("late"));

        let no_default = json!({"$switch": {"branches": [{"case": false, "then": 1}]}});
        assert!(eval(no_default, json!({})).unwrap_err().to_string().contains("no default"));
    }

    #[test]
    fn test_var_equalities() {
        let expr = Expr::parse(&json!({"$and": [
            {"$eq": ["$order_id", "$$order_id"]},
            {"$eq": ["$$pid", "$product_id"]},
            {"$lt": ["$product_id", "$$pid"]}
        ]}))
        .unwrap();
        assert_eq!(
            expr.var_equalities(),
            vec![
                ("order_id".to_string(), "order_id".to_string()),
                ("product_id".to_string(), "pid".to_string())
            ]
        );
    }
}
