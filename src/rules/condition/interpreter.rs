//! Binding and tree-walking evaluation of condition expressions.
//!
//! Compilation resolves column names to indices, folds aggregate calls
//! (`mean(col)`, `completeness(col)`, ...) into constants, and compiles regex
//! patterns once. Evaluation then walks the bound tree per row.
//!
//! Null handling follows three-valued logic: arithmetic and comparison with
//! null yield null, and a row whose predicate is null is not a violation.
//! Only `is null`, `is_null()` and `not_null()` observe nulls directly.

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Utc};
use regex::Regex;

use super::ast::{BinaryOp, Expr, Function, UnaryOp};
use crate::dataset::{parse_date, Dataset, Value};
use crate::error::ConditionError;

/// Result of evaluating a predicate over a whole dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum PredicateOutcome {
    /// The condition does not depend on individual rows (e.g. `completeness(x) >= 0.95`).
    Scalar(bool),
    /// Row-wise evaluation; `violations` lists failing row indices in order.
    Rows {
        evaluated: usize,
        violations: Vec<usize>,
    },
}

impl PredicateOutcome {
    pub fn passed(&self) -> bool {
        match self {
            PredicateOutcome::Scalar(ok) => *ok,
            PredicateOutcome::Rows { violations, .. } => violations.is_empty(),
        }
    }
}

#[derive(Debug)]
enum RowFn {
    Abs,
    Len,
    Lower,
    Upper,
    IsNull,
    NotNull,
    IsUnique(HashSet<String>),
    Matches(Regex),
    IsValidDate,
    Year,
    Coalesce,
    Round,
}

#[derive(Debug)]
enum Bound {
    Const(Value),
    Column(usize),
    Neg(Box<Bound>),
    Not(Box<Bound>),
    Binary(BinaryOp, Box<Bound>, Box<Bound>),
    IsNull(Box<Bound>, bool),
    InList(Box<Bound>, Vec<Bound>, bool),
    Between(Box<Bound>, Box<Bound>, Box<Bound>),
    Call(RowFn, Vec<Bound>),
}

/// An expression bound to one dataset.
#[derive(Debug)]
pub struct CompiledExpr<'a> {
    dataset: &'a Dataset,
    root: Bound,
    row_dependent: bool,
}

impl<'a> CompiledExpr<'a> {
    /// Binds an expression to a dataset.
    ///
    /// Fails with [`ConditionError::UnknownColumn`] when a referenced column
    /// does not exist, or [`ConditionError::Compile`] when an aggregate is
    /// applied to a column of the wrong type.
    pub fn compile(expr: &Expr, dataset: &'a Dataset) -> Result<Self, ConditionError> {
        let mut binder = Binder {
            dataset,
            aggregates: HashMap::new(),
            row_dependent: false,
        };
        let root = binder.bind(expr)?;
        Ok(Self {
            dataset,
            root,
            row_dependent: binder.row_dependent,
        })
    }

    pub fn is_row_dependent(&self) -> bool {
        self.row_dependent
    }

    /// Evaluates the expression for one row.
    pub fn eval_row(&self, row: usize) -> Result<Value, ConditionError> {
        self.eval(&self.root, row)
            .map_err(|message| ConditionError::Evaluation { row, message })
    }

    /// Evaluates the expression as a predicate over every row.
    pub fn evaluate_predicate(&self) -> Result<PredicateOutcome, ConditionError> {
        if !self.row_dependent {
            let value = self.eval_row(0)?;
            return Ok(PredicateOutcome::Scalar(as_predicate(&value)?.unwrap_or(true)));
        }

        let evaluated = self.dataset.row_count();
        let mut violations = Vec::new();
        for row in 0..evaluated {
            let value = self.eval_row(row)?;
            if as_predicate(&value)? == Some(false) {
                violations.push(row);
            }
        }
        Ok(PredicateOutcome::Rows {
            evaluated,
            violations,
        })
    }

    fn eval(&self, node: &Bound, row: usize) -> Result<Value, String> {
        match node {
            Bound::Const(v) => Ok(v.clone()),
            Bound::Column(idx) => Ok(self.dataset.column_at(*idx).values[row].clone()),
            Bound::Neg(inner) => match self.eval(inner, row)? {
                Value::Null => Ok(Value::Null),
                Value::Int(i) => Ok(i.checked_neg().map(Value::Int).unwrap_or(Value::Float(-(i as f64)))),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(format!("cannot negate {}", other.type_name())),
            },
            Bound::Not(inner) => {
                let v = self.eval(inner, row)?;
                Ok(match truthy(&v)? {
                    Some(b) => Value::Bool(!b),
                    None => Value::Null,
                })
            }
            Bound::Binary(BinaryOp::And, left, right) => {
                let l = truthy(&self.eval(left, row)?)?;
                if l == Some(false) {
                    return Ok(Value::Bool(false));
                }
                let r = truthy(&self.eval(right, row)?)?;
                Ok(match (l, r) {
                    (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                })
            }
            Bound::Binary(BinaryOp::Or, left, right) => {
                let l = truthy(&self.eval(left, row)?)?;
                if l == Some(true) {
                    return Ok(Value::Bool(true));
                }
                let r = truthy(&self.eval(right, row)?)?;
                Ok(match (l, r) {
                    (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                })
            }
            Bound::Binary(op, left, right) => {
                let l = self.eval(left, row)?;
                let r = self.eval(right, row)?;
                match op {
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                        arithmetic(*op, &l, &r)
                    }
                    _ => comparison(*op, &l, &r),
                }
            }
            Bound::IsNull(inner, negated) => {
                let is_null = self.eval(inner, row)?.is_null();
                Ok(Value::Bool(is_null != *negated))
            }
            Bound::InList(inner, list, negated) => {
                let v = self.eval(inner, row)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                for item in list {
                    let candidate = self.eval(item, row)?;
                    if v.compare(&candidate) == Some(std::cmp::Ordering::Equal) {
                        return Ok(Value::Bool(!*negated));
                    }
                }
                Ok(Value::Bool(*negated))
            }
            Bound::Between(inner, low, high) => {
                let v = self.eval(inner, row)?;
                let lo = comparison(BinaryOp::Gte, &v, &self.eval(low, row)?)?;
                let hi = comparison(BinaryOp::Lte, &v, &self.eval(high, row)?)?;
                Ok(match (truthy(&lo)?, truthy(&hi)?) {
                    (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                })
            }
            Bound::Call(function, args) => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a, row))
                    .collect::<Result<Vec<_>, _>>()?;
                call_row_function(function, values)
            }
        }
    }
}

struct Binder<'a> {
    dataset: &'a Dataset,
    aggregates: HashMap<(Function, usize), Value>,
    row_dependent: bool,
}

impl Binder<'_> {
    fn bind(&mut self, expr: &Expr) -> Result<Bound, ConditionError> {
        Ok(match expr {
            Expr::Literal(v) => Bound::Const(v.clone()),
            Expr::Column(name) => {
                self.row_dependent = true;
                Bound::Column(self.resolve(name)?)
            }
            Expr::Unary { op, expr } => {
                let inner = Box::new(self.bind(expr)?);
                match op {
                    UnaryOp::Neg => Bound::Neg(inner),
                    UnaryOp::Not => Bound::Not(inner),
                }
            }
            Expr::Binary { op, left, right } => {
                Bound::Binary(*op, Box::new(self.bind(left)?), Box::new(self.bind(right)?))
            }
            Expr::IsNull { expr, negated } => Bound::IsNull(Box::new(self.bind(expr)?), *negated),
            Expr::InList {
                expr,
                list,
                negated,
            } => Bound::InList(
                Box::new(self.bind(expr)?),
                list.iter().map(|e| self.bind(e)).collect::<Result<_, _>>()?,
                *negated,
            ),
            Expr::Between { expr, low, high } => Bound::Between(
                Box::new(self.bind(expr)?),
                Box::new(self.bind(low)?),
                Box::new(self.bind(high)?),
            ),
            Expr::Call { function, args } => self.bind_call(*function, args)?,
        })
    }

    fn resolve(&self, name: &str) -> Result<usize, ConditionError> {
        self.dataset
            .column_index(name)
            .ok_or_else(|| ConditionError::UnknownColumn(name.to_string()))
    }

    fn column_arg(&self, args: &[Expr]) -> Result<usize, ConditionError> {
        match args.first() {
            Some(Expr::Column(name)) => self.resolve(name),
            _ => Err(ConditionError::Compile(
                "expected a column argument".to_string(),
            )),
        }
    }

    fn bind_call(&mut self, function: Function, args: &[Expr]) -> Result<Bound, ConditionError> {
        match function {
            Function::RowCount => Ok(Bound::Const(Value::Int(self.dataset.row_count() as i64))),
            Function::Today => Ok(Bound::Const(Value::Date(Utc::now().date_naive()))),
            Function::Now => Ok(Bound::Const(Value::DateTime(Utc::now()))),
            Function::Mean
            | Function::Std
            | Function::Min
            | Function::Max
            | Function::Sum
            | Function::Count
            | Function::NullCount
            | Function::UniqueCount
            | Function::Completeness => {
                let idx = self.column_arg(args)?;
                if let Some(v) = self.aggregates.get(&(function, idx)) {
                    return Ok(Bound::Const(v.clone()));
                }
                let value = aggregate(self.dataset, function, idx)?;
                self.aggregates.insert((function, idx), value.clone());
                Ok(Bound::Const(value))
            }
            Function::IsUnique => {
                let idx = self.column_arg(args)?;
                self.row_dependent = true;
                let mut seen = HashSet::new();
                let mut duplicates = HashSet::new();
                for v in self.dataset.column_at(idx).values.iter().filter(|v| !v.is_null()) {
                    let key = v.key();
                    if !seen.insert(key.clone()) {
                        duplicates.insert(key);
                    }
                }
                Ok(Bound::Call(RowFn::IsUnique(duplicates), vec![Bound::Column(idx)]))
            }
            Function::Matches => {
                let pattern = match args.get(1) {
                    Some(Expr::Literal(Value::Str(p))) => p,
                    _ => {
                        return Err(ConditionError::Compile(
                            "matches() pattern must be a string literal".to_string(),
                        ))
                    }
                };
                let regex = Regex::new(pattern)
                    .map_err(|e| ConditionError::Compile(format!("invalid regex: {}", e)))?;
                let subject = self.bind(&args[0])?;
                Ok(Bound::Call(RowFn::Matches(regex), vec![subject]))
            }
            other => {
                let row_fn = match other {
                    Function::Abs => RowFn::Abs,
                    Function::Len => RowFn::Len,
                    Function::Lower => RowFn::Lower,
                    Function::Upper => RowFn::Upper,
                    Function::IsNull => RowFn::IsNull,
                    Function::NotNull => RowFn::NotNull,
                    Function::IsValidDate => RowFn::IsValidDate,
                    Function::Year => RowFn::Year,
                    Function::Coalesce => RowFn::Coalesce,
                    Function::Round => RowFn::Round,
                    _ => return Err(ConditionError::UnknownFunction(other.name().to_string())),
                };
                let bound = args.iter().map(|a| self.bind(a)).collect::<Result<_, _>>()?;
                Ok(Bound::Call(row_fn, bound))
            }
        }
    }
}

fn aggregate(dataset: &Dataset, function: Function, idx: usize) -> Result<Value, ConditionError> {
    let column = dataset.column_at(idx);
    let stats = &dataset.stats()[idx];
    let numeric = || -> Result<(), ConditionError> {
        if column.dtype.is_numeric() || stats.row_count == stats.null_count {
            Ok(())
        } else {
            Err(ConditionError::Compile(format!(
                "{}() requires a numeric column, '{}' is {}",
                function, column.name, column.dtype
            )))
        }
    };
    let opt = |v: Option<f64>| v.map(Value::Float).unwrap_or(Value::Null);

    Ok(match function {
        Function::Mean => {
            numeric()?;
            opt(stats.mean)
        }
        Function::Std => {
            numeric()?;
            opt(stats.std)
        }
        Function::Min if column.dtype.is_temporal() => {
            stats.min_date.map(Value::Date).unwrap_or(Value::Null)
        }
        Function::Max if column.dtype.is_temporal() => {
            stats.max_date.map(Value::Date).unwrap_or(Value::Null)
        }
        Function::Min => {
            numeric()?;
            opt(stats.min)
        }
        Function::Max => {
            numeric()?;
            opt(stats.max)
        }
        Function::Sum => {
            numeric()?;
            Value::Float(column.values.iter().filter_map(|v| v.as_f64()).sum())
        }
        Function::Count => Value::Int((stats.row_count - stats.null_count) as i64),
        Function::NullCount => Value::Int(stats.null_count as i64),
        Function::UniqueCount => Value::Int(stats.unique_count as i64),
        Function::Completeness => Value::Float(stats.completeness()),
        _ => {
            return Err(ConditionError::Compile(format!(
                "{}() is not an aggregate",
                function
            )))
        }
    })
}

fn truthy(value: &Value) -> Result<Option<bool>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        other if other.is_null() => Ok(None),
        other => Err(format!("expected boolean, got {}", other.type_name())),
    }
}

fn as_predicate(value: &Value) -> Result<Option<bool>, ConditionError> {
    truthy(value).map_err(|_| ConditionError::NotBoolean(value.type_name().to_string()))
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, String> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    if let (BinaryOp::Add, Value::Str(a), Value::Str(b)) = (op, l, r) {
        return Ok(Value::Str(format!("{}{}", a, b)));
    }
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        let checked = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            BinaryOp::Mod if *b == 0 => return Ok(Value::Null),
            BinaryOp::Mod => a.checked_rem(*b),
            _ => None,
        };
        if let Some(v) = checked {
            return Ok(Value::Int(v));
        }
    }
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok(match op {
            BinaryOp::Add => Value::Float(a + b),
            BinaryOp::Sub => Value::Float(a - b),
            BinaryOp::Mul => Value::Float(a * b),
            BinaryOp::Div | BinaryOp::Mod if b == 0.0 => Value::Null,
            BinaryOp::Div => Value::Float(a / b),
            BinaryOp::Mod => Value::Float(a % b),
            _ => unreachable!("arithmetic called with comparison operator"),
        }),
        _ => Err(format!(
            "unsupported operand types for {}: {} and {}",
            op.symbol(),
            l.type_name(),
            r.type_name()
        )),
    }
}

fn comparison(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, String> {
    use std::cmp::Ordering;

    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match l.compare(r) {
        Some(ord) => Ok(Value::Bool(match op {
            BinaryOp::Eq => ord == Ordering::Equal,
            BinaryOp::NotEq => ord != Ordering::Equal,
            BinaryOp::Lt => ord == Ordering::Less,
            BinaryOp::Lte => ord != Ordering::Greater,
            BinaryOp::Gt => ord == Ordering::Greater,
            BinaryOp::Gte => ord != Ordering::Less,
            _ => unreachable!("comparison called with non-comparison operator"),
        })),
        None => match op {
            BinaryOp::Eq => Ok(Value::Bool(false)),
            BinaryOp::NotEq => Ok(Value::Bool(true)),
            _ => Err(format!(
                "cannot compare {} with {} using {}",
                l.type_name(),
                r.type_name(),
                op.symbol()
            )),
        },
    }
}

fn call_row_function(function: &RowFn, mut args: Vec<Value>) -> Result<Value, String> {
    let first = args.first().cloned().unwrap_or(Value::Null);
    Ok(match function {
        RowFn::IsNull => Value::Bool(first.is_null()),
        RowFn::NotNull => Value::Bool(!first.is_null()),
        RowFn::Coalesce => args
            .drain(..)
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null),
        _ if first.is_null() => Value::Null,
        RowFn::Abs => match first {
            Value::Int(i) => Value::Int(i.saturating_abs()),
            Value::Float(f) => Value::Float(f.abs()),
            other => return Err(format!("abs() requires a number, got {}", other.type_name())),
        },
        RowFn::Len => Value::Int(first.to_string().chars().count() as i64),
        RowFn::Lower => match first {
            Value::Str(s) => Value::Str(s.to_lowercase()),
            other => return Err(format!("lower() requires a string, got {}", other.type_name())),
        },
        RowFn::Upper => match first {
            Value::Str(s) => Value::Str(s.to_uppercase()),
            other => return Err(format!("upper() requires a string, got {}", other.type_name())),
        },
        RowFn::IsUnique(duplicates) => Value::Bool(!duplicates.contains(&first.key())),
        RowFn::Matches(regex) => Value::Bool(regex.is_match(&first.to_string())),
        RowFn::IsValidDate => Value::Bool(match &first {
            Value::Date(_) | Value::DateTime(_) => true,
            Value::Str(s) => parse_date(s).is_some(),
            _ => false,
        }),
        RowFn::Year => first
            .as_date()
            .map(|d| Value::Int(d.year() as i64))
            .unwrap_or(Value::Null),
        RowFn::Round => {
            let digits = match args.get(1) {
                Some(Value::Int(d)) => *d as i32,
                Some(Value::Null) | None => 0,
                Some(other) => {
                    return Err(format!("round() digits must be an integer, got {}", other.type_name()))
                }
            };
            match first {
                Value::Int(i) => Value::Int(i),
                Value::Float(f) => {
                    let factor = 10f64.powi(digits);
                    Value::Float((f * factor).round() / factor)
                }
                other => return Err(format!("round() requires a number, got {}", other.type_name())),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;

    fn dataset() -> Dataset {
        Dataset::from_rows(
            1,
            &["age", "email", "code", "joined"],
            vec![
                vec![
                    Value::Int(-5),
                    Value::Str("a@x.io".into()),
                    Value::Str("AB".into()),
                    Value::Str("2023-01-05".into()),
                ],
                vec![
                    Value::Int(90),
                    Value::Null,
                    Value::Str("AB".into()),
                    Value::Str("not a date".into()),
                ],
                vec![
                    Value::Int(40),
                    Value::Str("b@x.io".into()),
                    Value::Str("CD".into()),
                    Value::Str("2024-02-29".into()),
                ],
            ],
        )
        .unwrap()
    }

    fn outcome(src: &str, ds: &Dataset) -> Result<PredicateOutcome, ConditionError> {
        let expr = parse(src)?;
        CompiledExpr::compile(&expr, ds)?.evaluate_predicate()
    }

    #[test]
    fn test_range_predicate_passes() {
        let ds = dataset();
        assert!(outcome("age >= -5 and age <= 90", &ds).unwrap().passed());
    }

    #[test]
    fn test_violations_are_collected() {
        let ds = dataset();
        let result = outcome("age > 0", &ds).unwrap();
        assert_eq!(
            result,
            PredicateOutcome::Rows {
                evaluated: 3,
                violations: vec![0]
            }
        );
    }

    #[test]
    fn test_null_is_not_a_violation_except_explicit_checks() {
        let ds = dataset();
        assert!(outcome("len(email) > 3", &ds).unwrap().passed());
        let result = outcome("email is not null", &ds).unwrap();
        assert!(!result.passed());
        assert!(!outcome("not_null(email)", &ds).unwrap().passed());
    }

    #[test]
    fn test_unknown_column() {
        let ds = dataset();
        assert_eq!(
            outcome("foo > 1", &ds).unwrap_err(),
            ConditionError::UnknownColumn("foo".into())
        );
    }

    #[test]
    fn test_aggregates_fold_to_scalar() {
        let ds = dataset();
        let expr = parse("completeness(email) >= 0.95").unwrap();
        let compiled = CompiledExpr::compile(&expr, &ds).unwrap();
        assert!(!compiled.is_row_dependent());
        assert_eq!(
            compiled.evaluate_predicate().unwrap(),
            PredicateOutcome::Scalar(false)
        );
        assert!(outcome("row_count() == 3", &ds).unwrap().passed());
    }

    #[test]
    fn test_outlier_rule_with_statistics() {
        let ds = dataset();
        assert!(outcome(
            "age >= mean(age) - 3 * std(age) and age <= mean(age) + 3 * std(age)",
            &ds
        )
        .unwrap()
        .passed());
    }

    #[test]
    fn test_mean_of_text_column_is_compile_error() {
        let ds = dataset();
        assert!(matches!(
            outcome("mean(email) > 1", &ds),
            Err(ConditionError::Compile(_))
        ));
    }

    #[test]
    fn test_type_error_is_evaluation_error() {
        let ds = dataset();
        assert!(matches!(
            outcome("email + 1 > 2", &ds),
            Err(ConditionError::Evaluation { row: 0, .. })
        ));
    }

    #[test]
    fn test_non_boolean_predicate() {
        let ds = dataset();
        assert_eq!(
            outcome("age + 1", &ds).unwrap_err(),
            ConditionError::NotBoolean("integer".into())
        );
    }

    #[test]
    fn test_in_list_unique_and_regex() {
        let ds = dataset();
        assert!(outcome("code in ('AB', 'CD')", &ds).unwrap().passed());
        let unique = outcome("is_unique(code)", &ds).unwrap();
        assert_eq!(
            unique,
            PredicateOutcome::Rows {
                evaluated: 3,
                violations: vec![0, 1]
            }
        );
        assert!(outcome("matches(email, '^[^@]+@[^@]+$')", &ds).unwrap().passed());
    }

    #[test]
    fn test_date_validity_and_future() {
        let ds = dataset();
        let result = outcome("is_valid_date(joined)", &ds).unwrap();
        assert_eq!(
            result,
            PredicateOutcome::Rows {
                evaluated: 3,
                violations: vec![1]
            }
        );
        assert!(outcome("not is_valid_date(joined) or joined <= today()", &ds)
            .unwrap()
            .passed());
    }

    #[test]
    fn test_eval_row_for_derived_values() {
        let ds = dataset();
        let expr = parse("round(age / 3, 1)").unwrap();
        let compiled = CompiledExpr::compile(&expr, &ds).unwrap();
        assert_eq!(compiled.eval_row(2).unwrap(), Value::Float(13.3));
        assert_eq!(compiled.eval_row(0).unwrap(), Value::Float(-1.7));
    }

    #[test]
    fn test_between_with_null_bound_is_three_valued() {
        let ds = dataset();
        assert_eq!(
            outcome("age between 0 and null", &ds).unwrap(),
            PredicateOutcome::Rows {
                evaluated: 3,
                violations: vec![0]
            }
        );
    }

    #[test]
    fn test_now_includes_earlier_today() {
        let stamp = Utc::now() - chrono::Duration::seconds(30);
        let ds = Dataset::from_rows(1, &["created_at"], vec![vec![Value::DateTime(stamp)]]).unwrap();
        assert!(outcome("created_at <= now()", &ds).unwrap().passed());
        assert!(outcome("created_at <= today()", &ds).unwrap().passed());
    }

    #[test]
    fn test_division_by_zero_is_null() {
        let ds = dataset();
        assert!(outcome("age / 0 > 1", &ds).unwrap().passed());
    }
}
