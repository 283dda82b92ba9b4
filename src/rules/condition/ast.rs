//! Condition syntax tree and the fixed function set.

use std::fmt;

use crate::dataset::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

/// Parsed condition or value expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Column(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Column names referenced anywhere in the expression.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column(name) => out.push(name),
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.collect_columns(out),
            Expr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::InList { expr, list, .. } => {
                expr.collect_columns(out);
                list.iter().for_each(|e| e.collect_columns(out));
            }
            Expr::Between { expr, low, high } => {
                expr.collect_columns(out);
                low.collect_columns(out);
                high.collect_columns(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|e| e.collect_columns(out)),
        }
    }
}

/// Whether a function reduces a whole column or maps row by row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Aggregate,
    Row,
}

/// The closed set of callable functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    // Aggregates over one column (folded to constants at compile time).
    Mean,
    Std,
    Min,
    Max,
    Sum,
    Count,
    NullCount,
    UniqueCount,
    Completeness,
    RowCount,
    // Row-wise.
    Abs,
    Len,
    Lower,
    Upper,
    IsNull,
    NotNull,
    IsUnique,
    Matches,
    IsValidDate,
    Today,
    Now,
    Year,
    Coalesce,
    Round,
}

impl Function {
    pub const ALL: [Function; 24] = [
        Function::Mean,
        Function::Std,
        Function::Min,
        Function::Max,
        Function::Sum,
        Function::Count,
        Function::NullCount,
        Function::UniqueCount,
        Function::Completeness,
        Function::RowCount,
        Function::Abs,
        Function::Len,
        Function::Lower,
        Function::Upper,
        Function::IsNull,
        Function::NotNull,
        Function::IsUnique,
        Function::Matches,
        Function::IsValidDate,
        Function::Today,
        Function::Now,
        Function::Year,
        Function::Coalesce,
        Function::Round,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Function::Mean => "mean",
            Function::Std => "std",
            Function::Min => "min",
            Function::Max => "max",
            Function::Sum => "sum",
            Function::Count => "count",
            Function::NullCount => "null_count",
            Function::UniqueCount => "unique_count",
            Function::Completeness => "completeness",
            Function::RowCount => "row_count",
            Function::Abs => "abs",
            Function::Len => "len",
            Function::Lower => "lower",
            Function::Upper => "upper",
            Function::IsNull => "is_null",
            Function::NotNull => "not_null",
            Function::IsUnique => "is_unique",
            Function::Matches => "matches",
            Function::IsValidDate => "is_valid_date",
            Function::Today => "today",
            Function::Now => "now",
            Function::Year => "year",
            Function::Coalesce => "coalesce",
            Function::Round => "round",
        }
    }

    /// Resolves a function by name, accepting a few common aliases.
    pub fn lookup(name: &str) -> Option<Function> {
        let lower = name.to_ascii_lowercase();
        let canonical = match lower.as_str() {
            "avg" | "average" => "mean",
            "stddev" | "stdev" => "std",
            "length" => "len",
            "isnull" | "isna" => "is_null",
            "notnull" | "notna" => "not_null",
            "regex" | "match" => "matches",
            other => other,
        };
        Function::ALL.into_iter().find(|f| f.name() == canonical)
    }

    pub fn kind(self) -> FunctionKind {
        match self {
            Function::Mean
            | Function::Std
            | Function::Min
            | Function::Max
            | Function::Sum
            | Function::Count
            | Function::NullCount
            | Function::UniqueCount
            | Function::Completeness
            | Function::RowCount => FunctionKind::Aggregate,
            _ => FunctionKind::Row,
        }
    }

    /// Inclusive (min, max) argument count; `None` max means variadic.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Function::RowCount | Function::Today | Function::Now => (0, Some(0)),
            Function::Matches => (2, Some(2)),
            Function::Round => (1, Some(2)),
            Function::Coalesce => (1, None),
            _ => (1, Some(1)),
        }
    }

    pub fn arity_text(self) -> String {
        match self.arity() {
            (lo, Some(hi)) if lo == hi => lo.to_string(),
            (lo, Some(hi)) => format!("{}..{}", lo, hi),
            (lo, None) => format!("at least {}", lo),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_aliases() {
        assert_eq!(Function::lookup("AVG"), Some(Function::Mean));
        assert_eq!(Function::lookup("notna"), Some(Function::NotNull));
        assert_eq!(Function::lookup("eval"), None);
    }

    #[test]
    fn test_every_function_round_trips_by_name() {
        for f in Function::ALL {
            assert_eq!(Function::lookup(f.name()), Some(f));
        }
    }
}
