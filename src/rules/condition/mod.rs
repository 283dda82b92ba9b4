//! The closed condition grammar rules are written in.
//!
//! Conditions are boolean expressions over column names, literals,
//! comparison and logical operators, and a fixed set of functions. Nothing
//! outside this grammar can be expressed, so untrusted text (including
//! model output) is safe to evaluate.
//!
//! ```text
//! age >= 0 and age <= 120
//! email is not null and matches(email, '^[^@]+@[^@]+$')
//! `signup date` <= today()
//! amount <= mean(amount) + 3 * std(amount)
//! df['status'] in ('active', 'paused')
//! ```

mod ast;
mod interpreter;
mod lexer;
mod parser;

pub use ast::{BinaryOp, Expr, Function, FunctionKind, UnaryOp};
pub use interpreter::{CompiledExpr, PredicateOutcome};
pub use parser::parse;

use crate::dataset::Dataset;
use crate::error::ConditionError;

/// A parsed condition, independent of any dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    text: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, ConditionError> {
        Ok(Self {
            text: text.trim().to_string(),
            expr: parse(text)?,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn referenced_columns(&self) -> Vec<&str> {
        self.expr.referenced_columns()
    }

    /// Binds the condition to a dataset for evaluation.
    pub fn bind<'a>(&self, dataset: &'a Dataset) -> Result<CompiledExpr<'a>, ConditionError> {
        CompiledExpr::compile(&self.expr, dataset)
    }

    /// Binds and evaluates as a predicate in one step.
    pub fn evaluate(&self, dataset: &Dataset) -> Result<PredicateOutcome, ConditionError> {
        self.bind(dataset)?.evaluate_predicate()
    }
}

/// Checks that condition text parses and, when a dataset is given, that it
/// binds to that dataset's columns.
pub fn validate_condition(text: &str, dataset: Option<&Dataset>) -> Result<(), ConditionError> {
    let condition = Condition::parse(text)?;
    if let Some(dataset) = dataset {
        condition.bind(dataset)?;
    }
    Ok(())
}
