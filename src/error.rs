//! Error types for ruleforge operations.
//!
//! Defines error types for the subsystems shared across modules:
//! - Dataset loading and tabular access
//! - Condition parsing, compilation and evaluation
//! - Rule generation backends
//! - LLM API interactions
//!
//! Errors owned by a single subsystem (ledger, dispatcher, storage, worker
//! pool) live next to that subsystem.

use thiserror::Error;

/// Errors that can occur while loading or reading datasets.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset {0} not found")]
    NotFound(i64),

    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Row {row} has {actual} values, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid dataset payload: {0}")]
    InvalidPayload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the condition grammar.
///
/// `Syntax` errors are produced before any dataset is touched; `Compile`
/// errors need a dataset (unknown columns, aggregate over text);
/// `Evaluation` errors happen row by row.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("Syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("column '{0}' not found")]
    UnknownColumn(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Function '{name}' expects {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: String,
        actual: usize,
    },

    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Evaluation error at row {row}: {message}")]
    Evaluation { row: usize, message: String },

    #[error("Condition must evaluate to a boolean, got {0}")]
    NotBoolean(String),
}

/// Errors that can occur during rule generation.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Dataset has no columns to generate rules from")]
    NoColumns,

    #[error("Generator backend '{0}' is not registered")]
    NotRegistered(String),

    #[error("Classifier failed: {0}")]
    Classifier(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) | LlmError::RateLimited(_) | LlmError::Timeout(_) => true,
            LlmError::ApiError { code, .. } => matches!(code, 408 | 429 | 500 | 502 | 503 | 504),
            LlmError::MissingApiBase | LlmError::ParseError(_) => false,
        }
    }
}
