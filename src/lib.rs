//! ruleforge: resumable dataset pipelines with self-correcting business rules.
//!
//! This library provides a persistent run ledger for multi-step dataset
//! pipelines, a step dispatcher with advisory quality scoring, pluggable
//! rule generators (AI prompt, statistical, schema-derived, classifier),
//! a sandboxed rule executor, and a generate → test → repair loop.

// Core modules
pub mod cli;
pub mod dataset;
pub mod error;
pub mod ledger;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod rules;
pub mod scheduler;
pub mod storage;
pub mod utils;

// Re-export commonly used error types
pub use error::{ConditionError, DatasetError, GeneratorError, LlmError};
pub use ledger::LedgerError;
pub use pipeline::{ConfigError, DispatchError, ServiceError};
