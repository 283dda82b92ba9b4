//! Business rules: model, condition language, execution, generation,
//! self-correction and persistence.
//!
//! The flow for generated rules is
//! [`generator`] → [`executor`] → [`correction`] → [`repository`]; nothing
//! reaches the repository without a syntactically valid condition.

pub mod cache;
pub mod condition;
pub mod correction;
pub mod executor;
pub mod generator;
pub mod model;
pub mod repository;

pub use cache::{RuleCache, RuleCacheConfig, RuleCacheStats};
pub use condition::{validate_condition, Condition, PredicateOutcome};
pub use correction::{SelfCorrectionLoop, DEFAULT_SAMPLE_SIZE};
pub use executor::{RuleExecutor, DEFAULT_MAX_CONCURRENCY};
pub use generator::{GeneratorKind, GeneratorRegistry, RuleGenerator};
pub use model::{
    BusinessRule, ExecutionSummary, FailedRule, RuleExecutionResult, RuleGenerationBatch,
    RuleSource, Severity, MAX_SAMPLE_VIOLATIONS,
};
pub use repository::{MemoryRuleStore, RuleRepository, RuleStore, RuleStoreError};
