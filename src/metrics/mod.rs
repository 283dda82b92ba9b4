//! Metrics module for Prometheus-based monitoring.
//!
//! Counters and histograms for pipeline steps, rule executions and AI
//! calls. Recording helpers are free functions so the rule engine can
//! record without threading a collector through every call.
//!
//! # Example
//!
//! ```ignore
//! use ruleforge::metrics::{init_metrics, export_metrics, record_step};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! record_step("validate", "completed", 0.8);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{
    record_ai_call, record_llm_request, record_rule_execution, record_rules_accepted,
    record_step, set_active_workers,
};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, AI_CALLS_TOTAL, LLM_LATENCY, REGISTRY, RULES_ACCEPTED_TOTAL,
    RULE_EXECUTIONS_TOTAL, STEPS_TOTAL, STEP_DURATION,
};
