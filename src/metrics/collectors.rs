//! Recording helpers for ruleforge operations.
//!
//! Every helper is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, AI_CALLS_TOTAL, LLM_LATENCY, RULES_ACCEPTED_TOTAL, RULE_EXECUTIONS_TOTAL,
    STEPS_TOTAL, STEP_DURATION,
};

/// Records one step execution.
///
/// # Arguments
///
/// * `step` - Step kind (e.g., "validate", "business_rules")
/// * `status` - Final status ("completed", "failed", "skipped")
/// * `duration_secs` - Wall time spent in the handler
pub fn record_step(step: &str, status: &str, duration_secs: f64) {
    if let Some(steps_total) = STEPS_TOTAL.get() {
        steps_total.with_label_values(&[step, status]).inc();
    }
    if let Some(step_duration) = STEP_DURATION.get() {
        step_duration
            .with_label_values(&[step])
            .observe(duration_secs);
    }
    tracing::trace!(step, status, duration_secs, "Recorded step metric");
}

/// Records one rule execution.
pub fn record_rule_execution(success: bool) {
    if let Some(counter) = RULE_EXECUTIONS_TOTAL.get() {
        let outcome = if success { "passed" } else { "failed" };
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Records one logical AI call (generation, classifier, table_qa or repair).
pub fn record_ai_call(purpose: &str, outcome: &str) {
    if let Some(counter) = AI_CALLS_TOTAL.get() {
        counter.with_label_values(&[purpose, outcome]).inc();
    }
    tracing::trace!(purpose, outcome, "Recorded AI call metric");
}

/// Records how many rules a self-correction batch accepted.
pub fn record_rules_accepted(engine: &str, count: usize) {
    if let Some(counter) = RULES_ACCEPTED_TOTAL.get() {
        counter.with_label_values(&[engine]).inc_by(count as f64);
    }
}

/// Records one LLM request, retries included.
pub fn record_llm_request(model: &str, success: bool, latency_secs: f64) {
    if let Some(latency) = LLM_LATENCY.get() {
        let status = if success { "success" } else { "failure" };
        latency
            .with_label_values(&[model, status])
            .observe(latency_secs);
    }
}

/// Sets the number of workers currently running a step.
pub fn set_active_workers(count: usize) {
    if let Some(gauge) = ACTIVE_WORKERS.get() {
        gauge.set(count as f64);
    }
}
