//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by ruleforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all ruleforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Pipeline step executions, labeled by step kind and final status.
pub static STEPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Step execution duration in seconds, labeled by step kind.
pub static STEP_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Rule executions, labeled by outcome (passed/failed).
pub static RULE_EXECUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Logical AI calls, labeled by purpose and outcome.
pub static AI_CALLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Rules accepted by the self-correction loop, labeled by engine.
pub static RULES_ACCEPTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// LLM request latency in seconds, labeled by model and status.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Number of workers currently running a step.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric construction or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Pipeline metrics
    let steps_total = CounterVec::new(
        Opts::new("ruleforge_steps_total", "Total pipeline step executions"),
        &["step", "status"],
    )?;

    let step_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "ruleforge_step_duration_seconds",
            "Pipeline step duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["step"],
    )?;

    // Rule metrics
    let rule_executions_total = CounterVec::new(
        Opts::new("ruleforge_rule_executions_total", "Total rule executions"),
        &["outcome"],
    )?;

    let ai_calls_total = CounterVec::new(
        Opts::new("ruleforge_ai_calls_total", "Total logical AI calls"),
        &["purpose", "outcome"],
    )?;

    let rules_accepted_total = CounterVec::new(
        Opts::new(
            "ruleforge_rules_accepted_total",
            "Total rules accepted by the self-correction loop",
        ),
        &["engine"],
    )?;

    let llm_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "ruleforge_llm_latency_seconds",
            "LLM request latency in seconds, retries included",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["model", "status"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new("ruleforge_active_workers", "Number of active workers")?;

    registry.register(Box::new(steps_total.clone()))?;
    registry.register(Box::new(step_duration.clone()))?;
    registry.register(Box::new(rule_executions_total.clone()))?;
    registry.register(Box::new(ai_calls_total.clone()))?;
    registry.register(Box::new(rules_accepted_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    let _ = STEPS_TOTAL.set(steps_total);
    let _ = STEP_DURATION.set(step_duration);
    let _ = RULE_EXECUTIONS_TOTAL.set(rule_executions_total);
    let _ = AI_CALLS_TOTAL.set(ai_calls_total);
    let _ = RULES_ACCEPTED_TOTAL.set(rules_accepted_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = REGISTRY.set(registry);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of failing when the registry is not
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();
        if let Some(counter) = RULE_EXECUTIONS_TOTAL.get() {
            counter.with_label_values(&["passed"]).inc();
        }
        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("ruleforge_rule_executions_total"));
    }
}
