//! Rule execution against a read-only dataset.
//!
//! [`RuleExecutor::execute`] never fails: parse, bind and evaluation errors
//! are captured into a failed [`RuleExecutionResult`]. Bulk execution fans
//! rules out on the blocking pool, all sharing one `Arc<Dataset>`.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::condition::{Condition, PredicateOutcome};
use super::model::{BusinessRule, RuleExecutionResult, MAX_SAMPLE_VIOLATIONS};
use crate::dataset::Dataset;
use crate::metrics;

/// Default number of rules evaluated at the same time by [`RuleExecutor::execute_all`].
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Evaluates business rules against datasets.
#[derive(Debug, Clone)]
pub struct RuleExecutor {
    max_concurrency: usize,
}

impl Default for RuleExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl RuleExecutor {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Executes one rule. Every outcome is audit-logged.
    pub fn execute(&self, rule: &BusinessRule, dataset: &Dataset) -> RuleExecutionResult {
        let started = Instant::now();
        let outcome = Condition::parse(&rule.condition).and_then(|c| c.evaluate(dataset));
        let elapsed = started.elapsed();

        let result = match outcome {
            Err(e) => RuleExecutionResult::failure(rule.id, e.to_string(), elapsed),
            Ok(PredicateOutcome::Scalar(passed)) => RuleExecutionResult {
                rule_id: rule.id,
                success: passed,
                message: if passed {
                    "dataset-level condition holds".to_string()
                } else {
                    "dataset-level condition evaluated to false".to_string()
                },
                affected_row_count: 0,
                sample_violations: Vec::new(),
                rows_evaluated: 0,
                execution_time_ms: elapsed.as_millis() as u64,
            },
            Ok(PredicateOutcome::Rows {
                evaluated,
                violations,
            }) => {
                let total = violations.len();
                RuleExecutionResult {
                    rule_id: rule.id,
                    success: total == 0,
                    message: if total == 0 {
                        format!("all {} rows passed", evaluated)
                    } else {
                        format!("{} of {} rows violate condition", total, evaluated)
                    },
                    affected_row_count: total,
                    sample_violations: violations.into_iter().take(MAX_SAMPLE_VIOLATIONS).collect(),
                    rows_evaluated: evaluated,
                    execution_time_ms: elapsed.as_millis() as u64,
                }
            }
        };

        audit(rule, dataset, &result);
        result
    }

    /// Executes many rules concurrently against the same dataset.
    ///
    /// Results come back in input order. A panic inside one evaluation is
    /// reported as that rule's failure and does not affect the others.
    pub async fn execute_all(
        &self,
        rules: &[BusinessRule],
        dataset: Arc<Dataset>,
    ) -> Vec<RuleExecutionResult> {
        if rules.is_empty() {
            return Vec::new();
        }
        debug!(
            dataset_id = dataset.id(),
            rule_count = rules.len(),
            "Executing rules"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let tasks = rules.iter().cloned().map(|rule| {
            let dataset = Arc::clone(&dataset);
            let semaphore = Arc::clone(&semaphore);
            let executor = self.clone();
            async move {
                let _permit = semaphore.acquire_owned().await;
                let rule_id = rule.id;
                let started = Instant::now();
                match tokio::task::spawn_blocking(move || executor.execute(&rule, &dataset)).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(rule_id = %rule_id, error = %e, "Rule evaluation task aborted");
                        metrics::record_rule_execution(false);
                        let reason = if e.is_panic() {
                            "rule evaluation panicked"
                        } else {
                            "rule evaluation was cancelled"
                        };
                        RuleExecutionResult::failure(rule_id, reason, started.elapsed())
                    }
                }
            }
        });

        let results = join_all(tasks).await;

        // Re-key by rule id so callers can rely on positional pairing.
        rules
            .iter()
            .map(|rule| {
                results
                    .iter()
                    .find(|r| r.rule_id == rule.id)
                    .cloned()
                    .unwrap_or_else(|| {
                        RuleExecutionResult::failure(rule.id, "missing execution result", Default::default())
                    })
            })
            .collect()
    }
}

fn audit(rule: &BusinessRule, dataset: &Dataset, result: &RuleExecutionResult) {
    metrics::record_rule_execution(result.success);
    info!(
        target: "ruleforge::audit",
        rule_id = %rule.id,
        dataset_id = dataset.id(),
        dataset_version = dataset.version(),
        severity = %rule.severity,
        success = result.success,
        affected_rows = result.affected_row_count,
        duration_ms = result.execution_time_ms,
        message = %result.message,
        "Rule executed"
    );
}
