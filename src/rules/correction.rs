//! Generate → test → repair → retest cycle for draft rules.
//!
//! Drafts are executed against the first `sample_size` rows. Each failing
//! draft gets exactly one repair request; the corrected variant is accepted
//! only if it passes the same sample. Nothing here persists rules, the
//! returned [`RuleGenerationBatch`] is handed to the repository by the caller.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::executor::RuleExecutor;
use super::generator::{dedupe_drafts, GeneratorRegistry};
use super::model::{BusinessRule, FailedRule, RuleExecutionResult, RuleGenerationBatch};
use crate::dataset::Dataset;
use crate::llm::TextGenerator;
use crate::metrics;
use crate::utils::{extract_json_objects, fill_template, strip_code_fences};

/// Default number of leading rows drafts are tested against.
pub const DEFAULT_SAMPLE_SIZE: usize = 1000;

const REPAIR_PROMPT: &str = r#"A data quality rule failed when tested against the dataset.

Rule name: {name}
Description: {description}
Condition: {condition}
Error: {error}

Available columns:
{columns}

Return only the corrected condition expression, using the same expression language and only the columns listed above. Do not explain."#;

/// Builds the repair prompt for one failing draft.
pub fn build_repair_prompt(rule: &BusinessRule, error: &str, dataset: &Dataset) -> String {
    let columns = dataset
        .stats()
        .iter()
        .map(|s| format!("- {}", s.describe()))
        .collect::<Vec<_>>()
        .join("\n");
    fill_template(
        REPAIR_PROMPT,
        &[
            ("name", &rule.name),
            ("description", &rule.description),
            ("condition", &rule.condition),
            ("error", error),
            ("columns", &columns),
        ],
    )
}

/// Pulls the corrected condition out of a repair reply.
///
/// Accepts `{"condition": "..."}`, a fenced block, or bare text; a leading
/// `condition:` label is dropped.
pub fn parse_repair_reply(reply: &str) -> Option<String> {
    let from_json = extract_json_objects(reply)
        .iter()
        .filter_map(|f| f.parse())
        .find_map(|obj| obj.get("condition").and_then(JsonValue::as_str).map(str::to_string));

    let text = from_json.unwrap_or_else(|| {
        let body = strip_code_fences(reply);
        let line = body
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string();
        match line.split_once(':') {
            Some((label, rest)) if label.trim().eq_ignore_ascii_case("condition") => {
                rest.trim().to_string()
            }
            _ => line,
        }
    });

    let text = text.trim().trim_matches('`').trim();
    (!text.is_empty()).then(|| text.to_string())
}

enum RepairOutcome {
    Accepted(BusinessRule),
    Rejected(FailedRule),
}

/// Orchestrates a generator backend and the executor to harden drafts.
pub struct SelfCorrectionLoop {
    registry: Arc<GeneratorRegistry>,
    executor: RuleExecutor,
    llm: Option<Arc<dyn TextGenerator>>,
    model: Option<String>,
    sample_size: usize,
}

impl SelfCorrectionLoop {
    pub fn new(registry: Arc<GeneratorRegistry>, executor: RuleExecutor) -> Self {
        Self {
            registry,
            executor,
            llm: None,
            model: None,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }

    /// Text generator used for repair requests. Without one, failing
    /// drafts are reported as failed with no correction attempt.
    pub fn with_repair(mut self, llm: Arc<dyn TextGenerator>, model: Option<String>) -> Self {
        self.llm = Some(llm);
        self.model = model;
        self
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    pub fn registry(&self) -> &GeneratorRegistry {
        &self.registry
    }

    /// Runs one generation cycle. Never fails: generator errors and service
    /// outages produce a batch with fewer (possibly zero) accepted rules.
    pub async fn run(&self, dataset: Arc<Dataset>, engine: &str) -> RuleGenerationBatch {
        let started = Instant::now();
        let dataset_id = dataset.id();

        let (engine_used, drafts) = match self.registry.resolve(engine) {
            Ok(generator) => {
                let kind = generator.kind();
                match generator.generate(&dataset).await {
                    Ok(drafts) => (kind.to_string(), dedupe_drafts(drafts)),
                    Err(e) => {
                        warn!(dataset_id, engine = %kind, error = %e, "Rule generation failed");
                        (kind.to_string(), Vec::new())
                    }
                }
            }
            Err(e) => {
                warn!(dataset_id, engine, error = %e, "No rule generator available");
                (engine.to_string(), Vec::new())
            }
        };

        let sample = Arc::new(dataset.head(self.sample_size));
        let results = self.executor.execute_all(&drafts, Arc::clone(&sample)).await;

        let mut passing = Vec::new();
        let mut failing: Vec<(BusinessRule, RuleExecutionResult)> = Vec::new();
        for (rule, result) in drafts.iter().cloned().zip(results) {
            if result.success {
                passing.push(rule);
            } else {
                failing.push((rule, result));
            }
        }
        debug!(
            dataset_id,
            engine = %engine_used,
            passing = passing.len(),
            failing = failing.len(),
            "Drafts tested against sample"
        );

        let outcomes = join_all(
            failing
                .iter()
                .map(|(rule, result)| self.repair(rule, &result.message, &sample)),
        )
        .await;

        let mut corrected_rules = Vec::new();
        let mut failed_rules = Vec::new();
        for outcome in outcomes {
            match outcome {
                RepairOutcome::Accepted(rule) => corrected_rules.push(rule),
                RepairOutcome::Rejected(failed) => failed_rules.push(failed),
            }
        }

        let mut rules = passing;
        rules.extend(corrected_rules.iter().cloned());
        metrics::record_rules_accepted(&engine_used, rules.len());

        let batch = RuleGenerationBatch {
            dataset_id,
            engine_used,
            initial_rules_count: drafts.len(),
            failed_rules_count: failing.len(),
            corrected_rules_count: corrected_rules.len(),
            rules,
            failed_rules,
            corrected_rules,
            execution_time_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            dataset_id,
            engine = %batch.engine_used,
            initial = batch.initial_rules_count,
            failed = batch.failed_rules_count,
            corrected = batch.corrected_rules_count,
            accepted = batch.rules.len(),
            duration_ms = batch.execution_time_ms,
            "Rule generation batch finished"
        );
        batch
    }

    async fn repair(&self, rule: &BusinessRule, error: &str, sample: &Arc<Dataset>) -> RepairOutcome {
        let rejected = |attempted: Option<String>, reason: String| {
            RepairOutcome::Rejected(FailedRule {
                rule: rule.clone(),
                error: error.to_string(),
                attempted_correction: attempted,
                correction_error: Some(reason),
            })
        };

        let Some(llm) = &self.llm else {
            return rejected(None, "repair service not configured".to_string());
        };

        let prompt = build_repair_prompt(rule, error, sample);
        let Some(reply) = llm.generate(&prompt, self.model.as_deref()).await else {
            metrics::record_ai_call("repair", "unavailable");
            warn!(rule_id = %rule.id, "Repair service unavailable");
            return rejected(None, "repair service unavailable".to_string());
        };
        metrics::record_ai_call("repair", "ok");

        let Some(condition) = parse_repair_reply(&reply) else {
            return rejected(None, "repair reply contained no condition".to_string());
        };
        if condition == rule.condition {
            return rejected(Some(condition), "repair returned the original condition".to_string());
        }

        let candidate = rule.corrected(condition.clone());
        let dataset = Arc::clone(sample);
        let executor = self.executor.clone();
        let retest_rule = candidate.clone();
        let retest = tokio::task::spawn_blocking(move || executor.execute(&retest_rule, &dataset)).await;

        match retest {
            Ok(result) if result.success => {
                debug!(rule_id = %rule.id, corrected_id = %candidate.id, "Corrected rule accepted");
                RepairOutcome::Accepted(candidate)
            }
            Ok(result) => rejected(Some(condition), result.message),
            Err(e) => rejected(Some(condition), format!("retest aborted: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Value;
    use crate::error::GeneratorError;
    use crate::rules::generator::{GeneratorKind, RuleGenerator};
    use crate::rules::model::RuleSource;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedGenerator {
        conditions: Vec<&'static str>,
    }

    #[async_trait]
    impl RuleGenerator for FixedGenerator {
        fn kind(&self) -> GeneratorKind {
            GeneratorKind::AiPrompt
        }

        async fn generate(&self, dataset: &Dataset) -> Result<Vec<BusinessRule>, GeneratorError> {
            Ok(self
                .conditions
                .iter()
                .enumerate()
                .map(|(i, c)| BusinessRule::draft(dataset.id(), RuleSource::Ai, format!("rule {}", i), *c))
                .collect())
        }
    }

    struct ScriptedRepair {
        replies: Mutex<VecDeque<Option<String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedRepair {
        fn new(replies: Vec<Option<&str>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(|r| r.map(str::to_string)).collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedRepair {
        async fn generate(&self, _prompt: &str, _model: Option<&str>) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies.lock().unwrap().pop_front().flatten()
        }
    }

    fn dataset() -> Arc<Dataset> {
        let rows = (0..5).map(|i| vec![Value::Int(20 + i)]).collect();
        Arc::new(Dataset::from_rows(42, &["age"], rows).unwrap())
    }

    fn correction_loop(conditions: Vec<&'static str>) -> SelfCorrectionLoop {
        let registry = GeneratorRegistry::new(GeneratorKind::AiPrompt)
            .with(Arc::new(FixedGenerator { conditions }));
        SelfCorrectionLoop::new(Arc::new(registry), RuleExecutor::default())
    }

    #[tokio::test]
    async fn test_repairs_missing_column() {
        let repair = ScriptedRepair::new(vec![Some("```\nage >= 0\n```")]);
        let batch = correction_loop(vec!["age < 200", "foo > 0"])
            .with_repair(repair.clone(), None)
            .run(dataset(), "ai")
            .await;

        assert_eq!(batch.initial_rules_count, 2);
        assert_eq!(batch.failed_rules_count, 1);
        assert_eq!(batch.corrected_rules_count, 1);
        assert_eq!(batch.rules.len(), 2);
        assert_eq!(repair.calls.load(Ordering::SeqCst), 1);

        let corrected = &batch.corrected_rules[0];
        assert_eq!(corrected.condition, "age >= 0");
        assert!(corrected.is_corrected());
        assert_eq!(corrected.metadata["original_condition"], "foo > 0");
    }

    #[tokio::test]
    async fn test_failed_repair_is_reported_with_attempt() {
        let repair = ScriptedRepair::new(vec![Some(r#"{"condition": "bar > 0"}"#)]);
        let batch = correction_loop(vec!["foo > 0"])
            .with_repair(repair, None)
            .run(dataset(), "ai")
            .await;

        assert!(batch.rules.is_empty());
        assert_eq!(batch.failed_rules.len(), 1);
        let failed = &batch.failed_rules[0];
        assert_eq!(failed.error, "column 'foo' not found");
        assert_eq!(failed.attempted_correction.as_deref(), Some("bar > 0"));
        assert_eq!(failed.correction_error.as_deref(), Some("column 'bar' not found"));
        assert_eq!(
            batch.corrected_rules_count + batch.discarded_count(),
            batch.failed_rules_count
        );
    }

    #[tokio::test]
    async fn test_repair_outage_degrades() {
        let repair = ScriptedRepair::new(vec![None, None]);
        let batch = correction_loop(vec!["foo > 0", "age > 100", "age > 0"])
            .with_repair(repair.clone(), None)
            .run(dataset(), "ai")
            .await;

        assert_eq!(batch.rules.len(), 1);
        assert_eq!(batch.failed_rules.len(), 2);
        assert!(batch.failed_rules.iter().all(|f| f.attempted_correction.is_none()));
        // One attempt per failing draft, never more.
        assert_eq!(repair.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_without_repair_service() {
        let batch = correction_loop(vec!["foo > 0"]).run(dataset(), "ai").await;
        assert_eq!(batch.failed_rules_count, 1);
        assert_eq!(
            batch.failed_rules[0].correction_error.as_deref(),
            Some("repair service not configured")
        );
    }

    #[tokio::test]
    async fn test_tests_against_bounded_sample() {
        // Ages 22 and up fall outside a 2-row sample.
        let batch = correction_loop(vec!["age < 22"])
            .with_sample_size(2)
            .run(dataset(), "ai")
            .await;
        assert_eq!(batch.rules.len(), 1);
    }

    #[test]
    fn test_parse_repair_reply_forms() {
        assert_eq!(parse_repair_reply("age > 0").as_deref(), Some("age > 0"));
        assert_eq!(parse_repair_reply("Condition: `age > 0`").as_deref(), Some("age > 0"));
        assert_eq!(
            parse_repair_reply("Sure!\n{\"condition\": \"x between 1 and 2\"}").as_deref(),
            Some("x between 1 and 2")
        );
        assert_eq!(parse_repair_reply("   "), None);
    }

    #[test]
    fn test_repair_prompt_carries_error() {
        let ds = dataset();
        let rule = BusinessRule::new(42, "r", "foo > 0").with_description("positive foo");
        let prompt = build_repair_prompt(&rule, "column 'foo' not found", &ds);
        assert!(prompt.contains("Condition: foo > 0"));
        assert!(prompt.contains("Error: column 'foo' not found"));
        assert!(prompt.contains("- age: type=integer"));
    }

    #[test]
    fn test_repair_prompt_keeps_placeholder_text_in_values() {
        let ds = dataset();
        let rule = BusinessRule::new(42, "{condition}", "label == '{error}'")
            .with_description("mentions {columns}");
        let prompt = build_repair_prompt(&rule, "bad {name}", &ds);
        assert!(prompt.contains("Rule name: {condition}\n"));
        assert!(prompt.contains("Description: mentions {columns}\n"));
        assert!(prompt.contains("Condition: label == '{error}'\n"));
        assert!(prompt.contains("Error: bad {name}\n"));
    }
}
