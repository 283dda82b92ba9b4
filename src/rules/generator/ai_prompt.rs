//! AI-prompt backend: asks the text-generation service for rules.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use super::{require_columns, GeneratorKind, RuleGenerator};
use crate::dataset::{Dataset, DatasetId};
use crate::error::GeneratorError;
use crate::llm::TextGenerator;
use crate::metrics;
use crate::rules::model::{BusinessRule, RuleSource, Severity};
use crate::utils::{extract_json_objects, fill_template};

/// Confidence assumed when the model does not state one.
const DEFAULT_AI_CONFIDENCE: f64 = 0.7;

/// Sample rows included in the prompt.
const PROMPT_SAMPLE_ROWS: usize = 5;

const GENERATION_PROMPT: &str = r#"You are a data quality engineer. Propose between 3 and 5 business rules for the dataset described below.

Columns:
{columns}

Sample rows:
{sample}

Write each rule as a separate JSON object with these keys:
  "name": short rule name
  "description": what the rule checks
  "condition": boolean expression over the columns
  "severity": "low", "medium" or "high"
  "message": message shown when the rule is violated
  "confidence": number between 0 and 1

Conditions use this expression language only:
  - column names as identifiers, or `quoted name` for names with spaces
  - comparisons: == != < <= > >=, logic: and or not
  - x is null, x is not null, x in ('a', 'b'), x between 1 and 10
  - functions: mean std min max sum count null_count unique_count completeness row_count
    abs len lower upper is_null not_null is_unique matches(x, 'regex') is_valid_date today now year coalesce round

Example:
{"name": "age range", "description": "Age is plausible", "condition": "age >= 0 and age <= 120", "severity": "high", "message": "Age out of range", "confidence": 0.9}
"#;

/// Builds the generation prompt from column metadata.
pub fn build_generation_prompt(dataset: &Dataset) -> String {
    let columns = dataset
        .stats()
        .iter()
        .map(|s| format!("- {}", s.describe()))
        .collect::<Vec<_>>()
        .join("\n");
    let sample = serde_json::to_string_pretty(&dataset.to_json_records(PROMPT_SAMPLE_ROWS))
        .unwrap_or_else(|_| "[]".to_string());
    fill_template(GENERATION_PROMPT, &[("columns", &columns), ("sample", &sample)])
}

/// Parses every rule object embedded in a reply.
///
/// Malformed fragments and objects without a usable condition are skipped.
/// A wrapper object like `{"rules": [...]}` is unwrapped.
pub fn parse_rule_reply(reply: &str, dataset_id: DatasetId) -> Vec<BusinessRule> {
    let mut rules = Vec::new();
    let mut skipped = 0usize;

    for fragment in extract_json_objects(reply) {
        let Some(object) = fragment.parse() else {
            skipped += 1;
            continue;
        };
        let candidates: Vec<Map<String, JsonValue>> = match object.get("rules") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_object().cloned())
                .collect(),
            _ => vec![object],
        };
        for candidate in candidates {
            match rule_from_object(&candidate, dataset_id, rules.len() + 1) {
                Some(rule) => rules.push(rule),
                None => skipped += 1,
            }
        }
    }

    if skipped > 0 {
        debug!(dataset_id, skipped, "Skipped malformed rule fragments");
    }
    rules
}

fn rule_from_object(object: &Map<String, JsonValue>, dataset_id: DatasetId, ordinal: usize) -> Option<BusinessRule> {
    let text = |key: &str| object.get(key).and_then(JsonValue::as_str).map(str::trim);

    let condition = text("condition").or_else(|| text("expression"))?;
    if condition.is_empty() {
        return None;
    }
    let name = text("name")
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("AI rule {}", ordinal));
    let severity = text("severity")
        .and_then(|s| s.parse::<Severity>().ok())
        .unwrap_or_default();
    let confidence = object
        .get("confidence")
        .and_then(JsonValue::as_f64)
        .unwrap_or(DEFAULT_AI_CONFIDENCE);

    Some(
        BusinessRule::draft(dataset_id, RuleSource::Ai, name, condition)
            .with_description(text("description").unwrap_or_default())
            .with_message(text("message").unwrap_or_default())
            .with_severity(severity)
            .with_confidence(confidence),
    )
}

/// Rule generator backed by a [`TextGenerator`].
pub struct AiPromptGenerator {
    llm: Arc<dyn TextGenerator>,
    model: Option<String>,
}

impl AiPromptGenerator {
    pub fn new(llm: Arc<dyn TextGenerator>, model: Option<String>) -> Self {
        Self { llm, model }
    }
}

#[async_trait]
impl RuleGenerator for AiPromptGenerator {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::AiPrompt
    }

    async fn generate(&self, dataset: &Dataset) -> Result<Vec<BusinessRule>, GeneratorError> {
        require_columns(dataset)?;
        let prompt = build_generation_prompt(dataset);

        let Some(reply) = self.llm.generate(&prompt, self.model.as_deref()).await else {
            metrics::record_ai_call("generation", "unavailable");
            warn!(dataset_id = dataset.id(), "Text generation unavailable, no AI drafts");
            return Ok(Vec::new());
        };
        metrics::record_ai_call("generation", "ok");

        let rules = parse_rule_reply(&reply, dataset.id());
        info!(dataset_id = dataset.id(), count = rules.len(), "AI drafts parsed");
        Ok(rules)
    }
}
