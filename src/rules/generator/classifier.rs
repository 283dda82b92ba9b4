//! Model-classifier backend.
//!
//! In zero-shot mode a classifier scores the candidate rule categories for
//! every column description, and only categories scoring above the
//! threshold are materialized into rules. In table-QA mode the text
//! generator is asked natural-language questions about a rendering of the
//! column table, and the answers are mapped onto the same templates.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::{column_ref, require_columns, string_literal, GeneratorKind, KnownFormat, RuleGenerator};
use crate::dataset::{format_number, ColumnStats, ColumnType, Dataset, MAX_CATEGORIES};
use crate::error::GeneratorError;
use crate::llm::TextGenerator;
use crate::metrics;
use crate::rules::model::{BusinessRule, RuleSource, Severity};
use crate::utils::extract_json_objects;

/// Scores at or below this are not materialized.
pub const DEFAULT_CLASSIFIER_THRESHOLD: f64 = 0.7;

/// Candidate rule categories scored per column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleCategory {
    NotNull,
    Unique,
    Range,
    Format,
    Enumeration,
}

impl RuleCategory {
    pub const ALL: [RuleCategory; 5] = [
        RuleCategory::NotNull,
        RuleCategory::Unique,
        RuleCategory::Range,
        RuleCategory::Format,
        RuleCategory::Enumeration,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RuleCategory::NotNull => "not_null",
            RuleCategory::Unique => "unique",
            RuleCategory::Range => "range",
            RuleCategory::Format => "format",
            RuleCategory::Enumeration => "enumeration",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        RuleCategory::ALL.into_iter().find(|c| c.label() == normalized)
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything a classifier may look at for one column.
#[derive(Debug, Clone)]
pub struct ColumnInput<'a> {
    pub stats: &'a ColumnStats,
    /// Natural-language description (see [`ColumnStats::describe`]).
    pub description: String,
    pub format: Option<KnownFormat>,
}

/// Zero-shot classifier over [`RuleCategory`] labels.
#[async_trait]
pub trait ZeroShotClassifier: Send + Sync {
    /// Scores every category in `[0, 1]` for every column, in input order.
    async fn classify(
        &self,
        columns: &[ColumnInput<'_>],
    ) -> Result<Vec<HashMap<RuleCategory, f64>>, GeneratorError>;
}

/// Local classifier that scores categories from column statistics.
#[derive(Debug, Clone, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    fn score(column: &ColumnInput<'_>) -> HashMap<RuleCategory, f64> {
        let stats = column.stats;
        let non_null = stats.row_count - stats.null_count;
        let name = stats.name.to_ascii_lowercase();
        let id_like = name == "id" || name.ends_with("_id") || (name.ends_with("id") && name.len() <= 4);

        let not_null = match stats.completeness() {
            c if c >= 1.0 && stats.row_count > 0 => 0.95,
            c if c >= 0.99 => 0.75,
            c => c * 0.5,
        };
        let unique = if stats.is_unique() && non_null >= 2 {
            if id_like {
                0.95
            } else if stats.dtype == ColumnType::Text || stats.dtype == ColumnType::Integer {
                0.75
            } else {
                0.5
            }
        } else {
            0.05
        };
        let range = if stats.min.is_some() && stats.max.is_some() && !id_like {
            0.85
        } else if stats.dtype.is_temporal() {
            0.4
        } else {
            0.05
        };
        let format = if column.format.is_some() { 0.9 } else { 0.1 };
        let enumeration = if matches!(stats.dtype, ColumnType::Text | ColumnType::Boolean)
            && stats.unique_count > 0
            && stats.unique_count <= MAX_CATEGORIES
            && stats.unique_count * 2 <= non_null
        {
            0.8
        } else {
            0.1
        };

        HashMap::from([
            (RuleCategory::NotNull, not_null),
            (RuleCategory::Unique, unique),
            (RuleCategory::Range, range),
            (RuleCategory::Format, format),
            (RuleCategory::Enumeration, enumeration),
        ])
    }
}

#[async_trait]
impl ZeroShotClassifier for HeuristicClassifier {
    async fn classify(
        &self,
        columns: &[ColumnInput<'_>],
    ) -> Result<Vec<HashMap<RuleCategory, f64>>, GeneratorError> {
        Ok(columns.iter().map(Self::score).collect())
    }
}

const CLASSIFY_PROMPT: &str = r#"Classify which data quality rule categories apply to each column.
Categories: not_null, unique, range, format, enumeration.

Columns:
{columns}

Reply with one JSON object per column, in the same order, shaped like:
{"column": "<name>", "scores": {"not_null": 0.0, "unique": 0.0, "range": 0.0, "format": 0.0, "enumeration": 0.0}}
Scores are probabilities between 0 and 1."#;

/// Classifier that asks the text-generation service for label scores.
pub struct LlmClassifier {
    llm: Arc<dyn TextGenerator>,
    model: Option<String>,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn TextGenerator>, model: Option<String>) -> Self {
        Self { llm, model }
    }
}

#[async_trait]
impl ZeroShotClassifier for LlmClassifier {
    async fn classify(
        &self,
        columns: &[ColumnInput<'_>],
    ) -> Result<Vec<HashMap<RuleCategory, f64>>, GeneratorError> {
        let listing = columns
            .iter()
            .map(|c| format!("- {}", c.description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = CLASSIFY_PROMPT.replace("{columns}", &listing);

        let Some(reply) = self.llm.generate(&prompt, self.model.as_deref()).await else {
            metrics::record_ai_call("classifier", "unavailable");
            return Err(GeneratorError::Classifier("text generation unavailable".to_string()));
        };
        metrics::record_ai_call("classifier", "ok");

        let mut by_column: HashMap<String, HashMap<RuleCategory, f64>> = HashMap::new();
        for object in extract_json_objects(&reply).iter().filter_map(|f| f.parse()) {
            let (Some(name), Some(JsonValue::Object(scores))) =
                (object.get("column").and_then(JsonValue::as_str), object.get("scores"))
            else {
                continue;
            };
            let parsed = scores
                .iter()
                .filter_map(|(label, score)| {
                    Some((RuleCategory::from_label(label)?, score.as_f64()?.clamp(0.0, 1.0)))
                })
                .collect();
            by_column.insert(name.to_string(), parsed);
        }

        Ok(columns
            .iter()
            .map(|c| by_column.remove(&c.stats.name).unwrap_or_default())
            .collect())
    }
}

/// How the classifier backend derives categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassifierMode {
    #[default]
    ZeroShot,
    TableQa,
}

/// Rule generator driven by a [`ZeroShotClassifier`] or table QA.
pub struct ClassifierGenerator {
    classifier: Arc<dyn ZeroShotClassifier>,
    threshold: f64,
    mode: ClassifierMode,
    qa_llm: Option<Arc<dyn TextGenerator>>,
    model: Option<String>,
}

impl ClassifierGenerator {
    pub fn new(classifier: Arc<dyn ZeroShotClassifier>) -> Self {
        Self {
            classifier,
            threshold: DEFAULT_CLASSIFIER_THRESHOLD,
            mode: ClassifierMode::ZeroShot,
            qa_llm: None,
            model: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Switches to table-QA mode, answering questions with `llm`.
    pub fn with_table_qa(mut self, llm: Arc<dyn TextGenerator>, model: Option<String>) -> Self {
        self.mode = ClassifierMode::TableQa;
        self.qa_llm = Some(llm);
        self.model = model;
        self
    }

    pub fn mode(&self) -> ClassifierMode {
        self.mode
    }

    async fn zero_shot(&self, dataset: &Dataset) -> Result<Vec<BusinessRule>, GeneratorError> {
        let inputs = column_inputs(dataset);
        let scores = match self.classifier.classify(&inputs).await {
            Ok(scores) => scores,
            Err(e) => {
                warn!(dataset_id = dataset.id(), error = %e, "Classifier unavailable, no drafts");
                return Ok(Vec::new());
            }
        };

        let mut rules = Vec::new();
        for (input, column_scores) in inputs.iter().zip(scores) {
            for category in RuleCategory::ALL {
                let score = column_scores.get(&category).copied().unwrap_or(0.0);
                if score <= self.threshold {
                    continue;
                }
                if let Some(rule) = materialize(dataset.id(), input, category, score) {
                    rules.push(rule);
                }
            }
        }
        Ok(rules)
    }

    async fn table_qa(&self, dataset: &Dataset) -> Result<Vec<BusinessRule>, GeneratorError> {
        let Some(llm) = &self.qa_llm else {
            return Err(GeneratorError::Classifier(
                "table QA mode requires a text generator".to_string(),
            ));
        };
        let inputs = column_inputs(dataset);
        let prompt = build_table_qa_prompt(&inputs);

        let Some(reply) = llm.generate(&prompt, self.model.as_deref()).await else {
            metrics::record_ai_call("table_qa", "unavailable");
            warn!(dataset_id = dataset.id(), "Table QA unavailable, no drafts");
            return Ok(Vec::new());
        };
        metrics::record_ai_call("table_qa", "ok");

        let answers: HashMap<String, JsonValue> = extract_json_objects(&reply)
            .iter()
            .filter_map(|f| f.parse())
            .flat_map(|m| m.into_iter())
            .collect();

        let mut rules = Vec::new();
        for input in &inputs {
            let name = &input.stats.name;
            let answer = |question: &str| answers.get(&format!("{}::{}", name, question));

            if answer("has_missing").is_some_and(is_no) {
                rules.extend(materialize(dataset.id(), input, RuleCategory::NotNull, 0.8));
            }
            if answer("all_distinct").is_some_and(is_yes) {
                rules.extend(materialize(dataset.id(), input, RuleCategory::Unique, 0.8));
            }
            let low = answer("minimum").and_then(as_number);
            let high = answer("maximum").and_then(as_number);
            if let (Some(low), Some(high)) = (low, high) {
                if input.stats.dtype.is_numeric() && low <= high {
                    let col = column_ref(name);
                    rules.push(
                        BusinessRule::draft(
                            dataset.id(),
                            RuleSource::ModelClassifier,
                            format!("{} range", name),
                            format!("{} >= {} and {} <= {}", col, format_number(low), col, format_number(high)),
                        )
                        .with_description(format!("Answer to 'what range can {} take?'", name))
                        .with_message(format!("'{}' is out of range", name))
                        .with_confidence(0.75),
                    );
                }
            }
        }
        Ok(rules)
    }
}

#[async_trait]
impl RuleGenerator for ClassifierGenerator {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::ModelClassifier
    }

    async fn generate(&self, dataset: &Dataset) -> Result<Vec<BusinessRule>, GeneratorError> {
        require_columns(dataset)?;
        let rules = match self.mode {
            ClassifierMode::ZeroShot => self.zero_shot(dataset).await?,
            ClassifierMode::TableQa => self.table_qa(dataset).await?,
        };
        debug!(dataset_id = dataset.id(), count = rules.len(), mode = ?self.mode, "Classifier drafts");
        Ok(rules)
    }
}

fn column_inputs(dataset: &Dataset) -> Vec<ColumnInput<'_>> {
    dataset
        .stats()
        .iter()
        .enumerate()
        .map(|(i, stats)| ColumnInput {
            stats,
            description: stats.describe(),
            format: if stats.dtype == ColumnType::Text {
                KnownFormat::detect(dataset.column_at(i))
            } else {
                None
            },
        })
        .collect()
}

/// Turns a category into a concrete rule for a column, when the column supports it.
fn materialize(
    dataset_id: i64,
    input: &ColumnInput<'_>,
    category: RuleCategory,
    score: f64,
) -> Option<BusinessRule> {
    let stats = input.stats;
    let name = &stats.name;
    let col = column_ref(name);

    let (condition, severity, message) = match category {
        RuleCategory::NotNull => (
            format!("not_null({})", col),
            Severity::High,
            format!("'{}' must not be empty", name),
        ),
        RuleCategory::Unique => (
            format!("is_unique({})", col),
            Severity::High,
            format!("'{}' must be unique", name),
        ),
        RuleCategory::Range => {
            let (min, max) = (stats.min?, stats.max?);
            (
                format!("{} >= {} and {} <= {}", col, format_number(min), col, format_number(max)),
                Severity::Medium,
                format!("'{}' is out of range", name),
            )
        }
        RuleCategory::Format => (
            input.format?.condition(name),
            Severity::Medium,
            format!("'{}' has an invalid format", name),
        ),
        RuleCategory::Enumeration => {
            if stats.categories.is_empty() || stats.unique_count > MAX_CATEGORIES {
                return None;
            }
            let values: Vec<String> = stats
                .categories
                .iter()
                .map(|c| match stats.dtype {
                    ColumnType::Boolean => c.value.clone(),
                    _ => string_literal(&c.value),
                })
                .collect();
            (
                format!("{} in ({})", col, values.join(", ")),
                Severity::Medium,
                format!("'{}' has an unexpected value", name),
            )
        }
    };

    Some(
        BusinessRule::draft(
            dataset_id,
            RuleSource::ModelClassifier,
            format!("{} {}", name, category.label().replace('_', " ")),
            condition,
        )
        .with_description(format!("Classified as '{}' with score {:.2}", category, score))
        .with_severity(severity)
        .with_message(message)
        .with_confidence(score),
    )
}

fn build_table_qa_prompt(inputs: &[ColumnInput<'_>]) -> String {
    let mut table = String::from("| column | type | nulls | unique | min | max |\n|---|---|---|---|---|---|\n");
    for input in inputs {
        let s = input.stats;
        table.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            s.name,
            s.dtype,
            s.null_count,
            s.unique_count,
            s.min.map(format_number).unwrap_or_default(),
            s.max.map(format_number).unwrap_or_default(),
        ));
    }

    let mut questions = Vec::new();
    for input in inputs {
        let name = &input.stats.name;
        questions.push(format!("\"{}::has_missing\": does column {} have missing values? (yes/no)", name, name));
        questions.push(format!("\"{}::all_distinct\": are all values of {} distinct? (yes/no)", name, name));
        if input.stats.dtype.is_numeric() {
            questions.push(format!("\"{}::minimum\": what is the smallest plausible value of {}? (number)", name, name));
            questions.push(format!("\"{}::maximum\": what is the largest plausible value of {}? (number)", name, name));
        }
    }

    format!(
        "Answer questions about this table.\n\n{}\nQuestions:\n{}\n\nReply with a single JSON object mapping each question key to its answer.",
        table,
        questions.join("\n")
    )
}

fn is_yes(answer: &JsonValue) -> bool {
    match answer {
        JsonValue::Bool(b) => *b,
        JsonValue::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "yes" | "true" | "y"),
        _ => false,
    }
}

fn is_no(answer: &JsonValue) -> bool {
    match answer {
        JsonValue::Bool(b) => !*b,
        JsonValue::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "no" | "false" | "n"),
        _ => false,
    }
}

fn as_number(answer: &JsonValue) -> Option<f64> {
    match answer {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Value;
    use crate::rules::executor::RuleExecutor;
    use std::sync::Mutex;

    struct MockTextGenerator {
        response: Mutex<Option<String>>,
    }

    #[async_trait]
    impl TextGenerator for MockTextGenerator {
        async fn generate(&self, _prompt: &str, _model: Option<&str>) -> Option<String> {
            self.response.lock().unwrap().clone()
        }
    }

    fn mock(response: Option<&str>) -> Arc<MockTextGenerator> {
        Arc::new(MockTextGenerator {
            response: Mutex::new(response.map(str::to_string)),
        })
    }

    fn dataset() -> Dataset {
        let rows = (0..6)
            .map(|i| {
                vec![
                    Value::Int(i + 1),
                    Value::Str(if i % 2 == 0 { "red" } else { "blue" }.into()),
                    Value::Float(1.5 * i as f64),
                ]
            })
            .collect();
        Dataset::from_rows(4, &["customer_id", "color", "score"], rows).unwrap()
    }

    #[tokio::test]
    async fn test_heuristic_materializes_high_scores_only() {
        let ds = dataset();
        let generator = ClassifierGenerator::new(Arc::new(HeuristicClassifier));
        let rules = generator.generate(&ds).await.unwrap();
        let conditions: Vec<&str> = rules.iter().map(|r| r.condition.as_str()).collect();

        assert!(conditions.contains(&"not_null(customer_id)"));
        assert!(conditions.contains(&"is_unique(customer_id)"));
        assert!(conditions.contains(&"color in ('blue', 'red')"));
        assert!(conditions.contains(&"score >= 0 and score <= 7.5"));
        // An id column gets no range rule.
        assert!(!conditions.iter().any(|c| c.starts_with("customer_id >=")));
        assert!(rules.iter().all(|r| r.confidence > DEFAULT_CLASSIFIER_THRESHOLD));

        let executor = RuleExecutor::default();
        for rule in &rules {
            assert!(executor.execute(rule, &ds).success, "{}", rule.condition);
        }
    }

    #[tokio::test]
    async fn test_llm_classifier_scores() {
        let reply = r#"{"column": "customer_id", "scores": {"not_null": 0.9, "unique": 0.72, "range": 0.3}}
{"column": "color", "scores": {"enumeration": 0.65}}"#;
        let classifier = LlmClassifier::new(mock(Some(reply)), None);
        let rules = ClassifierGenerator::new(Arc::new(classifier))
            .generate(&dataset())
            .await
            .unwrap();
        let conditions: Vec<&str> = rules.iter().map(|r| r.condition.as_str()).collect();
        assert_eq!(conditions, vec!["not_null(customer_id)", "is_unique(customer_id)"]);
    }

    #[tokio::test]
    async fn test_classifier_outage_degrades_to_no_rules() {
        let classifier = LlmClassifier::new(mock(None), None);
        let rules = ClassifierGenerator::new(Arc::new(classifier))
            .generate(&dataset())
            .await
            .unwrap();
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn test_table_qa_maps_answers_to_templates() {
        let reply = r#"{"customer_id::has_missing": "no", "customer_id::all_distinct": "yes",
"score::minimum": 0, "score::maximum": "10", "color::has_missing": "yes"}"#;
        let generator = ClassifierGenerator::new(Arc::new(HeuristicClassifier))
            .with_table_qa(mock(Some(reply)), None);
        assert_eq!(generator.mode(), ClassifierMode::TableQa);

        let rules = generator.generate(&dataset()).await.unwrap();
        let conditions: Vec<&str> = rules.iter().map(|r| r.condition.as_str()).collect();
        assert_eq!(
            conditions,
            vec![
                "not_null(customer_id)",
                "is_unique(customer_id)",
                "score >= 0 and score <= 10"
            ]
        );
    }
}
