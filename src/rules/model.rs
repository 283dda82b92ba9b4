//! Business rule records and the transient results built around them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::dataset::DatasetId;

/// Maximum number of failing row indices kept on an execution result.
pub const MAX_SAMPLE_VIOLATIONS: usize = 10;

/// How serious a rule violation is. Only `High` is blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn is_blocking(self) -> bool {
        self == Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    /// Accepts the canonical names plus the labels models tend to produce
    /// (`critical`, `error`, `warning`, `info`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "info" | "minor" => Ok(Severity::Low),
            "medium" | "warning" | "warn" | "moderate" => Ok(Severity::Medium),
            "high" | "critical" | "error" | "major" => Ok(Severity::High),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Who or what authored a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleSource {
    Manual,
    Ai,
    SchemaDerived,
    Statistical,
    ModelClassifier,
}

impl RuleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleSource::Manual => "manual",
            RuleSource::Ai => "ai",
            RuleSource::SchemaDerived => "schema-derived",
            RuleSource::Statistical => "statistical",
            RuleSource::ModelClassifier => "model-classifier",
        }
    }
}

impl fmt::Display for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "manual" => Ok(RuleSource::Manual),
            "ai" => Ok(RuleSource::Ai),
            "schema-derived" | "schema" => Ok(RuleSource::SchemaDerived),
            "statistical" => Ok(RuleSource::Statistical),
            "model-classifier" | "classifier" => Ok(RuleSource::ModelClassifier),
            other => Err(format!("unknown rule source '{}'", other)),
        }
    }
}

/// A named, severity-tagged boolean condition over a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    /// Unique identifier for the rule.
    pub id: Uuid,
    /// Dataset the rule applies to.
    pub dataset_id: DatasetId,
    /// Short human-readable name.
    pub name: String,
    /// What the rule checks and why.
    #[serde(default)]
    pub description: String,
    /// Condition text in the rule grammar (see [`crate::rules::condition`]).
    pub condition: String,
    pub severity: Severity,
    /// Message shown when the rule is violated.
    #[serde(default)]
    pub message: String,
    pub source: RuleSource,
    pub model_generated: bool,
    /// Generator confidence, always within `[0, 1]`.
    pub confidence: f64,
    pub active: bool,
    /// Free-form provenance (e.g. `corrected`, `original_condition`).
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BusinessRule {
    /// Creates a hand-authored rule with medium severity and full confidence.
    pub fn new(dataset_id: DatasetId, name: impl Into<String>, condition: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            dataset_id,
            name: name.into(),
            description: String::new(),
            condition: condition.into(),
            severity: Severity::Medium,
            message: String::new(),
            source: RuleSource::Manual,
            model_generated: false,
            confidence: 1.0,
            active: true,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a generator draft stamped with its source and a fresh id.
    pub fn draft(
        dataset_id: DatasetId,
        source: RuleSource,
        name: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self::new(dataset_id, name, condition).with_source(source)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Sets the source; anything other than `Manual` marks the rule model-generated.
    pub fn with_source(mut self, source: RuleSource) -> Self {
        self.source = source;
        self.model_generated = source != RuleSource::Manual;
        self
    }

    /// Sets confidence, clamped to `[0, 1]`. NaN becomes 0.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the corrected variant of a failing rule.
    ///
    /// The variant gets a fresh id and keeps a back-reference to the
    /// original through `metadata.corrected_from` and
    /// `metadata.original_condition`.
    pub fn corrected(&self, condition: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut rule = self.clone();
        rule.id = Uuid::new_v4();
        rule.condition = condition.into();
        rule.created_at = now;
        rule.updated_at = now;
        rule.metadata.insert("corrected".to_string(), JsonValue::Bool(true));
        rule.metadata.insert(
            "original_condition".to_string(),
            JsonValue::String(self.condition.clone()),
        );
        rule.metadata.insert(
            "corrected_from".to_string(),
            JsonValue::String(self.id.to_string()),
        );
        rule
    }

    pub fn is_corrected(&self) -> bool {
        self.metadata.get("corrected") == Some(&JsonValue::Bool(true))
    }
}

/// Outcome of executing one rule against one dataset. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExecutionResult {
    pub rule_id: Uuid,
    pub success: bool,
    /// Summary on success, error text on failure.
    pub message: String,
    /// Total number of violating rows.
    pub affected_row_count: usize,
    /// First [`MAX_SAMPLE_VIOLATIONS`] violating row indices.
    pub sample_violations: Vec<usize>,
    /// Rows the predicate was evaluated over (0 for dataset-level conditions).
    pub rows_evaluated: usize,
    pub execution_time_ms: u64,
}

impl RuleExecutionResult {
    pub(crate) fn failure(rule_id: Uuid, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            rule_id,
            success: false,
            message: message.into(),
            affected_row_count: 0,
            sample_violations: Vec::new(),
            rows_evaluated: 0,
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Aggregate view over one dataset's rule results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Failures of `high` severity rules; the only ones callers should block on.
    pub blocking_failures: usize,
    pub failed_rule_ids: Vec<Uuid>,
}

impl ExecutionSummary {
    /// Pairs rules with their results by id.
    pub fn from_results(rules: &[BusinessRule], results: &[RuleExecutionResult]) -> Self {
        let mut summary = ExecutionSummary {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            if result.success {
                summary.passed += 1;
                continue;
            }
            summary.failed += 1;
            summary.failed_rule_ids.push(result.rule_id);
            let blocking = rules
                .iter()
                .find(|r| r.id == result.rule_id)
                .is_some_and(|r| r.severity.is_blocking());
            if blocking {
                summary.blocking_failures += 1;
            }
        }
        summary
    }

    pub fn is_blocked(&self) -> bool {
        self.blocking_failures > 0
    }
}

/// A draft that failed testing, with the repair attempt kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRule {
    pub rule: BusinessRule,
    /// Error from the initial test run.
    pub error: String,
    /// Condition proposed by the repair call, if one came back.
    pub attempted_correction: Option<String>,
    /// Why the correction was rejected (retest error or repair unavailability).
    pub correction_error: Option<String>,
}

/// Transient result of one generate → test → repair cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGenerationBatch {
    pub dataset_id: DatasetId,
    pub engine_used: String,
    pub initial_rules_count: usize,
    pub failed_rules_count: usize,
    pub corrected_rules_count: usize,
    /// Accepted rules: passing drafts followed by corrected variants.
    pub rules: Vec<BusinessRule>,
    pub failed_rules: Vec<FailedRule>,
    pub corrected_rules: Vec<BusinessRule>,
    pub execution_time_ms: u64,
}

impl RuleGenerationBatch {
    /// Failing drafts whose repair did not pass retest.
    pub fn discarded_count(&self) -> usize {
        self.failed_rules.len()
    }
}
