//! Draft rule generation backends.
//!
//! Every backend implements [`RuleGenerator`] and is addressed by a
//! [`GeneratorKind`]. The [`GeneratorRegistry`] resolves a backend by name
//! and falls back to its configured default for unknown or unregistered
//! names.
//!
//! | Kind | Backend | External calls |
//! |------|---------|----------------|
//! | `ai` | [`AiPromptGenerator`] | one text-generation call |
//! | `statistical` | [`StatisticalGenerator`] | none |
//! | `schema` | [`SchemaGenerator`] | none |
//! | `classifier` | [`ClassifierGenerator`] | depends on the classifier |
//!
//! Drafts are stamped with their source, `model_generated = true` and a
//! fresh id. Nothing here persists rules.

mod ai_prompt;
mod classifier;
mod schema;
mod statistical;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub use ai_prompt::{build_generation_prompt, parse_rule_reply, AiPromptGenerator};
pub use classifier::{
    ClassifierGenerator, ClassifierMode, ColumnInput, HeuristicClassifier, LlmClassifier, RuleCategory,
    ZeroShotClassifier, DEFAULT_CLASSIFIER_THRESHOLD,
};
pub use schema::{FieldDefinition, SchemaGenerator};
pub use statistical::StatisticalGenerator;

use super::model::{BusinessRule, RuleSource};
use crate::dataset::{Column, Dataset};
use crate::error::GeneratorError;
use crate::llm::TextGenerator;

/// The interchangeable generation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    AiPrompt,
    Statistical,
    SchemaDerived,
    ModelClassifier,
}

impl GeneratorKind {
    pub const ALL: [GeneratorKind; 4] = [
        GeneratorKind::AiPrompt,
        GeneratorKind::Statistical,
        GeneratorKind::SchemaDerived,
        GeneratorKind::ModelClassifier,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GeneratorKind::AiPrompt => "ai",
            GeneratorKind::Statistical => "statistical",
            GeneratorKind::SchemaDerived => "schema",
            GeneratorKind::ModelClassifier => "classifier",
        }
    }

    /// Source stamped on rules produced by this backend.
    pub fn source(self) -> RuleSource {
        match self {
            GeneratorKind::AiPrompt => RuleSource::Ai,
            GeneratorKind::Statistical => RuleSource::Statistical,
            GeneratorKind::SchemaDerived => RuleSource::SchemaDerived,
            GeneratorKind::ModelClassifier => RuleSource::ModelClassifier,
        }
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeneratorKind {
    type Err = GeneratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "ai" | "ai_prompt" | "llm" | "prompt" => Ok(GeneratorKind::AiPrompt),
            "statistical" | "stats" | "baseline" => Ok(GeneratorKind::Statistical),
            "schema" | "schema_derived" | "schema_translation" => Ok(GeneratorKind::SchemaDerived),
            "classifier" | "model_classifier" | "zero_shot" | "table_qa" => {
                Ok(GeneratorKind::ModelClassifier)
            }
            other => Err(GeneratorError::NotRegistered(other.to_string())),
        }
    }
}

/// A backend that proposes draft rules for a dataset.
#[async_trait]
pub trait RuleGenerator: Send + Sync {
    fn kind(&self) -> GeneratorKind;

    /// Produces draft rules from the dataset's column metadata.
    ///
    /// Collaborator outages degrade to an empty list rather than an error.
    async fn generate(&self, dataset: &Dataset) -> Result<Vec<BusinessRule>, GeneratorError>;
}

/// Backends keyed by kind, with a default for unknown names.
pub struct GeneratorRegistry {
    generators: HashMap<GeneratorKind, Arc<dyn RuleGenerator>>,
    default_kind: GeneratorKind,
}

impl GeneratorRegistry {
    pub fn new(default_kind: GeneratorKind) -> Self {
        Self {
            generators: HashMap::new(),
            default_kind,
        }
    }

    /// Registry with every backend that can run with the given collaborators.
    ///
    /// The AI backend is registered only when a text generator is available;
    /// the classifier uses the LLM classifier when one is, and the local
    /// heuristic otherwise.
    pub fn standard(
        llm: Option<Arc<dyn TextGenerator>>,
        model: Option<String>,
        default_kind: GeneratorKind,
        classifier_threshold: f64,
    ) -> Self {
        let mut registry = Self::new(default_kind)
            .with(Arc::new(StatisticalGenerator::new()))
            .with(Arc::new(SchemaGenerator::new()));

        match llm {
            Some(llm) => {
                let classifier: Arc<dyn ZeroShotClassifier> =
                    Arc::new(LlmClassifier::new(Arc::clone(&llm), model.clone()));
                registry = registry
                    .with(Arc::new(AiPromptGenerator::new(Arc::clone(&llm), model)))
                    .with(Arc::new(
                        ClassifierGenerator::new(classifier).with_threshold(classifier_threshold),
                    ));
            }
            None => {
                registry = registry.with(Arc::new(
                    ClassifierGenerator::new(Arc::new(HeuristicClassifier))
                        .with_threshold(classifier_threshold),
                ));
            }
        }
        registry
    }

    pub fn with(mut self, generator: Arc<dyn RuleGenerator>) -> Self {
        self.register(generator);
        self
    }

    pub fn register(&mut self, generator: Arc<dyn RuleGenerator>) {
        self.generators.insert(generator.kind(), generator);
    }

    pub fn default_kind(&self) -> GeneratorKind {
        self.default_kind
    }

    pub fn registered(&self) -> Vec<GeneratorKind> {
        GeneratorKind::ALL
            .into_iter()
            .filter(|k| self.generators.contains_key(k))
            .collect()
    }

    pub fn get(&self, kind: GeneratorKind) -> Option<Arc<dyn RuleGenerator>> {
        self.generators.get(&kind).cloned()
    }

    /// Resolves a backend by name, falling back to the default.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn RuleGenerator>, GeneratorError> {
        match name.parse::<GeneratorKind>() {
            Ok(kind) => {
                if let Some(generator) = self.get(kind) {
                    return Ok(generator);
                }
                warn!(engine = %kind, fallback = %self.default_kind, "Generator not registered, using default");
            }
            Err(_) => {
                warn!(engine = name, fallback = %self.default_kind, "Unknown generator, using default");
            }
        }
        self.get(self.default_kind)
            .ok_or_else(|| GeneratorError::NotRegistered(self.default_kind.to_string()))
    }
}

/// Renders a column reference, backtick-quoting names that are not plain identifiers.
pub fn column_ref(name: &str) -> String {
    const KEYWORDS: [&str; 10] = [
        "and", "or", "not", "is", "in", "between", "true", "false", "null", "none",
    ];
    let mut chars = name.chars();
    let plain = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
        && !KEYWORDS.contains(&name.to_ascii_lowercase().as_str());
    if plain {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

/// Renders a single-quoted string literal.
pub fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Whitespace-insensitive fingerprint of condition text.
pub fn condition_fingerprint(condition: &str) -> String {
    let normalized = condition.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Drops drafts whose condition duplicates an earlier draft's.
pub fn dedupe_drafts(rules: Vec<BusinessRule>) -> Vec<BusinessRule> {
    let mut seen = HashSet::new();
    let before = rules.len();
    let unique: Vec<BusinessRule> = rules
        .into_iter()
        .filter(|r| seen.insert(condition_fingerprint(&r.condition)))
        .collect();
    if unique.len() < before {
        debug!(dropped = before - unique.len(), "Dropped duplicate drafts");
    }
    unique
}

/// Value formats recognizable from sample text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownFormat {
    Email,
    Uuid,
    Url,
    PostalCode,
    PhoneNumber,
}

impl KnownFormat {
    const ALL: [KnownFormat; 5] = [
        KnownFormat::Email,
        KnownFormat::Uuid,
        KnownFormat::Url,
        KnownFormat::PostalCode,
        KnownFormat::PhoneNumber,
    ];

    pub fn label(self) -> &'static str {
        match self {
            KnownFormat::Email => "email",
            KnownFormat::Uuid => "uuid",
            KnownFormat::Url => "url",
            KnownFormat::PostalCode => "postal code",
            KnownFormat::PhoneNumber => "phone number",
        }
    }

    pub fn pattern(self) -> &'static str {
        match self {
            KnownFormat::Email => r"^[^@\s]+@[^@\s]+\.[^@\s]+$",
            KnownFormat::Uuid => {
                r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
            }
            KnownFormat::Url => r"^https?://\S+$",
            KnownFormat::PostalCode => r"^\d{5}(-\d{4})?$",
            KnownFormat::PhoneNumber => r"^\+?[0-9][0-9 ().-]{6,18}[0-9]$",
        }
    }

    /// Condition asserting the format on a column.
    pub fn condition(self, column: &str) -> String {
        format!("matches({}, {})", column_ref(column), string_literal(self.pattern()))
    }

    /// Detects a format shared by every non-null text value of a column.
    pub fn detect(column: &Column) -> Option<KnownFormat> {
        let samples: Vec<&str> = column
            .values
            .iter()
            .filter_map(|v| v.as_str())
            .take(200)
            .collect();
        if samples.is_empty() || samples.len() < column.values.iter().filter(|v| !v.is_null()).count().min(200) {
            return None;
        }
        KnownFormat::ALL.into_iter().find(|format| {
            Regex::new(format.pattern())
                .map(|re| samples.iter().all(|s| re.is_match(s)))
                .unwrap_or(false)
        })
    }
}

pub(crate) fn require_columns(dataset: &Dataset) -> Result<(), GeneratorError> {
    if dataset.columns().is_empty() {
        Err(GeneratorError::NoColumns)
    } else {
        Ok(())
    }
}
