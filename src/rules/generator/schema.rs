//! Schema-translation backend.
//!
//! Each column is translated into a typed [`FieldDefinition`] (the shape a
//! record validator would declare), and every constraint on that field
//! becomes one rule. Numeric fields also get a mean ± 3σ outlier rule.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{column_ref, require_columns, string_literal, GeneratorKind, KnownFormat, RuleGenerator};
use crate::dataset::{format_number, ColumnType, Dataset, MAX_CATEGORIES};
use crate::error::GeneratorError;
use crate::rules::model::{BusinessRule, RuleSource, Severity};

/// Standard deviations from the mean beyond which a value is an outlier.
const OUTLIER_SIGMAS: u32 = 3;

/// Typed field definition inferred for one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDefinition {
    pub name: String,
    pub dtype: ColumnType,
    pub nullable: bool,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    /// Allowed values when the column is low-cardinality text.
    pub allowed_values: Option<Vec<String>>,
    pub format: Option<&'static str>,
    #[serde(skip)]
    format_kind: Option<KnownFormat>,
    /// Whether mean and standard deviation are available for outlier bounds.
    pub has_distribution: bool,
}

impl FieldDefinition {
    /// Infers the definition of a column.
    pub fn infer(dataset: &Dataset, index: usize) -> Self {
        let column = dataset.column_at(index);
        let stats = &dataset.stats()[index];

        let allowed_values = (matches!(stats.dtype, ColumnType::Text | ColumnType::Boolean)
            && stats.unique_count > 0
            && stats.unique_count <= MAX_CATEGORIES
            && stats.unique_count < stats.row_count - stats.null_count)
            .then(|| stats.categories.iter().map(|c| c.value.clone()).collect());

        let format_kind = if stats.dtype == ColumnType::Text && allowed_values.is_none() {
            KnownFormat::detect(column)
        } else {
            None
        };

        Self {
            name: column.name.clone(),
            dtype: stats.dtype,
            nullable: stats.null_count > 0,
            minimum: stats.min,
            maximum: stats.max,
            allowed_values,
            format: format_kind.map(KnownFormat::label),
            format_kind,
            has_distribution: matches!(stats.std, Some(s) if s > 0.0),
        }
    }

    /// One rule per constraint on the field.
    pub fn to_rules(&self, dataset_id: i64) -> Vec<BusinessRule> {
        let col = column_ref(&self.name);
        let draft = |suffix: &str, condition: String| {
            BusinessRule::draft(
                dataset_id,
                RuleSource::SchemaDerived,
                format!("{} {}", self.name, suffix),
                condition,
            )
        };
        let mut rules = Vec::new();

        if let (Some(min), Some(max)) = (self.minimum, self.maximum) {
            rules.push(
                draft(
                    "range",
                    format!(
                        "{} between {} and {}",
                        col,
                        format_number(min),
                        format_number(max)
                    ),
                )
                .with_description(format!("Field '{}' declares ge={} le={}", self.name, format_number(min), format_number(max)))
                .with_severity(Severity::Medium)
                .with_message(format!("'{}' is out of range", self.name))
                .with_confidence(0.85),
            );
        }

        if let Some(values) = &self.allowed_values {
            let literals: Vec<String> = values
                .iter()
                .map(|v| match self.dtype {
                    ColumnType::Boolean => v.clone(),
                    _ => string_literal(v),
                })
                .collect();
            rules.push(
                draft("allowed values", format!("{} in ({})", col, literals.join(", ")))
                    .with_description(format!("Field '{}' is an enumeration of {} values", self.name, values.len()))
                    .with_severity(Severity::Medium)
                    .with_message(format!("'{}' has an unexpected value", self.name))
                    .with_confidence(0.8),
            );
        }

        if let Some(format) = self.format_kind {
            rules.push(
                draft("format", format.condition(&self.name))
                    .with_description(format!("Field '{}' must be a valid {}", self.name, format.label()))
                    .with_severity(Severity::Medium)
                    .with_message(format!("'{}' is not a valid {}", self.name, format.label()))
                    .with_confidence(0.85),
            );
        }

        if self.has_distribution {
            rules.push(
                draft(
                    "outliers",
                    format!(
                        "{c} >= mean({c}) - {k} * std({c}) and {c} <= mean({c}) + {k} * std({c})",
                        c = col,
                        k = OUTLIER_SIGMAS
                    ),
                )
                .with_description(format!(
                    "'{}' stays within {} standard deviations of its mean",
                    self.name, OUTLIER_SIGMAS
                ))
                .with_severity(Severity::Low)
                .with_message(format!("'{}' is a statistical outlier", self.name))
                .with_confidence(0.6),
            );
        }

        rules
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaGenerator;

impl SchemaGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn field_definitions(&self, dataset: &Dataset) -> Vec<FieldDefinition> {
        (0..dataset.columns().len())
            .map(|i| FieldDefinition::infer(dataset, i))
            .collect()
    }
}

#[async_trait]
impl RuleGenerator for SchemaGenerator {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::SchemaDerived
    }

    async fn generate(&self, dataset: &Dataset) -> Result<Vec<BusinessRule>, GeneratorError> {
        require_columns(dataset)?;
        let rules: Vec<BusinessRule> = self
            .field_definitions(dataset)
            .iter()
            .flat_map(|field| field.to_rules(dataset.id()))
            .collect();
        debug!(dataset_id = dataset.id(), count = rules.len(), "Schema-derived drafts");
        Ok(rules)
    }
}
