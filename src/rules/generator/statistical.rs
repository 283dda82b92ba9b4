//! Deterministic rules derived from observed column statistics.
//!
//! No external calls; the same dataset always yields the same drafts, which
//! makes this backend the baseline and the fallback.

use async_trait::async_trait;
use tracing::debug;

use super::{column_ref, require_columns, GeneratorKind, RuleGenerator};
use crate::dataset::{format_number, ColumnStats, ColumnType, Dataset};
use crate::error::GeneratorError;
use crate::rules::model::{BusinessRule, RuleSource, Severity};

/// Minimum completeness a column must show to get a completeness rule.
const COMPLETENESS_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Default)]
pub struct StatisticalGenerator;

impl StatisticalGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Drafts for one column, in a fixed order.
    pub fn rules_for_column(&self, dataset_id: i64, stats: &ColumnStats) -> Vec<BusinessRule> {
        let name = &stats.name;
        let col = column_ref(name);
        let draft = |title: String, condition: String| {
            BusinessRule::draft(dataset_id, RuleSource::Statistical, title, condition)
        };
        let mut rules = Vec::new();

        if stats.row_count == 0 || stats.dtype == ColumnType::Empty {
            return rules;
        }

        if stats.null_count == 0 {
            rules.push(
                draft(format!("{} not null", name), format!("{} is not null", col))
                    .with_description(format!("No missing values were observed in '{}'", name))
                    .with_severity(Severity::High)
                    .with_message(format!("'{}' must not be empty", name))
                    .with_confidence(0.9),
            );
        } else if stats.completeness() >= COMPLETENESS_THRESHOLD {
            rules.push(
                draft(
                    format!("{} completeness", name),
                    format!("completeness({}) >= {}", col, COMPLETENESS_THRESHOLD),
                )
                .with_description(format!(
                    "At least {}% of '{}' values must be present",
                    COMPLETENESS_THRESHOLD * 100.0,
                    name
                ))
                .with_severity(Severity::Medium)
                .with_message(format!("Too many missing values in '{}'", name))
                .with_confidence(0.8),
            );
        }

        if let (Some(min), Some(max)) = (stats.min, stats.max) {
            rules.push(
                draft(
                    format!("{} range", name),
                    format!(
                        "{} >= {} and {} <= {}",
                        col,
                        format_number(min),
                        col,
                        format_number(max)
                    ),
                )
                .with_description(format!(
                    "'{}' stays within the observed range [{}, {}]",
                    name,
                    format_number(min),
                    format_number(max)
                ))
                .with_severity(Severity::Medium)
                .with_message(format!("'{}' is outside the expected range", name))
                .with_confidence(0.8),
            );
        }

        if let (Some(lo), Some(hi)) = (stats.min_length, stats.max_length) {
            rules.push(
                draft(
                    format!("{} length", name),
                    format!("len({}) >= {} and len({}) <= {}", col, lo, col, hi),
                )
                .with_description(format!("'{}' is between {} and {} characters", name, lo, hi))
                .with_severity(Severity::Low)
                .with_message(format!("'{}' has an unexpected length", name))
                .with_confidence(0.7),
            );
        }

        if stats.dtype.is_temporal() {
            let horizon = if stats.dtype == ColumnType::DateTime { "now()" } else { "today()" };
            rules.push(
                draft(
                    format!("{} valid date", name),
                    format!("is_valid_date({}) and {} <= {}", col, col, horizon),
                )
                .with_description(format!("'{}' is a valid date that is not in the future", name))
                .with_severity(Severity::Medium)
                .with_message(format!("'{}' is not a valid past date", name))
                .with_confidence(0.75),
            );
        }

        rules
    }
}

#[async_trait]
impl RuleGenerator for StatisticalGenerator {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::Statistical
    }

    async fn generate(&self, dataset: &Dataset) -> Result<Vec<BusinessRule>, GeneratorError> {
        require_columns(dataset)?;
        let rules: Vec<BusinessRule> = dataset
            .stats()
            .iter()
            .flat_map(|stats| self.rules_for_column(dataset.id(), stats))
            .collect();
        debug!(dataset_id = dataset.id(), count = rules.len(), "Statistical drafts");
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Value;
    use crate::rules::executor::RuleExecutor;
    use chrono::{Duration, NaiveDate, Utc};

    #[tokio::test]
    async fn test_age_range_and_not_null() {
        let ds = Dataset::from_rows(
            1,
            &["age"],
            vec![vec![Value::Int(-5)], vec![Value::Int(90)], vec![Value::Int(33)]],
        )
        .unwrap();
        let rules = StatisticalGenerator::new().generate(&ds).await.unwrap();
        let conditions: Vec<&str> = rules.iter().map(|r| r.condition.as_str()).collect();
        assert_eq!(conditions, vec!["age is not null", "age >= -5 and age <= 90"]);
        assert!(rules.iter().all(|r| r.model_generated && r.source == RuleSource::Statistical));
    }

    #[tokio::test]
    async fn test_text_date_and_completeness_rules() {
        let mut rows: Vec<Vec<Value>> = (0..20)
            .map(|i| {
                vec![
                    Value::Str(format!("name{}", i)),
                    Value::Date(NaiveDate::from_ymd_opt(2020, 1, 1 + i as u32).unwrap()),
                ]
            })
            .collect();
        rows[3][0] = Value::Null;
        let ds = Dataset::from_rows(1, &["name", "joined"], rows).unwrap();
        let rules = StatisticalGenerator::new().generate(&ds).await.unwrap();
        let conditions: Vec<&str> = rules.iter().map(|r| r.condition.as_str()).collect();
        assert!(conditions.contains(&"completeness(name) >= 0.95"));
        assert!(conditions.contains(&"len(name) >= 5 and len(name) <= 6"));
        assert!(conditions.contains(&"is_valid_date(joined) and joined <= today()"));

        let executor = RuleExecutor::default();
        for rule in &rules {
            assert!(executor.execute(rule, &ds).success, "{}", rule.condition);
        }
    }

    #[tokio::test]
    async fn test_timestamps_from_today_pass_their_own_rule() {
        let now = Utc::now();
        let ds = Dataset::from_rows(
            1,
            &["created_at"],
            vec![
                vec![Value::DateTime(now - Duration::minutes(1))],
                vec![Value::DateTime(now - Duration::days(3))],
            ],
        )
        .unwrap();
        let rules = StatisticalGenerator::new().generate(&ds).await.unwrap();
        let temporal = rules
            .iter()
            .find(|r| r.condition.starts_with("is_valid_date("))
            .unwrap();
        assert_eq!(temporal.condition, "is_valid_date(created_at) and created_at <= now()");

        let executor = RuleExecutor::default();
        for rule in &rules {
            assert!(executor.execute(rule, &ds).success, "{}", rule.condition);
        }
    }

    #[tokio::test]
    async fn test_mixed_text_column_passes_length_rule() {
        let ds = Dataset::from_rows(
            1,
            &["code"],
            vec![vec![Value::Str("ab".into())], vec![Value::Int(1234567)]],
        )
        .unwrap();
        let rules = StatisticalGenerator::new().generate(&ds).await.unwrap();
        assert!(rules.iter().any(|r| r.condition == "len(code) >= 2 and len(code) <= 7"));

        let executor = RuleExecutor::default();
        for rule in &rules {
            assert!(executor.execute(rule, &ds).success, "{}", rule.condition);
        }
    }

    #[tokio::test]
    async fn test_empty_dataset_has_no_columns() {
        let ds = Dataset::new(1, vec![]).unwrap();
        assert!(matches!(
            StatisticalGenerator::new().generate(&ds).await,
            Err(GeneratorError::NoColumns)
        ));
    }

    #[tokio::test]
    async fn test_deterministic() {
        let ds = Dataset::from_rows(1, &["x"], vec![vec![Value::Float(1.5)], vec![Value::Float(2.5)]]).unwrap();
        let generator = StatisticalGenerator::new();
        let a: Vec<String> = generator.generate(&ds).await.unwrap().into_iter().map(|r| r.condition).collect();
        let b: Vec<String> = generator.generate(&ds).await.unwrap().into_iter().map(|r| r.condition).collect();
        assert_eq!(a, b);
        assert_eq!(a[1], "x >= 1.5 and x <= 2.5");
    }
}
