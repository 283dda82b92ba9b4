//! Advisory quality scoring of step outputs.
//!
//! The dispatcher asks an [`Evaluator`] to grade the dataset a step
//! produced. Scores are attached to step metadata and never decide whether
//! a step succeeded.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use crate::dataset::{Dataset, DatasetId, Value};

const DEFAULT_EVALUATOR_TIMEOUT: Duration = Duration::from_secs(20);

/// Rows sent to a remote evaluator alongside the column profile.
const EVALUATION_SAMPLE_ROWS: usize = 50;

/// Errors raised by evaluators.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("Evaluator request failed: {0}")]
    RequestFailed(String),

    #[error("Evaluator returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Evaluator reported an error: {0}")]
    Service(String),

    #[error("Invalid evaluator response: {0}")]
    InvalidResponse(String),
}

/// An evaluator verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Overall score in [0, 1].
    pub score: f64,
    pub summary: String,
    #[serde(default)]
    pub details: JsonValue,
}

/// Grades a dataset (`evaluate(dataset_id, dataset) -> {score, summary, details} | {error}`).
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, dataset_id: DatasetId, dataset: &Dataset) -> Result<Evaluation, EvaluatorError>;
}

/// Completeness, validity and uniqueness of a dataset, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    /// Mean fraction of non-null cells per column.
    pub completeness: f64,
    /// Fraction of non-null cells that are well-formed.
    pub validity: f64,
    /// Fraction of rows that are not exact duplicates of an earlier row.
    pub uniqueness: f64,
    pub overall: f64,
}

impl QualityScore {
    pub fn compute(dataset: &Dataset) -> Self {
        if dataset.row_count() == 0 || dataset.columns().is_empty() {
            return Self {
                completeness: 0.0,
                validity: 0.0,
                uniqueness: 0.0,
                overall: 0.0,
            };
        }

        let stats = dataset.stats();
        let completeness = stats.iter().map(|s| s.completeness()).sum::<f64>() / stats.len() as f64;

        let today = Utc::now().date_naive();
        let mut checked = 0usize;
        let mut valid = 0usize;
        for column in dataset.columns() {
            for value in column.values.iter().filter(|v| !v.is_null()) {
                checked += 1;
                let ok = match value {
                    Value::Float(f) => f.is_finite(),
                    Value::Str(s) => !s.trim().is_empty(),
                    Value::Date(_) | Value::DateTime(_) => value.as_date().is_some_and(|d| d <= today),
                    _ => true,
                };
                if ok {
                    valid += 1;
                }
            }
        }
        let validity = if checked == 0 {
            0.0
        } else {
            valid as f64 / checked as f64
        };

        let mut seen = HashSet::with_capacity(dataset.row_count());
        let distinct = (0..dataset.row_count())
            .filter(|&r| {
                let key: Vec<String> = dataset.row(r).iter().map(|v| v.key()).collect();
                seen.insert(key.join("\u{1f}"))
            })
            .count();
        let uniqueness = distinct as f64 / dataset.row_count() as f64;

        let overall = (completeness + validity + uniqueness) / 3.0;
        Self {
            completeness: round4(completeness),
            validity: round4(validity),
            uniqueness: round4(uniqueness),
            overall: round4(overall),
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Local evaluator scoring a dataset from its own profile.
#[derive(Debug, Default, Clone)]
pub struct ProfileEvaluator;

#[async_trait]
impl Evaluator for ProfileEvaluator {
    async fn evaluate(&self, dataset_id: DatasetId, dataset: &Dataset) -> Result<Evaluation, EvaluatorError> {
        let score = QualityScore::compute(dataset);
        let weakest = dataset
            .stats()
            .iter()
            .min_by(|a, b| a.completeness().total_cmp(&b.completeness()))
            .map(|s| (s.name.clone(), s.completeness()));

        let summary = match &weakest {
            Some((name, completeness)) if *completeness < 1.0 => format!(
                "dataset {} scored {:.2}; least complete column '{}' ({:.0}% filled)",
                dataset_id,
                score.overall,
                name,
                completeness * 100.0
            ),
            _ => format!("dataset {} scored {:.2}", dataset_id, score.overall),
        };

        Ok(Evaluation {
            score: score.overall,
            summary,
            details: json!({
                "completeness": score.completeness,
                "validity": score.validity,
                "uniqueness": score.uniqueness,
                "rows": dataset.row_count(),
                "version": dataset.version(),
            }),
        })
    }
}

/// Evaluator backed by an HTTP scoring service.
///
/// POSTs `{dataset_id, profile, sample}` and expects either
/// `{score, summary, details}` or `{error}`.
pub struct HttpEvaluator {
    url: String,
    http_client: Client,
}

impl HttpEvaluator {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_EVALUATOR_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            url: url.into(),
            http_client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EvaluatorReply {
    Failure { error: JsonValue },
    Verdict(Evaluation),
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, dataset_id: DatasetId, dataset: &Dataset) -> Result<Evaluation, EvaluatorError> {
        let payload = json!({
            "dataset_id": dataset_id,
            "profile": dataset.summary(),
            "sample": dataset.to_json_records(EVALUATION_SAMPLE_ROWS),
        });

        let response = self
            .http_client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| EvaluatorError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(EvaluatorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: EvaluatorReply = response
            .json()
            .await
            .map_err(|e| EvaluatorError::InvalidResponse(e.to_string()))?;
        match reply {
            EvaluatorReply::Failure { error } => Err(EvaluatorError::Service(match error {
                JsonValue::String(s) => s,
                other => other.to_string(),
            })),
            EvaluatorReply::Verdict(evaluation) => {
                debug!(dataset_id, score = evaluation.score, "Evaluator verdict received");
                Ok(evaluation)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        Dataset::from_rows(
            5,
            &["id", "name"],
            vec![
                vec![Value::Int(1), Value::Str("ann".into())],
                vec![Value::Int(2), Value::Null],
                vec![Value::Int(2), Value::Null],
                vec![Value::Int(3), Value::Str("  ".into())],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_quality_score_components() {
        let score = QualityScore::compute(&dataset());
        // name is half filled, id fully filled.
        assert_eq!(score.completeness, 0.75);
        // 6 non-null cells, the blank string is malformed.
        assert_eq!(score.validity, round4(5.0 / 6.0));
        // Rows 1 and 2 are identical.
        assert_eq!(score.uniqueness, 0.75);
        assert!(score.overall > 0.0 && score.overall < 1.0);
    }

    #[test]
    fn test_quality_score_of_empty_dataset() {
        let empty = Dataset::from_rows(1, &["a"], vec![]).unwrap();
        assert_eq!(QualityScore::compute(&empty).overall, 0.0);
    }

    #[tokio::test]
    async fn test_profile_evaluator_names_weakest_column() {
        let evaluation = ProfileEvaluator.evaluate(5, &dataset()).await.unwrap();
        assert!(evaluation.summary.contains("'name'"));
        assert_eq!(evaluation.details["rows"], 4);
        assert!((0.0..=1.0).contains(&evaluation.score));
    }

    #[test]
    fn test_reply_shapes() {
        let failure: EvaluatorReply = serde_json::from_str(r#"{"error": "model offline"}"#).unwrap();
        assert!(matches!(failure, EvaluatorReply::Failure { .. }));

        let verdict: EvaluatorReply =
            serde_json::from_str(r#"{"score": 0.9, "summary": "good"}"#).unwrap();
        match verdict {
            EvaluatorReply::Verdict(e) => {
                assert_eq!(e.score, 0.9);
                assert!(e.details.is_null());
            }
            EvaluatorReply::Failure { .. } => panic!("expected a verdict"),
        }
    }

    #[tokio::test]
    async fn test_http_evaluator_unreachable() {
        // Bind then release a port so nothing is listening on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let evaluator = HttpEvaluator::with_timeout(
            format!("http://127.0.0.1:{}/evaluate", port),
            Duration::from_secs(2),
        );
        let result = evaluator.evaluate(5, &dataset()).await;
        assert!(matches!(result, Err(EvaluatorError::RequestFailed(_))));
    }
}
