//! Step dispatch: skip policy, timing, advisory scoring.
//!
//! The dispatcher runs one step handler, records `{step, start, end,
//! duration, status}` into the caller's [`StatusMap`] whatever happens, and
//! attaches the evaluator's verdict under `quality_evaluation`. Evaluator
//! failures are recorded as `{"error": ...}` and never fail a step.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

use super::evaluator::Evaluator;
use super::steps::{run_handler, StepContext, StepKind, UnknownStep};
use crate::dataset::Dataset;
use crate::ledger::{Metadata, StepType};
use crate::metrics;

/// Errors returned by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The step name is not one of the known step kinds. Never retried.
    #[error(transparent)]
    UnknownStep(#[from] UnknownStep),

    /// The handler failed; `metadata` carries timing, error and diagnostics.
    #[error("Step '{step}' failed: {message}")]
    StepFailed {
        step: StepKind,
        message: String,
        metadata: Metadata,
    },
}

/// Per-invocation timing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step: StepKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Seconds between `start` and `end`.
    pub duration: f64,
    pub status: String,
}

/// Caller-owned record of every dispatch, keyed by step kind.
pub type StatusMap = BTreeMap<StepKind, StepTiming>;

/// Skip policy and handler parameters for one dispatch.
#[derive(Debug, Clone, Default)]
pub struct StepRules {
    pub skip_steps: HashSet<StepKind>,
    pub params: Metadata,
}

impl StepRules {
    /// Reads `skip_steps` out of step params. Entries are step kind names
    /// or run step types; a step type stands for its default handler.
    ///
    /// # Errors
    ///
    /// `UnknownStep` for a name that is neither.
    pub fn from_params(params: &Metadata) -> Result<Self, DispatchError> {
        let skip_steps = match params.get("skip_steps") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(|item| match item.as_str() {
                    Some(name) => skip_target(name),
                    None => Err(UnknownStep(item.to_string())),
                })
                .collect::<Result<HashSet<_>, _>>()?,
            Some(JsonValue::String(name)) => HashSet::from([skip_target(name)?]),
            _ => HashSet::new(),
        };
        Ok(Self {
            skip_steps,
            params: params.clone(),
        })
    }

    pub fn skip(mut self, kind: StepKind) -> Self {
        self.skip_steps.insert(kind);
        self
    }
}

fn skip_target(name: &str) -> Result<StepKind, UnknownStep> {
    name.parse::<StepKind>().or_else(|unknown| {
        name.parse::<StepType>()
            .map(StepKind::for_step_type)
            .map_err(|_| unknown)
    })
}

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub enum Dispatched {
    Skipped,
    Completed {
        dataset: Arc<Dataset>,
        metadata: Metadata,
    },
}

/// Maps step kinds to handlers and wraps them with policy.
pub struct StepDispatcher {
    context: StepContext,
    evaluator: Option<Arc<dyn Evaluator>>,
}

impl StepDispatcher {
    pub fn new(context: StepContext) -> Self {
        Self {
            context,
            evaluator: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn context(&self) -> &StepContext {
        &self.context
    }

    /// Dispatches a step by name.
    ///
    /// # Errors
    ///
    /// `UnknownStep` before anything runs; `StepFailed` when the handler fails.
    pub async fn run_step(
        &self,
        step: &str,
        dataset: Arc<Dataset>,
        rules: &StepRules,
        status_map: &mut StatusMap,
    ) -> Result<Dispatched, DispatchError> {
        let kind: StepKind = step.parse()?;
        self.run(kind, dataset, rules, status_map).await
    }

    pub async fn run(
        &self,
        kind: StepKind,
        dataset: Arc<Dataset>,
        rules: &StepRules,
        status_map: &mut StatusMap,
    ) -> Result<Dispatched, DispatchError> {
        let start = Utc::now();
        if rules.skip_steps.contains(&kind) {
            info!(step = %kind, dataset_id = dataset.id(), "Step skipped by policy");
            record(status_map, kind, start, "skipped");
            return Ok(Dispatched::Skipped);
        }

        let dataset_id = dataset.id();
        match run_handler(kind, &self.context, Arc::clone(&dataset), &rules.params).await {
            Ok(output) => {
                let mut metadata = output.metadata;
                if let Some(verdict) = self.evaluate(&output.dataset).await {
                    metadata.insert("quality_evaluation".to_string(), verdict);
                }
                let timing = record(status_map, kind, start, "completed");
                metadata.insert("duration".to_string(), json!(timing.duration));
                info!(step = %kind, dataset_id, duration = timing.duration, "Step completed");
                Ok(Dispatched::Completed {
                    dataset: output.dataset,
                    metadata,
                })
            }
            Err(e) => {
                let message = e.to_string();
                let mut metadata = Metadata::new();
                // Diagnostics only: the verdict is over the step's input.
                if let Some(verdict) = self.evaluate(&dataset).await {
                    metadata.insert("quality_evaluation".to_string(), verdict);
                }
                if let Some(details) = e.diagnostics() {
                    metadata.insert("details".to_string(), details);
                }
                let timing = record(status_map, kind, start, "failed");
                metadata.insert("duration".to_string(), json!(timing.duration));
                metadata.insert("error".to_string(), json!(message));
                warn!(step = %kind, dataset_id, error = %message, "Step failed");
                Err(DispatchError::StepFailed {
                    step: kind,
                    message,
                    metadata,
                })
            }
        }
    }

    async fn evaluate(&self, dataset: &Dataset) -> Option<JsonValue> {
        let evaluator = self.evaluator.as_ref()?;
        match evaluator.evaluate(dataset.id(), dataset).await {
            Ok(evaluation) => {
                metrics::record_ai_call("evaluator", "ok");
                Some(serde_json::to_value(evaluation).unwrap_or(JsonValue::Null))
            }
            Err(e) => {
                warn!(dataset_id = dataset.id(), error = %e, "Quality evaluation unavailable");
                metrics::record_ai_call("evaluator", "unavailable");
                Some(json!({ "error": e.to_string() }))
            }
        }
    }
}

fn record(status_map: &mut StatusMap, kind: StepKind, start: DateTime<Utc>, status: &str) -> StepTiming {
    let end = Utc::now();
    let duration = (end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0;
    metrics::record_step(kind.as_str(), status, duration);
    let timing = StepTiming {
        step: kind,
        start,
        end,
        duration,
        status: status.to_string(),
    };
    status_map.insert(kind, timing.clone());
    timing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetId, Value};
    use crate::pipeline::evaluator::{Evaluation, EvaluatorError, ProfileEvaluator};
    use crate::rules::{GeneratorKind, GeneratorRegistry, RuleExecutor, RuleRepository, SelfCorrectionLoop};
    use async_trait::async_trait;

    fn context() -> StepContext {
        let registry = Arc::new(GeneratorRegistry::standard(None, None, GeneratorKind::Statistical, 0.7));
        StepContext::new(
            Arc::new(RuleRepository::in_memory()),
            RuleExecutor::default(),
            Arc::new(SelfCorrectionLoop::new(registry, RuleExecutor::default())),
            "statistical",
        )
    }

    fn dataset() -> Arc<Dataset> {
        Arc::new(
            Dataset::from_rows(
                11,
                &["x"],
                vec![vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(2)]],
            )
            .unwrap(),
        )
    }

    struct DownEvaluator;

    #[async_trait]
    impl Evaluator for DownEvaluator {
        async fn evaluate(&self, _: DatasetId, _: &Dataset) -> Result<Evaluation, EvaluatorError> {
            Err(EvaluatorError::RequestFailed("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_skip_records_status_without_running() {
        let dispatcher = StepDispatcher::new(context());
        let rules = StepRules::default().skip(StepKind::Clean);
        let mut status = StatusMap::new();

        let out = dispatcher.run_step("clean", dataset(), &rules, &mut status).await.unwrap();
        assert!(matches!(out, Dispatched::Skipped));
        assert_eq!(status[&StepKind::Clean].status, "skipped");
    }

    #[tokio::test]
    async fn test_unknown_step_fails_loudly() {
        let dispatcher = StepDispatcher::new(context());
        let mut status = StatusMap::new();
        let err = dispatcher
            .run_step("publish", dataset(), &StepRules::default(), &mut status)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownStep(_)));
        assert!(status.is_empty());
    }

    #[tokio::test]
    async fn test_success_attaches_evaluation() {
        let dispatcher = StepDispatcher::new(context()).with_evaluator(Arc::new(ProfileEvaluator));
        let mut status = StatusMap::new();
        let out = dispatcher
            .run(StepKind::Clean, dataset(), &StepRules::default(), &mut status)
            .await
            .unwrap();

        match out {
            Dispatched::Completed { dataset, metadata } => {
                assert_eq!(dataset.row_count(), 2);
                assert!(metadata["quality_evaluation"]["score"].is_number());
                assert!(metadata.contains_key("duration"));
            }
            Dispatched::Skipped => panic!("step should have run"),
        }
        let timing = &status[&StepKind::Clean];
        assert_eq!(timing.status, "completed");
        assert!(timing.end >= timing.start);
    }

    #[tokio::test]
    async fn test_evaluator_outage_is_advisory() {
        let dispatcher = StepDispatcher::new(context()).with_evaluator(Arc::new(DownEvaluator));
        let mut status = StatusMap::new();
        let out = dispatcher
            .run(StepKind::Profile, dataset(), &StepRules::default(), &mut status)
            .await
            .unwrap();
        let Dispatched::Completed { metadata, .. } = out else {
            panic!("step should have run");
        };
        assert!(metadata["quality_evaluation"]["error"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn test_handler_failure_records_status_and_error() {
        let dispatcher = StepDispatcher::new(context()).with_evaluator(Arc::new(ProfileEvaluator));
        let mut status = StatusMap::new();
        let err = dispatcher
            .run(StepKind::CustomTransform, dataset(), &StepRules::default(), &mut status)
            .await
            .unwrap_err();

        match err {
            DispatchError::StepFailed { step, metadata, .. } => {
                assert_eq!(step, StepKind::CustomTransform);
                assert!(metadata["error"].as_str().unwrap().contains("operations"));
                assert!(metadata.contains_key("quality_evaluation"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(status[&StepKind::CustomTransform].status, "failed");
    }

    #[test]
    fn test_rules_from_params() {
        let mut params = Metadata::new();
        params.insert("skip_steps".into(), json!(["enrich", "detect-anomalies"]));
        let rules = StepRules::from_params(&params).unwrap();
        assert!(rules.skip_steps.contains(&StepKind::Enrich));
        assert!(rules.skip_steps.contains(&StepKind::DetectAnomalies));

        params.insert("skip_steps".into(), json!(["teleport"]));
        assert!(matches!(
            StepRules::from_params(&params),
            Err(DispatchError::UnknownStep(_))
        ));
    }

    #[test]
    fn test_rules_accept_step_type_names() {
        let mut params = Metadata::new();
        params.insert("skip_steps".into(), json!(["transform", "load"]));
        let rules = StepRules::from_params(&params).unwrap();
        assert_eq!(
            rules.skip_steps,
            HashSet::from([StepKind::Clean, StepKind::Profile])
        );

        params.insert("skip_steps".into(), json!("business_rules"));
        let rules = StepRules::from_params(&params).unwrap();
        assert!(rules.skip_steps.contains(&StepKind::BusinessRules));
    }
}
