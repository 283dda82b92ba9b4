//! Control surface over the ledger, dispatcher and worker pool.
//!
//! `trigger_run`, `run_step`, `retry_failed`, `resume` and `get_status`.
//! Step work is submitted to the [`StepWorkerPool`]; callers get the step
//! ids back immediately together with a [`TaskHandle`] and poll the ledger
//! (or the handle) for progress.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::dispatcher::{DispatchError, Dispatched, StatusMap, StepDispatcher, StepRules};
use super::steps::StepKind;
use crate::dataset::{Dataset, DatasetId, DatasetLoader};
use crate::ledger::{
    LedgerError, Metadata, PipelineRun, PipelineStep, RunId, RunLedger, RunStatus, RunStatusReport,
    StepId, StepStatus,
};
use crate::rules::RuleRepository;
use crate::scheduler::{PoolError, StepWorkerPool, TaskHandle};

/// Outcome categories reported to callers of the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    NotFound,
    Forbidden,
    InvalidState,
    InvalidRequest,
    InternalError,
}

impl ResponseCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseCode::Ok => "ok",
            ResponseCode::NotFound => "not-found",
            ResponseCode::Forbidden => "forbidden",
            ResponseCode::InvalidState => "invalid-state",
            ResponseCode::InvalidRequest => "invalid-request",
            ResponseCode::InternalError => "internal-error",
        }
    }

    pub fn of<T>(result: &Result<T, ServiceError>) -> ResponseCode {
        match result {
            Ok(_) => ResponseCode::Ok,
            Err(e) => e.response_code(),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the pipeline service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("Caller is not the owner of run {0}")]
    Forbidden(RunId),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn response_code(&self) -> ResponseCode {
        match self {
            ServiceError::NotFound(_) => ResponseCode::NotFound,
            ServiceError::Forbidden(_) => ResponseCode::Forbidden,
            ServiceError::InvalidState(_) => ResponseCode::InvalidState,
            ServiceError::InvalidRequest(_) => ResponseCode::InvalidRequest,
            ServiceError::Internal(_) => ResponseCode::InternalError,
        }
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::RunNotFound(_) | LedgerError::StepNotFound(_) | LedgerError::DatasetNotFound(_) => {
                ServiceError::NotFound(err.to_string())
            }
            LedgerError::StateConflict { .. } | LedgerError::OrderViolation { .. } => {
                ServiceError::InvalidState(err.to_string())
            }
            LedgerError::Store(_) => ServiceError::Internal(err.to_string()),
        }
    }
}

impl From<DispatchError> for ServiceError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::UnknownStep(_) => ServiceError::InvalidRequest(err.to_string()),
            DispatchError::StepFailed { .. } => ServiceError::Internal(err.to_string()),
        }
    }
}

impl From<PoolError> for ServiceError {
    fn from(err: PoolError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

/// Steps handed to the worker pool and the handle to their job.
pub struct StepSubmission {
    pub step_ids: Vec<StepId>,
    pub handle: TaskHandle,
}

struct ServiceInner {
    ledger: Arc<RunLedger>,
    datasets: Arc<dyn DatasetLoader>,
    dispatcher: Arc<StepDispatcher>,
    /// Latest dataset version produced within each unfinished run.
    working: RwLock<HashMap<RunId, Arc<Dataset>>>,
}

/// The pipeline control surface.
pub struct PipelineService {
    inner: Arc<ServiceInner>,
    pool: Arc<StepWorkerPool>,
}

fn authorize(run: &PipelineRun, caller: Option<&str>) -> Result<(), ServiceError> {
    match (run.owner.as_deref(), caller) {
        (None, _) => Ok(()),
        (Some(owner), Some(caller)) if owner == caller => Ok(()),
        _ => Err(ServiceError::Forbidden(run.id)),
    }
}

/// Resolves the handler and skip policy, rejecting bad params before any write.
fn plan(step: &PipelineStep, params: &Metadata) -> Result<(StepKind, StepRules), ServiceError> {
    let mut merged = step.metadata.clone();
    for (k, v) in params {
        merged.insert(k.clone(), v.clone());
    }
    let kind = StepKind::resolve(step.step_type, &merged).map_err(DispatchError::from)?;
    let rules = StepRules::from_params(&merged)?;
    Ok((kind, rules))
}

impl PipelineService {
    /// Creates the service, starting the pool if it is not running yet.
    pub fn new(
        ledger: Arc<RunLedger>,
        datasets: Arc<dyn DatasetLoader>,
        dispatcher: Arc<StepDispatcher>,
        pool: Arc<StepWorkerPool>,
    ) -> Result<Self, PoolError> {
        if !pool.is_running() {
            pool.start()?;
        }
        Ok(Self {
            inner: Arc::new(ServiceInner {
                ledger,
                datasets,
                dispatcher,
                working: RwLock::new(HashMap::new()),
            }),
            pool,
        })
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.inner.ledger
    }

    pub fn repository(&self) -> &RuleRepository {
        &self.inner.dispatcher.context().repository
    }

    pub fn pool(&self) -> &StepWorkerPool {
        &self.pool
    }

    /// Creates a run with pending steps for a dataset.
    pub async fn trigger_run(&self, dataset_id: DatasetId, caller: Option<&str>) -> Result<RunId, ServiceError> {
        let run_id = self
            .inner
            .ledger
            .create_run(dataset_id, caller.map(str::to_string))
            .await?;
        Ok(run_id)
    }

    /// Starts one step and runs it in the background.
    ///
    /// The step is marked running before this returns, so a second call for
    /// the same step is rejected with `invalid-state`.
    pub async fn run_step(
        &self,
        step_id: StepId,
        params: Metadata,
        caller: Option<&str>,
    ) -> Result<StepSubmission, ServiceError> {
        let step = self.inner.ledger.step(step_id).await?;
        let run = self.inner.ledger.run(step.run_id).await?;
        authorize(&run, caller)?;
        plan(&step, &params)?;

        let started = self.inner.ledger.start_step(step_id, params).await?;
        let inner = Arc::clone(&self.inner);
        let handle = self
            .pool
            .submit(format!("{}:{}", run.id, started.step_type), async move {
                inner.execute_started(started).await
            })
            .await?;

        Ok(StepSubmission {
            step_ids: vec![step_id],
            handle,
        })
    }

    /// Re-runs the failed steps of a run, in declared order.
    pub async fn retry_failed(&self, run_id: RunId, caller: Option<&str>) -> Result<StepSubmission, ServiceError> {
        let run = self.inner.ledger.run(run_id).await?;
        authorize(&run, caller)?;
        let step_ids = self.inner.ledger.retry_failed(run_id).await?;
        if step_ids.is_empty() {
            return Err(ServiceError::InvalidState(format!("Run {} has no failed steps", run_id)));
        }
        self.submit_sequence(run_id, "retry", step_ids).await
    }

    /// Runs every step of a run that is not completed or skipped, in declared order.
    pub async fn resume(&self, run_id: RunId, caller: Option<&str>) -> Result<StepSubmission, ServiceError> {
        let run = self.inner.ledger.run(run_id).await?;
        authorize(&run, caller)?;
        let step_ids = self.inner.ledger.resume_run(run_id).await?;
        if step_ids.is_empty() {
            return Err(ServiceError::InvalidState(format!("Run {} has nothing left to run", run_id)));
        }
        self.submit_sequence(run_id, "resume", step_ids).await
    }

    pub async fn get_status(&self, run_id: RunId, caller: Option<&str>) -> Result<RunStatusReport, ServiceError> {
        let report = self.inner.ledger.get_status(run_id).await?;
        authorize(&report.run, caller)?;
        Ok(report)
    }

    /// Stops the worker pool after in-flight steps finish.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.pool.shutdown().await?;
        Ok(())
    }

    async fn submit_sequence(
        &self,
        run_id: RunId,
        label: &str,
        step_ids: Vec<StepId>,
    ) -> Result<StepSubmission, ServiceError> {
        info!(run_id = %run_id, steps = step_ids.len(), mode = label, "Submitting steps");
        let inner = Arc::clone(&self.inner);
        let ids = step_ids.clone();
        let handle = self
            .pool
            .submit(format!("{}:{}", run_id, label), async move { inner.execute_sequence(ids).await })
            .await?;
        Ok(StepSubmission { step_ids, handle })
    }
}

impl ServiceInner {
    async fn dataset_for(&self, run_id: RunId, dataset_id: DatasetId) -> Result<Arc<Dataset>, String> {
        if let Some(dataset) = self.working.read().await.get(&run_id) {
            return Ok(Arc::clone(dataset));
        }
        self.datasets
            .load_dataset(dataset_id)
            .await
            .map_err(|e| e.to_string())
    }

    /// Executes a step that is already marked running and records the outcome.
    async fn execute_started(&self, step: PipelineStep) -> Result<JsonValue, String> {
        let run_id = step.run_id;
        let outcome = self.execute_recorded(step).await;
        self.release_if_finished(run_id).await;
        outcome
    }

    /// Drops the run's working dataset once the run is completed or failed.
    /// A later retry starts again from the source dataset.
    async fn release_if_finished(&self, run_id: RunId) {
        match self.ledger.run(run_id).await {
            Ok(run) if matches!(run.status, RunStatus::Completed | RunStatus::Failed) => {
                if self.working.write().await.remove(&run_id).is_some() {
                    debug!(run_id = %run_id, status = %run.status, "Released working dataset");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(run_id = %run_id, error = %e, "Could not read run status"),
        }
    }

    async fn execute_recorded(&self, step: PipelineStep) -> Result<JsonValue, String> {
        let run = self.ledger.run(step.run_id).await.map_err(|e| e.to_string())?;
        let (kind, rules) = match plan(&step, &Metadata::new()) {
            Ok(plan) => plan,
            Err(e) => return self.record_failure(&step, e.to_string(), Metadata::new()).await,
        };
        let dataset = match self.dataset_for(run.id, run.dataset_id).await {
            Ok(dataset) => dataset,
            Err(e) => return self.record_failure(&step, e, Metadata::new()).await,
        };

        let mut status_map = StatusMap::new();
        let outcome = self.dispatcher.run(kind, dataset, &rules, &mut status_map).await;
        let status = serde_json::to_value(&status_map).unwrap_or(JsonValue::Null);

        match outcome {
            Ok(Dispatched::Completed { dataset, mut metadata }) => {
                self.working.write().await.insert(run.id, dataset);
                metadata.insert("operation".to_string(), json!(kind));
                metadata.insert("status_map".to_string(), status);
                let done = self
                    .ledger
                    .complete_step(step.id, metadata)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!(done))
            }
            Ok(Dispatched::Skipped) => {
                let skipped = self
                    .ledger
                    .skip_step(step.id, &format!("{} listed in skip_steps", kind))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!(skipped))
            }
            Err(DispatchError::StepFailed { message, mut metadata, .. }) => {
                metadata.insert("status_map".to_string(), status);
                self.record_failure(&step, message, metadata).await
            }
            Err(e @ DispatchError::UnknownStep(_)) => {
                self.record_failure(&step, e.to_string(), Metadata::new()).await
            }
        }
    }

    async fn record_failure(
        &self,
        step: &PipelineStep,
        message: String,
        metadata: Metadata,
    ) -> Result<JsonValue, String> {
        self.ledger
            .fail_step(step.id, message.clone(), metadata)
            .await
            .map_err(|e| e.to_string())?;
        Err(message)
    }

    /// Starts and executes steps one after another, stopping at the first failure.
    async fn execute_sequence(&self, step_ids: Vec<StepId>) -> Result<JsonValue, String> {
        let mut finished = Vec::with_capacity(step_ids.len());
        for step_id in step_ids {
            let started = match self.ledger.start_step(step_id, Metadata::new()).await {
                Ok(step) => step,
                Err(LedgerError::StateConflict {
                    status: StepStatus::Running,
                    ..
                }) => {
                    warn!(step_id = %step_id, "Step already running, leaving it to its owner");
                    continue;
                }
                Err(e) => return Err(e.to_string()),
            };
            finished.push(self.execute_started(started).await?);
        }
        Ok(json!({ "steps": finished }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{InMemoryDatasetLoader, Value};
    use crate::ledger::{MemoryLedgerStore, StepType};
    use crate::pipeline::evaluator::ProfileEvaluator;
    use crate::pipeline::steps::StepContext;
    use crate::rules::{
        BusinessRule, GeneratorKind, GeneratorRegistry, RuleExecutor, SelfCorrectionLoop, Severity,
    };
    use crate::scheduler::WorkerPoolConfig;

    async fn service() -> PipelineService {
        let loader = Arc::new(InMemoryDatasetLoader::new());
        loader
            .insert(
                Dataset::from_rows(
                    42,
                    &["id", "score"],
                    vec![
                        vec![Value::Int(1), Value::Float(0.5)],
                        vec![Value::Int(2), Value::Null],
                        vec![Value::Int(2), Value::Null],
                    ],
                )
                .unwrap(),
            )
            .await;
        let ledger = Arc::new(RunLedger::new(Arc::new(MemoryLedgerStore::new()), loader.clone()));
        let registry = Arc::new(GeneratorRegistry::standard(None, None, GeneratorKind::Statistical, 0.7));
        let context = StepContext::new(
            Arc::new(RuleRepository::in_memory()),
            RuleExecutor::default(),
            Arc::new(SelfCorrectionLoop::new(registry, RuleExecutor::default())),
            "statistical",
        );
        let dispatcher = Arc::new(StepDispatcher::new(context).with_evaluator(Arc::new(ProfileEvaluator)));
        let pool = Arc::new(StepWorkerPool::new(WorkerPoolConfig::new(2)));
        PipelineService::new(ledger, loader, dispatcher, pool).unwrap()
    }

    async fn working_runs(svc: &PipelineService) -> usize {
        svc.inner.working.read().await.len()
    }

    async fn step_id(svc: &PipelineService, run_id: RunId, t: StepType) -> StepId {
        svc.ledger().find_step(run_id, t).await.unwrap().unwrap().id
    }

    #[tokio::test]
    async fn test_trigger_unknown_dataset_is_not_found() {
        let svc = service().await;
        let result = svc.trigger_run(7, None).await;
        assert_eq!(ResponseCode::of(&result), ResponseCode::NotFound);
    }

    #[tokio::test]
    async fn test_run_step_completes_in_background() {
        let svc = service().await;
        let run_id = svc.trigger_run(42, Some("ana")).await.unwrap();
        let transform = step_id(&svc, run_id, StepType::Transform).await;

        let submission = svc.run_step(transform, Metadata::new(), Some("ana")).await.unwrap();
        assert_eq!(submission.step_ids, vec![transform]);
        let report = submission.handle.wait().await.unwrap();
        assert_eq!(report["status"], "completed");

        let step = svc.ledger().step(transform).await.unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        // The run is still open, so its transformed dataset is kept.
        assert_eq!(working_runs(&svc).await, 1);
        assert_eq!(step.metadata["operation"], "clean");
        assert_eq!(step.metadata["rows_after"], 2);
        assert!(step.metadata["status_map"]["clean"]["duration"].is_number());

        // A completed step cannot be started again.
        let again = svc.run_step(transform, Metadata::new(), Some("ana")).await;
        assert_eq!(ResponseCode::of(&again), ResponseCode::InvalidState);
    }

    #[tokio::test]
    async fn test_ownership_is_checked() {
        let svc = service().await;
        let run_id = svc.trigger_run(42, Some("ana")).await.unwrap();
        let result = svc.get_status(run_id, Some("bo")).await;
        assert_eq!(ResponseCode::of(&result), ResponseCode::Forbidden);
        assert!(svc.get_status(run_id, Some("ana")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_operation_rejected_before_start() {
        let svc = service().await;
        let run_id = svc.trigger_run(42, None).await.unwrap();
        let validate = step_id(&svc, run_id, StepType::Validate).await;

        let mut params = Metadata::new();
        params.insert("operation".into(), json!("teleport"));
        let result = svc.run_step(validate, params, None).await;
        assert_eq!(ResponseCode::of(&result), ResponseCode::InvalidRequest);
        assert_eq!(svc.ledger().step(validate).await.unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_step_can_be_retried() {
        let svc = service().await;
        let rule = svc
            .repository()
            .create(BusinessRule::new(42, "score present", "score is not null").with_severity(Severity::High))
            .await
            .unwrap();

        let run_id = svc.trigger_run(42, None).await.unwrap();
        let validate = step_id(&svc, run_id, StepType::Validate).await;
        let submission = svc.run_step(validate, Metadata::new(), None).await.unwrap();
        assert!(submission.handle.wait().await.is_err());

        let failed = svc.ledger().step(validate).await.unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert!(failed.error.unwrap().contains("blocking"));
        assert_eq!(failed.metadata["details"]["blocking_failures"], 1);

        svc.repository().delete(rule.id).await.unwrap();
        let retry = svc.retry_failed(run_id, None).await.unwrap();
        assert_eq!(retry.step_ids, vec![validate]);
        retry.handle.wait().await.unwrap();
        assert_eq!(svc.ledger().step(validate).await.unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_runs_remaining_steps_to_completion() {
        let svc = service().await;
        let run_id = svc.trigger_run(42, None).await.unwrap();

        let mut params = Metadata::new();
        params.insert("skip_steps".into(), json!(["enrich"]));
        let enrich = step_id(&svc, run_id, StepType::Enrich).await;
        svc.run_step(enrich, params, None).await.unwrap().handle.wait().await.unwrap();
        assert_eq!(svc.ledger().step(enrich).await.unwrap().status, StepStatus::Skipped);

        let submission = svc.resume(run_id, None).await.unwrap();
        assert_eq!(submission.step_ids.len(), 3);
        submission.handle.wait().await.unwrap();

        let report = svc.get_status(run_id, None).await.unwrap();
        assert_eq!(report.run.status, RunStatus::Completed);
        assert_eq!(report.counts.completed, 3);
        assert_eq!(report.counts.skipped, 1);
        assert_eq!(working_runs(&svc).await, 0);

        let nothing_left = svc.resume(run_id, None).await;
        assert_eq!(ResponseCode::of(&nothing_left), ResponseCode::InvalidState);
        svc.shutdown().await.unwrap();
    }
}
