//! Run and step records persisted by the ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::dataset::DatasetId;

pub type RunId = Uuid;
pub type StepId = Uuid;

/// Free-form JSON metadata attached to runs and steps.
pub type Metadata = Map<String, JsonValue>;

/// Lifecycle of a pipeline run, derived from its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Derives the run status from its steps.
    ///
    /// Completed when every step is completed or skipped; failed when at
    /// least one step failed and none is pending or running; pending while
    /// no step has left `pending`; running otherwise.
    pub fn from_steps(steps: &[PipelineStep]) -> RunStatus {
        if steps.is_empty() {
            return RunStatus::Pending;
        }
        if steps.iter().all(|s| s.status.is_settled()) {
            return RunStatus::Completed;
        }
        let open = steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Pending | StepStatus::Running));
        if !open && steps.iter().any(|s| s.status == StepStatus::Failed) {
            return RunStatus::Failed;
        }
        if steps.iter().all(|s| s.status == StepStatus::Pending) {
            RunStatus::Pending
        } else {
            RunStatus::Running
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Completed or skipped: nothing left to do for this step.
    pub fn is_settled(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    /// Whether a step in this status may be started.
    pub fn is_startable(self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// The stages of a run, in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Validate,
    Transform,
    Enrich,
    Load,
    BusinessRules,
}

impl StepType {
    /// Every step type in execution order.
    pub const ORDER: [StepType; 5] = [
        StepType::Validate,
        StepType::Transform,
        StepType::Enrich,
        StepType::Load,
        StepType::BusinessRules,
    ];

    /// Steps created for a run.
    pub fn for_run(include_business_rules: bool) -> Vec<StepType> {
        StepType::ORDER
            .into_iter()
            .filter(|t| include_business_rules || *t != StepType::BusinessRules)
            .collect()
    }

    pub fn position(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Validate => "validate",
            StepType::Transform => "transform",
            StepType::Enrich => "enrich",
            StepType::Load => "load",
            StepType::BusinessRules => "business_rules",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "validate" => Ok(StepType::Validate),
            "transform" => Ok(StepType::Transform),
            "enrich" => Ok(StepType::Enrich),
            "load" => Ok(StepType::Load),
            "business_rules" => Ok(StepType::BusinessRules),
            other => Err(format!("unknown step type '{}'", other)),
        }
    }
}

/// One end-to-end attempt to process a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub dataset_id: DatasetId,
    /// Caller that triggered the run; checked by the control surface.
    pub owner: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl PipelineRun {
    pub fn new(dataset_id: DatasetId, owner: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_id,
            owner,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            metadata: Metadata::new(),
        }
    }

    /// Re-derives the status from `steps`, stamping `completed_at` on a
    /// terminal status. Returns whether the status changed.
    pub fn refresh_status(&mut self, steps: &[PipelineStep]) -> bool {
        let status = RunStatus::from_steps(steps);
        if status == self.status {
            return false;
        }
        self.status = status;
        self.completed_at = match status {
            RunStatus::Completed | RunStatus::Failed => Some(Utc::now()),
            RunStatus::Pending | RunStatus::Running => None,
        };
        true
    }
}

/// One stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: StepId,
    pub run_id: RunId,
    pub step_type: StepType,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub error: Option<String>,
}

impl PipelineStep {
    pub fn pending(run_id: RunId, step_type: StepType) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step_type,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            metadata: Metadata::new(),
            error: None,
        }
    }

    /// Seconds between start and completion, when both are stamped.
    pub fn duration_secs(&self) -> Option<f64> {
        let (start, end) = (self.started_at?, self.completed_at?);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// Shallow merge: top-level keys of `patch` overwrite those of `target`.
pub fn merge_metadata(target: &mut Metadata, patch: Metadata) {
    for (key, value) in patch {
        target.insert(key, value);
    }
}

/// Per-status step counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StepCounts {
    pub fn from_steps(steps: &[PipelineStep]) -> Self {
        let mut counts = Self::default();
        for step in steps {
            match step.status {
                StepStatus::Pending => counts.pending += 1,
                StepStatus::Running => counts.running += 1,
                StepStatus::Completed => counts.completed += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

/// A run with its steps in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run: PipelineRun,
    pub steps: Vec<PipelineStep>,
    pub counts: StepCounts,
}
