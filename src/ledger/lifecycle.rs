use std::collections::HashMap;

use super::model::StepStatus;

/// Allowed step status transitions.
///
/// Valid transitions:
/// - Pending -> Running (start)
/// - Pending -> Skipped (skip policy)
/// - Failed -> Running (retry)
/// - Failed -> Skipped
/// - Running -> Completed
/// - Running -> Failed
/// - Running -> Skipped (dispatcher skip after start)
///
/// Completed and Skipped are terminal.
#[derive(Debug, Clone)]
pub struct StepLifecycle {
    valid_transitions: HashMap<StepStatus, Vec<StepStatus>>,
}

impl StepLifecycle {
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(
            StepStatus::Pending,
            vec![StepStatus::Running, StepStatus::Skipped],
        );
        valid_transitions.insert(
            StepStatus::Failed,
            vec![StepStatus::Running, StepStatus::Skipped],
        );
        valid_transitions.insert(
            StepStatus::Running,
            vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Skipped],
        );
        valid_transitions.insert(StepStatus::Completed, vec![]);
        valid_transitions.insert(StepStatus::Skipped, vec![]);

        Self { valid_transitions }
    }

    pub fn can_transition(&self, from: StepStatus, to: StepStatus) -> bool {
        self.valid_transitions
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false)
    }

    /// Statuses a step may be in for a move to `to`.
    pub fn sources_for(&self, to: StepStatus) -> Vec<StepStatus> {
        let mut sources: Vec<StepStatus> = self
            .valid_transitions
            .iter()
            .filter(|(_, targets)| targets.contains(&to))
            .map(|(from, _)| *from)
            .collect();
        sources.sort_by_key(|s| s.as_str());
        sources
    }
}

impl Default for StepLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
