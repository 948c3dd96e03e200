//! Workflow executions and checkpoints
//!
//! A `WorkflowExecution` is owned by exactly one scheduler driver. Every step
//! transition goes through the methods here, and the driver checkpoints the
//! whole execution after each one.

use super::definition::WorkflowDefinition;
use crate::error::{CoordError, CoordResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Skipped
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Ready => "ready",
            StepState::Running => "running",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Waiting for a concurrency slot
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Times the step was started, recovery restarts included
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            state: StepState::Pending,
            output: None,
            error: None,
            attempts: 0,
            finished_at: None,
        }
    }
}

/// Step transitions caused by a completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Advance {
    pub newly_ready: Vec<String>,
    pub newly_skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub session_id: String,
    pub definition: WorkflowDefinition,
    pub status: ExecutionStatus,
    pub steps: BTreeMap<String, StepRecord>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(definition: WorkflowDefinition, session_id: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        let steps = definition
            .steps
            .iter()
            .map(|step| (step.id.clone(), StepRecord::pending()))
            .collect();
        Self {
            execution_id: Uuid::new_v4(),
            session_id: session_id.into(),
            definition,
            status: ExecutionStatus::Queued,
            steps,
            input,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.definition.id
    }

    pub fn step_state(&self, step_id: &str) -> Option<StepState> {
        self.steps.get(step_id).map(|record| record.state)
    }

    fn record_mut(&mut self, step_id: &str) -> CoordResult<&mut StepRecord> {
        let workflow_id = self.definition.id.clone();
        self.steps.get_mut(step_id).ok_or_else(|| {
            CoordError::invalid_input(format!(
                "workflow '{workflow_id}' has no step '{step_id}'"
            ))
        })
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Ready steps in declaration order
    pub fn ready_candidates(&self) -> Vec<String> {
        self.definition
            .steps
            .iter()
            .filter(|step| self.step_state(&step.id) == Some(StepState::Ready))
            .map(|step| step.id.clone())
            .collect()
    }

    pub fn running_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|(_, record)| record.state == StepState::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Promote pending steps whose dependencies are settled.
    ///
    /// A step waits until every dependency is terminal. It becomes ready when
    /// all of them completed, or were skipped and the step tolerates skipped
    /// dependencies; otherwise it is skipped. A required step skipped this way
    /// fails the workflow. Repeats until nothing changes, so skips cascade.
    pub fn advance(&mut self) -> Advance {
        let mut advance = Advance::default();
        loop {
            let mut changed = false;
            for step in &self.definition.steps {
                if self.step_state(&step.id) != Some(StepState::Pending) {
                    continue;
                }

                let dependency_states: Vec<StepState> = step
                    .depends_on
                    .iter()
                    .filter_map(|dependency| self.step_state(dependency))
                    .collect();
                if dependency_states.iter().any(|state| !state.is_terminal()) {
                    continue;
                }

                let blocked = dependency_states.iter().any(|state| match state {
                    StepState::Failed => true,
                    StepState::Skipped => !step.tolerate_skipped,
                    _ => false,
                });

                let (state, list) = if blocked {
                    (StepState::Skipped, &mut advance.newly_skipped)
                } else {
                    (StepState::Ready, &mut advance.newly_ready)
                };
                if let Some(record) = self.steps.get_mut(&step.id) {
                    record.state = state;
                    if blocked {
                        record.error = Some("dependency did not complete".to_string());
                        record.finished_at = Some(Utc::now());
                    }
                }
                list.push(step.id.clone());
                changed = true;

                if blocked && step.is_required() && !self.status.is_terminal() {
                    self.status = ExecutionStatus::Failed;
                    self.error = Some(format!(
                        "required step '{}' was skipped because a dependency did not complete",
                        step.id
                    ));
                }
            }
            if !changed {
                break;
            }
        }
        if !advance.newly_ready.is_empty() || !advance.newly_skipped.is_empty() {
            self.touch();
        }
        advance
    }

    pub fn mark_running(&mut self, step_id: &str) -> CoordResult<()> {
        let record = self.record_mut(step_id)?;
        if record.state != StepState::Ready {
            return Err(CoordError::invalid_input(format!(
                "step '{step_id}' is {} and cannot start",
                record.state
            )));
        }
        record.state = StepState::Running;
        record.attempts += 1;
        self.touch();
        Ok(())
    }

    pub fn complete_step(&mut self, step_id: &str, output: Value) -> CoordResult<()> {
        let record = self.record_mut(step_id)?;
        record.state = StepState::Completed;
        record.output = Some(output);
        record.error = None;
        record.finished_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Record a step failure. Optional steps are skipped; a required step
    /// fails the whole execution. Returns the state the step ended in.
    pub fn fail_step(&mut self, step_id: &str, reason: impl Into<String>) -> CoordResult<StepState> {
        let required = self
            .definition
            .step(step_id)
            .map(|step| step.is_required())
            .unwrap_or(true);
        let reason = reason.into();

        let record = self.record_mut(step_id)?;
        record.state = if required {
            StepState::Failed
        } else {
            StepState::Skipped
        };
        record.error = Some(reason.clone());
        record.finished_at = Some(Utc::now());
        let state = record.state;

        // A cancelled or already failed execution keeps its outcome
        if required && !self.status.is_terminal() {
            self.status = ExecutionStatus::Failed;
            self.error = Some(format!("required step '{step_id}' failed: {reason}"));
        }
        self.touch();
        Ok(state)
    }

    pub fn set_status(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.touch();
    }

    /// Every step has reached a terminal state
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.values().all(|record| record.state.is_terminal())
    }

    /// Nothing is running and nothing more can start
    pub fn is_settled(&self) -> bool {
        self.running_steps().is_empty()
            && (self.all_steps_terminal()
                || (self.ready_candidates().is_empty() && self.status.is_terminal()))
    }

    /// Mark the execution completed once all steps are terminal
    pub fn finish_if_done(&mut self) -> bool {
        if self.status == ExecutionStatus::Running && self.all_steps_terminal() {
            self.set_status(ExecutionStatus::Completed);
            return true;
        }
        false
    }

    /// Outputs of the step's completed dependencies, oldest first
    pub fn dependency_outputs(&self, step_id: &str) -> Vec<(String, Value)> {
        let Some(step) = self.definition.step(step_id) else {
            return Vec::new();
        };
        let mut outputs: Vec<(DateTime<Utc>, String, Value)> = step
            .depends_on
            .iter()
            .filter_map(|dependency| {
                let record = self.steps.get(dependency)?;
                let output = record.output.clone()?;
                Some((record.finished_at.unwrap_or(self.started_at), dependency.clone(), output))
            })
            .collect();
        outputs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        outputs.into_iter().map(|(_, id, output)| (id, output)).collect()
    }

    /// Outputs of all completed steps keyed by step id
    pub fn outputs(&self) -> BTreeMap<String, Value> {
        self.steps
            .iter()
            .filter_map(|(id, record)| record.output.clone().map(|output| (id.clone(), output)))
            .collect()
    }

    /// Reset a reloaded execution so its interrupted work can be re-run.
    ///
    /// Running steps go back to ready; their invocations were lost with the
    /// process. Pending steps whose dependencies have settled are promoted.
    /// Returns the steps that are ready afterwards.
    pub fn prepare_for_recovery(&mut self) -> Vec<String> {
        for record in self.steps.values_mut() {
            if record.state == StepState::Running {
                record.state = StepState::Ready;
            }
        }
        if self.status == ExecutionStatus::Queued {
            self.status = ExecutionStatus::Running;
        }
        self.advance();
        self.touch();
        self.ready_candidates()
    }
}

/// The durable record of an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub session_id: String,
    /// Increases by one with every saved transition
    pub revision: u64,
    pub saved_at: DateTime<Utc>,
    pub execution: WorkflowExecution,
}

impl Checkpoint {
    pub fn new(revision: u64, execution: &WorkflowExecution) -> Self {
        Self {
            session_id: execution.session_id.clone(),
            revision,
            saved_at: Utc::now(),
            execution: execution.clone(),
        }
    }

    /// Executions that still have work to do after a restart
    pub fn is_active(&self) -> bool {
        !self.execution.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::WorkflowStep;
    use proptest::prelude::*;
    use serde_json::json;

    fn linear() -> WorkflowExecution {
        let definition = WorkflowDefinition::new(
            "linear",
            vec![
                WorkflowStep::agent("a", "x"),
                WorkflowStep::agent("b", "x").after(["a"]),
                WorkflowStep::agent("c", "x").after(["b"]),
            ],
        );
        let mut execution = WorkflowExecution::new(definition, "s1", json!({}));
        execution.set_status(ExecutionStatus::Running);
        execution
    }

    #[test]
    fn test_steps_become_ready_in_order() {
        let mut execution = linear();
        assert_eq!(execution.advance().newly_ready, vec!["a"]);
        execution.mark_running("a").unwrap();
        assert!(execution.advance().newly_ready.is_empty());

        execution.complete_step("a", json!(1)).unwrap();
        assert_eq!(execution.advance().newly_ready, vec!["b"]);
        assert!(execution.mark_running("c").is_err());
    }

    #[test]
    fn test_required_failure_fails_execution_and_skips_downstream() {
        let mut execution = linear();
        execution.advance();
        execution.mark_running("a").unwrap();
        assert_eq!(execution.fail_step("a", "boom").unwrap(), StepState::Failed);
        assert_eq!(execution.status, ExecutionStatus::Failed);

        let advance = execution.advance();
        assert_eq!(advance.newly_skipped, vec!["b", "c"]);
        assert!(execution.is_settled());
    }

    #[test]
    fn test_failure_after_cancel_keeps_cancelled() {
        let mut execution = linear();
        execution.advance();
        execution.mark_running("a").unwrap();
        execution.set_status(ExecutionStatus::Cancelled);

        assert_eq!(execution.fail_step("a", "boom").unwrap(), StepState::Failed);
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert!(execution.error.is_none());

        execution.advance();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_optional_failure_is_skipped() {
        let definition = WorkflowDefinition::new(
            "opt",
            vec![
                WorkflowStep::agent("enrich", "x").optional(),
                WorkflowStep::agent("summary", "x")
                    .after(["enrich"])
                    .tolerating_skipped(),
                WorkflowStep::agent("strict", "x").after(["enrich"]).optional(),
            ],
        );
        let mut execution = WorkflowExecution::new(definition, "s1", json!({}));
        execution.set_status(ExecutionStatus::Running);
        execution.advance();
        execution.mark_running("enrich").unwrap();

        assert_eq!(
            execution.fail_step("enrich", "timeout").unwrap(),
            StepState::Skipped
        );
        let advance = execution.advance();
        assert_eq!(advance.newly_ready, vec!["summary"]);
        assert_eq!(advance.newly_skipped, vec!["strict"]);
        assert_eq!(execution.status, ExecutionStatus::Running);
    }

    #[test]
    fn test_recovery_resets_running_steps() {
        // A completed, B running, C pending on B
        let mut execution = linear();
        execution.advance();
        execution.mark_running("a").unwrap();
        execution.complete_step("a", json!("done")).unwrap();
        execution.advance();
        execution.mark_running("b").unwrap();

        let checkpoint = Checkpoint::new(4, &execution);
        let encoded = serde_json::to_string(&checkpoint).unwrap();
        let mut reloaded: Checkpoint = serde_json::from_str(&encoded).unwrap();

        let ready = reloaded.execution.prepare_for_recovery();
        assert_eq!(ready, vec!["b"]);
        assert_eq!(reloaded.execution.step_state("a"), Some(StepState::Completed));
        assert_eq!(reloaded.execution.step_state("b"), Some(StepState::Ready));
        assert_eq!(reloaded.execution.step_state("c"), Some(StepState::Pending));
        assert!(reloaded.is_active());
    }

    #[test]
    fn test_dependency_outputs_oldest_first() {
        let definition = WorkflowDefinition::new(
            "fan-in",
            vec![
                WorkflowStep::agent("a", "x"),
                WorkflowStep::agent("b", "x"),
                WorkflowStep::agent("join", "x").after(["a", "b"]),
            ],
        );
        let mut execution = WorkflowExecution::new(definition, "s1", json!({}));
        execution.advance();
        execution.complete_step("b", json!("first")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        execution.complete_step("a", json!("second")).unwrap();

        let outputs = execution.dependency_outputs("join");
        assert_eq!(outputs[0], ("b".to_string(), json!("first")));
        assert_eq!(outputs[1], ("a".to_string(), json!("second")));
    }

    fn random_dag() -> impl Strategy<Value = (WorkflowDefinition, Vec<bool>)> {
        (2usize..10)
            .prop_flat_map(|n| {
                (
                    proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n),
                    proptest::collection::vec((any::<bool>(), any::<bool>()), n),
                    proptest::collection::vec(any::<bool>(), n),
                )
            })
            .prop_map(|(edges, flags, outcomes)| {
                let steps = flags
                    .iter()
                    .enumerate()
                    .map(|(i, (optional, tolerant))| {
                        let depends_on: Vec<String> = (0..i)
                            .filter(|j| edges[i][*j])
                            .map(|j| format!("s{j}"))
                            .collect();
                        let mut step = WorkflowStep::agent(format!("s{i}"), "x").after(depends_on);
                        if *optional {
                            step = step.optional();
                        }
                        if *tolerant {
                            step = step.tolerating_skipped();
                        }
                        step
                    })
                    .collect();
                (WorkflowDefinition::new("random", steps), outcomes)
            })
    }

    proptest! {
        #[test]
        fn prop_ready_only_after_dependencies_settle((definition, outcomes) in random_dag()) {
            prop_assert!(definition.validate().is_ok());
            let mut execution = WorkflowExecution::new(definition.clone(), "s", json!({}));
            execution.set_status(ExecutionStatus::Running);

            for _ in 0..definition.steps.len() * 2 {
                let advance = execution.advance();
                for id in &advance.newly_ready {
                    let step = definition.step(id).unwrap();
                    for dependency in &step.depends_on {
                        let state = execution.step_state(dependency).unwrap();
                        prop_assert!(
                            state == StepState::Completed
                                || (state == StepState::Skipped && step.tolerate_skipped),
                            "{} ready while {} is {}", id, dependency, state
                        );
                    }
                }

                let ready = execution.ready_candidates();
                if ready.is_empty() {
                    break;
                }
                for id in ready {
                    let index: usize = id[1..].parse().unwrap();
                    execution.mark_running(&id).unwrap();
                    if outcomes[index] {
                        execution.complete_step(&id, json!(index)).unwrap();
                    } else {
                        execution.fail_step(&id, "failed").unwrap();
                    }
                }
            }

            prop_assert!(execution.all_steps_terminal());
        }
    }
}
