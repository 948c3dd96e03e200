//! Workflow scheduler
//!
//! Each submitted execution gets one driver task that owns it. Ready steps are
//! spawned concurrently and report back over the driver's completion channel;
//! the driver applies every transition, checkpoints, and starts whatever
//! became ready. Pause, resume and cancel are observed between steps only.
//! Running steps are never interrupted.
//!
//! At most `max_concurrent` executions run at once. Further submissions wait
//! for a slot in submission order.

use super::context::ContextPackage;
use super::definition::{WorkflowDefinition, WorkflowStep};
use super::execution::{Checkpoint, ExecutionStatus, StepState, WorkflowExecution};
use super::store::CheckpointStore;
use crate::config::LimitsConfig;
use crate::error::{CoordError, CoordResult, FailureKind};
use crate::observability::MetricsCollector;
use crate::protocol::validate_id;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Everything a step needs to run
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub execution_id: Uuid,
    pub session_id: String,
    pub workflow_id: String,
    pub step: WorkflowStep,
    /// Workflow input merged with the step's static input
    pub input: Value,
    pub context: ContextPackage,
    pub attempt: u32,
    /// Working time the step may use
    pub timeout: Duration,
}

/// Runs one workflow step against its tool or agent.
///
/// Implementations bound their own work by `request.timeout`. Waiting for a
/// human approval does not count against it; approvals carry their own expiry.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, request: StepRequest) -> CoordResult<Value>;
}

/// Run `work` for at most `timeout`, reporting overrun as a transient failure
pub async fn within_step_timeout<F>(timeout: Duration, target: &str, work: F) -> CoordResult<Value>
where
    F: std::future::Future<Output = CoordResult<Value>>,
{
    tokio::time::timeout(timeout, work).await.unwrap_or_else(|_| {
        Err(CoordError::tool_invocation(
            target,
            FailureKind::Transient,
            format!("step timed out after {}ms", timeout.as_millis()),
        ))
    })
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub step_timeout: Duration,
    pub recovery_timeout: Duration,
    pub max_context_size: usize,
}

impl SchedulerSettings {
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self {
            max_concurrent: limits.max_concurrent_workflows.max(1),
            step_timeout: limits.step_timeout(),
            recovery_timeout: limits.recovery_timeout(),
            max_context_size: limits.max_context_size,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_limits(&LimitsConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

struct SessionHandle {
    control: watch::Sender<Control>,
    state: watch::Receiver<WorkflowExecution>,
    finished: watch::Receiver<bool>,
}

struct StepCompletion {
    step_id: String,
    result: CoordResult<Value>,
}

/// A session picked up again after a restart
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecoveredSession {
    pub session_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub ready_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub recovered: Vec<RecoveredSession>,
    /// Sessions already bound in this process and left alone
    pub skipped: Vec<String>,
    pub elapsed_ms: u64,
}

struct SchedulerInner {
    executor: Arc<dyn StepExecutor>,
    store: Arc<dyn CheckpointStore>,
    metrics: Arc<MetricsCollector>,
    slots: Arc<Semaphore>,
    sessions: DashMap<String, SessionHandle>,
    settings: SchedulerSettings,
}

#[derive(Clone)]
pub struct WorkflowScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for WorkflowScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowScheduler")
            .field("sessions", &self.inner.sessions.len())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl WorkflowScheduler {
    pub fn new(
        executor: Arc<dyn StepExecutor>,
        store: Arc<dyn CheckpointStore>,
        metrics: Arc<MetricsCollector>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                store,
                metrics,
                slots: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
                sessions: DashMap::new(),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Start a workflow bound to `session_id`.
    ///
    /// The definition is validated first; a cyclic definition creates no
    /// execution. When every slot is taken the execution is queued.
    pub async fn submit(
        &self,
        definition: WorkflowDefinition,
        session_id: &str,
        input: Value,
    ) -> CoordResult<WorkflowExecution> {
        definition.validate()?;
        validate_id(session_id)
            .map_err(|e| CoordError::invalid_input(format!("session id: {e}")))?;
        if self.is_bound(session_id) {
            return Err(CoordError::invalid_input(format!(
                "session '{session_id}' already has an active workflow"
            )));
        }

        let execution = WorkflowExecution::new(definition, session_id, input);
        self.inner
            .store
            .save(&Checkpoint::new(1, &execution))
            .await?;
        self.inner.metrics.workflow_queued();
        info!(
            session_id,
            workflow_id = %execution.workflow_id(),
            execution_id = %execution.execution_id,
            "Workflow submitted"
        );

        self.spawn_driver(execution.clone(), 1, Control::Run);
        Ok(execution)
    }

    fn is_bound(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .get(session_id)
            .map(|handle| !*handle.finished.borrow())
            .unwrap_or(false)
    }

    fn spawn_driver(&self, execution: WorkflowExecution, revision: u64, initial: Control) {
        let (control_tx, control_rx) = watch::channel(initial);
        let (state_tx, state_rx) = watch::channel(execution.clone());
        let (finished_tx, finished_rx) = watch::channel(false);

        self.inner.sessions.insert(
            execution.session_id.clone(),
            SessionHandle {
                control: control_tx,
                state: state_rx,
                finished: finished_rx,
            },
        );

        let span = crate::workflow_span!(execution.session_id, execution.definition.id);
        let driver = Driver {
            inner: Arc::clone(&self.inner),
            execution,
            revision,
            control: control_rx,
            state: state_tx,
        };
        tokio::spawn(
            async move {
                driver.run().await;
                let _ = finished_tx.send(true);
            }
            .instrument(span),
        );
    }

    fn handle_control(&self, session_id: &str, control: Control) -> CoordResult<()> {
        let handle = self
            .inner
            .sessions
            .get(session_id)
            .ok_or_else(|| CoordError::unknown_session(session_id))?;
        if *handle.finished.borrow() || handle.state.borrow().status.is_terminal() {
            return Err(CoordError::invalid_input(format!(
                "workflow in session '{session_id}' has already finished"
            )));
        }
        handle.control.send_replace(control);
        debug!(session_id, ?control, "Workflow control signalled");
        Ok(())
    }

    /// Stop starting new steps; running steps finish
    pub fn pause(&self, session_id: &str) -> CoordResult<()> {
        self.handle_control(session_id, Control::Pause)
    }

    pub fn resume(&self, session_id: &str) -> CoordResult<()> {
        self.handle_control(session_id, Control::Run)
    }

    /// Cancel at the next step boundary
    pub fn cancel(&self, session_id: &str) -> CoordResult<()> {
        self.handle_control(session_id, Control::Cancel)
    }

    /// Latest state of the session's execution
    pub fn status(&self, session_id: &str) -> CoordResult<WorkflowExecution> {
        self.inner
            .sessions
            .get(session_id)
            .map(|handle| handle.state.borrow().clone())
            .ok_or_else(|| CoordError::unknown_session(session_id))
    }

    /// Wait until the driver has finished, in-flight steps included
    pub async fn wait_for_completion(
        &self,
        session_id: &str,
        limit: Duration,
    ) -> CoordResult<WorkflowExecution> {
        let (mut finished, state) = {
            let handle = self
                .inner
                .sessions
                .get(session_id)
                .ok_or_else(|| CoordError::unknown_session(session_id))?;
            (handle.finished.clone(), handle.state.clone())
        };

        tokio::time::timeout(limit, finished.wait_for(|done| *done))
            .await
            .map_err(|_| {
                CoordError::internal(format!(
                    "workflow in session '{session_id}' did not finish within {limit:?}"
                ))
            })?
            .map_err(|_| CoordError::internal("workflow driver stopped unexpectedly"))?;

        let execution = state.borrow().clone();
        Ok(execution)
    }

    /// Drop a finished session so its id can be reused
    pub fn release(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .remove_if(session_id, |_, handle| *handle.finished.borrow())
            .is_some()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Sessions whose workflow has not finished
    pub fn active_sessions(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|entry| !*entry.finished.borrow())
            .count()
    }

    /// Reload every active checkpoint and resume its execution.
    ///
    /// Interrupted steps are re-run, so step executors must tolerate repeats;
    /// tool steps carry a stable idempotency key for this. Fails with
    /// `RecoveryTimeout` when loading checkpoints exceeds the recovery bound.
    pub async fn recover(&self) -> CoordResult<RecoveryReport> {
        let started = Instant::now();
        let limit = self.inner.settings.recovery_timeout;

        let checkpoints = tokio::time::timeout(limit, self.inner.store.load_active())
            .await
            .map_err(|_| CoordError::RecoveryTimeout { limit })??;

        let mut report = RecoveryReport {
            recovered: Vec::new(),
            skipped: Vec::new(),
            elapsed_ms: 0,
        };

        for checkpoint in checkpoints {
            if self.is_bound(&checkpoint.session_id) {
                report.skipped.push(checkpoint.session_id);
                continue;
            }

            let mut execution = checkpoint.execution;
            let ready_steps = execution.prepare_for_recovery();
            let initial = if execution.status == ExecutionStatus::Paused {
                Control::Pause
            } else {
                Control::Run
            };

            info!(
                session_id = %execution.session_id,
                workflow_id = %execution.workflow_id(),
                revision = checkpoint.revision,
                ?ready_steps,
                "Recovering workflow"
            );
            report.recovered.push(RecoveredSession {
                session_id: execution.session_id.clone(),
                workflow_id: execution.workflow_id().to_string(),
                status: execution.status,
                ready_steps,
            });
            self.inner.metrics.session_recovered();
            self.inner.metrics.workflow_queued();
            self.spawn_driver(execution, checkpoint.revision, initial);
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            recovered = report.recovered.len(),
            skipped = report.skipped.len(),
            elapsed_ms = report.elapsed_ms,
            "Recovery complete"
        );
        Ok(report)
    }
}

/// Single writer for one execution
struct Driver {
    inner: Arc<SchedulerInner>,
    execution: WorkflowExecution,
    revision: u64,
    control: watch::Receiver<Control>,
    state: watch::Sender<WorkflowExecution>,
}

impl Driver {
    async fn run(mut self) {
        let Some(_slot) = self.acquire_slot().await else {
            self.execution.set_status(ExecutionStatus::Cancelled);
            self.checkpoint().await;
            self.inner.metrics.workflow_cancelled();
            info!("Workflow cancelled while queued");
            return;
        };
        self.inner.metrics.workflow_started();

        let (completions_tx, mut completions) = mpsc::unbounded_channel::<StepCompletion>();
        let mut in_flight = 0usize;

        if self.execution.status == ExecutionStatus::Queued {
            self.execution.set_status(ExecutionStatus::Running);
        }
        self.advance();
        self.checkpoint().await;
        info!("Workflow started");

        loop {
            let control = *self.control.borrow_and_update();
            match control {
                Control::Cancel if !self.execution.status.is_terminal() => {
                    self.execution.set_status(ExecutionStatus::Cancelled);
                    self.checkpoint().await;
                    info!(in_flight, "Workflow cancelled");
                }
                Control::Pause if self.execution.status == ExecutionStatus::Running => {
                    self.execution.set_status(ExecutionStatus::Paused);
                    self.checkpoint().await;
                    info!(in_flight, "Workflow paused");
                }
                Control::Run if self.execution.status == ExecutionStatus::Paused => {
                    self.execution.set_status(ExecutionStatus::Running);
                    self.checkpoint().await;
                    info!("Workflow resumed");
                }
                _ => {}
            }

            if self.execution.status == ExecutionStatus::Running {
                for step_id in self.execution.ready_candidates() {
                    if self.start_step(&step_id, &completions_tx).await {
                        in_flight += 1;
                    }
                }
                if self.execution.finish_if_done() {
                    self.checkpoint().await;
                }
            }

            let status = self.execution.status;
            if in_flight == 0 {
                if status.is_terminal() {
                    break;
                }
                if status == ExecutionStatus::Running {
                    // Nothing running and nothing ready: the graph cannot progress
                    error!("Workflow stalled with no runnable steps");
                    self.execution.error = Some("no runnable steps".to_string());
                    self.execution.set_status(ExecutionStatus::Failed);
                    self.checkpoint().await;
                    break;
                }
            }

            tokio::select! {
                Some(completion) = completions.recv(), if in_flight > 0 => {
                    in_flight -= 1;
                    self.apply(completion).await;
                }
                changed = self.control.changed() => {
                    if changed.is_err() {
                        // Scheduler dropped; finish the steps already running
                        while in_flight > 0 {
                            match completions.recv().await {
                                Some(completion) => {
                                    in_flight -= 1;
                                    self.apply(completion).await;
                                }
                                None => break,
                            }
                        }
                        break;
                    }
                }
            }
        }

        match self.execution.status {
            ExecutionStatus::Completed => {
                self.inner.metrics.workflow_completed();
                info!("Workflow completed");
            }
            ExecutionStatus::Failed => {
                self.inner.metrics.workflow_failed();
                warn!(error = ?self.execution.error, "Workflow failed");
            }
            ExecutionStatus::Cancelled => self.inner.metrics.workflow_cancelled(),
            other => debug!(status = %other, "Workflow driver stopped"),
        }
    }

    /// Wait for a concurrency slot; `None` when cancelled while waiting
    async fn acquire_slot(&mut self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        let slots = Arc::clone(&self.inner.slots);
        loop {
            if *self.control.borrow_and_update() == Control::Cancel {
                return None;
            }
            tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => return permit.ok(),
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn advance(&mut self) {
        let advance = self.execution.advance();
        for step_id in &advance.newly_skipped {
            self.inner.metrics.step_skipped();
            info!(step_id, "Step skipped");
        }
    }

    async fn checkpoint(&mut self) {
        self.revision += 1;
        let checkpoint = Checkpoint::new(self.revision, &self.execution);
        if let Err(e) = self.inner.store.save(&checkpoint).await {
            error!(revision = self.revision, error = %e, "Failed to write checkpoint");
        }
        self.state.send_replace(self.execution.clone());
    }

    async fn start_step(
        &mut self,
        step_id: &str,
        completions: &mpsc::UnboundedSender<StepCompletion>,
    ) -> bool {
        let Some(step) = self.execution.definition.step(step_id).cloned() else {
            return false;
        };
        if let Err(e) = self.execution.mark_running(step_id) {
            warn!(step_id, error = %e, "Could not start step");
            return false;
        }
        self.checkpoint().await;

        let attempt = self
            .execution
            .steps
            .get(step_id)
            .map(|record| record.attempts)
            .unwrap_or(1);
        let request = StepRequest {
            execution_id: self.execution.execution_id,
            session_id: self.execution.session_id.clone(),
            workflow_id: self.execution.definition.id.clone(),
            input: compose_input(&self.execution.input, &step.input),
            context: ContextPackage::build(
                self.execution.dependency_outputs(step_id),
                self.inner.settings.max_context_size,
            ),
            attempt,
            timeout: self.inner.settings.step_timeout,
            step,
        };
        debug!(step_id, attempt, target = %request.step.target.describe(), "Step started");

        let executor = Arc::clone(&self.inner.executor);
        let completions = completions.clone();
        tokio::spawn(
            async move {
                let step_id = request.step.id.clone();
                let result = executor.execute(request).await;
                let _ = completions.send(StepCompletion { step_id, result });
            }
            .in_current_span(),
        );
        true
    }

    async fn apply(&mut self, completion: StepCompletion) {
        let StepCompletion { step_id, result } = completion;
        match result {
            Ok(output) => {
                if let Err(e) = self.execution.complete_step(&step_id, output) {
                    warn!(step_id, error = %e, "Dropping completion");
                    return;
                }
                self.inner.metrics.step_completed();
                info!(step_id, "Step completed");
            }
            Err(e) => {
                let reason = e.to_string();
                match self.execution.fail_step(&step_id, reason.clone()) {
                    Ok(StepState::Skipped) => {
                        self.inner.metrics.step_skipped();
                        warn!(step_id, error = %reason, "Optional step failed, skipping");
                    }
                    Ok(_) => {
                        self.inner.metrics.step_failed();
                        error!(step_id, error = %reason, "Required step failed");
                    }
                    Err(e) => {
                        warn!(step_id, error = %e, "Dropping completion");
                        return;
                    }
                }
            }
        }
        self.advance();
        self.checkpoint().await;
    }
}

/// Step input on top of the workflow input; objects are merged key by key
fn compose_input(workflow_input: &Value, step_input: &Value) -> Value {
    match (workflow_input, step_input) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockStepExecutor;
    use crate::workflow::store::MemoryCheckpointStore;
    use serde_json::json;

    fn scheduler(executor: Arc<MockStepExecutor>, max_concurrent: usize) -> WorkflowScheduler {
        WorkflowScheduler::new(
            executor,
            Arc::new(MemoryCheckpointStore::default()),
            Arc::new(MetricsCollector::new()),
            SchedulerSettings {
                max_concurrent,
                step_timeout: Duration::from_secs(2),
                recovery_timeout: Duration::from_secs(30),
                max_context_size: 4000,
            },
        )
    }

    #[test]
    fn test_compose_input() {
        assert_eq!(
            compose_input(&json!({"a": 1, "b": 1}), &json!({"b": 2})),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(compose_input(&json!({"a": 1}), &Value::Null), json!({"a": 1}));
        assert_eq!(compose_input(&json!({"a": 1}), &json!("raw")), json!("raw"));
    }

    #[tokio::test]
    async fn test_runs_dag_to_completion() {
        let executor = Arc::new(MockStepExecutor::new());
        let scheduler = scheduler(Arc::clone(&executor), 2);
        let definition = WorkflowDefinition::new(
            "pipeline",
            vec![
                WorkflowStep::agent("fetch", "research"),
                WorkflowStep::agent("summarize", "writing").after(["fetch"]),
            ],
        );

        scheduler.submit(definition, "s1", json!({"q": "rust"})).await.unwrap();
        let done = scheduler
            .wait_for_completion("s1", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(executor.executed(), vec!["fetch", "summarize"]);
        let summarize = executor.request("summarize").unwrap();
        assert_eq!(summarize.context.entries[0].step_id, "fetch");
        assert_eq!(summarize.input["q"], "rust");
    }

    #[tokio::test]
    async fn test_cyclic_definition_creates_no_execution() {
        let scheduler = scheduler(Arc::new(MockStepExecutor::new()), 2);
        let definition = WorkflowDefinition::new(
            "loop",
            vec![
                WorkflowStep::agent("a", "x").after(["b"]),
                WorkflowStep::agent("b", "x").after(["a"]),
            ],
        );
        assert!(matches!(
            scheduler.submit(definition, "s1", json!({})).await,
            Err(CoordError::CyclicWorkflow { .. })
        ));
        assert!(scheduler.status("s1").is_err());
    }

    #[tokio::test]
    async fn test_required_failure_halts_downstream() {
        let executor = Arc::new(MockStepExecutor::new());
        executor.fail("a", FailureKind::Permanent);
        let scheduler = scheduler(Arc::clone(&executor), 2);
        let definition = WorkflowDefinition::new(
            "halt",
            vec![
                WorkflowStep::agent("a", "x"),
                WorkflowStep::agent("b", "x").after(["a"]),
            ],
        );

        scheduler.submit(definition, "s1", json!({})).await.unwrap();
        let done = scheduler
            .wait_for_completion("s1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.step_state("b"), Some(StepState::Skipped));
        assert_eq!(executor.executed(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_excess_submissions_are_queued() {
        let executor = Arc::new(MockStepExecutor::new());
        executor.delay("slow", Duration::from_millis(100));
        let scheduler = scheduler(Arc::clone(&executor), 1);

        for session in ["s1", "s2"] {
            let definition =
                WorkflowDefinition::new("one", vec![WorkflowStep::agent("slow", "x")]);
            scheduler.submit(definition, session, json!({})).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(scheduler.status("s2").unwrap().status, ExecutionStatus::Queued);

        let second = scheduler
            .wait_for_completion("s2", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(second.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_pause_resume_cancel_at_step_boundaries() {
        let executor = Arc::new(MockStepExecutor::new());
        executor.delay("a", Duration::from_millis(80));
        let scheduler = scheduler(Arc::clone(&executor), 2);
        let definition = WorkflowDefinition::new(
            "controlled",
            vec![
                WorkflowStep::agent("a", "x"),
                WorkflowStep::agent("b", "x").after(["a"]),
                WorkflowStep::agent("c", "x").after(["b"]),
            ],
        );
        scheduler.submit(definition, "s1", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.pause("s1").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let paused = scheduler.status("s1").unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        // The running step finished; nothing new started
        assert_eq!(paused.step_state("a"), Some(StepState::Completed));
        assert_eq!(paused.step_state("b"), Some(StepState::Ready));

        scheduler.cancel("s1").unwrap();
        let done = scheduler
            .wait_for_completion("s1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Cancelled);
        assert_eq!(executor.executed(), vec!["a"]);
        assert!(scheduler.resume("s1").is_err());
        assert!(scheduler.release("s1"));
    }
    #[tokio::test]
    async fn test_failure_of_in_flight_step_after_cancel() {
        let executor = Arc::new(MockStepExecutor::new());
        executor.delay("a", Duration::from_millis(80));
        executor.fail("a", FailureKind::Permanent);
        let scheduler = scheduler(Arc::clone(&executor), 2);
        let definition = WorkflowDefinition::new(
            "doomed",
            vec![
                WorkflowStep::agent("a", "x"),
                WorkflowStep::agent("b", "x").after(["a"]),
            ],
        );
        scheduler.submit(definition, "s1", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.cancel("s1").unwrap();
        let done = scheduler
            .wait_for_completion("s1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Cancelled);
        assert_eq!(done.step_state("a"), Some(StepState::Failed));
        assert_eq!(executor.executed(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_overrunning_step_times_out() {
        let executor = Arc::new(MockStepExecutor::new());
        executor.delay("slow", Duration::from_secs(5));
        let scheduler = WorkflowScheduler::new(
            Arc::clone(&executor) as Arc<dyn StepExecutor>,
            Arc::new(MemoryCheckpointStore::default()),
            Arc::new(MetricsCollector::new()),
            SchedulerSettings {
                max_concurrent: 1,
                step_timeout: Duration::from_millis(50),
                recovery_timeout: Duration::from_secs(30),
                max_context_size: 4000,
            },
        );
        let definition = WorkflowDefinition::new("slow", vec![WorkflowStep::agent("slow", "x")]);
        scheduler.submit(definition, "s1", json!({})).await.unwrap();

        let done = scheduler
            .wait_for_completion("s1", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.steps["slow"]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }
}
