//! Step execution use case.
//!
//! Runs exactly one step to a terminal or suspended outcome:
//!
//! 1. resolve the step (tree first, request payload as a degraded fallback)
//! 2. apply the caller's resolved inputs
//! 3. checkpoint gate
//! 4. dispatch to the executor, racing cancellation and the step timeout
//! 5. record success or failure, or reset the step for a retry
//! 6. roll the tree outcome up into the task status
//!
//! Within one step, writes happen before events, and events before
//! dependents are scheduled. Retries are handed back to the caller through
//! `retry_step_data`; the use case never reschedules itself.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::node::Payload;
use crate::core::task::{StepStatus, StepUpdate, Task, TaskStatus, TaskStep};
use crate::error::Result;
use crate::orchestration::context::EngineContext;
use crate::orchestration::executor::{ErrorKind, ExecutionResult, StepError};
use crate::orchestration::ports::TaskEvent;
use crate::{tlog, tlog_debug, tlog_error, tlog_warn};

/// Invocation payload for one step.
///
/// Only `id` and `agent_type` are required. `inputs`, when present, replace
/// whatever the tree holds for the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub agent_type: String,
    #[serde(default)]
    pub inputs: Option<Payload>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl StepRequest {
    pub fn new(id: &str, agent_type: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            agent_type: agent_type.to_string(),
            inputs: None,
            retry_count: None,
            max_retries: None,
        }
    }

    pub fn from_step(step: &TaskStep) -> Self {
        Self {
            id: step.id.clone(),
            name: Some(step.name.clone()),
            agent_type: step.agent_type.clone(),
            inputs: Some(step.inputs.clone()),
            retry_count: Some(step.retry_count),
            max_retries: Some(step.max_retries),
        }
    }

    pub fn with_inputs(mut self, inputs: Payload) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}

/// Where the executed step definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSource {
    /// The task's execution tree, the source of truth.
    Tree,
    /// Rebuilt from the request because the tree lookup missed.
    Payload,
}

impl StepSource {
    /// Resolve a step, falling back to the request payload when the tree
    /// has no node for it.
    async fn resolve(
        ctx: &EngineContext,
        tree_id: &str,
        request: &StepRequest,
    ) -> (TaskStep, StepSource) {
        match ctx.adapter.get_step_from_tree(tree_id, &request.id).await {
            Ok(Some(step)) => (step, StepSource::Tree),
            Ok(None) => {
                tlog_warn!(
                    "Step {} not in tree {}, running from request payload",
                    request.id,
                    tree_id
                );
                (Self::from_request(ctx, request), StepSource::Payload)
            }
            Err(e) => {
                tlog_warn!(
                    "Tree lookup of step {} in {} failed, running from request payload: {}",
                    request.id,
                    tree_id,
                    e
                );
                (Self::from_request(ctx, request), StepSource::Payload)
            }
        }
    }

    fn from_request(ctx: &EngineContext, request: &StepRequest) -> TaskStep {
        let name = request.name.as_deref().unwrap_or(&request.id);
        let mut step = TaskStep::new(&request.id, name, &request.agent_type);
        step.max_retries = ctx.config.default_max_retries;
        step
    }
}

/// Result status of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Error,
    /// Transient failure with budget left; re-invoke with `retry_step_data`.
    Retrying,
    /// Waiting for approval.
    Checkpoint,
    /// The task or step was cancelled; any executor result was discarded.
    Cancelled,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepOutcome::Success => "success",
            StepOutcome::Error => "error",
            StepOutcome::Retrying => "retrying",
            StepOutcome::Checkpoint => "checkpoint",
            StepOutcome::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub task_id: String,
    pub step_id: String,
    pub status: StepOutcome,
    #[serde(default)]
    pub output: Option<Payload>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_step_data: Option<StepRequest>,
    /// Error class of a failure, when there was one.
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    pub source: StepSource,
}

impl StepExecutionResult {
    fn new(task_id: &str, step_id: &str, status: StepOutcome, source: StepSource) -> Self {
        Self {
            task_id: task_id.to_string(),
            step_id: step_id.to_string(),
            status,
            output: None,
            error: None,
            retry_step_data: None,
            error_kind: None,
            source,
        }
    }
}

/// Schedules newly ready dependents after a step completes.
#[async_trait]
pub trait ReadyStepScheduler: Send + Sync {
    /// Dispatch every step that is ready now; returns how many were dispatched.
    async fn schedule_ready_nodes(&self, task_id: &str) -> Result<usize>;
}

enum Dispatch {
    Finished(ExecutionResult),
    Cancelled,
}

pub struct StepExecutionUseCase {
    ctx: EngineContext,
    scheduler: Option<Weak<dyn ReadyStepScheduler>>,
}

impl StepExecutionUseCase {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            scheduler: None,
        }
    }

    /// Attach the scheduler asked to dispatch dependents after a success.
    pub fn with_scheduler(mut self, scheduler: Weak<dyn ReadyStepScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Run one step of `task_id` end to end.
    ///
    /// # Errors
    /// `TaskNotFound` for an unknown task, and any durable store failure.
    /// Collaborator failures (event bus, inbox) are logged only.
    pub async fn execute(
        &self,
        task_id: &str,
        request: &StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepExecutionResult> {
        let task = self.ctx.load_task(task_id).await?;
        let tree_id = task.tree_id().to_string();

        let (mut step, source) = StepSource::resolve(&self.ctx, &tree_id, request).await;
        if let Some(inputs) = &request.inputs {
            step.inputs = inputs.clone();
        }
        if let Some(retry_count) = request.retry_count {
            step.retry_count = retry_count;
        }
        if let Some(max_retries) = request.max_retries {
            step.max_retries = max_retries;
        }
        let resuming_checkpoint = step.status == StepStatus::Checkpoint;

        if cancel.is_cancelled() || is_closed(task.status) {
            return self.discard(&task, &tree_id, &step, source).await;
        }

        if step.checkpoint_required
            && !self.ctx.checkpoints.is_already_approved(task_id, &step).await?
        {
            return self.hold_for_approval(&task, &tree_id, &step, source).await;
        }

        let task = self.enter_executing(task, resuming_checkpoint).await?;
        if is_closed(task.status) {
            return self.discard(&task, &tree_id, &step, source).await;
        }

        self.record_started(task_id, &tree_id, &step).await?;

        let mut dispatched = self.dispatch(&step, &cancel).await;
        if let Dispatch::Finished(result) = &dispatched {
            if let Some(fallback) = self.fallback_for(&step, result) {
                tlog!(
                    "Step {}/{} failed permanently, retrying once with fallback agent {}",
                    task_id,
                    step.id,
                    fallback.agent_type
                );
                dispatched = self.dispatch(&fallback, &cancel).await;
            }
        }

        let result = match dispatched {
            Dispatch::Finished(result) => result,
            Dispatch::Cancelled => return self.discard(&task, &tree_id, &step, source).await,
        };

        // A late result must not revive a cancelled task.
        let current = self.ctx.load_task(task_id).await?;
        if cancel.is_cancelled() || is_closed(current.status) {
            tlog_debug!(
                "Discarding result of {}/{}: task is {}",
                task_id,
                step.id,
                current.status
            );
            return self.discard(&current, &tree_id, &step, source).await;
        }

        if result.success {
            self.on_success(&current, &tree_id, &step, source, result).await
        } else {
            self.on_failure(&current, &tree_id, &step, source, request, result)
                .await
        }
    }

    async fn hold_for_approval(
        &self,
        task: &Task,
        tree_id: &str,
        step: &TaskStep,
        source: StepSource,
    ) -> Result<StepExecutionResult> {
        let task_id = task.id.as_str();
        self.ctx.adapter.pause_step(tree_id, &step.id).await?;
        self.ctx
            .record_step(task_id, &step.id, &StepUpdate::status(StepStatus::Checkpoint))
            .await?;

        let checkpoint_id = self.ctx.checkpoints.create_checkpoint(task_id, step).await?;

        if let Err(e) = self
            .ctx
            .state_machine
            .try_transition(task_id, TaskStatus::Checkpoint)
            .await
        {
            tlog_warn!("Could not move task {} to checkpoint: {}", task_id, e);
        }

        self.ctx
            .publish(TaskEvent::CheckpointCreated {
                task_id: task_id.to_string(),
                step_id: step.id.clone(),
                checkpoint_id: checkpoint_id.clone(),
                message: step.checkpoint_config.as_ref().and_then(|c| c.message.clone()),
            })
            .await;
        if let Err(e) = self
            .ctx
            .inbox
            .add_checkpoint_message(task_id, step, &checkpoint_id)
            .await
        {
            tlog_warn!("Inbox checkpoint message for {}/{} failed: {}", task_id, step.id, e);
        }

        tlog!("Step {}/{} awaiting approval ({})", task_id, step.id, checkpoint_id);
        Ok(StepExecutionResult::new(
            task_id,
            &step.id,
            StepOutcome::Checkpoint,
            source,
        ))
    }

    /// READY -> EXECUTING, and CHECKPOINT/PAUSED -> EXECUTING when resuming
    /// an approved checkpoint.
    async fn enter_executing(&self, task: Task, resuming_checkpoint: bool) -> Result<Task> {
        let enter = match task.status {
            TaskStatus::Ready => true,
            TaskStatus::Checkpoint | TaskStatus::Paused => resuming_checkpoint,
            _ => false,
        };
        if !enter {
            return Ok(task);
        }
        match self
            .ctx
            .state_machine
            .try_transition(&task.id, TaskStatus::Executing)
            .await?
        {
            Some(updated) => Ok(updated),
            None => self.ctx.load_task(&task.id).await,
        }
    }

    async fn record_started(&self, task_id: &str, tree_id: &str, step: &TaskStep) -> Result<()> {
        if !self.ctx.adapter.start_step(tree_id, &step.id).await? {
            tlog_debug!("Start of {}/{}: no tree node", tree_id, step.id);
        }
        self.ctx
            .record_step(
                task_id,
                &step.id,
                &StepUpdate::status(StepStatus::Running)
                    .with_retry_count(step.retry_count)
                    .started_now(),
            )
            .await?;
        tlog_debug!(
            "Dispatching {}/{} to {} (attempt {})",
            task_id,
            step.id,
            step.agent_type,
            step.retry_count + 1
        );
        self.ctx
            .publish(TaskEvent::StepStarted {
                task_id: task_id.to_string(),
                step_id: step.id.clone(),
                agent_type: step.agent_type.clone(),
            })
            .await;
        Ok(())
    }

    /// Await the executor, giving up on cancellation or timeout.
    async fn dispatch(&self, step: &TaskStep, cancel: &CancellationToken) -> Dispatch {
        let started = Instant::now();
        let timeout = self.ctx.config.step_timeout();
        let run = AssertUnwindSafe(self.ctx.executor.execute(step, cancel.clone())).catch_unwind();

        let bounded = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(result) => result,
                    Err(_) => Ok(ExecutionResult::failure(
                        StepError::transient(format!(
                            "step timed out after {}s",
                            limit.as_secs()
                        )),
                        started.elapsed().as_millis() as u64,
                    )),
                },
                None => run.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Dispatch::Cancelled,
            outcome = bounded => match outcome {
                Ok(result) => Dispatch::Finished(result),
                Err(_) => {
                    tlog_error!("Executor panicked running step {}", step.id);
                    Dispatch::Finished(ExecutionResult::failure(
                        StepError::permanent("executor panicked"),
                        started.elapsed().as_millis() as u64,
                    ))
                }
            },
        }
    }

    /// The step to re-dispatch with its fallback agent, if this failure
    /// calls for one.
    fn fallback_for(&self, step: &TaskStep, result: &ExecutionResult) -> Option<TaskStep> {
        if result.success {
            return None;
        }
        let kind = result
            .error
            .as_ref()
            .map(|e| e.classify(&self.ctx.config.extra_transient_patterns))
            .unwrap_or(ErrorKind::Permanent);
        if kind != ErrorKind::Permanent {
            return None;
        }
        let agent = step.fallback_config.as_ref()?.fallback_agent_type.as_ref()?;
        if agent == &step.agent_type {
            return None;
        }
        let mut fallback = step.clone();
        fallback.agent_type = agent.clone();
        Some(fallback)
    }

    async fn on_success(
        &self,
        task: &Task,
        tree_id: &str,
        step: &TaskStep,
        source: StepSource,
        result: ExecutionResult,
    ) -> Result<StepExecutionResult> {
        let task_id = task.id.as_str();
        let output = result.output.unwrap_or_default();

        if !self
            .ctx
            .adapter
            .complete_step(tree_id, &step.id, output.clone())
            .await?
        {
            tlog_debug!("Completion of {}/{}: no tree node", tree_id, step.id);
        }
        self.ctx
            .record_step(
                task_id,
                &step.id,
                &StepUpdate::status(StepStatus::Done)
                    .with_outputs(output.clone())
                    .completed_now(),
            )
            .await?;

        tlog_debug!(
            "Step {}/{} completed in {}ms",
            task_id,
            step.id,
            result.execution_time_ms
        );
        self.ctx
            .publish(TaskEvent::StepCompleted {
                task_id: task_id.to_string(),
                step_id: step.id.clone(),
                output: output.clone(),
                execution_time_ms: result.execution_time_ms,
            })
            .await;
        if let Err(e) = self
            .ctx
            .inbox
            .add_step_message(task_id, step, &format!("Step '{}' completed", step.name))
            .await
        {
            tlog_warn!("Inbox step message for {}/{} failed: {}", task_id, step.id, e);
        }

        self.schedule_dependents(task_id).await;
        self.check_finalization(task_id, tree_id).await?;

        let mut outcome = StepExecutionResult::new(task_id, &step.id, StepOutcome::Success, source);
        outcome.output = Some(output);
        Ok(outcome)
    }

    async fn on_failure(
        &self,
        task: &Task,
        tree_id: &str,
        step: &TaskStep,
        source: StepSource,
        request: &StepRequest,
        result: ExecutionResult,
    ) -> Result<StepExecutionResult> {
        let task_id = task.id.as_str();
        let error = result
            .error
            .unwrap_or_else(|| StepError::new("step failed without an error message"));
        let kind = error.classify(&self.ctx.config.extra_transient_patterns);

        if kind == ErrorKind::Transient && step.retry_count < step.max_retries {
            let next = step.retry_count + 1;
            self.ctx.adapter.reset_step(tree_id, &step.id).await?;
            self.ctx.adapter.set_retry_count(tree_id, &step.id, next).await?;
            self.ctx
                .record_step(
                    task_id,
                    &step.id,
                    &StepUpdate::status(StepStatus::Pending)
                        .with_retry_count(next)
                        .with_error(&error.message),
                )
                .await?;
            tlog!(
                "Step {}/{} failed transiently ({}), retry {}/{}",
                task_id,
                step.id,
                error.message,
                next,
                step.max_retries
            );

            let mut outcome =
                StepExecutionResult::new(task_id, &step.id, StepOutcome::Retrying, source);
            outcome.error = Some(error.message);
            outcome.error_kind = Some(kind);
            outcome.retry_step_data = Some(request.clone().with_retry_count(next));
            return Ok(outcome);
        }

        if !self
            .ctx
            .adapter
            .fail_step(tree_id, &step.id, &error.message)
            .await?
        {
            tlog_debug!("Failure of {}/{}: no tree node", tree_id, step.id);
        }
        self.ctx
            .record_step(
                task_id,
                &step.id,
                &StepUpdate::status(StepStatus::Failed)
                    .with_error(&error.message)
                    .completed_now(),
            )
            .await?;

        tlog!(
            "Step {}/{} failed ({:?}): {}",
            task_id,
            step.id,
            kind,
            error.message
        );
        self.ctx
            .publish(TaskEvent::StepFailed {
                task_id: task_id.to_string(),
                step_id: step.id.clone(),
                error: error.message.clone(),
                retry_count: step.retry_count,
            })
            .await;
        if let Err(e) = self
            .ctx
            .inbox
            .add_step_message(
                task_id,
                step,
                &format!("Step '{}' failed: {}", step.name, error.message),
            )
            .await
        {
            tlog_warn!("Inbox step message for {}/{} failed: {}", task_id, step.id, e);
        }

        self.check_finalization(task_id, tree_id).await?;

        let mut outcome = StepExecutionResult::new(task_id, &step.id, StepOutcome::Error, source);
        outcome.error = Some(error.message);
        outcome.error_kind = Some(kind);
        Ok(outcome)
    }

    /// Mark the step skipped and report the invocation as cancelled.
    async fn discard(
        &self,
        task: &Task,
        tree_id: &str,
        step: &TaskStep,
        source: StepSource,
    ) -> Result<StepExecutionResult> {
        self.ctx.record_skipped(&task.id, tree_id, &step.id).await?;
        tlog_debug!("Step {}/{} cancelled", task.id, step.id);
        Ok(StepExecutionResult::new(
            &task.id,
            &step.id,
            StepOutcome::Cancelled,
            source,
        ))
    }

    async fn schedule_dependents(&self, task_id: &str) {
        let Some(scheduler) = self.scheduler.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        match scheduler.schedule_ready_nodes(task_id).await {
            Ok(n) if n > 0 => tlog_debug!("Scheduled {} dependents of task {}", n, task_id),
            Ok(_) => {}
            Err(e) => tlog_warn!("Scheduling dependents of task {} failed: {}", task_id, e),
        }
    }

    /// Roll a finished tree up into the task status.
    pub async fn check_finalization(&self, task_id: &str, tree_id: &str) -> Result<()> {
        let (done, outcome) = self.ctx.adapter.is_task_complete(tree_id).await?;
        let (true, Some(outcome)) = (done, outcome) else {
            return Ok(());
        };

        let Some(_task) = self.ctx.state_machine.finalize(task_id, outcome).await? else {
            return Ok(());
        };

        self.ctx
            .publish(TaskEvent::TaskCompleted {
                task_id: task_id.to_string(),
                status: outcome,
            })
            .await;

        let summary = match self.ctx.adapter.get_task_progress(tree_id).await {
            Ok(p) => format!(
                "Task {}: {}/{} steps completed",
                outcome, p.completed_steps, p.total_steps
            ),
            Err(_) => format!("Task {}", outcome),
        };
        if let Err(e) = self
            .ctx
            .inbox
            .add_completion_message(task_id, outcome, &summary)
            .await
        {
            tlog_warn!("Inbox completion message for {} failed: {}", task_id, e);
        }
        tlog!("{}", summary);
        Ok(())
    }
}

/// Statuses under which no step may run or record a result.
fn is_closed(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Cancelled | TaskStatus::Superseded | TaskStatus::Completed
    )
}
