//! Scheduler for concurrent step execution.
//!
//! The Scheduler turns readiness into dispatch: every call to
//! `schedule_ready_nodes` re-reads the ready steps of a task and spawns one
//! use case invocation per step that is not already in flight. It owns the
//! per-task runtime state the tree cannot express: the dispatched set that
//! guarantees a single active invocation per step, the concurrency bound,
//! the cancellation tokens and the in-flight counter behind `wait_idle`.
//!
//! Group policies:
//! - BEST_EFFORT: a member's failure leaves siblings alone, and members of a
//!   group that already started keep being dispatched after the task FAILED.
//! - FAIL_FAST: a member's permanent failure cancels in-flight siblings and
//!   skips pending ones.
//! - ALL_OR_NOTHING: members start only once every pending member is ready;
//!   a failure behaves like FAIL_FAST.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::node::Payload;
use crate::core::task::{ParallelPolicy, StepStatus, StepUpdate, Task, TaskStatus, TaskStep};
use crate::error::{Error, Result};
use crate::orchestration::context::EngineContext;
use crate::orchestration::inputs::{has_placeholders, resolve_inputs};
use crate::orchestration::step::{
    ReadyStepScheduler, StepExecutionUseCase, StepOutcome, StepRequest,
};
use crate::{tlog, tlog_debug, tlog_error, tlog_warn};

#[derive(Default)]
struct RuntimeState {
    /// Steps with a live invocation, including ones waiting out a retry
    /// backoff. An id leaves only when its invocation stops retrying.
    dispatched: HashMap<String, CancellationToken>,
    /// Parallel groups with at least one dispatched member.
    groups_started: HashSet<String>,
}

/// In-memory execution state of one task.
struct TaskRuntime {
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    state: Mutex<RuntimeState>,
    in_flight: watch::Sender<usize>,
}

impl TaskRuntime {
    fn new(max_concurrent: usize) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            cancel: CancellationToken::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            state: Mutex::new(RuntimeState::default()),
            in_flight,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, RuntimeState>> {
        self.state.lock().map_err(|e| Error::Store(e.to_string()))
    }
}

/// Releases a step's dispatch slot when its invocation ends.
struct DispatchGuard {
    runtime: Arc<TaskRuntime>,
    step_id: String,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.runtime.state.lock() {
            state.dispatched.remove(&self.step_id);
        }
        self.runtime
            .in_flight
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Which gate a dispatch passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    /// Normal readiness dispatch under an EXECUTING task.
    Executing,
    /// The task FAILED; only started BEST_EFFORT groups may continue.
    BestEffortOnly,
    /// Re-dispatch of an approved checkpoint.
    Resume,
}

/// What a spawned invocation needs to know about its step.
struct Dispatched {
    task_id: String,
    step_id: String,
    group: Option<String>,
    policy: ParallelPolicy,
    retry_base_ms: Option<u64>,
    request: StepRequest,
    token: CancellationToken,
}

pub struct Scheduler {
    ctx: EngineContext,
    use_case: StepExecutionUseCase,
    runtimes: Mutex<HashMap<String, Arc<TaskRuntime>>>,
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler wired into its own step use case.
    pub fn new(ctx: EngineContext) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let as_scheduler: Weak<dyn ReadyStepScheduler> = weak.clone();
            Self {
                use_case: StepExecutionUseCase::new(ctx.clone()).with_scheduler(as_scheduler),
                ctx,
                runtimes: Mutex::new(HashMap::new()),
                self_ref: weak.clone(),
            }
        })
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn use_case(&self) -> &StepExecutionUseCase {
        &self.use_case
    }

    /// Persist a planned task, build its tree and move it to READY.
    pub async fn submit_task(&self, task: Task) -> Result<Task> {
        self.ctx.submit_task(task).await
    }

    /// READY -> EXECUTING, then dispatch the first wave.
    pub async fn start_task(&self, task_id: &str) -> Result<usize> {
        let task = self
            .ctx
            .state_machine
            .transition(task_id, TaskStatus::Executing)
            .await?;
        tlog!("Starting task {} ({} steps)", task_id, task.steps.len());
        let dispatched = self.schedule_ready_nodes(task_id).await?;
        self.use_case
            .check_finalization(task_id, task.tree_id())
            .await?;
        Ok(dispatched)
    }

    /// Dispatch every ready step of the task that is not already in flight.
    ///
    /// Nothing is dispatched unless the task is EXECUTING, except members of
    /// started BEST_EFFORT groups once the task FAILED.
    pub async fn schedule_ready_nodes(&self, task_id: &str) -> Result<usize> {
        let task = self.ctx.load_task(task_id).await?;
        let mode = match task.status {
            TaskStatus::Executing => DispatchMode::Executing,
            TaskStatus::Failed => DispatchMode::BestEffortOnly,
            other => {
                tlog_debug!("Not scheduling task {}: status {}", task_id, other);
                return Ok(0);
            }
        };

        let tree_id = task.tree_id().to_string();
        let ready = self.ctx.adapter.get_ready_steps(&tree_id).await?;
        if ready.is_empty() {
            return Ok(0);
        }
        let all_steps = self.ctx.adapter.get_all_steps(&tree_id).await?;
        let outputs = completed_outputs(&all_steps);
        let ready_ids: HashSet<&str> = ready.iter().map(|s| s.id.as_str()).collect();

        let runtime = self.runtime(task_id)?;
        let mut batch = Vec::new();
        {
            let mut state = runtime.state()?;
            for step in &ready {
                if state.dispatched.contains_key(&step.id) {
                    continue;
                }
                let policy = self.policy_for(&task, step);
                if !self.may_dispatch(&state, mode, step, policy, &all_steps, &ready_ids) {
                    continue;
                }

                let token = runtime.cancel.child_token();
                state.dispatched.insert(step.id.clone(), token.clone());
                if let Some(group) = &step.parallel_group {
                    state.groups_started.insert(group.clone());
                }
                batch.push(self.prepare(task_id, step, policy, &outputs, token));
            }
        }

        let count = batch.len();
        for dispatched in batch {
            self.spawn(Arc::clone(&runtime), dispatched, mode);
        }
        if count > 0 {
            tlog_debug!("Dispatched {} steps of task {}", count, task_id);
        }
        Ok(count)
    }

    /// Re-dispatch a step parked at a checkpoint. The use case re-checks
    /// approval, so an unapproved step simply parks again.
    ///
    /// Returns false if the step is not waiting at a checkpoint or is
    /// already in flight.
    pub async fn resume_checkpoint(&self, task_id: &str, step_id: &str) -> Result<bool> {
        let task = self.ctx.load_task(task_id).await?;
        if !matches!(task.status, TaskStatus::Checkpoint | TaskStatus::Executing) {
            return Err(Error::InvalidTransition {
                task_id: task_id.to_string(),
                current: task.status,
                target: TaskStatus::Executing,
            });
        }

        let tree_id = task.tree_id().to_string();
        let Some(step) = self.ctx.adapter.get_step_from_tree(&tree_id, step_id).await? else {
            return Ok(false);
        };
        if step.status != StepStatus::Checkpoint {
            return Ok(false);
        }
        let outputs = completed_outputs(&self.ctx.adapter.get_all_steps(&tree_id).await?);

        let runtime = self.runtime(task_id)?;
        let dispatched = {
            let mut state = runtime.state()?;
            if state.dispatched.contains_key(step_id) {
                return Ok(false);
            }
            let token = runtime.cancel.child_token();
            state.dispatched.insert(step_id.to_string(), token.clone());
            let policy = self.policy_for(&task, &step);
            self.prepare(task_id, &step, policy, &outputs, token)
        };

        tlog!("Resuming checkpoint {}/{}", task_id, step_id);
        self.spawn(runtime, dispatched, DispatchMode::Resume);
        Ok(true)
    }

    /// EXECUTING -> PAUSED. In-flight steps finish; nothing new starts.
    pub async fn pause_task(&self, task_id: &str) -> Result<Task> {
        self.ctx
            .state_machine
            .transition(task_id, TaskStatus::Paused)
            .await
    }

    /// PAUSED -> EXECUTING and dispatch whatever became ready meanwhile.
    pub async fn resume_task(&self, task_id: &str) -> Result<usize> {
        let current = self.ctx.load_task(task_id).await?;
        if current.status != TaskStatus::Paused {
            return Err(Error::InvalidTransition {
                task_id: task_id.to_string(),
                current: current.status,
                target: TaskStatus::Executing,
            });
        }
        let task = self
            .ctx
            .state_machine
            .transition(task_id, TaskStatus::Executing)
            .await?;
        let dispatched = self.schedule_ready_nodes(task_id).await?;
        self.use_case
            .check_finalization(task_id, task.tree_id())
            .await?;
        Ok(dispatched)
    }

    /// Pick a task back up after a restart.
    ///
    /// Steps left RUNNING by a process that stopped mid-step are reset to
    /// PENDING with their retry count intact, in the tree and the task
    /// record, and dispatched again if the task is EXECUTING. Steps still in
    /// flight in this process are left alone. Returns how many steps were
    /// dispatched.
    pub async fn recover_task(&self, task_id: &str) -> Result<usize> {
        let task = self.ctx.load_task(task_id).await?;
        if matches!(
            task.status,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Superseded
        ) {
            tlog_debug!("Nothing to recover for task {}: {}", task_id, task.status);
            return Ok(0);
        }

        let mut live: HashSet<String> = HashSet::new();
        if let Some(runtime) = self.existing_runtime(task_id)? {
            let state = runtime.state()?;
            live.extend(state.dispatched.keys().cloned());
        }
        let tree_id = task.tree_id().to_string();
        let mut reset: HashSet<String> = self
            .ctx
            .adapter
            .reset_running_steps(&tree_id, &live)
            .await?
            .into_iter()
            .collect();
        reset.extend(
            task.steps
                .iter()
                .filter(|s| s.status == StepStatus::Running && !live.contains(&s.id))
                .map(|s| s.id.clone()),
        );
        for step_id in &reset {
            self.ctx
                .record_step(task_id, step_id, &StepUpdate::status(StepStatus::Pending))
                .await?;
        }
        if !reset.is_empty() {
            tlog!(
                "Recovered task {}: {} interrupted steps back to pending",
                task_id,
                reset.len()
            );
        }

        let dispatched = self.schedule_ready_nodes(task_id).await?;
        self.use_case.check_finalization(task_id, &tree_id).await?;
        Ok(dispatched)
    }

    /// Move the task to CANCELLED and signal every in-flight step.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task> {
        let task = self
            .ctx
            .state_machine
            .transition(task_id, TaskStatus::Cancelled)
            .await?;
        if let Some(runtime) = self.existing_runtime(task_id)? {
            runtime.cancel.cancel();
        }
        tlog!("Cancelled task {}", task_id);
        Ok(task)
    }

    /// FAILED/CANCELLED -> READY with failed and skipped steps reset to
    /// PENDING and a fresh retry budget. Call `start_task` to run it again.
    pub async fn retry_task(&self, task_id: &str) -> Result<Task> {
        let current = self.ctx.load_task(task_id).await?;
        if !matches!(current.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(Error::InvalidTransition {
                task_id: task_id.to_string(),
                current: current.status,
                target: TaskStatus::Ready,
            });
        }

        // Invocations of the previous run, including ones waiting out a
        // backoff, end before the task leaves FAILED or CANCELLED.
        let previous = self.runtimes_lock()?.remove(task_id);
        if let Some(runtime) = previous {
            runtime.cancel.cancel();
            let mut rx = runtime.in_flight.subscribe();
            let _ = rx.wait_for(|n| *n == 0).await;
        }

        let task = self
            .ctx
            .state_machine
            .transition(task_id, TaskStatus::Ready)
            .await?;
        let tree_id = task.tree_id().to_string();
        let reset = self.ctx.adapter.reset_failed_steps(&tree_id).await?;
        for step_id in &reset {
            self.ctx
                .repository()
                .update_step(
                    task_id,
                    step_id,
                    &StepUpdate::status(StepStatus::Pending).with_retry_count(0),
                )
                .await?;
        }

        tlog!("Task {} reset for retry ({} steps)", task_id, reset.len());
        self.ctx.load_task(task_id).await
    }

    /// Resolves once no step of the task is in flight.
    pub async fn wait_idle(&self, task_id: &str) {
        let Ok(Some(runtime)) = self.existing_runtime(task_id) else {
            return;
        };
        let mut rx = runtime.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Number of steps of the task currently in flight.
    pub fn in_flight(&self, task_id: &str) -> usize {
        let Ok(Some(runtime)) = self.existing_runtime(task_id) else {
            return 0;
        };
        let count = *runtime.in_flight.borrow();
        count
    }

    pub fn is_dispatched(&self, task_id: &str, step_id: &str) -> bool {
        let Ok(Some(runtime)) = self.existing_runtime(task_id) else {
            return false;
        };
        let dispatched = runtime
            .state()
            .map(|s| s.dispatched.contains_key(step_id))
            .unwrap_or(false);
        dispatched
    }

    fn runtimes_lock(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<TaskRuntime>>>> {
        self.runtimes.lock().map_err(|e| Error::Store(e.to_string()))
    }

    fn runtime(&self, task_id: &str) -> Result<Arc<TaskRuntime>> {
        let max = self.ctx.config.max_concurrent_steps;
        Ok(Arc::clone(
            self.runtimes_lock()?
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(TaskRuntime::new(max))),
        ))
    }

    fn existing_runtime(&self, task_id: &str) -> Result<Option<Arc<TaskRuntime>>> {
        Ok(self.runtimes_lock()?.get(task_id).cloned())
    }

    fn policy_for(&self, task: &Task, step: &TaskStep) -> ParallelPolicy {
        step.parallel_group
            .as_deref()
            .and_then(|g| task.policy_for(g))
            .unwrap_or(self.ctx.config.default_group_policy)
    }

    fn may_dispatch(
        &self,
        state: &RuntimeState,
        mode: DispatchMode,
        step: &TaskStep,
        policy: ParallelPolicy,
        all_steps: &[TaskStep],
        ready_ids: &HashSet<&str>,
    ) -> bool {
        let group = step.parallel_group.as_deref();

        if mode == DispatchMode::BestEffortOnly {
            return match group {
                Some(g) => policy == ParallelPolicy::BestEffort && state.groups_started.contains(g),
                None => false,
            };
        }

        match (group, policy) {
            (Some(g), ParallelPolicy::AllOrNothing) if !state.groups_started.contains(g) => {
                all_steps
                    .iter()
                    .filter(|s| s.parallel_group.as_deref() == Some(g))
                    .filter(|s| s.status == StepStatus::Pending)
                    .all(|s| ready_ids.contains(s.id.as_str()))
            }
            _ => true,
        }
    }

    fn prepare(
        &self,
        task_id: &str,
        step: &TaskStep,
        policy: ParallelPolicy,
        outputs: &HashMap<String, Payload>,
        token: CancellationToken,
    ) -> Dispatched {
        let inputs = resolve_inputs(&step.inputs, outputs);
        if has_placeholders(&inputs) {
            tlog_debug!(
                "Step {}/{} dispatched with unresolved placeholders",
                task_id,
                step.id
            );
        }
        Dispatched {
            task_id: task_id.to_string(),
            step_id: step.id.clone(),
            group: step.parallel_group.clone(),
            policy,
            retry_base_ms: step.fallback_config.as_ref().and_then(|f| f.retry_delay_ms),
            request: StepRequest::from_step(step).with_inputs(inputs),
            token,
        }
    }

    fn spawn(&self, runtime: Arc<TaskRuntime>, dispatched: Dispatched, mode: DispatchMode) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        runtime.in_flight.send_modify(|n| *n += 1);
        let guard = DispatchGuard {
            runtime: Arc::clone(&runtime),
            step_id: dispatched.step_id.clone(),
        };
        tokio::spawn(async move {
            let _guard = guard;
            this.run_step(&runtime, dispatched, mode).await;
        });
    }

    /// Drive one step through its retries. A concurrency permit is held for
    /// each attempt and released while waiting out a backoff.
    async fn run_step(&self, runtime: &TaskRuntime, dispatched: Dispatched, mode: DispatchMode) {
        let Dispatched {
            task_id,
            step_id,
            group,
            policy,
            retry_base_ms,
            mut request,
            token,
        } = dispatched;

        let mut first_attempt = true;
        loop {
            let Ok(permit) = runtime.semaphore.acquire().await else {
                return;
            };
            // A cancelled token still goes through the use case so the step
            // is recorded as skipped. An approved checkpoint starts regardless.
            let gated = !(first_attempt && mode == DispatchMode::Resume);
            if gated
                && !token.is_cancelled()
                && !self
                    .still_eligible(&task_id, group.as_deref(), policy)
                    .await
            {
                tlog_debug!(
                    "Step {}/{} no longer eligible, leaving it pending",
                    task_id,
                    step_id
                );
                return;
            }
            first_attempt = false;

            let executed = self
                .use_case
                .execute(&task_id, &request, token.clone())
                .await;
            drop(permit);
            let result = match executed {
                Ok(result) => result,
                Err(e) => {
                    tlog_error!("Step {}/{} aborted: {}", task_id, step_id, e);
                    return;
                }
            };

            match result.status {
                StepOutcome::Retrying => {
                    let Some(next) = result.retry_step_data else {
                        return;
                    };
                    let attempt = next.retry_count.unwrap_or(1);
                    let delay = self.ctx.config.retry_delay(attempt, retry_base_ms);
                    tlog_debug!(
                        "Step {}/{} retry {} in {:?}",
                        task_id,
                        step_id,
                        attempt,
                        delay
                    );
                    tokio::select! {
                        _ = token.cancelled() => {
                            self.skip_after_cancel(&task_id, &step_id).await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    request = next;
                }
                StepOutcome::Error => {
                    if let Some(group) = &group {
                        if policy.cancels_siblings() {
                            self.stop_siblings(&task_id, group, &step_id).await;
                        }
                    }
                    return;
                }
                StepOutcome::Success | StepOutcome::Checkpoint | StepOutcome::Cancelled => return,
            }
        }
    }

    /// Whether a step may still start given the task's current status.
    async fn still_eligible(&self, task_id: &str, group: Option<&str>, policy: ParallelPolicy) -> bool {
        let task = match self.ctx.load_task(task_id).await {
            Ok(task) => task,
            Err(e) => {
                tlog_warn!("Eligibility check of task {} failed: {}", task_id, e);
                return false;
            }
        };
        match task.status {
            TaskStatus::Executing => true,
            TaskStatus::Failed => {
                let started = match (group, self.existing_runtime(task_id)) {
                    (Some(g), Ok(Some(runtime))) => runtime
                        .state()
                        .map(|s| s.groups_started.contains(g))
                        .unwrap_or(false),
                    _ => false,
                };
                started && policy == ParallelPolicy::BestEffort
            }
            _ => false,
        }
    }

    async fn skip_after_cancel(&self, task_id: &str, step_id: &str) {
        let tree_id = match self.ctx.load_task(task_id).await {
            Ok(task) => task.tree_id().to_string(),
            Err(_) => task_id.to_string(),
        };
        if let Err(e) = self.ctx.record_skipped(task_id, &tree_id, step_id).await {
            tlog_warn!("Could not mark {}/{} skipped: {}", task_id, step_id, e);
        }
    }

    /// Cancel in-flight members of `group` and skip its pending ones.
    async fn stop_siblings(&self, task_id: &str, group: &str, failed_step: &str) {
        let task = match self.ctx.load_task(task_id).await {
            Ok(task) => task,
            Err(e) => {
                tlog_warn!("Could not stop siblings of {}/{}: {}", task_id, failed_step, e);
                return;
            }
        };
        let tree_id = task.tree_id().to_string();
        let members: Vec<String> = task
            .group_members(group)
            .into_iter()
            .filter(|id| id != failed_step)
            .collect();

        if let Ok(Some(runtime)) = self.existing_runtime(task_id) {
            if let Ok(state) = runtime.state() {
                for id in &members {
                    if let Some(token) = state.dispatched.get(id) {
                        token.cancel();
                    }
                }
            }
        }

        // Tokens are cancelled first, so a member that has not reached its
        // executor yet cannot overwrite the skip below.
        for id in members {
            let pending = matches!(
                self.ctx.adapter.get_step_from_tree(&tree_id, &id).await,
                Ok(Some(step)) if step.status == StepStatus::Pending
            );
            if !pending {
                continue;
            }
            if let Err(e) = self.ctx.record_skipped(task_id, &tree_id, &id).await {
                tlog_warn!("Could not skip sibling {}/{}: {}", task_id, id, e);
            }
        }
        tlog!(
            "Group {} of task {} stopped after {} failed",
            group,
            task_id,
            failed_step
        );
    }
}

#[async_trait]
impl ReadyStepScheduler for Scheduler {
    async fn schedule_ready_nodes(&self, task_id: &str) -> Result<usize> {
        Scheduler::schedule_ready_nodes(self, task_id).await
    }
}

/// Outputs of every DONE step, for input templating.
fn completed_outputs(steps: &[TaskStep]) -> HashMap<String, Payload> {
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Done)
        .filter_map(|s| s.outputs.clone().map(|o| (s.id.clone(), o)))
        .collect()
}
