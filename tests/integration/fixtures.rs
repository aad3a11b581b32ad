//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted step executor with call and concurrency tracking
//! - A harness wiring the scheduler to in-memory or file-backed stores
//! - Polling helpers for asynchronous task progress

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tasktree::config::Config;
use tasktree::core::{
    ExecutionTreeStore, LocalTreeStore, ParallelPolicy, Payload, StepStatus, Task, TaskStatus,
    TaskStep,
};
use tasktree::orchestration::{
    ChannelEventBus, EngineContext, ExecutionResult, MemoryCheckpointService, MemoryInbox,
    Scheduler, StepError, StepExecutor, TaskEvent,
};
use tasktree::state::{FileTaskStore, MemoryTaskStore, TaskRepository};
use tasktree::workflow::{TaskStateMachine, TaskTreeAdapter};

/// What the fake executor does for one invocation.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Echo the inputs plus `{"step": <id>}` after the default delay.
    Succeed,
    /// Fail with the given error after the default delay.
    Fail(StepError),
    /// Block until cancelled.
    Hang,
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Executor replaying scripted behaviors per step id, succeeding once a
/// step's script is exhausted.
pub struct FakeExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Behavior>>>,
    calls: Mutex<Vec<(String, String)>>,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(10))
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Queue a behavior for the next invocation of `step_id`.
    pub fn script(&self, step_id: &str, behavior: Behavior) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(step_id.to_string())
            .or_default()
            .push_back(behavior);
        self
    }

    /// `(step_id, agent_type)` of every invocation, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, step_id: &str) -> usize {
        self.calls().iter().filter(|(id, _)| id == step_id).count()
    }

    /// Highest number of concurrent invocations observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for FakeExecutor {
    async fn execute(&self, step: &TaskStep, cancel: CancellationToken) -> ExecutionResult {
        self.calls
            .lock()
            .unwrap()
            .push((step.id.clone(), step.agent_type.clone()));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        let behavior = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&step.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Behavior::Succeed);

        match behavior {
            Behavior::Succeed => {
                tokio::time::sleep(self.delay).await;
                let mut output = step.inputs.clone();
                output.insert("step".to_string(), json!(step.id));
                ExecutionResult::success(output, self.delay.as_millis() as u64)
            }
            Behavior::Fail(error) => {
                tokio::time::sleep(self.delay).await;
                ExecutionResult::failure(error, self.delay.as_millis() as u64)
            }
            Behavior::Hang => {
                cancel.cancelled().await;
                ExecutionResult::failure(StepError::permanent("cancelled"), 0)
            }
        }
    }
}

/// A scheduler plus handles on every collaborator.
pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<FakeExecutor>,
    pub checkpoints: Arc<MemoryCheckpointService>,
    pub inbox: Arc<MemoryInbox>,
    events: mpsc::Receiver<TaskEvent>,
}

impl Harness {
    pub fn new(executor: FakeExecutor) -> Self {
        Self::with_config(executor, test_config())
    }

    pub fn with_config(executor: FakeExecutor, config: Config) -> Self {
        Self::with_stores(
            executor,
            config,
            Arc::new(LocalTreeStore::new()),
            TaskRepository::new(Arc::new(MemoryTaskStore::new())),
        )
    }

    /// Harness over file-backed stores rooted at `dir`.
    pub async fn on_disk(executor: FakeExecutor, dir: &Path) -> Self {
        let trees = LocalTreeStore::open(&dir.join("trees"))
            .await
            .expect("Failed to open tree store");
        let tasks = FileTaskStore::open(&dir.join("tasks"))
            .await
            .expect("Failed to open task store");
        Self::with_stores(
            executor,
            test_config(),
            Arc::new(trees),
            TaskRepository::new(Arc::new(tasks)).with_cache(Arc::new(MemoryTaskStore::new())),
        )
    }

    pub fn with_stores(
        executor: FakeExecutor,
        config: Config,
        trees: Arc<dyn ExecutionTreeStore>,
        repo: TaskRepository,
    ) -> Self {
        let executor = Arc::new(executor);
        let checkpoints = Arc::new(MemoryCheckpointService::new());
        let inbox = Arc::new(MemoryInbox::new());
        let (bus, events) = ChannelEventBus::new(1024);
        let scheduler = Scheduler::new(EngineContext {
            adapter: TaskTreeAdapter::new(trees),
            state_machine: Arc::new(TaskStateMachine::new(repo)),
            executor: executor.clone(),
            events: Arc::new(bus),
            inbox: inbox.clone(),
            checkpoints: checkpoints.clone(),
            config: Arc::new(config),
        });
        Self {
            scheduler,
            executor,
            checkpoints,
            inbox,
            events,
        }
    }

    pub async fn submit(&self, steps: Vec<TaskStep>) -> Task {
        self.submit_with_policies(steps, &[]).await
    }

    pub async fn submit_with_policies(
        &self,
        steps: Vec<TaskStep>,
        policies: &[(&str, ParallelPolicy)],
    ) -> Task {
        let mut task = Task::new("user-1", "integration goal");
        task.steps = steps;
        for (group, policy) in policies {
            task.parallel_policies.insert(group.to_string(), *policy);
        }
        self.scheduler
            .submit_task(task)
            .await
            .expect("Failed to submit task")
    }

    /// Start the task and wait until nothing is in flight.
    pub async fn run(&self, task_id: &str) {
        self.scheduler
            .start_task(task_id)
            .await
            .expect("Failed to start task");
        self.idle(task_id).await;
    }

    pub async fn idle(&self, task_id: &str) {
        tokio::time::timeout(Duration::from_secs(10), self.scheduler.wait_idle(task_id))
            .await
            .expect("Task did not go idle");
    }

    pub async fn task(&self, task_id: &str) -> Task {
        self.scheduler
            .context()
            .load_task(task_id)
            .await
            .expect("Failed to load task")
    }

    /// Status of a step as recorded in the execution tree.
    pub async fn tree_status(&self, task: &Task, step_id: &str) -> StepStatus {
        self.scheduler
            .context()
            .adapter
            .get_step_from_tree(task.tree_id(), step_id)
            .await
            .expect("Tree lookup failed")
            .expect("Step missing from tree")
            .status
    }

    /// Poll until `check` holds for the task.
    pub async fn wait_for(&self, task_id: &str, check: impl Fn(&Task) -> bool) -> Task {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let task = self.task(task_id).await;
                if check(&task) {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Condition not reached")
    }

    pub fn drain_events(&mut self) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn drain_event_names(&mut self) -> Vec<&'static str> {
        self.drain_events().iter().map(TaskEvent::name).collect()
    }
}

/// Defaults with short retry delays.
pub fn test_config() -> Config {
    Config {
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 50,
        ..Default::default()
    }
}

pub fn step(id: &str) -> TaskStep {
    TaskStep::new(id, &id.to_uppercase(), "worker")
}

pub fn inputs(value: serde_json::Value) -> Payload {
    value.as_object().cloned().expect("inputs must be an object")
}

pub fn is_terminal(task: &Task) -> bool {
    task.status.is_terminal()
}

pub fn has_status(status: TaskStatus) -> impl Fn(&Task) -> bool {
    move |task| task.status == status
}
