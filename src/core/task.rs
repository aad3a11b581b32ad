//! Task data model.
//!
//! A `Task` is the domain-level unit a user asks for: a goal plus a plan of
//! `TaskStep`s with dependencies. Steps carry the agent-specific
//! configuration (checkpoints, fallbacks, parallel groups) that the generic
//! execution tree does not know about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::node::Payload;

/// Default retry budget for a step when the plan does not specify one.
pub const DEFAULT_STEP_MAX_RETRIES: u32 = 3;

/// Task status in its lifecycle.
///
/// Only `TaskStateMachine` writes this field once a task is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created, planner still filling in steps.
    #[default]
    Planning,
    /// Plan complete, waiting to be started.
    Ready,
    /// Steps are being dispatched.
    Executing,
    /// A step is waiting for checkpoint approval.
    Checkpoint,
    /// Paused by a user; no new steps are dispatched.
    Paused,
    /// Every step finished successfully.
    Completed,
    /// At least one step failed permanently.
    Failed,
    /// Aborted by a user.
    Cancelled,
    /// Replaced by a newer task.
    Superseded,
}

impl TaskStatus {
    /// All statuses, in declaration order.
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Planning,
        TaskStatus::Ready,
        TaskStatus::Executing,
        TaskStatus::Checkpoint,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Superseded,
    ];

    /// Terminal statuses never move again except FAILED/CANCELLED -> READY.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Superseded
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Planning => "planning",
            TaskStatus::Ready => "ready",
            TaskStatus::Executing => "executing",
            TaskStatus::Checkpoint => "checkpoint",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Superseded => "superseded",
        };
        write!(f, "{}", s)
    }
}

/// Status of a single step as seen by the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    Checkpoint,
    Skipped,
}

impl StepStatus {
    pub const ALL: [StepStatus; 6] = [
        StepStatus::Pending,
        StepStatus::Running,
        StepStatus::Done,
        StepStatus::Failed,
        StepStatus::Checkpoint,
        StepStatus::Skipped,
    ];
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
            StepStatus::Checkpoint => "checkpoint",
            StepStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Configuration of a human approval gate in front of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CheckpointConfig {
    /// Message shown to the approver.
    #[serde(default)]
    pub message: Option<String>,
    /// Users allowed to approve. Empty means anyone with access to the task.
    #[serde(default)]
    pub approvers: Vec<String>,
    /// How long the checkpoint may wait before it is considered stale.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// What to do when a step fails permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FallbackConfig {
    /// Agent to try once more with before failing the step.
    #[serde(default)]
    pub fallback_agent_type: Option<String>,
    /// Base backoff for transient retries, overriding the engine default.
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
}

/// Failure policy for steps sharing a `parallel_group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParallelPolicy {
    /// Members are dispatched together and a failure cancels the rest.
    AllOrNothing,
    /// A failure does not affect sibling members.
    #[default]
    BestEffort,
    /// A failure cancels running siblings and skips pending ones.
    FailFast,
}

impl ParallelPolicy {
    /// True when a member's failure should stop its siblings.
    pub fn cancels_siblings(&self) -> bool {
        matches!(self, ParallelPolicy::AllOrNothing | ParallelPolicy::FailFast)
    }
}

impl std::fmt::Display for ParallelPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParallelPolicy::AllOrNothing => write!(f, "all_or_nothing"),
            ParallelPolicy::BestEffort => write!(f, "best_effort"),
            ParallelPolicy::FailFast => write!(f, "fail_fast"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_STEP_MAX_RETRIES
}

/// One step of a task plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub agent_type: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub inputs: Payload,
    #[serde(default)]
    pub outputs: Option<Payload>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub checkpoint_required: bool,
    #[serde(default)]
    pub checkpoint_config: Option<CheckpointConfig>,
    #[serde(default)]
    pub fallback_config: Option<FallbackConfig>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default = "default_true")]
    pub is_critical: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskStep {
    /// Create a pending step with no dependencies.
    pub fn new(id: &str, name: &str, agent_type: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            agent_type: agent_type.to_string(),
            domain: None,
            inputs: Payload::new(),
            outputs: None,
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            checkpoint_required: false,
            checkpoint_config: None,
            fallback_config: None,
            parallel_group: None,
            is_critical: true,
            retry_count: 0,
            max_retries: DEFAULT_STEP_MAX_RETRIES,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Builder-style dependency list.
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Builder-style parallel group tag.
    pub fn in_group(mut self, group: &str) -> Self {
        self.parallel_group = Some(group.to_string());
        self
    }

    /// Builder-style checkpoint gate.
    pub fn with_checkpoint(mut self, config: CheckpointConfig) -> Self {
        self.checkpoint_required = true;
        self.checkpoint_config = Some(config);
        self
    }

    /// Apply a partial update.
    ///
    /// Re-entering PENDING or RUNNING clears the terminal fields
    /// (`error_message`, `completed_at`) unless the update sets them.
    pub fn apply(&mut self, update: &StepUpdate) {
        if let Some(status) = update.status {
            self.status = status;
            if matches!(status, StepStatus::Pending | StepStatus::Running) {
                self.error_message = None;
                self.completed_at = None;
            }
        }
        if let Some(outputs) = &update.outputs {
            self.outputs = Some(outputs.clone());
        }
        if let Some(error) = &update.error_message {
            self.error_message = Some(error.clone());
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(started_at) = update.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
    }
}

/// A user goal broken into executable steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    pub goal: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    /// Failure policy per parallel group tag.
    #[serde(default)]
    pub parallel_policies: BTreeMap<String, ParallelPolicy>,
    #[serde(default)]
    pub tree_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl Task {
    /// Create a new task in PLANNING with a generated id.
    pub fn new(user_id: &str, goal: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            organization_id: None,
            goal: goal.to_string(),
            status: TaskStatus::Planning,
            steps: Vec::new(),
            parallel_policies: BTreeMap::new(),
            tree_id: None,
            created_at: Utc::now(),
            completed_at: None,
            conversation_id: None,
        }
    }

    /// The execution tree backing this task. Defaults to the task id.
    pub fn tree_id(&self) -> &str {
        self.tree_id.as_deref().unwrap_or(&self.id)
    }

    pub fn step(&self, step_id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Policy configured for a group, if any.
    pub fn policy_for(&self, group: &str) -> Option<ParallelPolicy> {
        self.parallel_policies.get(group).copied()
    }

    /// Ids of the steps tagged with `group`.
    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.parallel_group.as_deref() == Some(group))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Apply a partial update to task-level fields.
    pub fn apply(&mut self, update: &TaskUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(tree_id) = &update.tree_id {
            self.tree_id = Some(tree_id.clone());
        }
    }
}

/// Partial update of a task record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tree_id: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }
}

/// Partial update of a step record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepUpdate {
    pub status: Option<StepStatus>,
    pub outputs: Option<Payload>,
    pub error_message: Option<String>,
    pub retry_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepUpdate {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_outputs(mut self, outputs: Payload) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error_message = Some(error.to_string());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn started_now(mut self) -> Self {
        self.started_at = Some(Utc::now());
        self
    }

    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }
}

/// A plan file as written by a planner or a user.
///
/// Converting it yields a task in PLANNING; moving it to READY is a state
/// machine transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub goal: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    #[serde(default)]
    pub parallel_policies: BTreeMap<String, ParallelPolicy>,
}

impl TaskPlan {
    pub fn into_task(self) -> Task {
        let mut task = Task::new(&self.user_id, &self.goal);
        task.organization_id = self.organization_id;
        task.conversation_id = self.conversation_id;
        task.steps = self.steps;
        task.parallel_policies = self.parallel_policies;
        task
    }
}
