//! Narrow interfaces to the collaborators around the engine.
//!
//! The event bus and inbox are fire-and-forget: callers log their failures
//! and carry on. The checkpoint service decides whether a gated step may run.
//! In-memory implementations are provided for tests and the CLI.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::node::Payload;
use crate::core::task::{TaskStatus, TaskStep};
use crate::error::{Error, Result};

/// Notifications emitted while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A step was dispatched to its executor.
    StepStarted {
        task_id: String,
        step_id: String,
        agent_type: String,
    },
    /// A step finished successfully.
    StepCompleted {
        task_id: String,
        step_id: String,
        output: Payload,
        execution_time_ms: u64,
    },
    /// A step failed for good.
    StepFailed {
        task_id: String,
        step_id: String,
        error: String,
        retry_count: u32,
    },
    /// A step is waiting for approval.
    CheckpointCreated {
        task_id: String,
        step_id: String,
        checkpoint_id: String,
        message: Option<String>,
    },
    /// The task reached an outcome; `status` is COMPLETED or FAILED.
    TaskCompleted { task_id: String, status: TaskStatus },
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::StepStarted { .. } => "step_started",
            TaskEvent::StepCompleted { .. } => "step_completed",
            TaskEvent::StepFailed { .. } => "step_failed",
            TaskEvent::CheckpointCreated { .. } => "checkpoint_created",
            TaskEvent::TaskCompleted { .. } => "task_completed",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::StepStarted { task_id, .. }
            | TaskEvent::StepCompleted { task_id, .. }
            | TaskEvent::StepFailed { task_id, .. }
            | TaskEvent::CheckpointCreated { task_id, .. }
            | TaskEvent::TaskCompleted { task_id, .. } => task_id,
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: TaskEvent) -> Result<()>;
}

/// Event bus backed by a bounded mpsc channel.
///
/// Publishing never waits: a full or closed channel is reported as an error
/// and the event is dropped.
pub struct ChannelEventBus {
    tx: mpsc::Sender<TaskEvent>,
}

impl ChannelEventBus {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn publish(&self, event: TaskEvent) -> Result<()> {
        self.tx
            .try_send(event)
            .map_err(|e| Error::Notify(format!("event bus: {}", e)))
    }
}

/// Kind of inbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxKind {
    Step,
    Checkpoint,
    Completion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub task_id: String,
    pub kind: InboxKind,
    pub step_id: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// User-facing messages about task progress.
#[async_trait]
pub trait Inbox: Send + Sync {
    async fn add_step_message(&self, task_id: &str, step: &TaskStep, body: &str) -> Result<()>;

    async fn add_checkpoint_message(
        &self,
        task_id: &str,
        step: &TaskStep,
        checkpoint_id: &str,
    ) -> Result<()>;

    async fn add_completion_message(
        &self,
        task_id: &str,
        status: TaskStatus,
        summary: &str,
    ) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryInbox {
    messages: Mutex<Vec<InboxMessage>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<InboxMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    fn push(&self, message: InboxMessage) -> Result<()> {
        self.messages
            .lock()
            .map_err(|e| Error::Notify(format!("inbox: {}", e)))?
            .push(message);
        Ok(())
    }
}

#[async_trait]
impl Inbox for MemoryInbox {
    async fn add_step_message(&self, task_id: &str, step: &TaskStep, body: &str) -> Result<()> {
        self.push(InboxMessage {
            task_id: task_id.to_string(),
            kind: InboxKind::Step,
            step_id: Some(step.id.clone()),
            body: body.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn add_checkpoint_message(
        &self,
        task_id: &str,
        step: &TaskStep,
        checkpoint_id: &str,
    ) -> Result<()> {
        let prompt = step
            .checkpoint_config
            .as_ref()
            .and_then(|c| c.message.clone())
            .unwrap_or_else(|| format!("Step '{}' is awaiting approval", step.name));
        self.push(InboxMessage {
            task_id: task_id.to_string(),
            kind: InboxKind::Checkpoint,
            step_id: Some(step.id.clone()),
            body: format!("{} (checkpoint {})", prompt, checkpoint_id),
            created_at: Utc::now(),
        })
    }

    async fn add_completion_message(
        &self,
        task_id: &str,
        _status: TaskStatus,
        summary: &str,
    ) -> Result<()> {
        self.push(InboxMessage {
            task_id: task_id.to_string(),
            kind: InboxKind::Completion,
            step_id: None,
            body: summary.to_string(),
            created_at: Utc::now(),
        })
    }
}

/// Human approval gates.
#[async_trait]
pub trait CheckpointService: Send + Sync {
    async fn is_already_approved(&self, task_id: &str, step: &TaskStep) -> Result<bool>;

    /// Record a pending checkpoint and return its id.
    async fn create_checkpoint(&self, task_id: &str, step: &TaskStep) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub task_id: String,
    pub step_id: String,
    pub message: Option<String>,
    pub approvers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl CheckpointRecord {
    pub fn is_approved(&self) -> bool {
        self.approved_at.is_some()
    }
}

/// Checkpoint records keyed by `(task_id, step_id)`.
///
/// Creating a checkpoint for a step that already has a pending one returns
/// the existing id.
#[derive(Default)]
pub struct MemoryCheckpointService {
    records: RwLock<HashMap<(String, String), CheckpointRecord>>,
}

impl MemoryCheckpointService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approve the checkpoint of a step. False if none was created.
    pub fn approve(&self, task_id: &str, step_id: &str) -> Result<bool> {
        let mut records = self
            .records
            .write()
            .map_err(|e| Error::Store(e.to_string()))?;
        match records.get_mut(&(task_id.to_string(), step_id.to_string())) {
            Some(record) => {
                record.approved_at.get_or_insert_with(Utc::now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get(&self, task_id: &str, step_id: &str) -> Option<CheckpointRecord> {
        self.records
            .read()
            .ok()?
            .get(&(task_id.to_string(), step_id.to_string()))
            .cloned()
    }

    /// Checkpoints still waiting for approval.
    pub fn pending(&self) -> Vec<CheckpointRecord> {
        self.records
            .read()
            .map(|r| r.values().filter(|c| !c.is_approved()).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointService for MemoryCheckpointService {
    async fn is_already_approved(&self, task_id: &str, step: &TaskStep) -> Result<bool> {
        let records = self
            .records
            .read()
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(records
            .get(&(task_id.to_string(), step.id.clone()))
            .map(CheckpointRecord::is_approved)
            .unwrap_or(false))
    }

    async fn create_checkpoint(&self, task_id: &str, step: &TaskStep) -> Result<String> {
        let mut records = self
            .records
            .write()
            .map_err(|e| Error::Store(e.to_string()))?;
        let key = (task_id.to_string(), step.id.clone());
        if let Some(existing) = records.get(&key) {
            return Ok(existing.id.clone());
        }
        let config = step.checkpoint_config.clone().unwrap_or_default();
        let record = CheckpointRecord {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            step_id: step.id.clone(),
            message: config.message,
            approvers: config.approvers,
            created_at: Utc::now(),
            approved_at: None,
        };
        let id = record.id.clone();
        records.insert(key, record);
        Ok(id)
    }
}
