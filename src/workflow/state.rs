//! Task status state machine.
//!
//! `TaskStateMachine` is the only writer of `Task::status`. Legal moves are a
//! fixed table; anything else fails with `Error::InvalidTransition` and leaves
//! the stored task untouched.
//!
//! ```text
//! PLANNING  -> READY
//! READY     -> EXECUTING | CANCELLED
//! EXECUTING -> COMPLETED | FAILED | CHECKPOINT | PAUSED | CANCELLED
//! CHECKPOINT-> EXECUTING | CANCELLED
//! PAUSED    -> EXECUTING | CANCELLED
//! FAILED    -> READY
//! CANCELLED -> READY
//! COMPLETED, SUPERSEDED: none
//! ```

use crate::core::task::{Task, TaskStatus, TaskUpdate};
use crate::error::{Error, Result};
use crate::state::TaskRepository;
use crate::{tlog, tlog_debug};

/// Check if `current -> target` is an edge of the transition table.
pub fn can_transition(current: TaskStatus, target: TaskStatus) -> bool {
    matches!(
        (current, target),
        (TaskStatus::Planning, TaskStatus::Ready)
            | (TaskStatus::Ready, TaskStatus::Executing)
            | (TaskStatus::Ready, TaskStatus::Cancelled)
            | (TaskStatus::Executing, TaskStatus::Completed)
            | (TaskStatus::Executing, TaskStatus::Failed)
            | (TaskStatus::Executing, TaskStatus::Checkpoint)
            | (TaskStatus::Executing, TaskStatus::Paused)
            | (TaskStatus::Executing, TaskStatus::Cancelled)
            | (TaskStatus::Checkpoint, TaskStatus::Executing)
            | (TaskStatus::Checkpoint, TaskStatus::Cancelled)
            | (TaskStatus::Paused, TaskStatus::Executing)
            | (TaskStatus::Paused, TaskStatus::Cancelled)
            | (TaskStatus::Failed, TaskStatus::Ready)
            | (TaskStatus::Cancelled, TaskStatus::Ready)
    )
}

/// The row of the transition table for `status`.
pub fn allowed_transitions(status: TaskStatus) -> Vec<TaskStatus> {
    TaskStatus::ALL
        .into_iter()
        .filter(|target| can_transition(status, *target))
        .collect()
}

/// Statuses a finalization to `outcome` may overwrite.
fn finalizable_from(outcome: TaskStatus, current: TaskStatus) -> bool {
    match outcome {
        TaskStatus::Completed => current == TaskStatus::Executing,
        TaskStatus::Failed => matches!(
            current,
            TaskStatus::Executing | TaskStatus::Checkpoint | TaskStatus::Paused
        ),
        _ => false,
    }
}

/// Serializes task status changes and writes them through the repository.
pub struct TaskStateMachine {
    repo: TaskRepository,
    lock: tokio::sync::Mutex<()>,
}

impl TaskStateMachine {
    pub fn new(repo: TaskRepository) -> Self {
        Self {
            repo,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &TaskRepository {
        &self.repo
    }

    /// Pure table lookup, no I/O.
    pub fn validate_transition(&self, current: TaskStatus, target: TaskStatus) -> bool {
        can_transition(current, target)
    }

    pub fn get_allowed_transitions(&self, status: TaskStatus) -> Vec<TaskStatus> {
        allowed_transitions(status)
    }

    /// Move a task to `target` and return the updated record.
    ///
    /// # Errors
    /// `TaskNotFound` if the durable store does not know the task,
    /// `InvalidTransition` if the move is not in the table.
    pub async fn transition(&self, task_id: &str, target: TaskStatus) -> Result<Task> {
        let _guard = self.lock.lock().await;
        let task = self.load(task_id).await?;
        if !can_transition(task.status, target) {
            return Err(Error::InvalidTransition {
                task_id: task_id.to_string(),
                current: task.status,
                target,
            });
        }
        self.write(task, target).await
    }

    /// Like `transition`, but an illegal move is a no-op returning `None`.
    pub async fn try_transition(&self, task_id: &str, target: TaskStatus) -> Result<Option<Task>> {
        match self.transition(task_id, target).await {
            Ok(task) => Ok(Some(task)),
            Err(e) if e.is_invalid_transition() => {
                tlog_debug!("Skipping transition of task {} to {}: {}", task_id, target, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Roll a tree outcome up into the task status.
    ///
    /// COMPLETED applies only to an EXECUTING task. FAILED applies to an
    /// EXECUTING, CHECKPOINT or PAUSED task. Anything else, notably a task
    /// already CANCELLED, SUPERSEDED or COMPLETED, is left as is and `None`
    /// is returned.
    pub async fn finalize(&self, task_id: &str, outcome: TaskStatus) -> Result<Option<Task>> {
        if !matches!(outcome, TaskStatus::Completed | TaskStatus::Failed) {
            return Err(Error::Validation(format!(
                "cannot finalize task {} as {}",
                task_id, outcome
            )));
        }

        let _guard = self.lock.lock().await;
        let task = self.load(task_id).await?;
        if !finalizable_from(outcome, task.status) {
            tlog_debug!(
                "Not finalizing task {}: {} cannot become {}",
                task_id,
                task.status,
                outcome
            );
            return Ok(None);
        }
        self.write(task, outcome).await.map(Some)
    }

    async fn load(&self, task_id: &str) -> Result<Task> {
        self.repo
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    async fn write(&self, mut task: Task, target: TaskStatus) -> Result<Task> {
        let mut update = TaskUpdate::status(target);
        if target == TaskStatus::Completed {
            update = update.completed_now();
        }
        if !self.repo.update_task(&task.id, &update).await? {
            return Err(Error::TaskNotFound(task.id));
        }
        tlog!("Task {}: {} -> {}", task.id, task.status, target);
        task.apply(&update);
        Ok(task)
    }
}
