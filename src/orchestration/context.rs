//! Shared handles the use case and scheduler work through.

use std::sync::Arc;

use crate::config::Config;
use crate::core::task::{StepStatus, StepUpdate, Task, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::executor::StepExecutor;
use crate::orchestration::ports::{CheckpointService, EventBus, Inbox, TaskEvent};
use crate::state::TaskRepository;
use crate::workflow::{TaskStateMachine, TaskTreeAdapter};
use crate::{tlog, tlog_debug, tlog_warn};

#[derive(Clone)]
pub struct EngineContext {
    pub adapter: TaskTreeAdapter,
    pub state_machine: Arc<TaskStateMachine>,
    pub executor: Arc<dyn StepExecutor>,
    pub events: Arc<dyn EventBus>,
    pub inbox: Arc<dyn Inbox>,
    pub checkpoints: Arc<dyn CheckpointService>,
    pub config: Arc<Config>,
}

impl EngineContext {
    pub fn repository(&self) -> &TaskRepository {
        self.state_machine.repository()
    }

    pub async fn load_task(&self, task_id: &str) -> Result<Task> {
        self.repository()
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// Build the tree for a planned task, persist it and move it to READY.
    ///
    /// The plan is validated before anything is written; a task whose tree
    /// cannot be built is never stored.
    pub async fn submit_task(&self, mut task: Task) -> Result<Task> {
        if task.status != TaskStatus::Planning {
            return Err(Error::InvalidTransition {
                task_id: task.id.clone(),
                current: task.status,
                target: TaskStatus::Ready,
            });
        }
        for step in &mut task.steps {
            step.status = StepStatus::Pending;
        }

        let tree_id = self.adapter.create_task_tree(&task).await?;
        task.tree_id = Some(tree_id.clone());

        if let Err(e) = self.repository().save_task(&task).await {
            if let Err(cleanup) = self.adapter.delete_task_tree(&tree_id).await {
                tlog_warn!("Failed to remove tree {}: {}", tree_id, cleanup);
            }
            return Err(e);
        }

        let task = self
            .state_machine
            .transition(&task.id, TaskStatus::Ready)
            .await?;
        tlog!("Submitted task {} ({} steps)", task.id, task.steps.len());
        Ok(task)
    }

    /// Fire-and-forget event publish.
    pub(crate) async fn publish(&self, event: TaskEvent) {
        let name = event.name();
        let task_id = event.task_id().to_string();
        if let Err(e) = self.events.publish(event).await {
            tlog_warn!("Dropped {} event for task {}: {}", name, task_id, e);
        }
    }

    /// Mark a step SKIPPED in the tree and the task record.
    pub(crate) async fn record_skipped(
        &self,
        task_id: &str,
        tree_id: &str,
        step_id: &str,
    ) -> Result<()> {
        if !self.adapter.skip_step(tree_id, step_id).await? {
            tlog_debug!("Skip of {}/{}: no tree node", tree_id, step_id);
        }
        self.record_step(
            task_id,
            step_id,
            &StepUpdate::status(StepStatus::Skipped).completed_now(),
        )
        .await
    }

    /// Apply `update` to the task record of a step. A step with no stored
    /// record is left as is.
    pub(crate) async fn record_step(
        &self,
        task_id: &str,
        step_id: &str,
        update: &StepUpdate,
    ) -> Result<()> {
        if !self.repository().update_step(task_id, step_id, update).await? {
            tlog_debug!(
                "Step {}/{} has no task record, {:?} not stored",
                task_id,
                step_id,
                update.status
            );
        }
        Ok(())
    }
}
