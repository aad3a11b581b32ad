//! Domain-facing façade over the execution tree store.
//!
//! `TaskTreeAdapter` speaks `Task`/`TaskStep` and translates every call into
//! node operations through the mapping functions. One tree per task, keyed
//! by the task id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::mapping::{node_to_task_step, task_step_to_node};
use crate::core::node::{error_payload, NodeStatus, Payload, ROOT_NODE_ID};
use crate::core::task::{Task, TaskStatus, TaskStep};
use crate::core::tree::{topological_order, ExecutionTreeStore};
use crate::error::{Error, Result};
use crate::{tlog_debug, tlog_warn};

/// Step counts for a task, root excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub running_steps: usize,
    pub pending_steps: usize,
    /// 0 when the task has no steps.
    pub completion_percentage: f64,
}

fn is_success(status: NodeStatus) -> bool {
    matches!(status, NodeStatus::Completed | NodeStatus::Expanded)
}

fn is_failure(status: NodeStatus) -> bool {
    matches!(status, NodeStatus::Failed | NodeStatus::Timeout)
}

#[derive(Clone)]
pub struct TaskTreeAdapter {
    store: Arc<dyn ExecutionTreeStore>,
}

impl TaskTreeAdapter {
    pub fn new(store: Arc<dyn ExecutionTreeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionTreeStore> {
        &self.store
    }

    /// Check a step list can form a tree and return the ids in dependency
    /// order.
    ///
    /// # Errors
    /// `Validation` for duplicate ids, a step named like the root, or an
    /// unknown dependency. `CycleDetected` for self or cyclic dependencies.
    pub fn validate_steps(steps: &[TaskStep]) -> Result<Vec<String>> {
        let mut ids = HashSet::new();
        for step in steps {
            if step.id.is_empty() {
                return Err(Error::Validation("step with empty id".to_string()));
            }
            if step.id == ROOT_NODE_ID {
                return Err(Error::Validation(format!(
                    "step id {:?} is reserved",
                    ROOT_NODE_ID
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(Error::Validation(format!("duplicate step id {}", step.id)));
            }
        }

        for step in steps {
            for dep in &step.dependencies {
                if dep == &step.id {
                    return Err(Error::CycleDetected(format!(
                        "step {} depends on itself",
                        step.id
                    )));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(Error::Validation(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
        }

        topological_order(steps.iter().map(|s| (s.id.as_str(), &s.dependencies)))
    }

    /// Build the tree for `task`: a completed root plus one node per step.
    ///
    /// The plan is validated before anything is written. If a node insert
    /// fails the partial tree is deleted.
    pub async fn create_task_tree(&self, task: &Task) -> Result<String> {
        let order = Self::validate_steps(&task.steps)?;

        let mut metadata = Payload::new();
        metadata.insert("type".to_string(), Value::from("task"));
        metadata.insert("goal".to_string(), Value::from(task.goal.clone()));
        metadata.insert("user_id".to_string(), Value::from(task.user_id.clone()));

        let tree_id = self.store.create_tree(&task.id, metadata).await?;

        if let Err(e) = self.populate(&tree_id, task, &order).await {
            tlog_warn!("Tree {} left incomplete, removing: {}", tree_id, e);
            if let Err(cleanup) = self.store.delete_tree(&tree_id).await {
                tlog_warn!("Failed to remove tree {}: {}", tree_id, cleanup);
            }
            return Err(e);
        }

        tlog_debug!("Created tree {} with {} steps", tree_id, task.steps.len());
        Ok(tree_id)
    }

    async fn populate(&self, tree_id: &str, task: &Task, order: &[String]) -> Result<()> {
        // A store that does not pre-complete the root would block every step.
        match self.store.get_node(tree_id, ROOT_NODE_ID).await? {
            Some(root) if root.status == NodeStatus::Completed => {}
            Some(_) => {
                self.store
                    .update_node_status(tree_id, ROOT_NODE_ID, NodeStatus::Completed, None, None)
                    .await?;
            }
            None => return Err(Error::TreeNotFound(tree_id.to_string())),
        }

        for step_id in order {
            let Some(step) = task.step(step_id) else {
                continue;
            };
            let node = task_step_to_node(step, Some(ROOT_NODE_ID));
            if !self.store.add_node(tree_id, node).await? {
                return Err(Error::Validation(format!(
                    "could not add step {} to tree {}",
                    step_id, tree_id
                )));
            }
        }
        Ok(())
    }

    pub async fn get_step_from_tree(&self, tree_id: &str, step_id: &str) -> Result<Option<TaskStep>> {
        Ok(self
            .store
            .get_node(tree_id, step_id)
            .await?
            .filter(|n| !n.is_root())
            .map(|n| node_to_task_step(&n)))
    }

    pub async fn start_step(&self, tree_id: &str, step_id: &str) -> Result<bool> {
        self.store
            .update_node_status(tree_id, step_id, NodeStatus::Running, None, None)
            .await
    }

    pub async fn complete_step(&self, tree_id: &str, step_id: &str, outputs: Payload) -> Result<bool> {
        self.store
            .update_node_status(tree_id, step_id, NodeStatus::Completed, Some(outputs), None)
            .await
    }

    /// Fail a step with `error_data = {"error": message}`.
    pub async fn fail_step(&self, tree_id: &str, step_id: &str, error: &str) -> Result<bool> {
        self.store
            .update_node_status(
                tree_id,
                step_id,
                NodeStatus::Failed,
                None,
                Some(error_payload(error)),
            )
            .await
    }

    pub async fn pause_step(&self, tree_id: &str, step_id: &str) -> Result<bool> {
        self.store
            .update_node_status(tree_id, step_id, NodeStatus::Paused, None, None)
            .await
    }

    /// Back to PENDING, so the step re-enters the ready pool.
    pub async fn reset_step(&self, tree_id: &str, step_id: &str) -> Result<bool> {
        self.store
            .update_node_status(tree_id, step_id, NodeStatus::Pending, None, None)
            .await
    }

    /// Mark a step SKIPPED (node CANCELLED).
    pub async fn skip_step(&self, tree_id: &str, step_id: &str) -> Result<bool> {
        self.store
            .update_node_status(tree_id, step_id, NodeStatus::Cancelled, None, None)
            .await
    }

    pub async fn set_retry_count(&self, tree_id: &str, step_id: &str, retry_count: u32) -> Result<bool> {
        self.store.set_retry_count(tree_id, step_id, retry_count).await
    }

    /// Reset every FAILED, TIMEOUT or CANCELLED step to PENDING with a fresh
    /// retry budget. Returns the ids that were reset.
    pub async fn reset_failed_steps(&self, tree_id: &str) -> Result<Vec<String>> {
        let snapshot = self
            .store
            .get_tree_snapshot(tree_id)
            .await?
            .ok_or_else(|| Error::TreeNotFound(tree_id.to_string()))?;

        let mut reset = Vec::new();
        for node in snapshot.work_nodes() {
            if is_failure(node.status) || node.status == NodeStatus::Cancelled {
                self.reset_step(tree_id, &node.id).await?;
                self.store.set_retry_count(tree_id, &node.id, 0).await?;
                reset.push(node.id.clone());
            }
        }
        Ok(reset)
    }

    /// Reset steps left RUNNING by a process that stopped mid-step back to
    /// PENDING, keeping their retry count. Steps named in `live` are still
    /// running here and are left alone. Returns the ids that were reset.
    pub async fn reset_running_steps(
        &self,
        tree_id: &str,
        live: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let snapshot = self
            .store
            .get_tree_snapshot(tree_id)
            .await?
            .ok_or_else(|| Error::TreeNotFound(tree_id.to_string()))?;

        let mut reset = Vec::new();
        for node in snapshot.work_nodes() {
            if node.status == NodeStatus::Running && !live.contains(&node.id) {
                self.reset_step(tree_id, &node.id).await?;
                reset.push(node.id.clone());
            }
        }
        Ok(reset)
    }

    /// PENDING steps whose dependencies are all done.
    pub async fn get_ready_steps(&self, tree_id: &str) -> Result<Vec<TaskStep>> {
        Ok(self
            .store
            .get_ready_nodes(tree_id)
            .await?
            .iter()
            .filter(|n| !n.is_root())
            .map(node_to_task_step)
            .collect())
    }

    /// Whether the tree reached an outcome.
    ///
    /// Any failed step yields `(true, Some(Failed))` even while others still
    /// run. All steps done yields `(true, Some(Completed))`, including a tree
    /// with no steps. Otherwise `(false, None)`.
    pub async fn is_task_complete(&self, tree_id: &str) -> Result<(bool, Option<TaskStatus>)> {
        let snapshot = self
            .store
            .get_tree_snapshot(tree_id)
            .await?
            .ok_or_else(|| Error::TreeNotFound(tree_id.to_string()))?;

        if snapshot.work_nodes().any(|n| is_failure(n.status)) {
            return Ok((true, Some(TaskStatus::Failed)));
        }
        if snapshot.work_nodes().all(|n| is_success(n.status)) {
            return Ok((true, Some(TaskStatus::Completed)));
        }
        Ok((false, None))
    }

    pub async fn get_task_progress(&self, tree_id: &str) -> Result<TaskProgress> {
        let snapshot = self
            .store
            .get_tree_snapshot(tree_id)
            .await?
            .ok_or_else(|| Error::TreeNotFound(tree_id.to_string()))?;

        let mut progress = TaskProgress {
            total_steps: 0,
            completed_steps: 0,
            running_steps: 0,
            pending_steps: 0,
            completion_percentage: 0.0,
        };
        for node in snapshot.work_nodes() {
            progress.total_steps += 1;
            match node.status {
                s if is_success(s) => progress.completed_steps += 1,
                NodeStatus::Running => progress.running_steps += 1,
                NodeStatus::Pending | NodeStatus::Waiting => progress.pending_steps += 1,
                _ => {}
            }
        }
        if progress.total_steps > 0 {
            progress.completion_percentage =
                progress.completed_steps as f64 / progress.total_steps as f64 * 100.0;
        }
        Ok(progress)
    }

    /// All steps of the tree, root excluded, ordered by id.
    pub async fn get_all_steps(&self, tree_id: &str) -> Result<Vec<TaskStep>> {
        Ok(self
            .store
            .get_tree_snapshot(tree_id)
            .await?
            .map(|snapshot| snapshot.work_nodes().map(node_to_task_step).collect())
            .unwrap_or_default())
    }

    pub async fn delete_task_tree(&self, tree_id: &str) -> Result<bool> {
        self.store.delete_tree(tree_id).await
    }

    pub async fn tree_exists(&self, tree_id: &str) -> Result<bool> {
        Ok(self.store.get_node(tree_id, ROOT_NODE_ID).await?.is_some())
    }

    pub async fn health_check(&self) -> bool {
        self.store.health_check().await
    }
}
