//! Write-through task repository.
//!
//! Every task or step write lands in the durable store first and is then
//! mirrored to the optional cache. Durable failures propagate; cache failures
//! are logged and swallowed. Reads always come from the durable store, which
//! is the source of truth on restart.

use std::sync::Arc;

use crate::core::task::{StepUpdate, Task, TaskUpdate};
use crate::error::Result;
use crate::state::store::TaskStore;
use crate::{tlog_trace, tlog_warn};

#[derive(Clone)]
pub struct TaskRepository {
    durable: Arc<dyn TaskStore>,
    cache: Option<Arc<dyn TaskStore>>,
}

impl TaskRepository {
    pub fn new(durable: Arc<dyn TaskStore>) -> Self {
        Self {
            durable,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn TaskStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn durable(&self) -> &Arc<dyn TaskStore> {
        &self.durable
    }

    pub fn cache(&self) -> Option<&Arc<dyn TaskStore>> {
        self.cache.as_ref()
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.durable.get_task(task_id).await
    }

    pub async fn save_task(&self, task: &Task) -> Result<()> {
        self.durable.save_task(task).await?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save_task(task).await {
                tlog_warn!("Cache mirror of task {} failed: {}", task.id, e);
            }
        }
        Ok(())
    }

    /// Returns false if the durable store does not know the task.
    pub async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<bool> {
        if !self.durable.update_task(task_id, update).await? {
            return Ok(false);
        }
        if let Some(cache) = &self.cache {
            match cache.update_task(task_id, update).await {
                Ok(true) => {}
                Ok(false) => self.reseed(cache.as_ref(), task_id).await,
                Err(e) => tlog_warn!("Cache mirror of task {} failed: {}", task_id, e),
            }
        }
        Ok(true)
    }

    /// Returns false if the durable store does not know the task or step.
    pub async fn update_step(
        &self,
        task_id: &str,
        step_id: &str,
        update: &StepUpdate,
    ) -> Result<bool> {
        if !self.durable.update_step(task_id, step_id, update).await? {
            return Ok(false);
        }
        if let Some(cache) = &self.cache {
            match cache.update_step(task_id, step_id, update).await {
                Ok(true) => {}
                Ok(false) => self.reseed(cache.as_ref(), task_id).await,
                Err(e) => tlog_warn!(
                    "Cache mirror of step {}/{} failed: {}",
                    task_id,
                    step_id,
                    e
                ),
            }
        }
        Ok(true)
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let removed = self.durable.delete_task(task_id).await?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.delete_task(task_id).await {
                tlog_warn!("Cache delete of task {} failed: {}", task_id, e);
            }
        }
        Ok(removed)
    }

    /// Copy the durable record into the cache after a cache miss.
    async fn reseed(&self, cache: &dyn TaskStore, task_id: &str) {
        let task = match self.durable.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                tlog_warn!("Cache reseed of task {} failed to read: {}", task_id, e);
                return;
            }
        };
        tlog_trace!("Reseeding cache with task {}", task_id);
        if let Err(e) = cache.save_task(&task).await {
            tlog_warn!("Cache reseed of task {} failed: {}", task_id, e);
        }
    }
}
