//! Task stores.
//!
//! `TaskStore` is the persistence seam for task records. `MemoryTaskStore`
//! is the fast, process-local store; `FileTaskStore` is durable, one JSON
//! file per task.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::core::task::{StepUpdate, Task, TaskUpdate};
use crate::error::{Error, Result};
use crate::tlog_trace;

/// Async CRUD over task records.
///
/// Updates return `Ok(false)` when the task (or step) is unknown; `Err` is
/// reserved for the store itself failing.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// Insert or replace a whole task.
    async fn save_task(&self, task: &Task) -> Result<()>;

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<bool>;

    async fn update_step(&self, task_id: &str, step_id: &str, update: &StepUpdate)
        -> Result<bool>;

    async fn delete_task(&self, task_id: &str) -> Result<bool>;
}

/// Apply a step update to a task in place. False if the step is unknown.
fn apply_step_update(task: &mut Task, step_id: &str, update: &StepUpdate) -> bool {
    match task.step_mut(step_id) {
        Some(step) => {
            step.apply(update);
            true
        }
        None => false,
    }
}

/// In-memory store for development, tests and as the fast cache.
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.read().map_err(|e| Error::Store(e.to_string()))?;
        Ok(tasks.get(task_id).cloned())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(|e| Error::Store(e.to_string()))?;
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<bool> {
        let mut tasks = self.tasks.write().map_err(|e| Error::Store(e.to_string()))?;
        match tasks.get_mut(task_id) {
            Some(task) => {
                task.apply(update);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_step(
        &self,
        task_id: &str,
        step_id: &str,
        update: &StepUpdate,
    ) -> Result<bool> {
        let mut tasks = self.tasks.write().map_err(|e| Error::Store(e.to_string()))?;
        Ok(tasks
            .get_mut(task_id)
            .map(|task| apply_step_update(task, step_id, update))
            .unwrap_or(false))
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let mut tasks = self.tasks.write().map_err(|e| Error::Store(e.to_string()))?;
        Ok(tasks.remove(task_id).is_some())
    }
}

/// Durable store keeping `<dir>/<task_id>.json` per task.
///
/// Read-modify-write cycles are serialized by one async mutex, so concurrent
/// step updates of the same task never lose each other's fields.
pub struct FileTaskStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileTaskStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_path(&self, task_id: &str) -> Result<PathBuf> {
        let valid = !task_id.is_empty()
            && task_id != "."
            && task_id != ".."
            && task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(Error::Validation(format!("invalid task id: {:?}", task_id)));
        }
        Ok(self.dir.join(format!("{}.json", task_id)))
    }

    async fn read(&self, task_id: &str) -> Result<Option<Task>> {
        let path = self.task_path(task_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, task: &Task) -> Result<()> {
        let path = self.task_path(&task.id)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(task)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tlog_trace!("Persisted task {} to {}", task.id, path.display());
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.read(task_id).await
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(task).await
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut task) = self.read(task_id).await? else {
            return Ok(false);
        };
        task.apply(update);
        self.write(&task).await?;
        Ok(true)
    }

    async fn update_step(
        &self,
        task_id: &str,
        step_id: &str,
        update: &StepUpdate,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut task) = self.read(task_id).await? else {
            return Ok(false);
        };
        if !apply_step_update(&mut task, step_id, update) {
            return Ok(false);
        }
        self.write(&task).await?;
        Ok(true)
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.task_path(task_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
