use thiserror::Error;

use crate::core::task::TaskStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition for task {task_id}: {current} -> {target}")]
    InvalidTransition {
        task_id: String,
        current: TaskStatus,
        target: TaskStatus,
    },

    #[error("Tree not found: {0}")]
    TreeNotFound(String),

    #[error("Tree already exists: {0}")]
    TreeExists(String),

    #[error("Dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Notification failed: {0}")]
    Notify(String),

    #[error("No home directory")]
    NoHomeDir,
}

impl Error {
    /// True for `InvalidTransition`, letting callers branch without matching fields.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Error::InvalidTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
