//! Task persistence.
//!
//! A durable `TaskStore` plus an optional fast cache, tied together by the
//! write-through `TaskRepository`.

mod repository;
mod store;

pub use repository::TaskRepository;
pub use store::{FileTaskStore, MemoryTaskStore, TaskStore};
