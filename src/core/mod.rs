//! Core domain models.
//!
//! Tasks and steps on the domain side, execution nodes and trees on the
//! generic side, and the mapping between the two.

pub mod mapping;
pub mod node;
pub mod task;
pub mod tree;

pub use node::{ExecutionNode, NodeStatus, NodeType, Payload, ROOT_NODE_ID};
pub use task::{
    CheckpointConfig, FallbackConfig, ParallelPolicy, StepStatus, StepUpdate, Task, TaskPlan,
    TaskStatus, TaskStep,
};
pub use tree::{ExecutionTreeStore, LocalTreeStore, TreeMetrics, TreeSnapshot};
