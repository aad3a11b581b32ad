//! Task workflow: the tree adapter and the task status state machine.

mod adapter;
mod state;

pub use adapter::{TaskProgress, TaskTreeAdapter};
pub use state::{allowed_transitions, can_transition, TaskStateMachine};
