//! Orchestration layer for task execution.
//!
//! This module runs the steps of a task against its execution tree: the
//! step execution use case drives one step through dispatch, retry and
//! checkpoint handling, and the scheduler fans ready steps out to it under
//! a per-task concurrency bound and the parallel group policies.

mod context;
mod executor;
mod inputs;
mod ports;
mod scheduler;
mod step;

pub use context::EngineContext;
pub use executor::{
    is_transient_error, ErrorKind, ExecutionResult, StepError, StepExecutor,
    TRANSIENT_ERROR_PATTERNS,
};
pub use inputs::resolve_inputs;
pub use ports::{
    ChannelEventBus, CheckpointRecord, CheckpointService, EventBus, Inbox, InboxKind,
    InboxMessage, MemoryCheckpointService, MemoryInbox, TaskEvent,
};
pub use scheduler::Scheduler;
pub use step::{
    ReadyStepScheduler, StepExecutionResult, StepExecutionUseCase, StepOutcome, StepRequest,
    StepSource,
};
