//! Integration test suite for tasktree.
//!
//! These tests drive whole tasks through the scheduler, the step use case
//! and the tree and task stores together.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full task execution, inputs and checkpoints
//! - `parallel_groups`: Group failure policies and the concurrency bound
//! - `lifecycle`: Retries, cancellation, pause/resume and task retry
//! - `recovery`: File-backed stores surviving a restart
//!
//! Steps run against a scripted in-process executor, so the suite needs no
//! network or external services.

mod fixtures;

mod lifecycle;
mod parallel_groups;
mod recovery;
mod workflow_e2e;
