//! Parallel group policy and concurrency tests.
//!
//! These tests verify that the scheduler honors FAIL_FAST and
//! ALL_OR_NOTHING groups and never exceeds the per-task step bound.

use std::time::Duration;

use tasktree::core::{ParallelPolicy, StepStatus, TaskStatus};
use tasktree::orchestration::StepError;

use crate::fixtures::{step, test_config, Behavior, FakeExecutor, Harness};

/// Test: Fail-fast cancels running siblings
/// Given A, then B and C in fail-fast group g
/// When B fails permanently while C is still running
/// Then C is cancelled and recorded as SKIPPED
#[tokio::test]
async fn test_fail_fast_cancels_running_sibling() {
    let executor = FakeExecutor::new();
    executor
        .script("b", Behavior::Fail(StepError::permanent("bad request")))
        .script("c", Behavior::Hang);
    let h = Harness::new(executor);

    let task = h
        .submit_with_policies(
            vec![
                step("a"),
                step("b").depends_on(&["a"]).in_group("g"),
                step("c").depends_on(&["a"]).in_group("g"),
            ],
            &[("g", ParallelPolicy::FailFast)],
        )
        .await;
    h.run(&task.id).await;

    let stored = h.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.step("b").unwrap().status, StepStatus::Failed);
    assert_eq!(stored.step("c").unwrap().status, StepStatus::Skipped);
    assert_eq!(h.tree_status(&task, "c").await, StepStatus::Skipped);
}

/// Test: Fail-fast skips siblings that never started
/// Given fail-fast group g where D waits on a step outside the group
/// When B fails
/// Then D is skipped and never dispatched
#[tokio::test]
async fn test_fail_fast_skips_pending_sibling() {
    let executor = FakeExecutor::new();
    executor
        .script("b", Behavior::Fail(StepError::permanent("bad request")))
        .script("slow", Behavior::Hang);
    let h = Harness::new(executor);

    let task = h
        .submit_with_policies(
            vec![
                step("slow"),
                step("b").in_group("g"),
                step("d").depends_on(&["slow"]).in_group("g"),
            ],
            &[("g", ParallelPolicy::FailFast)],
        )
        .await;
    h.scheduler.start_task(&task.id).await.unwrap();

    let failed = h
        .wait_for(&task.id, |t| {
            t.step("d").map(|s| s.status) == Some(StepStatus::Skipped)
        })
        .await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.step("b").unwrap().status, StepStatus::Failed);
    assert_eq!(h.executor.calls_for("d"), 0);
    // "slow" is outside the group and keeps running.
    assert!(h.scheduler.is_dispatched(&task.id, "slow"));
}

/// Test: All-or-nothing waits for the whole group
/// Given X ready at once and Y in the same group waiting on A
/// When the task starts
/// Then X is held back until Y is ready too
#[tokio::test]
async fn test_all_or_nothing_dispatches_together() {
    let h = Harness::new(FakeExecutor::with_delay(Duration::from_millis(30)));
    let task = h
        .submit_with_policies(
            vec![
                step("a"),
                step("x").in_group("g"),
                step("y").depends_on(&["a"]).in_group("g"),
            ],
            &[("g", ParallelPolicy::AllOrNothing)],
        )
        .await;

    assert_eq!(h.scheduler.start_task(&task.id).await.unwrap(), 1);
    assert!(h.scheduler.is_dispatched(&task.id, "a"));
    assert!(!h.scheduler.is_dispatched(&task.id, "x"));
    h.idle(&task.id).await;

    let stored = h.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Completed);
    let calls: Vec<String> = h.executor.calls().into_iter().map(|(id, _)| id).collect();
    assert_eq!(calls.first().map(String::as_str), Some("a"));
}

/// Test: All-or-nothing failure stops the group
/// Given X and Y in an all-or-nothing group
/// When X fails
/// Then Y is cancelled
#[tokio::test]
async fn test_all_or_nothing_failure_cancels_group() {
    let executor = FakeExecutor::new();
    executor
        .script("x", Behavior::Fail(StepError::permanent("broken")))
        .script("y", Behavior::Hang);
    let h = Harness::new(executor);
    let task = h
        .submit_with_policies(
            vec![step("x").in_group("g"), step("y").in_group("g")],
            &[("g", ParallelPolicy::AllOrNothing)],
        )
        .await;
    h.run(&task.id).await;

    let stored = h.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.step("y").unwrap().status, StepStatus::Skipped);
}

/// Test: Concurrency bound
/// Given eight independent steps and max_concurrent_steps = 3
/// When the task runs
/// Then at most three steps execute at once and all complete
#[tokio::test]
async fn test_concurrency_bound_is_respected() {
    let config = tasktree::config::Config {
        max_concurrent_steps: 3,
        ..test_config()
    };
    let h = Harness::with_config(FakeExecutor::with_delay(Duration::from_millis(25)), config);
    let steps = (0..8).map(|i| step(&format!("s{}", i))).collect();
    let task = h.submit(steps).await;

    assert_eq!(h.scheduler.start_task(&task.id).await.unwrap(), 8);
    assert_eq!(h.scheduler.in_flight(&task.id), 8);
    h.idle(&task.id).await;

    assert!(h.executor.peak() <= 3, "peak was {}", h.executor.peak());
    assert_eq!(h.executor.calls().len(), 8);
    assert_eq!(h.task(&task.id).await.status, TaskStatus::Completed);
}
