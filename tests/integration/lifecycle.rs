//! Task lifecycle tests.
//!
//! These tests verify retries with backoff, the fallback agent,
//! cancellation, pause/resume and retrying a failed task.

use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use tasktree::config::Config;
use tasktree::core::{FallbackConfig, StepStatus, TaskStatus};
use tasktree::orchestration::{StepError, TaskEvent};

use crate::fixtures::{
    has_status, is_terminal, step, test_config, Behavior, FakeExecutor, Harness,
};

/// Test defaults with a backoff long enough to outlast any test.
fn long_backoff(max_concurrent_steps: usize) -> Config {
    Config {
        max_concurrent_steps,
        retry_base_delay_ms: 60_000,
        retry_max_delay_ms: 60_000,
        ..test_config()
    }
}

/// Test: Transient failures are retried by the scheduler
/// Given a step that hits two rate limits before succeeding
/// When the task runs with a budget of three retries
/// Then the step completes after three attempts
#[tokio::test]
async fn test_transient_failures_are_retried_with_backoff() {
    let executor = FakeExecutor::new();
    executor
        .script("a", Behavior::Fail(StepError::new("429 rate limit exceeded")))
        .script("a", Behavior::Fail(StepError::new("upstream connection reset")));
    let h = Harness::new(executor);

    let mut a = step("a");
    a.max_retries = 3;
    let task = h.submit(vec![a, step("b").depends_on(&["a"])]).await;
    h.run(&task.id).await;

    let stored = h.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Completed);
    let a = stored.step("a").unwrap();
    assert_eq!(a.status, StepStatus::Done);
    assert_eq!(a.retry_count, 2);
    assert_eq!(a.error_message, None);
    assert_eq!(h.executor.calls_for("a"), 3);
    assert_eq!(h.executor.calls_for("b"), 1);
}

/// Test: Retry budget exhaustion
/// Given a step that always times out with one retry allowed
/// When the task runs
/// Then the step fails after two attempts and the task fails
#[tokio::test]
async fn test_retry_budget_exhaustion_fails_task() {
    let executor = FakeExecutor::new();
    for _ in 0..3 {
        executor.script("a", Behavior::Fail(StepError::new("gateway timeout")));
    }
    let mut h = Harness::new(executor);

    let mut a = step("a");
    a.max_retries = 1;
    let task = h.submit(vec![a]).await;
    h.run(&task.id).await;

    let stored = h.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.step("a").unwrap().status, StepStatus::Failed);
    assert_eq!(h.executor.calls_for("a"), 2);

    let failed = h
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            TaskEvent::StepFailed {
                error, retry_count, ..
            } => Some((error, retry_count)),
            _ => None,
        })
        .expect("step_failed event");
    assert_eq!(failed, ("gateway timeout".to_string(), 1));
}

/// Test: Explicitly permanent errors are not retried
/// Given an error typed permanent whose message looks transient
/// When the step fails
/// Then it is not retried
#[tokio::test]
async fn test_typed_permanent_error_wins_over_message() {
    let executor = FakeExecutor::new();
    executor.script("a", Behavior::Fail(StepError::permanent("503 but do not retry")));
    let h = Harness::new(executor);
    let task = h.submit(vec![step("a")]).await;
    h.run(&task.id).await;

    assert_eq!(h.task(&task.id).await.status, TaskStatus::Failed);
    assert_eq!(h.executor.calls_for("a"), 1);
}

/// Test: Fallback agent
/// Given a step with a fallback agent configured
/// When the primary agent fails permanently
/// Then the step is re-dispatched once with the fallback agent
#[tokio::test]
async fn test_fallback_agent_rescues_step() {
    let executor = FakeExecutor::new();
    executor.script("a", Behavior::Fail(StepError::permanent("unsupported language")));
    let h = Harness::new(executor);

    let mut a = step("a");
    a.fallback_config = Some(FallbackConfig {
        fallback_agent_type: Some("generalist".to_string()),
        retry_delay_ms: None,
    });
    let task = h.submit(vec![a]).await;
    h.run(&task.id).await;

    assert_eq!(h.task(&task.id).await.status, TaskStatus::Completed);
    assert_eq!(
        h.executor.calls(),
        vec![
            ("a".to_string(), "worker".to_string()),
            ("a".to_string(), "generalist".to_string())
        ]
    );
}

/// Test: Cancelling a running task
/// Given a task whose only step never finishes on its own
/// When the task is cancelled
/// Then the step is SKIPPED and the task stays CANCELLED
#[tokio::test]
async fn test_cancel_task_stops_running_steps() {
    let executor = FakeExecutor::new();
    executor.script("a", Behavior::Hang);
    let mut h = Harness::new(executor);
    let task = h.submit(vec![step("a"), step("b").depends_on(&["a"])]).await;

    h.scheduler.start_task(&task.id).await.unwrap();
    h.wait_for(&task.id, |t| {
        t.step("a").map(|s| s.status) == Some(StepStatus::Running)
    })
    .await;

    let cancelled = h.scheduler.cancel_task(&task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    h.idle(&task.id).await;

    let stored = h.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert_eq!(stored.step("a").unwrap().status, StepStatus::Skipped);
    assert_eq!(stored.step("b").unwrap().status, StepStatus::Pending);
    assert!(!h
        .drain_event_names()
        .contains(&"task_completed"));

    // A cancelled task cannot be cancelled twice.
    assert_err!(h.scheduler.cancel_task(&task.id).await);
}

/// Test: Pause and resume
/// Given a running two-step chain
/// When the task is paused right after starting
/// Then no dependent starts until the task is resumed
#[tokio::test]
async fn test_pause_holds_dependents_until_resume() {
    let h = Harness::new(FakeExecutor::with_delay(Duration::from_millis(20)));
    let task = h.submit(vec![step("a"), step("b").depends_on(&["a"])]).await;

    h.scheduler.start_task(&task.id).await.unwrap();
    let paused = h.scheduler.pause_task(&task.id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    h.idle(&task.id).await;

    assert_eq!(h.task(&task.id).await.status, TaskStatus::Paused);
    assert_eq!(h.executor.calls_for("b"), 0);
    assert_eq!(h.tree_status(&task, "b").await, StepStatus::Pending);

    assert_ok!(h.scheduler.resume_task(&task.id).await);
    let done = h.wait_for(&task.id, is_terminal).await;
    h.idle(&task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(h.executor.calls_for("b"), 1);
}

/// Test: Retrying a failed task
/// Given a task that failed on its first step
/// When it is retried and restarted
/// Then the failed step runs again with a fresh budget and the task completes
#[tokio::test]
async fn test_retry_task_after_failure() {
    let executor = FakeExecutor::new();
    executor.script("a", Behavior::Fail(StepError::permanent("disk full")));
    let h = Harness::new(executor);
    let task = h.submit(vec![step("a"), step("b").depends_on(&["a"])]).await;
    h.run(&task.id).await;
    assert_eq!(h.task(&task.id).await.status, TaskStatus::Failed);

    let ready = h.scheduler.retry_task(&task.id).await.unwrap();
    assert_eq!(ready.status, TaskStatus::Ready);
    let a = ready.step("a").unwrap();
    assert_eq!(a.status, StepStatus::Pending);
    assert_eq!(a.retry_count, 0);
    assert_eq!(a.error_message, None);
    assert_eq!(h.tree_status(&task, "a").await, StepStatus::Pending);

    h.run(&task.id).await;
    let done = h.wait_for(&task.id, has_status(TaskStatus::Completed)).await;
    assert_eq!(done.step("b").unwrap().status, StepStatus::Done);
    assert_eq!(h.executor.calls_for("a"), 2);
}

/// Test: Retrying a task that is still running is rejected
#[tokio::test]
async fn test_retry_task_requires_failed_or_cancelled() {
    let h = Harness::new(FakeExecutor::new());
    let task = h.submit(vec![step("a")]).await;
    assert_err!(h.scheduler.retry_task(&task.id).await);
    assert_err!(h.scheduler.resume_task(&task.id).await);
    assert_ok!(h.scheduler.start_task(&task.id).await);
    h.idle(&task.id).await;
}

/// Test: Retrying a task ends invocations of the previous run
/// Given a failed task whose other step is waiting out a long backoff
/// When the task is retried
/// Then the waiting invocation ends, its step gets a fresh budget and the
/// task completes on the next start
#[tokio::test]
async fn test_retry_task_ends_backoff_of_previous_run() {
    let executor = FakeExecutor::new();
    executor
        .script("a", Behavior::Fail(StepError::permanent("disk full")))
        .script("c", Behavior::Fail(StepError::new("429 rate limit exceeded")));
    let h = Harness::with_config(executor, long_backoff(4));
    let task = h.submit(vec![step("a"), step("c")]).await;

    h.scheduler.start_task(&task.id).await.unwrap();
    h.wait_for(&task.id, |t| {
        t.status == TaskStatus::Failed && t.step("c").map(|s| s.retry_count) == Some(1)
    })
    .await;

    let ready = tokio::time::timeout(Duration::from_secs(5), h.scheduler.retry_task(&task.id))
        .await
        .expect("retry_task waited for the backoff")
        .unwrap();
    assert_eq!(ready.status, TaskStatus::Ready);
    assert_eq!(h.scheduler.in_flight(&task.id), 0);
    let c = ready.step("c").unwrap();
    assert_eq!(c.status, StepStatus::Pending);
    assert_eq!(c.retry_count, 0);
    assert_eq!(h.tree_status(&task, "c").await, StepStatus::Pending);

    h.run(&task.id).await;
    let done = h.wait_for(&task.id, has_status(TaskStatus::Completed)).await;
    assert_eq!(done.step("c").unwrap().status, StepStatus::Done);
    assert_eq!(h.executor.calls_for("a"), 2);
    assert_eq!(h.executor.calls_for("c"), 2);
}

/// Test: A step waiting out a backoff frees its concurrency slot
/// Given a single slot, a step with a long backoff and an independent step
/// When the first step fails transiently
/// Then the independent step runs while the first one waits
#[tokio::test]
async fn test_backoff_releases_concurrency_slot() {
    let executor = FakeExecutor::new();
    executor.script("a", Behavior::Fail(StepError::new("429 rate limit exceeded")));
    let h = Harness::with_config(executor, long_backoff(1));
    let task = h.submit(vec![step("a"), step("b")]).await;

    h.scheduler.start_task(&task.id).await.unwrap();
    let waiting = h
        .wait_for(&task.id, |t| {
            t.step("a").map(|s| s.retry_count) == Some(1)
                && t.step("b").map(|s| s.status) == Some(StepStatus::Done)
        })
        .await;
    assert_eq!(waiting.status, TaskStatus::Executing);
    assert_eq!(waiting.step("a").unwrap().status, StepStatus::Pending);
    assert_eq!(h.executor.calls_for("a"), 1);
    assert!(h.scheduler.is_dispatched(&task.id, "a"));

    assert_ok!(h.scheduler.cancel_task(&task.id).await);
    h.idle(&task.id).await;
}
