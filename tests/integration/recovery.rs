//! Restart and recovery integration tests.
//!
//! These tests verify that tasks and trees written through the file-backed
//! stores survive a restart and that execution picks up where it stopped.

use tempfile::TempDir;
use tokio_test::assert_err;

use tasktree::core::{CheckpointConfig, StepStatus, StepUpdate, TaskStatus};

use crate::fixtures::{has_status, step, FakeExecutor, Harness};

/// Test: Checkpointed task survives a restart
/// Given a task parked at a checkpoint on disk
/// When the stores are reopened by a fresh scheduler
/// Then the task state is intact and it can be approved and finished
#[tokio::test]
async fn test_checkpointed_task_resumes_after_restart() {
    let dir = TempDir::new().expect("Failed to create temp directory");

    let (task_id, tree_id) = {
        let h = Harness::on_disk(FakeExecutor::new(), dir.path()).await;
        let task = h
            .submit(vec![
                step("a"),
                step("review")
                    .depends_on(&["a"])
                    .with_checkpoint(CheckpointConfig::default()),
            ])
            .await;
        h.run(&task.id).await;
        assert_eq!(h.task(&task.id).await.status, TaskStatus::Checkpoint);
        (task.id.clone(), task.tree_id().to_string())
    };

    let h = Harness::on_disk(FakeExecutor::new(), dir.path()).await;
    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Checkpoint);
    assert_eq!(task.tree_id(), tree_id);
    assert_eq!(task.step("a").unwrap().status, StepStatus::Done);
    assert_eq!(h.tree_status(&task, "a").await, StepStatus::Done);
    assert_eq!(h.tree_status(&task, "review").await, StepStatus::Checkpoint);

    // Approvals live in memory, so the new process asks again.
    assert!(h.scheduler.resume_checkpoint(&task_id, "review").await.unwrap());
    h.idle(&task_id).await;
    assert_eq!(h.checkpoints.pending().len(), 1);

    h.checkpoints.approve(&task_id, "review").unwrap();
    assert!(h.scheduler.resume_checkpoint(&task_id, "review").await.unwrap());
    let done = h.wait_for(&task_id, has_status(TaskStatus::Completed)).await;
    h.idle(&task_id).await;
    assert_eq!(done.step("review").unwrap().status, StepStatus::Done);
    assert_eq!(h.executor.calls_for("a"), 0);
}

/// Test: Completed outputs are reused after a restart
/// Given a chain whose first step finished before the process stopped
/// When a new scheduler resumes the paused task
/// Then only the remaining step runs, with the stored output as input
#[tokio::test]
async fn test_paused_task_continues_after_restart() {
    let dir = TempDir::new().expect("Failed to create temp directory");

    let task_id = {
        let h = Harness::on_disk(FakeExecutor::new(), dir.path()).await;
        let mut first = step("a");
        first.inputs = crate::fixtures::inputs(serde_json::json!({"value": 42}));
        let mut second = step("b").depends_on(&["a"]);
        second.inputs = crate::fixtures::inputs(serde_json::json!({"from_a": "{{a.outputs.value}}"}));
        let task = h.submit(vec![first, second]).await;

        // Pause once A is done so B never starts in this process.
        h.scheduler.start_task(&task.id).await.unwrap();
        h.scheduler.pause_task(&task.id).await.unwrap();
        h.idle(&task.id).await;
        task.id.clone()
    };

    let h = Harness::on_disk(FakeExecutor::new(), dir.path()).await;
    assert_eq!(h.task(&task_id).await.status, TaskStatus::Paused);

    h.scheduler.resume_task(&task_id).await.unwrap();
    let done = h.wait_for(&task_id, has_status(TaskStatus::Completed)).await;
    h.idle(&task_id).await;

    let b = done.step("b").unwrap();
    assert_eq!(b.status, StepStatus::Done);
    assert_eq!(b.outputs.as_ref().unwrap()["from_a"], serde_json::json!(42));
    assert_eq!(h.executor.calls_for("b"), 1);
}

/// Test: A step interrupted mid-run is dispatched again after a restart
/// Given a chain whose first step was RUNNING on disk when the process stopped
/// When a new scheduler recovers the task
/// Then the interrupted step runs again and the task completes
#[tokio::test]
async fn test_interrupted_step_is_redispatched_after_restart() {
    let dir = TempDir::new().expect("Failed to create temp directory");

    let task_id = {
        let h = Harness::on_disk(FakeExecutor::new(), dir.path()).await;
        let task = h.submit(vec![step("a"), step("b").depends_on(&["a"])]).await;
        let ctx = h.scheduler.context();
        ctx.state_machine
            .transition(&task.id, TaskStatus::Executing)
            .await
            .unwrap();
        ctx.adapter.start_step(task.tree_id(), "a").await.unwrap();
        ctx.repository()
            .update_step(&task.id, "a", &StepUpdate::status(StepStatus::Running))
            .await
            .unwrap();
        task.id.clone()
    };

    let h = Harness::on_disk(FakeExecutor::new(), dir.path()).await;
    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Executing);
    assert_eq!(task.step("a").unwrap().status, StepStatus::Running);
    assert_eq!(h.tree_status(&task, "a").await, StepStatus::Running);
    assert_err!(h.scheduler.start_task(&task_id).await);

    assert_eq!(h.scheduler.recover_task(&task_id).await.unwrap(), 1);
    let done = h.wait_for(&task_id, has_status(TaskStatus::Completed)).await;
    h.idle(&task_id).await;

    assert_eq!(done.step("a").unwrap().status, StepStatus::Done);
    assert_eq!(done.step("b").unwrap().status, StepStatus::Done);
    assert_eq!(h.executor.calls_for("a"), 1);
    assert_eq!(h.executor.calls_for("b"), 1);

    // Nothing left to pick up once the task finished.
    assert_eq!(h.scheduler.recover_task(&task_id).await.unwrap(), 0);
}

/// Test: Recovering a paused task only resets its interrupted steps
/// Given a paused task with a step left RUNNING on disk
/// When a new scheduler recovers and then resumes it
/// Then nothing runs until the resume, and the step runs once after it
#[tokio::test]
async fn test_recovered_paused_task_waits_for_resume() {
    let dir = TempDir::new().expect("Failed to create temp directory");

    let task_id = {
        let h = Harness::on_disk(FakeExecutor::new(), dir.path()).await;
        let task = h.submit(vec![step("a")]).await;
        let ctx = h.scheduler.context();
        ctx.state_machine
            .transition(&task.id, TaskStatus::Executing)
            .await
            .unwrap();
        ctx.adapter.start_step(task.tree_id(), "a").await.unwrap();
        ctx.state_machine
            .transition(&task.id, TaskStatus::Paused)
            .await
            .unwrap();
        task.id.clone()
    };

    let h = Harness::on_disk(FakeExecutor::new(), dir.path()).await;
    assert_eq!(h.scheduler.recover_task(&task_id).await.unwrap(), 0);
    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(h.tree_status(&task, "a").await, StepStatus::Pending);
    assert_eq!(h.executor.calls_for("a"), 0);

    h.scheduler.resume_task(&task_id).await.unwrap();
    h.wait_for(&task_id, has_status(TaskStatus::Completed)).await;
    h.idle(&task_id).await;
    assert_eq!(h.executor.calls_for("a"), 1);
}
