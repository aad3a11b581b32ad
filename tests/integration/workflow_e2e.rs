//! End-to-end task execution tests.
//!
//! These tests verify that a submitted plan runs to its outcome through the
//! scheduler: ordering by dependencies, output propagation into inputs,
//! group policies on failure and checkpoint approval.

use serde_json::json;

use tasktree::core::{CheckpointConfig, ParallelPolicy, StepStatus, TaskStatus};
use tasktree::orchestration::{StepError, TaskEvent};

use crate::fixtures::{has_status, inputs, step, Behavior, FakeExecutor, Harness};

/// Test: Best-effort group keeps going after a sibling fails
/// Given A, then B and C in best-effort group g1
/// When B fails permanently
/// Then C still completes and the task ends FAILED
#[tokio::test]
async fn test_best_effort_group_finishes_despite_failure() {
    let executor = FakeExecutor::new();
    executor.script("b", Behavior::Fail(StepError::permanent("invalid input")));
    let mut h = Harness::new(executor);

    let task = h
        .submit_with_policies(
            vec![
                step("a"),
                step("b").depends_on(&["a"]).in_group("g1"),
                step("c").depends_on(&["a"]).in_group("g1"),
            ],
            &[("g1", ParallelPolicy::BestEffort)],
        )
        .await;
    h.run(&task.id).await;

    let stored = h.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.step("a").unwrap().status, StepStatus::Done);
    assert_eq!(stored.step("b").unwrap().status, StepStatus::Failed);
    assert_eq!(stored.step("c").unwrap().status, StepStatus::Done);

    let adapter = &h.scheduler.context().adapter;
    assert_eq!(
        adapter.is_task_complete(task.tree_id()).await.unwrap(),
        (true, Some(TaskStatus::Failed))
    );

    // Exactly one terminal event, even though C finished after B.
    let completions: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, TaskEvent::TaskCompleted { .. }))
        .collect();
    assert_eq!(completions.len(), 1);
}

/// Test: Linear chain with templated inputs
/// Given fetch -> summarize where summarize references fetch's output
/// When the task runs
/// Then summarize receives the resolved value and the task completes
#[tokio::test]
async fn test_chain_passes_outputs_into_inputs() {
    let mut h = Harness::new(FakeExecutor::new());

    let mut fetch = step("fetch");
    fetch.inputs = inputs(json!({"url": "https://example.com", "pages": 3}));
    let mut summarize = step("summarize").depends_on(&["fetch"]);
    summarize.inputs = inputs(json!({
        "source": "{{fetch.outputs.url}}",
        "pages": "{{fetch.outputs.pages}}",
        "prompt": "Summarize {{fetch.outputs.pages}} pages"
    }));

    let task = h.submit(vec![fetch, summarize]).await;
    h.run(&task.id).await;

    let stored = h.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.completed_at.is_some());

    let outputs = stored.step("summarize").unwrap().outputs.clone().unwrap();
    assert_eq!(outputs["source"], json!("https://example.com"));
    assert_eq!(outputs["pages"], json!(3));
    assert_eq!(outputs["prompt"], json!("Summarize 3 pages"));

    let calls: Vec<String> = h.executor.calls().into_iter().map(|(id, _)| id).collect();
    assert_eq!(calls, vec!["fetch", "summarize"]);

    assert_eq!(
        h.drain_event_names(),
        vec![
            "step_started",
            "step_completed",
            "step_started",
            "step_completed",
            "task_completed"
        ]
    );
    // One message per step plus the completion summary.
    assert_eq!(h.inbox.messages().len(), 3);
}

/// Test: Diamond dependencies
/// Given a -> (b, c) -> d
/// When the task runs
/// Then d starts only after both b and c finished
#[tokio::test]
async fn test_diamond_runs_join_last() {
    let h = Harness::new(FakeExecutor::new());
    let task = h
        .submit(vec![
            step("a"),
            step("b").depends_on(&["a"]),
            step("c").depends_on(&["a"]),
            step("d").depends_on(&["b", "c"]),
        ])
        .await;
    h.run(&task.id).await;

    let stored = h.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Completed);

    let calls: Vec<String> = h.executor.calls().into_iter().map(|(id, _)| id).collect();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls.first().map(String::as_str), Some("a"));
    assert_eq!(calls.last().map(String::as_str), Some("d"));
}

/// Test: Checkpoint approval
/// Given a -> review (checkpoint) -> publish
/// When the task reaches review
/// Then it parks at CHECKPOINT until approved, then completes
#[tokio::test]
async fn test_checkpoint_blocks_until_approved() {
    let mut h = Harness::new(FakeExecutor::new());
    let review = step("review")
        .depends_on(&["a"])
        .with_checkpoint(CheckpointConfig {
            message: Some("Approve the draft?".to_string()),
            ..Default::default()
        });
    let task = h
        .submit(vec![step("a"), review, step("publish").depends_on(&["review"])])
        .await;
    h.run(&task.id).await;

    let parked = h.task(&task.id).await;
    assert_eq!(parked.status, TaskStatus::Checkpoint);
    assert_eq!(parked.step("review").unwrap().status, StepStatus::Checkpoint);
    assert_eq!(h.tree_status(&task, "publish").await, StepStatus::Pending);
    assert_eq!(h.executor.calls_for("review"), 0);

    let checkpoint = h
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            TaskEvent::CheckpointCreated { step_id, message, .. } => Some((step_id, message)),
            _ => None,
        })
        .expect("checkpoint event");
    assert_eq!(checkpoint.0, "review");
    assert_eq!(checkpoint.1.as_deref(), Some("Approve the draft?"));

    // Resuming without approval parks the step again.
    assert!(h.scheduler.resume_checkpoint(&task.id, "review").await.unwrap());
    h.idle(&task.id).await;
    assert_eq!(h.task(&task.id).await.status, TaskStatus::Checkpoint);
    assert_eq!(h.checkpoints.pending().len(), 1);

    assert!(h.checkpoints.approve(&task.id, "review").unwrap());
    assert!(h.scheduler.resume_checkpoint(&task.id, "review").await.unwrap());
    let done = h.wait_for(&task.id, has_status(TaskStatus::Completed)).await;
    h.idle(&task.id).await;

    assert_eq!(done.step("review").unwrap().status, StepStatus::Done);
    assert_eq!(done.step("publish").unwrap().status, StepStatus::Done);
    assert!(h.checkpoints.pending().is_empty());
}

/// Test: Resuming a step that is not parked
/// Given a completed step
/// When resume_checkpoint is called for it
/// Then nothing is dispatched
#[tokio::test]
async fn test_resume_checkpoint_ignores_unparked_steps() {
    let h = Harness::new(FakeExecutor::new());
    let task = h
        .submit(vec![
            step("a"),
            step("gate").depends_on(&["a"]).with_checkpoint(CheckpointConfig::default()),
        ])
        .await;
    h.run(&task.id).await;

    assert!(!h.scheduler.resume_checkpoint(&task.id, "a").await.unwrap());
    assert!(!h.scheduler.resume_checkpoint(&task.id, "missing").await.unwrap());
    assert_eq!(h.executor.calls_for("a"), 1);
}

/// Test: Plan validation happens before anything is stored
/// Given a plan with a dependency cycle
/// When it is submitted
/// Then submission fails and no task or tree exists
#[tokio::test]
async fn test_cyclic_plan_is_rejected() {
    let h = Harness::new(FakeExecutor::new());
    let mut task = tasktree::core::Task::new("user-1", "cyclic");
    task.steps = vec![step("a").depends_on(&["b"]), step("b").depends_on(&["a"])];
    let id = task.id.clone();

    let err = h.scheduler.submit_task(task).await.unwrap_err();
    assert!(matches!(err, tasktree::Error::CycleDetected(_)));

    let ctx = h.scheduler.context();
    assert!(ctx.repository().get_task(&id).await.unwrap().is_none());
    assert!(!ctx.adapter.tree_exists(&id).await.unwrap());
}
