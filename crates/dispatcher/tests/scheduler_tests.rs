//! 调度器集成测试：到期作业、pingback、内部轮询与重启恢复

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use taskmesh_core::models::{TaskStatus, TaskType};
use taskmesh_core::traits::TaskRepository;
use taskmesh_dispatcher::{ActionRegistry, HandlerOptions, JobBoard, JobKind, UPDATE_TASK_ACTION};
use taskmesh_testing_utils::TaskBuilder;

use engine_test_utils::{task_envelope, EchoHandler, TestContext};

fn task_options() -> HandlerOptions {
    HandlerOptions {
        is_task: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_expiration_fires_exactly_once() {
    let ctx = TestContext::new(ActionRegistry::new());
    let scheduler = ctx.scheduler();

    let mut sub = remote_submission();
    sub.expiration_date = Some(Utc::now() - chrono::Duration::seconds(5));
    let task = ctx.engine.create_task(sub).await.unwrap();

    let fired = scheduler.tick(Utc::now()).await;
    assert_eq!(fired, 1);

    let stored = ctx.task_repo.get_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Error);
    assert_eq!(stored.output_data, Some(json!({"error": "expired"})));
    assert!(!stored.expiration_pending);

    // 作业触发前已摘除，后续tick不会再触发
    assert_eq!(scheduler.tick(Utc::now()).await, 0);
    assert_eq!(scheduler.tick(Utc::now() + chrono::Duration::seconds(30)).await, 0);
}

#[tokio::test]
async fn test_expiration_is_noop_on_finished_task() {
    let ctx = TestContext::new(ActionRegistry::new());

    let task = TaskBuilder::new()
        .with_id("t-done")
        .with_status(TaskStatus::Finished)
        .with_output(json!({"n": 1}))
        .build();
    ctx.task_repo.insert(&task).await.unwrap();

    ctx.engine.fire_expiration("t-done").await.unwrap();

    let stored = ctx.task_repo.get_by_id("t-done").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Finished);
    assert_eq!(stored.output_data, Some(json!({"n": 1})));
}

#[tokio::test]
async fn test_pingback_reports_progress_to_sender() {
    let mut registry = ActionRegistry::new();
    registry
        .register("vote.hold", "election", Arc::new(EchoHandler), task_options())
        .unwrap();
    let ctx = TestContext::new(registry);
    let scheduler = ctx.scheduler();

    // 同步任务：处理器返回后不自动finished，停在executing等显式完成
    let mut envelope = task_envelope(
        "msg-ping",
        "task-ping",
        "vote.hold",
        "election",
        "synchronous",
        json!({"phase": "open"}),
    );
    envelope["pingback_date"] = json!(Utc::now() - chrono::Duration::seconds(1));
    ctx.engine.receive_message(envelope).await.unwrap();

    let stored = ctx.task_repo.get_by_id("task-ping").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Executing);
    assert!(ctx.board.pending("task-ping", JobKind::Pingback));

    let fired = scheduler.tick(Utc::now()).await;
    assert!(fired >= 1);

    // 发送方收到executing进度更新
    let updates = ctx.transport.deliveries_for_action(UPDATE_TASK_ACTION);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["task_id"], json!("task-ping"));
    assert_eq!(updates[0]["input_data"]["status"], json!("executing"));

    // 信封里没有周期间隔，一次性pingback不再重arm
    assert!(!ctx.board.pending("task-ping", JobKind::Pingback));
}

#[tokio::test]
async fn test_recover_jobs_after_restart() {
    let ctx = TestContext::new(ActionRegistry::new());

    // 节点宕机前落库的pending标志
    let expiring = TaskBuilder::new()
        .with_id("t-exp")
        .with_status(TaskStatus::Sent)
        .with_expiration(Utc::now() + chrono::Duration::seconds(120))
        .build();
    ctx.task_repo.insert(&expiring).await.unwrap();

    let mut pinging = TaskBuilder::new()
        .with_id("t-ping")
        .received()
        .with_status(TaskStatus::Executing)
        .build();
    pinging.pingback_pending = true;
    pinging.pingback_date = Some(Utc::now() + chrono::Duration::seconds(60));
    ctx.task_repo.insert(&pinging).await.unwrap();

    assert!(ctx.board.is_empty());
    let scheduler = ctx.scheduler();
    scheduler.start().await.unwrap();

    assert!(ctx.board.pending("t-exp", JobKind::Expiration));
    assert!(ctx.board.pending("t-ping", JobKind::Pingback));
}

#[tokio::test]
async fn test_internal_poll_completes_missed_chord() {
    let ctx = TestContext::new(ActionRegistry::new());

    // 扇入时机被错过的chord：父任务仍在等待，子任务其实都已完成
    let parent = TaskBuilder::new()
        .with_id("p-1")
        .with_type(TaskType::Chord)
        .with_queue("election")
        .received()
        .with_status(TaskStatus::WaitingSubtasks)
        .build();
    ctx.task_repo.insert(&parent).await.unwrap();

    for (order, output) in [(0, json!({"x": 1})), (1, json!({"x": 2}))] {
        let subtask = TaskBuilder::new()
            .with_id(&format!("p-1-s{order}"))
            .with_queue("election")
            .with_parent("p-1", order)
            .with_status(TaskStatus::Finished)
            .with_output(output)
            .build();
        ctx.task_repo.insert(&subtask).await.unwrap();
    }

    ctx.engine.internal_poll("election").await.unwrap();

    let stored = ctx.task_repo.get_by_id("p-1").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Finished);
    assert_eq!(stored.output_data, Some(json!([{"x": 1}, {"x": 2}])));

    // 补扫出的终态同样回报发送方
    let updates = ctx.transport.deliveries_for_action(UPDATE_TASK_ACTION);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["task_id"], json!("p-1"));
}

#[tokio::test]
async fn test_internal_poll_rearms_after_firing() {
    let mut registry = ActionRegistry::new();
    registry
        .register("vote.count", "election", Arc::new(EchoHandler), task_options())
        .unwrap();
    let ctx = TestContext::new(registry);
    let scheduler = ctx.scheduler();

    scheduler.start().await.unwrap();
    assert!(ctx.board.pending("election", JobKind::InternalPoll));

    // 轮询触发后自动重arm
    let later = Utc::now() + chrono::Duration::seconds(5);
    let fired = scheduler.tick(later).await;
    assert_eq!(fired, 1);
    assert!(ctx.board.pending("election", JobKind::InternalPoll));
}

#[tokio::test]
async fn test_pingback_interval_rearms_until_terminal() {
    let ctx = TestContext::new(ActionRegistry::new());

    // 带周期间隔的长任务：每次pingback触发后重新arm
    let mut task = TaskBuilder::new()
        .with_id("t-loop")
        .received()
        .with_status(TaskStatus::Executing)
        .build();
    task.task_metadata = json!({"pingback_interval_seconds": 30});
    task.pingback_pending = true;
    task.pingback_date = Some(Utc::now());
    ctx.task_repo.insert(&task).await.unwrap();

    ctx.engine.fire_pingback("t-loop").await.unwrap();
    assert!(ctx.board.pending("t-loop", JobKind::Pingback));
    assert_eq!(ctx.transport.deliveries_for_action(UPDATE_TASK_ACTION).len(), 1);

    ctx.engine.fire_pingback("t-loop").await.unwrap();
    assert!(ctx.board.pending("t-loop", JobKind::Pingback));
    assert_eq!(ctx.transport.deliveries_for_action(UPDATE_TASK_ACTION).len(), 2);

    // 终态后作业摘除，不再重arm也不再发进度
    ctx.engine.finish_task("t-loop", Some(json!({"n": 1}))).await.unwrap();
    assert!(!ctx.board.pending("t-loop", JobKind::Pingback));
    assert_eq!(ctx.transport.deliveries_for_action(UPDATE_TASK_ACTION).len(), 3);

    ctx.engine.fire_pingback("t-loop").await.unwrap();
    assert!(!ctx.board.pending("t-loop", JobKind::Pingback));
    assert_eq!(ctx.transport.deliveries_for_action(UPDATE_TASK_ACTION).len(), 3);
}

fn remote_submission() -> taskmesh_dispatcher::TaskSubmission {
    taskmesh_dispatcher::TaskSubmission {
        task_type: TaskType::Simple,
        action: "vote.count".to_string(),
        queue_name: "election".to_string(),
        receiver_url: engine_test_utils::REMOTE_URL.to_string(),
        receiver_ssl_cert: engine_test_utils::REMOTE_CERT.to_string(),
        input_data: Some(json!({})),
        task_metadata: None,
        pingback_date: None,
        expiration_date: None,
    }
}
