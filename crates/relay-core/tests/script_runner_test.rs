//! Command tasks through the script runner: success envelopes, failure
//! with stderr capture, wall-clock timeout, and cooperative terminate.

#![cfg(unix)]

use std::time::{Duration, Instant};

use serde_json::json;

use relay_core::action::ActionRegistry;
use relay_core::scheduler::Scheduler;
use relay_core::service::NewTask;
use relay_db::models::{ExecutionStatus, TaskKind};
use relay_test_utils::{create_test_db, fast_config, wait_until};

async fn command_task(scheduler: &Scheduler, name: &str, config: serde_json::Value) -> i64 {
    let mut spec = NewTask::new(name, TaskKind::Common);
    spec.config = Some(config);
    spec.max_retries = 0;
    scheduler.create_task(spec).await.unwrap().id
}

async fn wait_terminal(scheduler: &Scheduler, execution_id: i64, timeout: Duration) {
    let done = wait_until(timeout, || {
        let scheduler = &scheduler;
        async move {
            scheduler
                .get_execution(execution_id)
                .await
                .unwrap()
                .status
                .is_terminal()
        }
    })
    .await;
    assert!(done, "command execution {execution_id} never finished");
}

#[tokio::test]
async fn successful_command_returns_a_bounded_envelope() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let scheduler = Scheduler::new(pool, fast_config(), ActionRegistry::new());

    let task_id = command_task(
        &scheduler,
        "hello",
        json!({"command": "echo hello world"}),
    )
    .await;

    let execution = scheduler.trigger_task(task_id).await.unwrap();
    wait_terminal(&scheduler, execution.id, Duration::from_secs(10)).await;

    let row = scheduler.get_execution(execution.id).await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Success);

    let result = row.result().unwrap();
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["exit_code"], json!(0));
    assert_eq!(result["command"], json!("echo hello world"));
    assert!(result.get("work_dir").is_some());
    // Stream output is never persisted.
    assert!(result.get("stdout").is_none());
    assert!(result.get("stderr").is_none());
}

#[tokio::test]
async fn failing_command_carries_the_stderr_head() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let scheduler = Scheduler::new(pool, fast_config(), ActionRegistry::new());

    let task_id = command_task(
        &scheduler,
        "boom",
        json!({"command": "sh -c 'echo kaput >&2; exit 3'"}),
    )
    .await;

    let execution = scheduler.trigger_task(task_id).await.unwrap();
    wait_terminal(&scheduler, execution.id, Duration::from_secs(10)).await;

    let row = scheduler.get_execution(execution.id).await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    let message = row.error_message.unwrap();
    assert!(message.contains("exit"), "message = {message}");
    assert!(message.contains("3"), "message = {message}");
    assert!(message.contains("kaput"), "message = {message}");
}

#[tokio::test]
async fn empty_command_is_a_validation_failure() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let scheduler = Scheduler::new(pool, fast_config(), ActionRegistry::new());

    let task_id = command_task(&scheduler, "empty", json!({"command": "   "})).await;

    let execution = scheduler.trigger_task(task_id).await.unwrap();
    wait_terminal(&scheduler, execution.id, Duration::from_secs(10)).await;

    let row = scheduler.get_execution(execution.id).await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert!(
        row.error_message
            .unwrap()
            .contains("command must not be empty")
    );
}

#[tokio::test]
async fn command_is_killed_after_its_timeout() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let scheduler = Scheduler::new(pool, fast_config(), ActionRegistry::new());

    let task_id = command_task(
        &scheduler,
        "too-slow",
        json!({"command": "sleep 30", "timeout_seconds": 1}),
    )
    .await;

    let started = Instant::now();
    let execution = scheduler.trigger_task(task_id).await.unwrap();
    wait_terminal(&scheduler, execution.id, Duration::from_secs(15)).await;

    // The 2 s poll loop enforces the budget well before the sleep ends.
    assert!(started.elapsed() < Duration::from_secs(10));

    let row = scheduler.get_execution(execution.id).await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert!(row.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn terminate_kills_the_child_process() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let scheduler = Scheduler::new(pool, fast_config(), ActionRegistry::new());

    let task_id =
        command_task(&scheduler, "kill-me", json!({"command": "sleep 30"})).await;

    let started = Instant::now();
    let execution = scheduler.trigger_task(task_id).await.unwrap();
    scheduler.terminate_execution(execution.id).await.unwrap();

    wait_terminal(&scheduler, execution.id, Duration::from_secs(15)).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    let row = scheduler.get_execution(execution.id).await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Terminated);
    assert!(row.terminate_requested);
}
