//! Integration tests for execution rows: the single-instance gate, control
//! flags, finish semantics, and result compaction at the store boundary.

use serde_json::json;
use sqlx::SqlitePool;

use relay_db::compact::DEFAULT_MAX_RESULT_CHARS;
use relay_db::models::{ExecutionStatus, TaskKind};
use relay_db::queries::executions as db;
use relay_db::queries::tasks::{self, NewTaskRow};

async fn seed_task(pool: &SqlitePool, name: &str) -> i64 {
    let row = NewTaskRow {
        name: name.to_string(),
        job_id: format!("common_{name}_test"),
        kind: TaskKind::Common,
        cron_expression: None,
        interval_seconds: None,
        enabled: true,
        paused: false,
        description: None,
        config_json: None,
        max_retries: 0,
        retry_interval: 60,
        created_by: None,
    };
    tasks::insert_task(pool, &row).await.unwrap().id
}

#[tokio::test]
async fn gate_admits_exactly_one_active_execution() {
    let (pool, _dir) = relay_test_utils::create_test_db().await;
    let task_id = seed_task(&pool, "gated").await;

    let first = db::insert_execution_gated(&pool, task_id, 0, None, DEFAULT_MAX_RESULT_CHARS)
        .await
        .unwrap()
        .expect("first start wins the gate");
    assert_eq!(first.status, ExecutionStatus::Running);
    assert_eq!(first.created_by.as_deref(), Some("scheduler"));

    // Second start is rejected while the first is active.
    let second = db::insert_execution_gated(&pool, task_id, 0, None, DEFAULT_MAX_RESULT_CHARS)
        .await
        .unwrap();
    assert!(second.is_none());

    // A different task is unaffected.
    let other_task = seed_task(&pool, "independent").await;
    assert!(
        db::insert_execution_gated(&pool, other_task, 0, None, DEFAULT_MAX_RESULT_CHARS)
            .await
            .unwrap()
            .is_some()
    );

    // Finishing frees the slot.
    db::finish_execution(
        &pool,
        first.id,
        ExecutionStatus::Success,
        Some(&json!({"success": true})),
        None,
        DEFAULT_MAX_RESULT_CHARS,
    )
    .await
    .unwrap();
    assert!(
        db::insert_execution_gated(&pool, task_id, 0, None, DEFAULT_MAX_RESULT_CHARS)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn concurrent_starts_serialize_to_one_winner() {
    let (pool, _dir) = relay_test_utils::create_test_db().await;
    let task_id = seed_task(&pool, "contended").await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            db::insert_execution_gated(&pool, task_id, 0, None, DEFAULT_MAX_RESULT_CHARS)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn finish_stamps_timing_and_success_progress() {
    let (pool, _dir) = relay_test_utils::create_test_db().await;
    let task_id = seed_task(&pool, "finisher").await;

    let execution = db::insert_execution_gated(&pool, task_id, 0, None, DEFAULT_MAX_RESULT_CHARS)
        .await
        .unwrap()
        .unwrap();

    let rows = db::finish_execution(
        &pool,
        execution.id,
        ExecutionStatus::Success,
        Some(&json!({"success": true, "message": "done"})),
        None,
        DEFAULT_MAX_RESULT_CHARS,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let finished = db::get_execution(&pool, execution.id).await.unwrap().unwrap();
    assert_eq!(finished.status, ExecutionStatus::Success);
    assert_eq!(finished.progress_percent, 100.0);
    assert!(finished.end_time.is_some());
    let duration = finished.duration_seconds.unwrap();
    assert!((0..=2).contains(&duration));

    // Terminal rows are never re-finished.
    let again = db::finish_execution(
        &pool,
        execution.id,
        ExecutionStatus::Failed,
        None,
        Some("late write"),
        DEFAULT_MAX_RESULT_CHARS,
    )
    .await
    .unwrap();
    assert_eq!(again, 0);
    let unchanged = db::get_execution(&pool, execution.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, ExecutionStatus::Success);
    assert!(unchanged.error_message.is_none());
}

#[tokio::test]
async fn force_terminate_wins_over_a_late_finish() {
    let (pool, _dir) = relay_test_utils::create_test_db().await;
    let task_id = seed_task(&pool, "forced").await;

    let execution = db::insert_execution_gated(&pool, task_id, 0, None, DEFAULT_MAX_RESULT_CHARS)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        db::force_terminate(&pool, execution.id, "worker lost").await.unwrap(),
        1
    );

    // The worker coming back later cannot overwrite the terminal row.
    let late = db::finish_execution(
        &pool,
        execution.id,
        ExecutionStatus::Success,
        Some(&json!({"success": true})),
        None,
        DEFAULT_MAX_RESULT_CHARS,
    )
    .await
    .unwrap();
    assert_eq!(late, 0);

    let row = db::get_execution(&pool, execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Terminated);
    assert!(row.terminate_requested);
    assert!(!row.is_paused);
    assert_eq!(row.error_message.as_deref(), Some("worker lost"));
    assert!(row.end_time.is_some());
}

#[tokio::test]
async fn terminate_flag_is_monotonic() {
    let (pool, _dir) = relay_test_utils::create_test_db().await;
    let task_id = seed_task(&pool, "monotonic").await;

    let execution = db::insert_execution_gated(&pool, task_id, 0, None, DEFAULT_MAX_RESULT_CHARS)
        .await
        .unwrap()
        .unwrap();

    db::set_control(&pool, execution.id, None, true).await.unwrap();
    let flags = db::get_control_flags(&pool, execution.id).await.unwrap().unwrap();
    assert!(flags.terminate_requested);

    // A later pause-only update must not clear the terminate flag.
    db::set_control(&pool, execution.id, Some(false), false).await.unwrap();
    let flags = db::get_control_flags(&pool, execution.id).await.unwrap().unwrap();
    assert!(flags.terminate_requested);
}

#[tokio::test]
async fn processed_items_never_decreases() {
    let (pool, _dir) = relay_test_utils::create_test_db().await;
    let task_id = seed_task(&pool, "progress").await;

    let execution = db::insert_execution_gated(&pool, task_id, 0, None, DEFAULT_MAX_RESULT_CHARS)
        .await
        .unwrap()
        .unwrap();

    let patch = db::ProgressPatch {
        processed_items: Some(5),
        total_items: Some(10),
        progress_percent: Some(50.0),
        current_item: Some("item-5".to_string()),
        ..Default::default()
    };
    db::update_progress(&pool, execution.id, &patch).await.unwrap();

    // A stale report with a lower counter is clamped.
    let stale = db::ProgressPatch {
        processed_items: Some(3),
        ..Default::default()
    };
    db::update_progress(&pool, execution.id, &stale).await.unwrap();

    let row = db::get_execution(&pool, execution.id).await.unwrap().unwrap();
    assert_eq!(row.processed_items, 5);
    assert_eq!(row.total_items, 10);
    assert_eq!(row.current_item.as_deref(), Some("item-5"));
}

#[tokio::test]
async fn oversized_results_are_compacted_at_the_store() {
    let (pool, _dir) = relay_test_utils::create_test_db().await;
    let task_id = seed_task(&pool, "bulky").await;

    let execution = db::insert_execution_gated(&pool, task_id, 0, None, DEFAULT_MAX_RESULT_CHARS)
        .await
        .unwrap()
        .unwrap();

    let result = json!({
        "success": true,
        "exit_code": 0,
        "message": "done",
        "command": "generate-report",
        "payload": "x".repeat(61_000),
    });
    db::finish_execution(
        &pool,
        execution.id,
        ExecutionStatus::Success,
        Some(&result),
        None,
        DEFAULT_MAX_RESULT_CHARS,
    )
    .await
    .unwrap();

    let row = db::get_execution(&pool, execution.id).await.unwrap().unwrap();
    let stored = row.result_json.unwrap();
    assert!(stored.chars().count() <= DEFAULT_MAX_RESULT_CHARS);

    let value: serde_json::Value = serde_json::from_str(&stored).unwrap();
    assert_eq!(value["truncated"], json!(true));
    assert_eq!(value["command"], json!("generate-report"));
    assert!(value.get("payload").is_none());
}

#[tokio::test]
async fn stats_aggregate_per_task_and_globally() {
    let (pool, _dir) = relay_test_utils::create_test_db().await;
    let task_a = seed_task(&pool, "stat-a").await;
    let task_b = seed_task(&pool, "stat-b").await;

    for status in [ExecutionStatus::Success, ExecutionStatus::Failed] {
        let execution =
            db::insert_execution_gated(&pool, task_a, 0, None, DEFAULT_MAX_RESULT_CHARS)
                .await
                .unwrap()
                .unwrap();
        db::finish_execution(&pool, execution.id, status, None, None, DEFAULT_MAX_RESULT_CHARS)
            .await
            .unwrap();
    }
    db::insert_execution_gated(&pool, task_b, 0, None, DEFAULT_MAX_RESULT_CHARS)
        .await
        .unwrap()
        .unwrap();

    let a = db::stats(&pool, Some(task_a)).await.unwrap();
    assert_eq!(a.total_executions, 2);
    assert_eq!(a.success_count, 1);
    assert_eq!(a.failed_count, 1);
    assert_eq!(a.running_count, 0);
    assert!((a.success_rate - 0.5).abs() < f64::EPSILON);
    assert!(a.latest_execution_time.is_some());

    let all = db::stats(&pool, None).await.unwrap();
    assert_eq!(all.total_executions, 3);
    assert_eq!(all.running_count, 1);

    let empty = db::stats(&pool, Some(9999)).await.unwrap();
    assert_eq!(empty.total_executions, 0);
    assert_eq!(empty.success_rate, 0.0);
    assert!(empty.latest_execution_time.is_none());
}
