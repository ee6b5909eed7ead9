//! The full background machinery: interval fires through the schedule
//! source and dispatcher, pause suppression, and the single-instance rule
//! under a schedule faster than the action.

use std::time::Duration;

use serde_json::json;

use relay_core::action::ActionRegistry;
use relay_core::scheduler::Scheduler;
use relay_core::service::NewTask;
use relay_db::models::TaskKind;
use relay_test_utils::{
    RecordingAction, SleepAction, create_test_db, fast_config, wait_until,
};

#[tokio::test]
async fn interval_task_fires_repeatedly_after_start() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;

    let (action, runs) = RecordingAction::new("record");
    let mut registry = ActionRegistry::new();
    registry.register(action);
    let scheduler = Scheduler::new(pool, fast_config(), registry);

    let mut spec = NewTask::new("every-second", TaskKind::Common);
    spec.config = Some(json!({"task_action": "record"}));
    spec.interval_seconds = Some(1);
    spec.max_retries = 0;
    let task = scheduler.create_task(spec).await.unwrap();

    scheduler.start().await.unwrap();
    // A second start is rejected.
    assert!(scheduler.start().await.is_err());

    let fired_twice = wait_until(Duration::from_secs(10), || {
        let runs = runs.clone();
        async move { runs.lock().unwrap().len() >= 2 }
    })
    .await;
    assert!(fired_twice, "interval task did not fire twice");

    // Pausing the task suppresses further fires.
    scheduler.pause_task(task.id, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let frozen = runs.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(runs.lock().unwrap().len(), frozen, "paused task kept firing");

    // Resuming makes it eligible again from the next tick.
    scheduler.resume_task(task.id, None).await.unwrap();
    let resumed = wait_until(Duration::from_secs(10), || {
        let runs = runs.clone();
        async move { runs.lock().unwrap().len() > frozen }
    })
    .await;
    assert!(resumed, "resumed task never fired again");

    scheduler.shutdown();
}

#[tokio::test]
async fn slow_action_never_overlaps_itself_under_a_fast_schedule() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;

    let mut registry = ActionRegistry::new();
    // ~2.5 s of work against a 1 s schedule.
    registry.register(SleepAction::new("slow", 5, Duration::from_millis(500)));
    let scheduler = Scheduler::new(pool, fast_config(), registry);

    let mut spec = NewTask::new("overlapping", TaskKind::Common);
    spec.config = Some(json!({"task_action": "slow"}));
    spec.interval_seconds = Some(1);
    spec.max_retries = 0;
    let task = scheduler.create_task(spec).await.unwrap();

    scheduler.start().await.unwrap();

    let started = wait_until(Duration::from_secs(10), || {
        let scheduler = &scheduler;
        let task_id = task.id;
        async move {
            !scheduler
                .list_executions(task_id, 100, 0)
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;
    assert!(started);

    // Sample the store while fires keep arriving: never two active rows.
    for _ in 0..30 {
        let executions = scheduler.list_executions(task.id, 100, 0).await.unwrap();
        let active = executions.iter().filter(|e| e.status.is_active()).count();
        assert!(active <= 1, "single-instance rule violated: {active} active");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    scheduler.shutdown();
}

#[tokio::test]
async fn disabled_tasks_do_not_fire() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;

    let (action, runs) = RecordingAction::new("record");
    let mut registry = ActionRegistry::new();
    registry.register(action);
    let scheduler = Scheduler::new(pool, fast_config(), registry);

    let mut spec = NewTask::new("dormant", TaskKind::Common);
    spec.config = Some(json!({"task_action": "record"}));
    spec.interval_seconds = Some(1);
    spec.max_retries = 0;
    let task = scheduler.create_task(spec).await.unwrap();
    scheduler.disable_task(task.id, None).await.unwrap();

    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(runs.lock().unwrap().is_empty(), "disabled task fired");

    // Enabling makes it eligible from the next tick.
    scheduler.enable_task(task.id, None).await.unwrap();
    let fired = wait_until(Duration::from_secs(10), || {
        let runs = runs.clone();
        async move { !runs.lock().unwrap().is_empty() }
    })
    .await;
    assert!(fired, "enabled task never fired");

    scheduler.shutdown();
}
