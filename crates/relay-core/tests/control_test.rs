//! Single-instance gating and cooperative pause/resume/terminate through
//! the public control surface.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use relay_core::action::{Action, ActionRegistry, ExecutionContext};
use relay_core::error::{EngineError, EngineResult};
use relay_core::scheduler::Scheduler;
use relay_core::service::NewTask;
use relay_db::models::{ExecutionStatus, TaskKind};
use relay_test_utils::{SleepAction, create_test_db, fast_config, wait_until};

fn sleeping_scheduler(pool: sqlx::SqlitePool, steps: i64, step_millis: u64) -> Scheduler {
    let mut registry = ActionRegistry::new();
    registry.register(SleepAction::new(
        "sleepy",
        steps,
        Duration::from_millis(step_millis),
    ));
    Scheduler::new(pool, fast_config(), registry)
}

async fn sleepy_task(scheduler: &Scheduler, name: &str) -> i64 {
    let mut spec = NewTask::new(name, TaskKind::Common);
    spec.config = Some(json!({"task_action": "sleepy"}));
    spec.max_retries = 0;
    scheduler.create_task(spec).await.unwrap().id
}

async fn wait_for_status(scheduler: &Scheduler, execution_id: i64, status: ExecutionStatus) {
    let reached = wait_until(Duration::from_secs(10), || {
        let scheduler = &scheduler;
        async move {
            scheduler.get_execution(execution_id).await.unwrap().status == status
        }
    })
    .await;
    assert!(reached, "execution {execution_id} never reached {status}");
}

#[tokio::test]
async fn second_trigger_hits_the_single_instance_gate() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let scheduler = sleeping_scheduler(pool, 20, 100);
    let task_id = sleepy_task(&scheduler, "busy").await;

    let execution = scheduler.trigger_task(task_id).await.unwrap();

    let err = scheduler.trigger_task(task_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)), "got {err}");

    // Only one execution row exists.
    assert_eq!(scheduler.list_executions(task_id, 100, 0).await.unwrap().len(), 1);

    scheduler.terminate_execution(execution.id).await.unwrap();
    wait_for_status(&scheduler, execution.id, ExecutionStatus::Terminated).await;

    // The slot is free again.
    scheduler.trigger_task(task_id).await.unwrap();
}

#[tokio::test]
async fn pause_parks_and_resume_continues() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let scheduler = sleeping_scheduler(pool, 15, 150);
    let task_id = sleepy_task(&scheduler, "pausable").await;

    let execution = scheduler.trigger_task(task_id).await.unwrap();

    // Let it make some progress first.
    let progressed = wait_until(Duration::from_secs(5), || {
        let scheduler = &scheduler;
        async move {
            scheduler
                .get_execution(execution.id)
                .await
                .unwrap()
                .processed_items
                > 0
        }
    })
    .await;
    assert!(progressed);

    let paused = scheduler.pause_execution(execution.id).await.unwrap();
    assert!(paused.is_paused);
    wait_for_status(&scheduler, execution.id, ExecutionStatus::Paused).await;

    // Paused executions still hold the single-instance slot.
    assert!(matches!(
        scheduler.trigger_task(task_id).await.unwrap_err(),
        EngineError::Conflict(_)
    ));

    let before = scheduler.get_execution(execution.id).await.unwrap().processed_items;
    tokio::time::sleep(Duration::from_millis(600)).await;
    let during = scheduler.get_execution(execution.id).await.unwrap().processed_items;
    assert_eq!(before, during, "paused execution kept processing");

    scheduler.resume_execution(execution.id).await.unwrap();
    wait_for_status(&scheduler, execution.id, ExecutionStatus::Success).await;

    let finished = scheduler.get_execution(execution.id).await.unwrap();
    assert_eq!(finished.progress_percent, 100.0);
    assert!(!finished.is_paused);
}

#[tokio::test]
async fn terminate_while_paused_ends_terminated() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let scheduler = sleeping_scheduler(pool, 30, 100);
    let task_id = sleepy_task(&scheduler, "pause-then-kill").await;

    let execution = scheduler.trigger_task(task_id).await.unwrap();
    scheduler.pause_execution(execution.id).await.unwrap();
    wait_for_status(&scheduler, execution.id, ExecutionStatus::Paused).await;

    scheduler.terminate_execution(execution.id).await.unwrap();
    // Terminate wins over pause: the parked action observes the flag and
    // exits as terminated, never failed.
    wait_for_status(&scheduler, execution.id, ExecutionStatus::Terminated).await;

    let row = scheduler.get_execution(execution.id).await.unwrap();
    assert!(row.terminate_requested);
    assert!(row.end_time.is_some());
}

#[tokio::test]
async fn cooperative_terminate_is_observed_on_the_next_poll() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let scheduler = sleeping_scheduler(pool, 30, 100);
    let task_id = sleepy_task(&scheduler, "killable").await;

    let execution = scheduler.trigger_task(task_id).await.unwrap();
    let requested = scheduler.terminate_execution(execution.id).await.unwrap();
    assert!(requested.terminate_requested);

    wait_for_status(&scheduler, execution.id, ExecutionStatus::Terminated).await;
}

/// An action that never polls its context, so cooperative terminate cannot
/// reach it.
struct StubbornAction;

#[async_trait]
impl Action for StubbornAction {
    fn name(&self) -> &str {
        "stubborn"
    }

    async fn execute(&self, _ctx: &ExecutionContext, _config: &Value) -> EngineResult<Value> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!({"success": true}))
    }
}

#[tokio::test]
async fn second_terminate_force_cleans_an_unresponsive_execution() {
    relay_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;

    let mut registry = ActionRegistry::new();
    registry.register(StubbornAction);
    let scheduler = Scheduler::new(pool, fast_config(), registry);

    let mut spec = NewTask::new("stubborn-task", TaskKind::Common);
    spec.config = Some(json!({"task_action": "stubborn"}));
    spec.max_retries = 0;
    let task = scheduler.create_task(spec).await.unwrap();

    let execution = scheduler.trigger_task(task.id).await.unwrap();

    // First request sets the flag; the action ignores it.
    let first = scheduler.terminate_execution(execution.id).await.unwrap();
    assert!(first.terminate_requested);
    assert_eq!(first.status, ExecutionStatus::Running);

    // Second request stops waiting and forces the row terminal.
    let second = scheduler.terminate_execution(execution.id).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Terminated);
    assert!(second.end_time.is_some());
}
