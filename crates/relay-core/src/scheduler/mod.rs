//! The scheduler facade: one owned value wiring the store, schedule
//! source, dispatcher, runtime, and sweeper together.
//!
//! There is no global state: the application entry point builds a
//! [`Scheduler`] (with a populated [`ActionRegistry`]) and hands references
//! to its collaborators. `start` spawns the background loops; `shutdown`
//! cancels them cooperatively.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_db::models::{ExecutionStatus, Task, TaskExecution, TaskKind};
use relay_db::queries::executions as exec_db;
use relay_db::queries::executions::ExecutionStats;
use relay_db::queries::tasks::TaskFilter;
use relay_db::queries::tasks as task_db;

use crate::action::ActionRegistry;
use crate::config::SchedulerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{EngineError, EngineResult};
use crate::runtime::Runtime;
use crate::runtime::liveness::LivenessRegistry;
use crate::schedule::{Fire, ScheduleSource};
use crate::service::{self, ListTasks, NewTask, TaskPatch};
use crate::sweeper::{LOST_WORKER_MESSAGE, Sweeper};
use crate::workflow;

/// Bound on in-flight fires between the schedule source and dispatcher.
const FIRE_CHANNEL_CAPACITY: usize = 64;

pub struct Scheduler {
    pool: SqlitePool,
    config: SchedulerConfig,
    schedule: Arc<ScheduleSource>,
    dispatcher: Arc<Dispatcher>,
    liveness: LivenessRegistry,
    sweeper: Arc<Sweeper>,
    fires: Mutex<Option<mpsc::Receiver<Fire>>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Wire up an engine over the given pool. The registry must already
    /// hold every action the stored tasks refer to.
    pub fn new(pool: SqlitePool, config: SchedulerConfig, registry: ActionRegistry) -> Self {
        let (fires_tx, fires_rx) = mpsc::channel(FIRE_CHANNEL_CAPACITY);
        let liveness = LivenessRegistry::new();

        let runtime = Arc::new(Runtime::new(
            pool.clone(),
            Arc::new(registry),
            liveness.clone(),
            config.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            Arc::clone(&runtime),
            config.worker_pool_size,
            config.max_result_chars,
        ));
        let schedule = Arc::new(ScheduleSource::new(config.clone(), fires_tx));
        let sweeper = Arc::new(Sweeper::new(
            pool.clone(),
            liveness.clone(),
            config.sweeper_interval,
        ));

        Self {
            pool,
            config,
            schedule,
            dispatcher,
            liveness,
            sweeper,
            fires: Mutex::new(Some(fires_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The process-local worker liveness registry (sweeper input).
    pub fn liveness(&self) -> &LivenessRegistry {
        &self.liveness
    }

    /// Load every schedulable task into the schedule source and spawn the
    /// background loops (tick loop, fire loop, recovery sweeper).
    pub async fn start(&self) -> EngineResult<()> {
        let fires_rx = self
            .fires
            .lock()
            .expect("fire receiver poisoned")
            .take()
            .ok_or_else(|| EngineError::Validation("scheduler already started".to_string()))?;

        let filter = TaskFilter {
            enabled: Some(true),
            descending: false,
            limit: i64::MAX,
            ..Default::default()
        };
        let tasks = task_db::list_tasks(&self.pool, &filter)
            .await
            .map_err(EngineError::Infrastructure)?;

        let mut scheduled = 0usize;
        for task in &tasks {
            if task.kind == TaskKind::Manual {
                continue;
            }
            if task.cron_expression.is_none() && task.interval_seconds.is_none() {
                continue;
            }
            match self.schedule.add_task(task) {
                Ok(()) => scheduled += 1,
                Err(err) => warn!(
                    task_id = task.id,
                    task = %task.name,
                    error = %err,
                    "stored task has an invalid schedule, skipping"
                ),
            }
        }

        tokio::spawn(Arc::clone(&self.schedule).run(self.shutdown.child_token()));
        tokio::spawn(
            Arc::clone(&self.dispatcher).run_loop(fires_rx, self.shutdown.child_token()),
        );
        tokio::spawn(Arc::clone(&self.sweeper).run(self.shutdown.child_token()));

        info!(scheduled, "scheduler started");
        Ok(())
    }

    /// Cancel the background loops. In-flight executions finish
    /// cooperatively; anything still active at process exit is reclaimed
    /// by the sweeper on the next start.
    pub fn shutdown(&self) {
        info!("scheduler shutting down");
        self.shutdown.cancel();
    }

    // -----------------------------------------------------------------
    // Task management
    // -----------------------------------------------------------------

    pub async fn create_task(&self, spec: NewTask) -> EngineResult<Task> {
        let task = service::create_task(&self.pool, spec).await?;
        self.sync_schedule_entry(&task);
        Ok(task)
    }

    pub async fn update_task(&self, id: i64, patch: TaskPatch) -> EngineResult<Task> {
        let task = service::update_task(&self.pool, id, patch).await?;
        self.sync_schedule_entry(&task);
        Ok(task)
    }

    pub async fn delete_task(&self, id: i64) -> EngineResult<Task> {
        let task = service::delete_task(&self.pool, id).await?;
        self.schedule.remove_task(id);
        Ok(task)
    }

    pub async fn get_task(&self, id: i64) -> EngineResult<Task> {
        service::get_task(&self.pool, id).await
    }

    pub async fn list_tasks(&self, params: &ListTasks) -> EngineResult<Vec<Task>> {
        service::list_tasks(&self.pool, params).await
    }

    pub async fn enable_task(&self, id: i64, updated_by: Option<&str>) -> EngineResult<Task> {
        let task = service::set_enabled(&self.pool, id, true, updated_by).await?;
        self.sync_schedule_entry(&task);
        Ok(task)
    }

    pub async fn disable_task(&self, id: i64, updated_by: Option<&str>) -> EngineResult<Task> {
        let task = service::set_enabled(&self.pool, id, false, updated_by).await?;
        self.sync_schedule_entry(&task);
        Ok(task)
    }

    /// Suppress schedule fires without unregistering the task.
    pub async fn pause_task(&self, id: i64, updated_by: Option<&str>) -> EngineResult<Task> {
        let task = service::set_paused(&self.pool, id, true, updated_by).await?;
        self.schedule.set_paused(id, true);
        Ok(task)
    }

    pub async fn resume_task(&self, id: i64, updated_by: Option<&str>) -> EngineResult<Task> {
        let task = service::set_paused(&self.pool, id, false, updated_by).await?;
        self.schedule.set_paused(id, false);
        Ok(task)
    }

    /// Manually trigger a task, bypassing the schedule source.
    ///
    /// The single-instance gate still applies; a second trigger while an
    /// execution is active returns `conflict`.
    pub async fn trigger_task(&self, id: i64) -> EngineResult<TaskExecution> {
        let task = service::get_task(&self.pool, id).await?;
        self.dispatcher.dispatch(task, None).await
    }

    /// Bring the in-memory schedule entry in line with a task row.
    fn sync_schedule_entry(&self, task: &Task) {
        let eligible = task.enabled
            && task.kind != TaskKind::Manual
            && (task.cron_expression.is_some() || task.interval_seconds.is_some());

        if eligible {
            if let Err(err) = self.schedule.add_task(task) {
                warn!(
                    task_id = task.id,
                    error = %err,
                    "task not entered into schedule source"
                );
            }
        } else {
            self.schedule.remove_task(task.id);
        }
    }

    // -----------------------------------------------------------------
    // Execution inspection and control
    // -----------------------------------------------------------------

    pub async fn list_executions(
        &self,
        task_id: i64,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<TaskExecution>> {
        exec_db::list_for_task(&self.pool, task_id, limit, offset)
            .await
            .map_err(EngineError::Infrastructure)
    }

    pub async fn get_execution(&self, id: i64) -> EngineResult<TaskExecution> {
        exec_db::get_execution(&self.pool, id)
            .await
            .map_err(EngineError::Infrastructure)?
            .ok_or_else(|| EngineError::NotFound(format!("execution {id}")))
    }

    /// Set the cooperative pause flag on a running execution.
    pub async fn pause_execution(&self, id: i64) -> EngineResult<TaskExecution> {
        let execution = self.get_execution(id).await?;
        if execution.status == ExecutionStatus::Running {
            exec_db::set_control(&self.pool, id, Some(true), false)
                .await
                .map_err(EngineError::Infrastructure)?;
            info!(execution_id = id, "pause requested");
        }
        self.get_execution(id).await
    }

    /// Resume an execution.
    ///
    /// Live and paused: clear the flag. Live and running: no-op. Active
    /// but ownerless (zombie): force-terminate, then fall through to the
    /// restart path. Terminal: start a fresh execution carrying
    /// `resume_from_execution_id`, which for workflow tasks skips
    /// previously successful children.
    pub async fn resume_execution(&self, id: i64) -> EngineResult<TaskExecution> {
        let execution = self.get_execution(id).await?;
        let alive = self.liveness.is_alive(id);

        if alive {
            if execution.is_paused {
                exec_db::resume_mark_running(&self.pool, id)
                    .await
                    .map_err(EngineError::Infrastructure)?;
                info!(execution_id = id, "cleared pause flag on live execution");
                return self.get_execution(id).await;
            }
            if execution.status == ExecutionStatus::Running {
                warn!(execution_id = id, "execution already running, nothing to resume");
                return Ok(execution);
            }
        }

        if !alive && execution.status.is_active() {
            warn!(
                execution_id = id,
                "active execution has no live worker, reclaiming before resume"
            );
            exec_db::force_terminate(&self.pool, id, LOST_WORKER_MESSAGE)
                .await
                .map_err(EngineError::Infrastructure)?;
        }

        let execution = self.get_execution(id).await?;
        if !execution.status.is_terminal() {
            return Ok(execution);
        }

        let task = service::get_task(&self.pool, execution.task_id).await?;
        let mut config = task.config().map_err(|err| {
            EngineError::Validation(format!("unparseable config for task {:?}: {err}", task.name))
        })?;
        let fields = config.as_object_mut().ok_or_else(|| {
            EngineError::Validation(format!("config for task {:?} is not an object", task.name))
        })?;
        fields.insert("resume_from_execution_id".to_string(), json!(id));

        let mut resumed = task;
        resumed.config_json = Some(config.to_string());

        let seed = json!({
            "resume_from_execution_id": id,
            "message": format!("resumed from execution {id}"),
        });

        info!(
            task_id = resumed.id,
            resume_from = id,
            "starting resumption execution"
        );
        self.dispatcher.dispatch(resumed, Some(&seed)).await
    }

    /// Request termination of an active execution.
    ///
    /// First call on a live worker sets the cooperative flag; the action
    /// observes it on its next progress poll. If the worker is gone, or a
    /// previous request went unanswered, the row is forced to `terminated`
    /// immediately (the "force clean" path).
    pub async fn terminate_execution(&self, id: i64) -> EngineResult<TaskExecution> {
        let execution = self.get_execution(id).await?;

        if execution.status.is_active() {
            let alive = self.liveness.is_alive(id);
            if !alive || execution.terminate_requested {
                let reason = if !alive {
                    "运行线程已丢失"
                } else {
                    "正常终止请求无响应，强制终止"
                };
                warn!(execution_id = id, reason, "force-terminating execution");
                let message = format!("{reason}（可能已崩溃或被外部强制结束），系统已回收状态");
                exec_db::force_terminate(&self.pool, id, &message)
                    .await
                    .map_err(EngineError::Infrastructure)?;
            } else {
                exec_db::set_control(&self.pool, id, None, true)
                    .await
                    .map_err(EngineError::Infrastructure)?;
                info!(execution_id = id, "terminate requested");
            }
        }

        self.get_execution(id).await
    }

    pub async fn stats(&self, task_id: Option<i64>) -> EngineResult<ExecutionStats> {
        exec_db::stats(&self.pool, task_id)
            .await
            .map_err(EngineError::Infrastructure)
    }

    // -----------------------------------------------------------------
    // Workflow utilities
    // -----------------------------------------------------------------

    /// The child tasks of a workflow task.
    pub async fn workflow_tasks(&self, workflow_task_id: i64) -> EngineResult<Vec<Task>> {
        service::workflow_children(&self.pool, workflow_task_id).await
    }

    /// Validate a workflow config blob against the current store.
    pub async fn validate_workflow_config(&self, config: &Value) -> EngineResult<()> {
        workflow::validate_workflow_config(&self.pool, config)
            .await
            .map(|_| ())
    }
}
