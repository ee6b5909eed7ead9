//! The dispatcher: the decision point between "due to run" and "actually
//! running".
//!
//! Every start funnels through [`Dispatcher::dispatch`]: acquire the
//! single-instance gate, then hand the `(task, execution)` pair to a worker
//! on the bounded pool. Scheduled fires that lose the gate are dropped with
//! a warning; manual triggers surface the conflict to the caller.

use std::sync::Arc;

use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_db::models::{Task, TaskExecution};
use relay_db::queries::executions as exec_db;
use relay_db::queries::tasks as task_db;

use crate::error::{EngineError, EngineResult};
use crate::runtime::Runtime;
use crate::schedule::Fire;

pub struct Dispatcher {
    pool: SqlitePool,
    runtime: Arc<Runtime>,
    workers: Arc<Semaphore>,
    max_result_chars: usize,
}

impl Dispatcher {
    pub fn new(
        pool: SqlitePool,
        runtime: Arc<Runtime>,
        worker_pool_size: usize,
        max_result_chars: usize,
    ) -> Self {
        Self {
            pool,
            runtime,
            workers: Arc::new(Semaphore::new(worker_pool_size)),
            max_result_chars,
        }
    }

    /// Gate and start an execution for a task.
    ///
    /// Returns the freshly created execution row; the action itself runs on
    /// a spawned worker, so this never blocks on the work. A full worker
    /// pool delays the start, not the caller.
    pub async fn dispatch(
        &self,
        task: Task,
        initial_result: Option<&Value>,
    ) -> EngineResult<TaskExecution> {
        if !task.enabled {
            return Err(EngineError::Validation(format!(
                "task {:?} is disabled",
                task.name
            )));
        }

        let execution = exec_db::insert_execution_gated(
            &self.pool,
            task.id,
            0,
            initial_result,
            self.max_result_chars,
        )
        .await
        .map_err(EngineError::Infrastructure)?
        .ok_or_else(|| {
            EngineError::Conflict(format!(
                "task {:?} already has an active execution",
                task.name
            ))
        })?;

        let runtime = Arc::clone(&self.runtime);
        let workers = Arc::clone(&self.workers);
        let spawned = execution.clone();
        tokio::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                // Closed only on teardown; the sweeper reclaims the row.
                Err(_) => return,
            };
            let outcome = runtime.run(task, spawned).await;
            debug!(
                execution_id = outcome.execution_id,
                status = %outcome.status,
                "worker finished"
            );
        });

        Ok(execution)
    }

    /// The fire loop: consume due-time events from the schedule source
    /// until shutdown.
    pub async fn run_loop(
        self: Arc<Self>,
        mut fires: mpsc::Receiver<Fire>,
        shutdown: CancellationToken,
    ) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                fire = fires.recv() => {
                    match fire {
                        Some(fire) => self.handle_fire(fire).await,
                        None => break,
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }

    /// Handle one scheduled fire. All failures are logged, never raised:
    /// the schedule source does not care.
    async fn handle_fire(&self, fire: Fire) {
        let task = match task_db::get_task(&self.pool, fire.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = fire.task_id, "fire for unknown task, dropping");
                return;
            }
            Err(err) => {
                error!(task_id = fire.task_id, error = %err, "could not load fired task");
                return;
            }
        };

        if !task.enabled || task.paused {
            debug!(task_id = task.id, "fire for disabled or paused task, dropping");
            return;
        }

        match self.dispatch(task, None).await {
            Ok(execution) => {
                debug!(
                    task_id = fire.task_id,
                    execution_id = execution.id,
                    due_at = %fire.due_at,
                    "fire dispatched"
                );
            }
            Err(EngineError::Conflict(message)) => {
                warn!(task_id = fire.task_id, "{message}; dropping fire");
            }
            Err(err) => {
                error!(task_id = fire.task_id, error = %err, "fire dispatch failed");
            }
        }
    }
}
