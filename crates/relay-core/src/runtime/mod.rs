//! The execution runtime: resolves a task's action, runs it under a
//! cancellation/pause context, keeps the execution row in sync, and drives
//! the retry chain.

pub mod liveness;
pub mod script;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use relay_db::models::{ExecutionStatus, Task, TaskExecution, TaskKind};
use relay_db::queries::executions as exec_db;

use crate::action::{ActionRegistry, ExecutionContext};
use crate::config::SchedulerConfig;
use crate::error::{EngineError, EngineResult};
use crate::workflow;
use liveness::LivenessRegistry;

/// Error message recorded when an execution honors a terminate request.
const TERMINATED_MESSAGE: &str = "用户请求终止任务";

/// Terminal summary of one run (after any retries).
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: i64,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Shared executor for all worker activities.
pub struct Runtime {
    pool: SqlitePool,
    registry: Arc<ActionRegistry>,
    liveness: LivenessRegistry,
    config: SchedulerConfig,
}

impl Runtime {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<ActionRegistry>,
        liveness: LivenessRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            liveness,
            config,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn liveness(&self) -> &LivenessRegistry {
        &self.liveness
    }

    pub(crate) fn max_result_chars(&self) -> usize {
        self.config.max_result_chars
    }

    /// Run a gated execution to its terminal state, then walk the retry
    /// chain: after a non-cancelled failure with budget left, sleep
    /// `retry_interval` and start a fresh gated execution carrying
    /// `retry_count + 1`. Workflow tasks never take outer retries.
    ///
    /// Boxed so the orchestrator can recurse through child runs.
    pub fn run(&self, task: Task, execution: TaskExecution) -> BoxFuture<'_, ExecutionOutcome> {
        async move {
            let mut execution = execution;
            loop {
                let (outcome, failure_retryable) = self.run_once(&task, &execution).await;

                let retryable = outcome.status == ExecutionStatus::Failed
                    && failure_retryable
                    && task.kind != TaskKind::Workflow
                    && execution.retry_count < task.max_retries;
                if !retryable {
                    return outcome;
                }

                info!(
                    task_id = task.id,
                    task = %task.name,
                    retry_in_secs = task.retry_interval,
                    next_retry = execution.retry_count + 1,
                    "scheduling retry"
                );
                tokio::time::sleep(Duration::from_secs(task.retry_interval.max(0) as u64)).await;

                match exec_db::insert_execution_gated(
                    &self.pool,
                    task.id,
                    execution.retry_count + 1,
                    None,
                    self.config.max_result_chars,
                )
                .await
                {
                    Ok(Some(next)) => execution = next,
                    Ok(None) => {
                        warn!(
                            task_id = task.id,
                            "retry skipped: task already has an active execution"
                        );
                        return outcome;
                    }
                    Err(err) => {
                        error!(
                            task_id = task.id,
                            error = %err,
                            "retry skipped: could not create execution"
                        );
                        return outcome;
                    }
                }
            }
        }
        .boxed()
    }

    /// One attempt: register liveness, invoke the action, translate the
    /// outcome into a terminal row.
    ///
    /// The second element says whether a failure belongs to a retryable
    /// error class: action errors and timeouts feed the retry policy,
    /// validation and infrastructure failures never do.
    async fn run_once(&self, task: &Task, execution: &TaskExecution) -> (ExecutionOutcome, bool) {
        let _guard = self.liveness.register(execution.id);
        let ctx = ExecutionContext::new(
            self.pool.clone(),
            task.id,
            execution.id,
            execution.start_time,
        );

        info!(
            task_id = task.id,
            execution_id = execution.id,
            task = %task.name,
            retry = execution.retry_count,
            "execution started"
        );

        match self.invoke(task, &ctx).await {
            Ok(result) => {
                let wrote = exec_db::finish_execution(
                    &self.pool,
                    execution.id,
                    ExecutionStatus::Success,
                    Some(&result),
                    None,
                    self.config.max_result_chars,
                )
                .await;
                let outcome = self.translate_finish(
                    execution.id,
                    wrote,
                    ExecutionStatus::Success,
                    Some(result),
                    None,
                );
                (outcome, false)
            }
            Err(EngineError::Cancelled) => {
                let wrote = exec_db::finish_execution(
                    &self.pool,
                    execution.id,
                    ExecutionStatus::Terminated,
                    None,
                    Some(TERMINATED_MESSAGE),
                    self.config.max_result_chars,
                )
                .await;
                let outcome = self.translate_finish(
                    execution.id,
                    wrote,
                    ExecutionStatus::Terminated,
                    None,
                    Some(TERMINATED_MESSAGE.to_string()),
                );
                (outcome, false)
            }
            Err(err) => {
                let retryable = matches!(
                    err,
                    EngineError::Action(_) | EngineError::Timeout(_)
                );
                let message = err.to_string();
                let wrote = exec_db::finish_execution(
                    &self.pool,
                    execution.id,
                    ExecutionStatus::Failed,
                    None,
                    Some(&message),
                    self.config.max_result_chars,
                )
                .await;
                let outcome = self.translate_finish(
                    execution.id,
                    wrote,
                    ExecutionStatus::Failed,
                    None,
                    Some(message),
                );
                (outcome, retryable)
            }
        }
    }

    /// Resolve the action for a task, in fixed precedence order.
    async fn invoke(&self, task: &Task, ctx: &ExecutionContext) -> EngineResult<Value> {
        let config = task.config().map_err(|err| {
            EngineError::Validation(format!("unparseable config for task {:?}: {err}", task.name))
        })?;

        if config.get("command").and_then(Value::as_str).is_some() {
            script::run_command(ctx, &config, &self.config).await
        } else if let Some(name) = config.get("task_action").and_then(Value::as_str) {
            let action = self.registry.get(name).ok_or_else(|| {
                EngineError::Validation(format!("no action registered under {name:?}"))
            })?;
            action.execute(ctx, &config).await
        } else if task.kind == TaskKind::Workflow {
            workflow::run_workflow(self, ctx, &config).await
        } else {
            Err(EngineError::Validation(
                "task config must provide 'command' or 'task_action'".to_string(),
            ))
        }
    }

    /// Fold the finish-write result into the outcome.
    ///
    /// Zero rows affected means the row was already forced terminal (the
    /// sweeper or an explicit terminate won), so the authoritative status
    /// is `terminated` regardless of what the action returned. A write
    /// error is infrastructure: log it and report what the action did, but
    /// do not attempt further writes for this execution.
    fn translate_finish(
        &self,
        execution_id: i64,
        wrote: anyhow::Result<u64>,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> ExecutionOutcome {
        match wrote {
            Ok(0) => {
                warn!(
                    execution_id,
                    "execution was force-terminated while finishing"
                );
                ExecutionOutcome {
                    execution_id,
                    status: ExecutionStatus::Terminated,
                    result: None,
                    error: Some("execution was force-terminated".to_string()),
                }
            }
            Ok(_) => {
                info!(execution_id, status = %status, "execution finished");
                ExecutionOutcome {
                    execution_id,
                    status,
                    result,
                    error,
                }
            }
            Err(err) => {
                error!(
                    execution_id,
                    error = %err,
                    "failed to record execution outcome"
                );
                ExecutionOutcome {
                    execution_id,
                    status,
                    result,
                    error,
                }
            }
        }
    }
}
