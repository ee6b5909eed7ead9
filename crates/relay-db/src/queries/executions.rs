//! Database query functions for the `task_executions` table.
//!
//! Every state transition on execution rows lives here. The two contended
//! paths are written as single atomic statements: the insert gate (at most
//! one active execution per task) and the optimistic finish (terminal rows
//! are never overwritten).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::compact::compact_result;
use crate::models::{ExecutionStatus, TaskExecution};

/// Auditor identity stamped on engine-initiated writes.
const SCHEDULER_AUDITOR: &str = "scheduler";

/// Create a new `running` execution for a task, subject to the
/// single-instance gate.
///
/// The insert and the "no active execution exists" check are one statement,
/// so concurrent callers for the same task serialize on SQLite's write lock
/// and exactly one wins. Returns `None` when the gate rejects the start.
pub async fn insert_execution_gated(
    pool: &SqlitePool,
    task_id: i64,
    retry_count: i64,
    initial_result: Option<&Value>,
    max_result_chars: usize,
) -> Result<Option<TaskExecution>> {
    let now = Utc::now();
    let result_json = initial_result.map(|value| compact_result(value, max_result_chars));

    let execution = sqlx::query_as::<_, TaskExecution>(
        "INSERT INTO task_executions \
             (task_id, status, start_time, retry_count, result_json, \
              created_by, created_time, updated_by, updated_time) \
         SELECT ?, 'running', ?, ?, ?, ?, ?, ?, ? \
         WHERE NOT EXISTS ( \
             SELECT 1 FROM task_executions \
             WHERE task_id = ? AND status IN ('running', 'paused') \
         ) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(now)
    .bind(retry_count)
    .bind(result_json)
    .bind(SCHEDULER_AUDITOR)
    .bind(now)
    .bind(SCHEDULER_AUDITOR)
    .bind(now)
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to insert execution")?;

    Ok(execution)
}

/// Fetch a single execution by ID.
pub async fn get_execution(pool: &SqlitePool, id: i64) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch execution")?;

    Ok(execution)
}

/// List a task's executions, most recent first.
pub async fn list_for_task(
    pool: &SqlitePool,
    task_id: i64,
    limit: i64,
    offset: i64,
) -> Result<Vec<TaskExecution>> {
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE task_id = ? \
         ORDER BY start_time DESC, id DESC \
         LIMIT ? OFFSET ?",
    )
    .bind(task_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list executions")?;

    Ok(executions)
}

/// The most recent execution of a task, if any.
pub async fn latest_for_task(pool: &SqlitePool, task_id: i64) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE task_id = ? \
         ORDER BY start_time DESC, id DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest execution")?;

    Ok(execution)
}

/// The task's active (`running` or `paused`) execution, if one exists.
pub async fn active_for_task(pool: &SqlitePool, task_id: i64) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE task_id = ? AND status IN ('running', 'paused') \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch active execution")?;

    Ok(execution)
}

/// Every active execution across all tasks (sweeper input).
pub async fn list_active(pool: &SqlitePool) -> Result<Vec<TaskExecution>> {
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE status IN ('running', 'paused') \
         ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active executions")?;

    Ok(executions)
}

/// The cooperative control flags, read fresh from the store.
///
/// The runtime polls this on every progress report instead of trusting a
/// cached row, so API-originated pause/terminate requests propagate within
/// one poll tick.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct ControlFlags {
    pub status: ExecutionStatus,
    pub is_paused: bool,
    pub terminate_requested: bool,
}

/// Read the control flags of an execution.
pub async fn get_control_flags(pool: &SqlitePool, id: i64) -> Result<Option<ControlFlags>> {
    let flags = sqlx::query_as::<_, ControlFlags>(
        "SELECT status, is_paused, terminate_requested FROM task_executions WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch control flags")?;

    Ok(flags)
}

/// Partial progress update; absent fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub progress_percent: Option<f64>,
    pub current_item: Option<String>,
    pub total_items: Option<i64>,
    pub processed_items: Option<i64>,
    pub estimated_end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

/// Apply a partial progress update. Safe to call at high frequency.
///
/// `processed_items` is clamped to be monotonically non-decreasing within
/// one execution.
pub async fn update_progress(pool: &SqlitePool, id: i64, patch: &ProgressPatch) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_executions \
         SET progress_percent = COALESCE(?, progress_percent), \
             current_item = COALESCE(?, current_item), \
             total_items = COALESCE(?, total_items), \
             processed_items = MAX(processed_items, COALESCE(?, processed_items)), \
             estimated_end_time = COALESCE(?, estimated_end_time), \
             duration_seconds = COALESCE(?, duration_seconds), \
             updated_by = ?, \
             updated_time = ? \
         WHERE id = ?",
    )
    .bind(patch.progress_percent)
    .bind(&patch.current_item)
    .bind(patch.total_items)
    .bind(patch.processed_items)
    .bind(patch.estimated_end_time)
    .bind(patch.duration_seconds)
    .bind(SCHEDULER_AUDITOR)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update execution progress")?;

    Ok(result.rows_affected())
}

/// Set the cooperative control flags on an active execution.
///
/// `terminate_requested` is monotonic: once set it is never cleared, so the
/// terminate argument can only turn it on. Returns rows affected (0 when
/// the execution is already terminal).
pub async fn set_control(
    pool: &SqlitePool,
    id: i64,
    pause: Option<bool>,
    terminate: bool,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_executions \
         SET is_paused = COALESCE(?, is_paused), \
             terminate_requested = CASE WHEN ? THEN 1 ELSE terminate_requested END, \
             updated_by = ?, \
             updated_time = ? \
         WHERE id = ? AND status IN ('running', 'paused')",
    )
    .bind(pause)
    .bind(terminate)
    .bind(SCHEDULER_AUDITOR)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set execution control flags")?;

    Ok(result.rows_affected())
}

/// Record that a running execution has observed its pause flag and parked.
pub async fn mark_paused(pool: &SqlitePool, id: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_executions \
         SET status = 'paused', updated_by = ?, updated_time = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(SCHEDULER_AUDITOR)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark execution paused")?;

    Ok(result.rows_affected())
}

/// Clear the pause flag and put a still-alive execution back to `running`.
pub async fn resume_mark_running(pool: &SqlitePool, id: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_executions \
         SET is_paused = 0, status = 'running', updated_by = ?, updated_time = ? \
         WHERE id = ? AND status IN ('running', 'paused')",
    )
    .bind(SCHEDULER_AUDITOR)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to resume execution")?;

    Ok(result.rows_affected())
}

/// Finish an execution with a terminal status.
///
/// Compacts the result at this boundary, stamps `end_time` and
/// `duration_seconds`, and forces `progress_percent = 100` on success. The
/// optimistic `WHERE status IN ('running', 'paused')` means a row already
/// forced terminal (sweeper, explicit terminate) is left untouched; the
/// returned row count tells the caller which write won.
pub async fn finish_execution(
    pool: &SqlitePool,
    id: i64,
    status: ExecutionStatus,
    result: Option<&Value>,
    error_message: Option<&str>,
    max_result_chars: usize,
) -> Result<u64> {
    debug_assert!(status.is_terminal());
    let now = Utc::now();
    let result_json = result.map(|value| compact_result(value, max_result_chars));

    let outcome = sqlx::query(
        "UPDATE task_executions \
         SET status = ?, \
             end_time = ?, \
             duration_seconds = CAST(ROUND((JULIANDAY(?) - JULIANDAY(start_time)) * 86400) AS INTEGER), \
             result_json = COALESCE(?, result_json), \
             error_message = COALESCE(?, error_message), \
             progress_percent = CASE WHEN ? = 'success' THEN 100.0 ELSE progress_percent END, \
             updated_by = ?, \
             updated_time = ? \
         WHERE id = ? AND status IN ('running', 'paused')",
    )
    .bind(status)
    .bind(now)
    .bind(now)
    .bind(result_json)
    .bind(error_message)
    .bind(status)
    .bind(SCHEDULER_AUDITOR)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish execution")?;

    Ok(outcome.rows_affected())
}

/// Force an active execution to `terminated` without waiting for the worker.
///
/// Used by the recovery sweeper and the explicit-terminate "force clean"
/// path. Sets the monotonic terminate flag and clears the pause flag so the
/// row reads consistently afterwards.
pub async fn force_terminate(pool: &SqlitePool, id: i64, error_message: &str) -> Result<u64> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE task_executions \
         SET status = 'terminated', \
             terminate_requested = 1, \
             is_paused = 0, \
             end_time = ?, \
             duration_seconds = CAST(ROUND((JULIANDAY(?) - JULIANDAY(start_time)) * 86400) AS INTEGER), \
             error_message = ?, \
             updated_by = ?, \
             updated_time = ? \
         WHERE id = ? AND status IN ('running', 'paused')",
    )
    .bind(now)
    .bind(now)
    .bind(error_message)
    .bind(SCHEDULER_AUDITOR)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to force-terminate execution")?;

    Ok(result.rows_affected())
}

/// Aggregate execution statistics, optionally scoped to one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStats {
    pub total_executions: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub running_count: i64,
    pub success_rate: f64,
    pub avg_duration_seconds: f64,
    pub latest_execution_time: Option<DateTime<Utc>>,
}

/// Compute execution statistics for one task or the whole store.
pub async fn stats(pool: &SqlitePool, task_id: Option<i64>) -> Result<ExecutionStats> {
    let mut sql = String::from(
        "SELECT COUNT(*), \
                COALESCE(SUM(status = 'success'), 0), \
                COALESCE(SUM(status = 'failed'), 0), \
                COALESCE(SUM(status = 'running'), 0), \
                COALESCE(AVG(duration_seconds), 0.0), \
                MAX(start_time) \
         FROM task_executions",
    );
    if task_id.is_some() {
        sql.push_str(" WHERE task_id = ?");
    }

    let mut query =
        sqlx::query_as::<_, (i64, i64, i64, i64, f64, Option<DateTime<Utc>>)>(&sql);
    if let Some(task_id) = task_id {
        query = query.bind(task_id);
    }

    let (total, success, failed, running, avg_duration, latest) = query
        .fetch_one(pool)
        .await
        .context("failed to compute execution stats")?;

    Ok(ExecutionStats {
        total_executions: total,
        success_count: success,
        failed_count: failed,
        running_count: running,
        success_rate: if total > 0 {
            success as f64 / total as f64
        } else {
            0.0
        },
        avg_duration_seconds: avg_duration,
        latest_execution_time: latest,
    })
}
