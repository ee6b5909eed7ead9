//! Database query functions for the `scheduled_tasks` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{Task, TaskKind};

/// Field values for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTaskRow {
    pub name: String,
    pub job_id: String,
    pub kind: TaskKind,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub enabled: bool,
    pub paused: bool,
    pub description: Option<String>,
    pub config_json: Option<String>,
    pub max_retries: i64,
    pub retry_interval: i64,
    pub created_by: Option<String>,
}

/// Insert a new task row. Returns the inserted task with its generated id.
pub async fn insert_task(pool: &SqlitePool, row: &NewTaskRow) -> Result<Task> {
    let now = Utc::now();
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO scheduled_tasks \
             (name, job_id, task_type, cron_expression, interval_seconds, enabled, paused, \
              description, config_json, max_retries, retry_interval, \
              created_by, created_time, updated_by, updated_time) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(&row.name)
    .bind(&row.job_id)
    .bind(row.kind)
    .bind(&row.cron_expression)
    .bind(row.interval_seconds)
    .bind(row.enabled)
    .bind(row.paused)
    .bind(&row.description)
    .bind(&row.config_json)
    .bind(row.max_retries)
    .bind(row.retry_interval)
    .bind(&row.created_by)
    .bind(now)
    .bind(&row.created_by)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM scheduled_tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a single task by its unique name.
pub async fn get_task_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM scheduled_tasks WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task by name")?;

    Ok(task)
}

/// Fetch every task of a given kind.
pub async fn list_tasks_by_kind(pool: &SqlitePool, kind: TaskKind) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM scheduled_tasks WHERE task_type = ? ORDER BY id ASC",
    )
    .bind(kind)
    .fetch_all(pool)
    .await
    .context("failed to list tasks by kind")?;

    Ok(tasks)
}

/// Fetch tasks by explicit IDs, in ID order.
pub async fn list_tasks_by_ids(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<Task>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql =
        format!("SELECT * FROM scheduled_tasks WHERE id IN ({placeholders}) ORDER BY id ASC");

    let mut query = sqlx::query_as::<_, Task>(&sql);
    for id in ids {
        query = query.bind(id);
    }

    let tasks = query
        .fetch_all(pool)
        .await
        .context("failed to list tasks by ids")?;

    Ok(tasks)
}

/// Filters, sorting, and paging for [`list_tasks`].
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub enabled: Option<bool>,
    /// Tasks to hide from the listing (e.g. workflow children).
    pub exclude_ids: Vec<i64>,
    /// One of the whitelisted sort columns; anything else falls back to `id`.
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            kind: None,
            enabled: None,
            exclude_ids: Vec::new(),
            order_by: None,
            descending: true,
            limit: 100,
            offset: 0,
        }
    }
}

/// Columns that may be sorted on. Sorting is interpolated into the SQL, so
/// the whitelist is load-bearing.
const SORTABLE_COLUMNS: [&str; 8] = [
    "id",
    "name",
    "task_type",
    "enabled",
    "paused",
    "max_retries",
    "created_time",
    "updated_time",
];

/// List tasks with optional filters, a whitelisted sort, and paging.
pub async fn list_tasks(pool: &SqlitePool, filter: &TaskFilter) -> Result<Vec<Task>> {
    let mut sql = String::from("SELECT * FROM scheduled_tasks WHERE 1 = 1");

    if filter.kind.is_some() {
        sql.push_str(" AND task_type = ?");
    }
    if filter.enabled.is_some() {
        sql.push_str(" AND enabled = ?");
    }
    if !filter.exclude_ids.is_empty() {
        let placeholders = vec!["?"; filter.exclude_ids.len()].join(", ");
        sql.push_str(&format!(" AND id NOT IN ({placeholders})"));
    }

    let column = filter
        .order_by
        .as_deref()
        .filter(|c| SORTABLE_COLUMNS.contains(c))
        .unwrap_or("id");
    let direction = if filter.descending { "DESC" } else { "ASC" };
    sql.push_str(&format!(" ORDER BY {column} {direction} LIMIT ? OFFSET ?"));

    let mut query = sqlx::query_as::<_, Task>(&sql);
    if let Some(kind) = filter.kind {
        query = query.bind(kind);
    }
    if let Some(enabled) = filter.enabled {
        query = query.bind(enabled);
    }
    for id in &filter.exclude_ids {
        query = query.bind(id);
    }
    query = query.bind(filter.limit).bind(filter.offset);

    let tasks = query.fetch_all(pool).await.context("failed to list tasks")?;
    Ok(tasks)
}

/// Write back every mutable column of a task row. The caller merges the
/// patch into a fetched row first, so this is a full-row update.
pub async fn update_task_row(pool: &SqlitePool, task: &Task) -> Result<Task> {
    let updated = sqlx::query_as::<_, Task>(
        "UPDATE scheduled_tasks \
         SET name = ?, \
             cron_expression = ?, \
             interval_seconds = ?, \
             description = ?, \
             config_json = ?, \
             max_retries = ?, \
             retry_interval = ?, \
             enabled = ?, \
             paused = ?, \
             updated_by = ?, \
             updated_time = ? \
         WHERE id = ? \
         RETURNING *",
    )
    .bind(&task.name)
    .bind(&task.cron_expression)
    .bind(task.interval_seconds)
    .bind(&task.description)
    .bind(&task.config_json)
    .bind(task.max_retries)
    .bind(task.retry_interval)
    .bind(task.enabled)
    .bind(task.paused)
    .bind(&task.updated_by)
    .bind(Utc::now())
    .bind(task.id)
    .fetch_one(pool)
    .await
    .context("failed to update task")?;

    Ok(updated)
}

/// Flip the `enabled` flag with audit stamping. Returns rows affected.
pub async fn set_enabled(
    pool: &SqlitePool,
    id: i64,
    enabled: bool,
    updated_by: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE scheduled_tasks SET enabled = ?, updated_by = ?, updated_time = ? WHERE id = ?",
    )
    .bind(enabled)
    .bind(updated_by)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set task enabled flag")?;

    Ok(result.rows_affected())
}

/// Flip the `paused` flag with audit stamping. Returns rows affected.
pub async fn set_paused(
    pool: &SqlitePool,
    id: i64,
    paused: bool,
    updated_by: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE scheduled_tasks SET paused = ?, updated_by = ?, updated_time = ? WHERE id = ?",
    )
    .bind(paused)
    .bind(updated_by)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set task paused flag")?;

    Ok(result.rows_affected())
}

/// Delete a task row. Execution history is left in place on purpose.
pub async fn delete_task(pool: &SqlitePool, id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete task")?;

    Ok(result.rows_affected())
}
