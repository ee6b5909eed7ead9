//! Task management: validation plus CRUD on top of the store.
//!
//! Everything that can reject a task spec lives here, so the dispatcher and
//! runtime can assume rows they load are well-formed: manual tasks carry no
//! schedule, cron expressions parse, workflow DAGs are closed and acyclic.

use std::collections::HashSet;

use serde_json::Value;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use relay_db::models::{Task, TaskKind};
use relay_db::queries::tasks as task_db;
use relay_db::queries::tasks::{NewTaskRow, TaskFilter};

use crate::cron::parse_cron_expression;
use crate::error::{EngineError, EngineResult};
use crate::workflow;

/// A task creation request.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub kind: TaskKind,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub description: Option<String>,
    pub config: Option<Value>,
    pub max_retries: i64,
    pub retry_interval: i64,
    pub enabled: bool,
    pub created_by: Option<String>,
}

impl NewTask {
    /// A spec with the engine defaults: enabled, three retries a minute
    /// apart, no schedule and no config.
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            cron_expression: None,
            interval_seconds: None,
            description: None,
            config: None,
            max_retries: 3,
            retry_interval: 60,
            enabled: true,
            created_by: None,
        }
    }
}

/// A partial task update. Outer `None` leaves a field unchanged; for the
/// schedule fields the inner `Option` distinguishes "set" from "clear".
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub cron_expression: Option<Option<String>>,
    pub interval_seconds: Option<Option<i64>>,
    pub description: Option<String>,
    pub config: Option<Value>,
    pub max_retries: Option<i64>,
    pub retry_interval: Option<i64>,
    pub updated_by: Option<String>,
}

/// Listing parameters for [`list_tasks`].
#[derive(Debug, Clone)]
pub struct ListTasks {
    pub kind: Option<TaskKind>,
    pub enabled: Option<bool>,
    /// Hide tasks referenced as children of some workflow.
    pub exclude_children: bool,
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListTasks {
    fn default() -> Self {
        Self {
            kind: None,
            enabled: None,
            exclude_children: true,
            order_by: None,
            descending: true,
            limit: 100,
            offset: 0,
        }
    }
}

/// Create a task after validating the spec.
///
/// Rejects duplicate names, manual tasks with a schedule, double schedules,
/// unparseable cron expressions, non-positive intervals, and workflow
/// configs whose DAG does not check out. Manual tasks are stored disabled;
/// they only ever run by explicit trigger after an `enable`.
pub async fn create_task(pool: &SqlitePool, spec: NewTask) -> EngineResult<Task> {
    if spec.name.trim().is_empty() {
        return Err(EngineError::Validation("task name must not be empty".to_string()));
    }
    if task_db::get_task_by_name(pool, &spec.name)
        .await
        .map_err(EngineError::Infrastructure)?
        .is_some()
    {
        return Err(EngineError::Validation(format!(
            "task name {:?} already exists",
            spec.name
        )));
    }

    validate_retry_policy(spec.max_retries, spec.retry_interval)?;
    validate_schedule(spec.kind, &spec.cron_expression, spec.interval_seconds)?;

    if spec.kind == TaskKind::Workflow {
        let config = spec.config.as_ref().ok_or_else(|| {
            EngineError::Validation("workflow task requires a workflow config".to_string())
        })?;
        workflow::validate_workflow_config(pool, config).await?;
    }

    // Manual tasks never auto-fire; they start disabled.
    let enabled = spec.enabled && spec.kind != TaskKind::Manual;

    let job_id = format!(
        "{}_{}_{}",
        spec.kind,
        spec.name,
        Uuid::new_v4().simple()
    );

    let row = NewTaskRow {
        name: spec.name,
        job_id,
        kind: spec.kind,
        cron_expression: spec.cron_expression,
        interval_seconds: spec.interval_seconds,
        enabled,
        paused: false,
        description: spec.description,
        config_json: spec.config.map(|c| c.to_string()),
        max_retries: spec.max_retries,
        retry_interval: spec.retry_interval,
        created_by: spec.created_by,
    };

    let task = task_db::insert_task(pool, &row)
        .await
        .map_err(EngineError::Infrastructure)?;
    info!(task_id = task.id, task = %task.name, kind = %task.kind, "task created");
    Ok(task)
}

/// Apply a validated patch to a task.
pub async fn update_task(pool: &SqlitePool, id: i64, patch: TaskPatch) -> EngineResult<Task> {
    let mut task = get_task(pool, id).await?;

    if let Some(name) = &patch.name {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("task name must not be empty".to_string()));
        }
        if name != &task.name {
            if let Some(existing) = task_db::get_task_by_name(pool, name)
                .await
                .map_err(EngineError::Infrastructure)?
            {
                if existing.id != id {
                    return Err(EngineError::Validation(format!(
                        "task name {name:?} already exists"
                    )));
                }
            }
            task.name = name.clone();
        }
    }

    if let Some(cron) = patch.cron_expression {
        task.cron_expression = cron;
    }
    if let Some(interval) = patch.interval_seconds {
        task.interval_seconds = interval;
    }
    if let Some(description) = patch.description {
        task.description = Some(description);
    }
    if let Some(config) = &patch.config {
        task.config_json = Some(config.to_string());
    }
    if let Some(max_retries) = patch.max_retries {
        task.max_retries = max_retries;
    }
    if let Some(retry_interval) = patch.retry_interval {
        task.retry_interval = retry_interval;
    }
    if patch.updated_by.is_some() {
        task.updated_by = patch.updated_by;
    }

    validate_retry_policy(task.max_retries, task.retry_interval)?;
    validate_schedule(task.kind, &task.cron_expression, task.interval_seconds)?;

    if task.kind == TaskKind::Workflow {
        let config = task.config().map_err(|err| {
            EngineError::Validation(format!("unparseable workflow config: {err}"))
        })?;
        workflow::validate_workflow_config(pool, &config).await?;
    }

    let updated = task_db::update_task_row(pool, &task)
        .await
        .map_err(EngineError::Infrastructure)?;
    info!(task_id = id, task = %updated.name, "task updated");
    Ok(updated)
}

/// Fetch a task or report `not_found`.
pub async fn get_task(pool: &SqlitePool, id: i64) -> EngineResult<Task> {
    task_db::get_task(pool, id)
        .await
        .map_err(EngineError::Infrastructure)?
        .ok_or_else(|| EngineError::NotFound(format!("task {id}")))
}

/// Delete a task, returning the removed row. Execution history stays.
pub async fn delete_task(pool: &SqlitePool, id: i64) -> EngineResult<Task> {
    let task = get_task(pool, id).await?;
    task_db::delete_task(pool, id)
        .await
        .map_err(EngineError::Infrastructure)?;
    info!(task_id = id, task = %task.name, "task deleted");
    Ok(task)
}

/// List tasks with filters, sorting, and paging.
pub async fn list_tasks(pool: &SqlitePool, params: &ListTasks) -> EngineResult<Vec<Task>> {
    let exclude_ids = if params.exclude_children {
        workflow_child_ids(pool).await?
    } else {
        Vec::new()
    };

    let filter = TaskFilter {
        kind: params.kind,
        enabled: params.enabled,
        exclude_ids,
        order_by: params.order_by.clone(),
        descending: params.descending,
        limit: params.limit,
        offset: params.offset,
    };
    task_db::list_tasks(pool, &filter)
        .await
        .map_err(EngineError::Infrastructure)
}

/// Flip the enabled flag, returning the updated task.
pub async fn set_enabled(
    pool: &SqlitePool,
    id: i64,
    enabled: bool,
    updated_by: Option<&str>,
) -> EngineResult<Task> {
    let rows = task_db::set_enabled(pool, id, enabled, updated_by)
        .await
        .map_err(EngineError::Infrastructure)?;
    if rows == 0 {
        return Err(EngineError::NotFound(format!("task {id}")));
    }
    info!(task_id = id, enabled, "task enabled flag updated");
    get_task(pool, id).await
}

/// Flip the paused flag, returning the updated task.
pub async fn set_paused(
    pool: &SqlitePool,
    id: i64,
    paused: bool,
    updated_by: Option<&str>,
) -> EngineResult<Task> {
    let rows = task_db::set_paused(pool, id, paused, updated_by)
        .await
        .map_err(EngineError::Infrastructure)?;
    if rows == 0 {
        return Err(EngineError::NotFound(format!("task {id}")));
    }
    info!(task_id = id, paused, "task paused flag updated");
    get_task(pool, id).await
}

/// The child tasks referenced by a workflow task, in ID order.
pub async fn workflow_children(pool: &SqlitePool, workflow_task_id: i64) -> EngineResult<Vec<Task>> {
    let task = get_task(pool, workflow_task_id).await?;
    if task.kind != TaskKind::Workflow {
        return Err(EngineError::Validation(format!(
            "task {workflow_task_id} is not a workflow"
        )));
    }

    let config = task.config().map_err(|err| {
        EngineError::Validation(format!("unparseable workflow config: {err}"))
    })?;
    let ids = child_ids_of(&config);
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    task_db::list_tasks_by_ids(pool, &ids)
        .await
        .map_err(EngineError::Infrastructure)
}

/// IDs of every task referenced as a workflow child, across all workflows.
async fn workflow_child_ids(pool: &SqlitePool) -> EngineResult<Vec<i64>> {
    let workflows = task_db::list_tasks_by_kind(pool, TaskKind::Workflow)
        .await
        .map_err(EngineError::Infrastructure)?;

    let mut ids = HashSet::new();
    for task in workflows {
        let Ok(config) = task.config() else { continue };
        ids.extend(child_ids_of(&config));
    }
    let mut ids: Vec<i64> = ids.into_iter().collect();
    ids.sort_unstable();
    Ok(ids)
}

fn child_ids_of(config: &Value) -> Vec<i64> {
    config
        .get("tasks")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("task_id").and_then(Value::as_i64))
                .collect()
        })
        .unwrap_or_default()
}

fn validate_retry_policy(max_retries: i64, retry_interval: i64) -> EngineResult<()> {
    if max_retries < 0 {
        return Err(EngineError::Validation("max_retries must not be negative".to_string()));
    }
    if retry_interval < 0 {
        return Err(EngineError::Validation("retry_interval must not be negative".to_string()));
    }
    Ok(())
}

fn validate_schedule(
    kind: TaskKind,
    cron_expression: &Option<String>,
    interval_seconds: Option<i64>,
) -> EngineResult<()> {
    if kind == TaskKind::Manual {
        if cron_expression.is_some() {
            return Err(EngineError::Validation(
                "manual tasks do not take a cron schedule".to_string(),
            ));
        }
        if interval_seconds.is_some() {
            return Err(EngineError::Validation(
                "manual tasks do not take an interval schedule".to_string(),
            ));
        }
        return Ok(());
    }

    if cron_expression.is_some() && interval_seconds.is_some() {
        return Err(EngineError::Validation(
            "a task takes at most one of cron_expression and interval_seconds".to_string(),
        ));
    }
    if let Some(expr) = cron_expression {
        parse_cron_expression(expr)?;
    }
    if let Some(secs) = interval_seconds {
        if secs < 1 {
            return Err(EngineError::Validation(
                "interval_seconds must be at least 1".to_string(),
            ));
        }
    }
    Ok(())
}
