//! The workflow orchestrator: executes a DAG of child tasks on behalf of a
//! workflow-type execution.
//!
//! Children run through the ordinary runtime path, so each child holds its
//! own gated execution, observes its own pause/terminate flags, and spends
//! its own retry budget. The workflow execution itself never takes outer
//! retries; partial failure is governed solely by `on_failure`.

pub mod graph;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tracing::{info, warn};

use relay_db::models::{ExecutionStatus, Task};
use relay_db::queries::executions as exec_db;
use relay_db::queries::tasks as task_db;

use crate::action::{ExecutionContext, ProgressUpdate};
use crate::error::{EngineError, EngineResult};
use crate::runtime::Runtime;
use graph::DependencyGraph;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// How the child set is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    /// One child at a time, in topological order.
    Serial,
    /// Waves of dependency-ready children, dispatched concurrently.
    Parallel,
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Serial => "serial",
            Self::Parallel => "parallel",
        })
    }
}

/// Policy when a child fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Skip everything not yet started.
    #[default]
    Stop,
    /// Keep walking the rest of the DAG.
    Continue,
}

/// One child entry in a workflow config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    pub task_id: i64,
    #[serde(default)]
    pub dependencies: Vec<i64>,
}

/// The `config_json` shape of a workflow task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub workflow_type: WorkflowMode,
    pub tasks: Vec<ChildSpec>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub resume_from_execution_id: Option<i64>,
}

/// Parse a raw config blob into a [`WorkflowConfig`].
pub fn parse_workflow_config(raw: &Value) -> EngineResult<WorkflowConfig> {
    serde_json::from_value(raw.clone())
        .map_err(|err| EngineError::Validation(format!("invalid workflow config: {err}")))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a workflow config against the store.
///
/// Checks: at least one child, no duplicates, every child exists and is
/// enabled, dependencies stay inside the child set, and the graph is
/// acyclic. Returns the parsed config plus the loaded child tasks. Run both
/// at create/update time and again just before execution, in case the
/// referenced tasks changed in between.
pub async fn validate_workflow_config(
    pool: &SqlitePool,
    raw: &Value,
) -> EngineResult<(WorkflowConfig, HashMap<i64, Task>)> {
    let config = parse_workflow_config(raw)?;

    if config.tasks.is_empty() {
        return Err(EngineError::Validation(
            "workflow must contain at least one child task".to_string(),
        ));
    }

    let ids: Vec<i64> = config.tasks.iter().map(|c| c.task_id).collect();
    let unique: HashSet<i64> = ids.iter().copied().collect();
    if unique.len() != ids.len() {
        return Err(EngineError::Validation(
            "workflow lists the same child task more than once".to_string(),
        ));
    }

    let rows = task_db::list_tasks_by_ids(pool, &ids)
        .await
        .map_err(EngineError::Infrastructure)?;
    let children: HashMap<i64, Task> = rows.into_iter().map(|t| (t.id, t)).collect();

    let missing: Vec<i64> = ids.iter().copied().filter(|id| !children.contains_key(id)).collect();
    if !missing.is_empty() {
        return Err(EngineError::Validation(format!(
            "workflow references unknown tasks: {missing:?}"
        )));
    }

    let disabled: Vec<i64> = children
        .values()
        .filter(|t| !t.enabled)
        .map(|t| t.id)
        .collect();
    if !disabled.is_empty() {
        return Err(EngineError::Validation(format!(
            "workflow references disabled tasks: {disabled:?}"
        )));
    }

    let dep_graph = dependency_graph(&config);
    graph::validate_edges(&dep_graph)?;
    graph::detect_cycles(&dep_graph)?;

    Ok((config, children))
}

fn dependency_graph(config: &WorkflowConfig) -> DependencyGraph {
    config
        .tasks
        .iter()
        .map(|c| (c.task_id, c.dependencies.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Execute a workflow config under the given execution context.
///
/// The returned value is the workflow result envelope; child failures live
/// inside it and never cross this boundary as errors. Cancellation of the
/// workflow execution does: once the context observes a terminate request
/// no further children are dispatched and `Cancelled` propagates.
pub(crate) async fn run_workflow(
    runtime: &Runtime,
    ctx: &ExecutionContext,
    raw_config: &Value,
) -> EngineResult<Value> {
    let (config, children) = validate_workflow_config(runtime.pool(), raw_config).await?;

    let declared: Vec<i64> = config.tasks.iter().map(|c| c.task_id).collect();
    let dep_graph = dependency_graph(&config);

    // Resume support: children that already succeeded in the prior
    // execution get a skip record instead of a new run.
    let mut results: BTreeMap<i64, Value> = BTreeMap::new();
    if let Some(prior_id) = config.resume_from_execution_id {
        let succeeded = prior_successes(runtime.pool(), prior_id).await?;
        for id in &declared {
            if succeeded.contains(id) {
                results.insert(*id, skip_record(&children[id]));
            }
        }
        info!(
            execution_id = ctx.execution_id(),
            resume_from = prior_id,
            skipped = results.len(),
            "resuming workflow, skipping previously successful children"
        );
    }

    match config.workflow_type {
        WorkflowMode::Serial => {
            run_serial(runtime, ctx, &config, &children, &declared, &dep_graph, &mut results)
                .await?;
        }
        WorkflowMode::Parallel => {
            run_parallel(runtime, ctx, &config, &children, &declared, &dep_graph, &mut results)
                .await?;
        }
    }

    // Final progress flush; a terminate arriving this late no longer
    // changes what already ran.
    let _ = ctx
        .report_progress(ProgressUpdate {
            processed_items: Some(results.len() as i64),
            total_items: Some(declared.len() as i64),
            ..Default::default()
        })
        .await;

    Ok(summarize(&config, declared.len(), &results))
}

async fn run_serial(
    runtime: &Runtime,
    ctx: &ExecutionContext,
    config: &WorkflowConfig,
    children: &HashMap<i64, Task>,
    declared: &[i64],
    dep_graph: &DependencyGraph,
    results: &mut BTreeMap<i64, Value>,
) -> EngineResult<()> {
    let order = graph::topological_order(declared, dep_graph)?;
    let total = order.len() as i64;

    for id in order {
        if results.contains_key(&id) {
            continue;
        }
        let child = &children[&id];

        ctx.report_progress(ProgressUpdate {
            processed_items: Some(results.len() as i64),
            total_items: Some(total),
            current_item: Some(child.name.clone()),
            ..Default::default()
        })
        .await?;

        info!(
            execution_id = ctx.execution_id(),
            child_task = %child.name,
            "serial workflow: starting child"
        );
        let entry = run_child(runtime, child).await;
        let failed = entry_failed(&entry);
        results.insert(id, entry);

        if failed && config.on_failure == OnFailure::Stop {
            warn!(
                execution_id = ctx.execution_id(),
                child_task = %child.name,
                "child failed, stopping workflow (on_failure=stop)"
            );
            break;
        }
    }
    Ok(())
}

async fn run_parallel(
    runtime: &Runtime,
    ctx: &ExecutionContext,
    config: &WorkflowConfig,
    children: &HashMap<i64, Task>,
    declared: &[i64],
    dep_graph: &DependencyGraph,
    results: &mut BTreeMap<i64, Value>,
) -> EngineResult<()> {
    let total = declared.len();
    let mut done: HashSet<i64> = results.keys().copied().collect();

    while done.len() < total {
        let ready = graph::ready_set(declared, dep_graph, &done);
        if ready.is_empty() {
            // Unreachable after cycle validation, but a config raced
            // underneath us is better surfaced than spun on.
            return Err(EngineError::Validation(format!(
                "workflow cannot make progress; {} children remain blocked",
                total - done.len()
            )));
        }

        ctx.report_progress(ProgressUpdate {
            processed_items: Some(done.len() as i64),
            total_items: Some(total as i64),
            current_item: ready.first().map(|id| children[id].name.clone()),
            ..Default::default()
        })
        .await?;

        info!(
            execution_id = ctx.execution_id(),
            wave_size = ready.len(),
            "parallel workflow: dispatching wave"
        );
        let wave =
            futures::future::join_all(ready.iter().map(|id| run_child(runtime, &children[id])))
                .await;

        let mut wave_failed = false;
        for (id, entry) in ready.iter().zip(wave) {
            wave_failed |= entry_failed(&entry);
            done.insert(*id);
            results.insert(*id, entry);
        }

        if wave_failed && config.on_failure == OnFailure::Stop {
            warn!(
                execution_id = ctx.execution_id(),
                "wave had failures, stopping workflow (on_failure=stop)"
            );
            break;
        }
    }
    Ok(())
}

/// Run one child through the ordinary runtime path.
///
/// Always returns a result entry; failures (including a rejected
/// single-instance gate) are recorded, never raised.
async fn run_child(runtime: &Runtime, child: &Task) -> Value {
    let gated = exec_db::insert_execution_gated(
        runtime.pool(),
        child.id,
        0,
        None,
        runtime.max_result_chars(),
    )
    .await;

    let execution = match gated {
        Ok(Some(execution)) => execution,
        Ok(None) => {
            return failure_entry(child, "child task already has an active execution");
        }
        Err(err) => {
            return failure_entry(child, &format!("could not create child execution: {err}"));
        }
    };

    let outcome = runtime.run(child.clone(), execution).await;
    match outcome.status {
        ExecutionStatus::Success => json!({
            "task_id": child.id,
            "task_name": child.name,
            "status": "success",
            "result": outcome.result.unwrap_or_else(|| json!({})),
        }),
        status => failure_entry(
            child,
            &outcome
                .error
                .unwrap_or_else(|| format!("child execution ended {status}")),
        ),
    }
}

fn failure_entry(child: &Task, error: &str) -> Value {
    json!({
        "task_id": child.id,
        "task_name": child.name,
        "status": "failed",
        "error": error,
    })
}

fn skip_record(child: &Task) -> Value {
    json!({
        "task_id": child.id,
        "task_name": child.name,
        "status": "success",
        "result": {"message": "skipped previously successful child (resume)"},
        "skipped": true,
    })
}

fn entry_failed(entry: &Value) -> bool {
    entry.get("status").and_then(Value::as_str) == Some("failed")
}

/// Children of a prior execution whose recorded status was `success`.
async fn prior_successes(pool: &SqlitePool, prior_id: i64) -> EngineResult<HashSet<i64>> {
    let Some(prior) = exec_db::get_execution(pool, prior_id)
        .await
        .map_err(EngineError::Infrastructure)?
    else {
        return Ok(HashSet::new());
    };

    let result = prior.result().unwrap_or_else(|_| json!({}));
    let mut succeeded = HashSet::new();
    if let Some(task_results) = result.get("task_results").and_then(Value::as_object) {
        for (key, entry) in task_results {
            if entry.get("status").and_then(Value::as_str) == Some("success") {
                if let Ok(id) = key.parse::<i64>() {
                    succeeded.insert(id);
                }
            }
        }
    }
    Ok(succeeded)
}

fn summarize(config: &WorkflowConfig, total: usize, results: &BTreeMap<i64, Value>) -> Value {
    let failed_task_ids: Vec<i64> = results
        .iter()
        .filter(|(_, entry)| entry_failed(entry))
        .map(|(id, _)| *id)
        .collect();
    let success_count = results.len() - failed_task_ids.len();
    let failed_count = failed_task_ids.len();

    let task_results: serde_json::Map<String, Value> = results
        .iter()
        .map(|(id, entry)| (id.to_string(), entry.clone()))
        .collect();

    let mut summary = json!({
        "workflow_type": config.workflow_type,
        "total_tasks": total,
        "success_count": success_count,
        "failed_count": failed_count,
        "failed_task_ids": failed_task_ids,
        "task_results": task_results,
        "message": format!(
            "{} workflow finished: {success_count}/{total} succeeded, {failed_count} failed",
            config.workflow_type
        ),
    });
    if let Some(prior) = config.resume_from_execution_id {
        summary["resume_from_execution_id"] = json!(prior);
    }
    summary
}
