use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of a schedulable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Triggered by hand only; never entered into the schedule source.
    Manual,
    /// A single action or command, fired from a cron or interval schedule.
    Common,
    /// A DAG of child tasks executed serially or in parallel.
    Workflow,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Common => "common",
            Self::Workflow => "workflow",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskKind {
    type Err = TaskKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "common" => Ok(Self::Common),
            "workflow" => Ok(Self::Workflow),
            other => Err(TaskKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskKind`] string.
#[derive(Debug, Clone)]
pub struct TaskKindParseError(pub String);

impl fmt::Display for TaskKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskKindParseError {}

// ---------------------------------------------------------------------------

/// Status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Success,
    Failed,
    Completed,
    Terminated,
}

impl ExecutionStatus {
    /// A terminal execution is never re-opened; resumption creates a new row.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Completed | Self::Terminated
        )
    }

    /// Active executions hold their task's single-instance slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            "terminated" => Ok(Self::Terminated),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A schedulable task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: i64,
    pub name: String,
    /// Engine-generated stable handle used by the schedule source.
    pub job_id: String,
    #[sqlx(rename = "task_type")]
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
    pub created_time: DateTime<Utc>,
    pub updated_by: Option<String>,
    pub updated_time: DateTime<Utc>,
}

impl Task {
    /// Parse the opaque configuration blob. An absent blob is an empty map.
    pub fn config(&self) -> anyhow::Result<serde_json::Value> {
        match &self.config_json {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(serde_json::Value::Object(Default::default())),
        }
    }
}

/// One attempt at running a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskExecution {
    pub id: i64,
    /// Soft link; no foreign key so task deletion never cascades here.
    pub task_id: i64,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub result_json: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub progress_percent: f64,
    pub current_item: Option<String>,
    pub total_items: i64,
    pub processed_items: i64,
    pub estimated_end_time: Option<DateTime<Utc>>,
    pub is_paused: bool,
    pub terminate_requested: bool,
    pub created_by: Option<String>,
    pub created_time: DateTime<Utc>,
    pub updated_by: Option<String>,
    pub updated_time: DateTime<Utc>,
}

impl TaskExecution {
    /// Parse the compacted result blob. An absent blob is an empty map.
    pub fn result(&self) -> anyhow::Result<serde_json::Value> {
        match &self.result_json {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(serde_json::Value::Object(Default::default())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
