//! The execution context handed to every running action.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_db::queries::executions as exec_db;
use relay_db::queries::executions::ProgressPatch;

use crate::error::{EngineError, EngineResult};

/// How long a paused action sleeps between control-flag polls.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A partial progress report. Absent fields leave the stored values alone.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    /// Explicit percentage; derived from the counters when absent.
    pub progress_percent: Option<f64>,
    /// Free-form label for the item currently being processed.
    pub current_item: Option<String>,
    pub total_items: Option<i64>,
    pub processed_items: Option<i64>,
}

/// Cancellation, pause, and progress plumbing for one execution.
///
/// Control flags are always read back from the store, never from a cached
/// row, so pause/terminate requests issued through the control API are
/// observed within one progress poll.
#[derive(Clone)]
pub struct ExecutionContext {
    pool: SqlitePool,
    task_id: i64,
    execution_id: i64,
    start_time: DateTime<Utc>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub(crate) fn new(
        pool: SqlitePool,
        task_id: i64,
        execution_id: i64,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            pool,
            task_id,
            execution_id,
            start_time,
            cancel: CancellationToken::new(),
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn execution_id(&self) -> i64 {
        self.execution_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// The cancellation handle for this execution. Cancelled once a
    /// terminate request has been observed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report progress and observe control flags.
    ///
    /// Updates are idempotent and cumulative; `processed_items` never
    /// decreases within an execution. When both counters are known the
    /// store also receives an `estimated_end_time` extrapolated from the
    /// elapsed wall clock. Returns [`EngineError::Cancelled`] once a
    /// terminate request is seen; blocks (in one-second sleeps) while the
    /// execution is paused.
    pub async fn report_progress(&self, update: ProgressUpdate) -> EngineResult<()> {
        let progress_percent = update.progress_percent.or_else(|| {
            match (update.processed_items, update.total_items) {
                (Some(done), Some(total)) if total > 0 => {
                    Some((done as f64 / total as f64) * 100.0)
                }
                _ => None,
            }
        });

        let patch = ProgressPatch {
            progress_percent,
            current_item: update.current_item,
            total_items: update.total_items,
            processed_items: update.processed_items,
            estimated_end_time: estimate_end_time(
                self.start_time,
                update.processed_items,
                update.total_items,
            ),
            duration_seconds: Some((Utc::now() - self.start_time).num_seconds().max(0)),
        };

        exec_db::update_progress(&self.pool, self.execution_id, &patch)
            .await
            .map_err(EngineError::Infrastructure)?;

        self.checkpoint().await
    }

    /// Observe control flags without writing progress.
    ///
    /// Spins while paused (flipping the row to `paused` for the duration),
    /// and surfaces a terminate request as [`EngineError::Cancelled`] after
    /// cancelling the context token. Terminate wins over pause, so an
    /// execution terminated while parked still ends `terminated`.
    pub async fn checkpoint(&self) -> EngineResult<()> {
        let mut parked = false;
        loop {
            let flags = exec_db::get_control_flags(&self.pool, self.execution_id)
                .await
                .map_err(EngineError::Infrastructure)?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("execution {}", self.execution_id))
                })?;

            if flags.terminate_requested {
                self.cancel.cancel();
                return Err(EngineError::Cancelled);
            }

            if flags.is_paused {
                if !parked {
                    parked = true;
                    debug!(execution_id = self.execution_id, "execution paused");
                    exec_db::mark_paused(&self.pool, self.execution_id)
                        .await
                        .map_err(EngineError::Infrastructure)?;
                }
                tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                continue;
            }

            if parked {
                debug!(execution_id = self.execution_id, "execution resumed");
                exec_db::resume_mark_running(&self.pool, self.execution_id)
                    .await
                    .map_err(EngineError::Infrastructure)?;
            }
            return Ok(());
        }
    }

    /// Keep `duration_seconds` fresh without a full progress report.
    pub(crate) async fn record_duration(&self) -> EngineResult<()> {
        let patch = ProgressPatch {
            duration_seconds: Some((Utc::now() - self.start_time).num_seconds().max(0)),
            ..Default::default()
        };
        exec_db::update_progress(&self.pool, self.execution_id, &patch)
            .await
            .map_err(EngineError::Infrastructure)?;
        Ok(())
    }
}

/// Extrapolate a completion time from the counters, when both are set and
/// some work has already happened.
fn estimate_end_time(
    start_time: DateTime<Utc>,
    processed_items: Option<i64>,
    total_items: Option<i64>,
) -> Option<DateTime<Utc>> {
    let processed = processed_items?;
    let total = total_items?;
    if processed <= 0 || total <= 0 || processed > total {
        return None;
    }

    let now = Utc::now();
    let elapsed = (now - start_time).num_milliseconds();
    if elapsed <= 0 {
        return None;
    }

    let remaining_ms = elapsed as f64 * (total - processed) as f64 / processed as f64;
    Some(now + chrono::Duration::milliseconds(remaining_ms as i64))
}
