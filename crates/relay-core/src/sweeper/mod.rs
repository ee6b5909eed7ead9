//! The recovery sweeper: reconciles execution rows orphaned by a crash or
//! restart.
//!
//! An execution row in `{running, paused}` claims a live worker. After a
//! process restart no such worker exists, so the row would hold its task's
//! single-instance slot forever. The sweeper runs once at startup and then
//! on a slow timer, asking the liveness registry about every active row and
//! force-terminating the ones nobody owns.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_db::queries::executions as exec_db;

use crate::error::{EngineError, EngineResult};
use crate::runtime::liveness::LivenessRegistry;

/// Error message recorded on executions whose worker has vanished.
pub const LOST_WORKER_MESSAGE: &str = "运行线程已丢失（可能由于系统重启）";

pub struct Sweeper {
    pool: SqlitePool,
    liveness: LivenessRegistry,
    interval: Duration,
}

impl Sweeper {
    pub fn new(pool: SqlitePool, liveness: LivenessRegistry, interval: Duration) -> Self {
        Self {
            pool,
            liveness,
            interval,
        }
    }

    /// Scan active executions once; force-terminate every zombie. Returns
    /// the number of rows reclaimed.
    pub async fn sweep_once(&self) -> EngineResult<u64> {
        let active = exec_db::list_active(&self.pool)
            .await
            .map_err(EngineError::Infrastructure)?;

        let mut reclaimed = 0;
        for execution in active {
            if self.liveness.is_alive(execution.id) {
                continue;
            }
            warn!(
                execution_id = execution.id,
                task_id = execution.task_id,
                "active execution has no live worker, force-terminating"
            );
            let rows = exec_db::force_terminate(&self.pool, execution.id, LOST_WORKER_MESSAGE)
                .await
                .map_err(EngineError::Infrastructure)?;
            reclaimed += rows;
        }

        if reclaimed > 0 {
            info!(reclaimed, "sweeper reclaimed orphaned executions");
        }
        Ok(reclaimed)
    }

    /// Sweep immediately, then on every interval tick until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "recovery sweeper started");
        if let Err(err) = self.sweep_once().await {
            error!(error = %err, "startup sweep failed");
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // the immediate first tick was the startup sweep
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = %err, "sweep failed");
                    }
                }
            }
        }
        info!("recovery sweeper stopped");
    }
}
