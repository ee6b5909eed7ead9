//! Shared test utilities for relay integration tests.
//!
//! Provides a temp-file SQLite database with migrations applied, a fast
//! engine config so timing-sensitive tests finish quickly, and a few canned
//! actions (flaky, sleeping, recording) used across the test suites.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::time::Instant;

use relay_core::action::{Action, ExecutionContext, ProgressUpdate};
use relay_core::config::SchedulerConfig;
use relay_core::error::{EngineError, EngineResult};
use relay_db::config::DbConfig;
use relay_db::pool;

static TRACING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info".into());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, dir)`; keep the [`TempDir`] alive for the duration of
/// the test, it owns the database file.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("relay-test.db");
    let config = DbConfig::new(format!("sqlite://{}", path.display()));

    let db = pool::create_pool(&config)
        .await
        .expect("failed to open test database");
    pool::run_migrations(&db, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (db, dir)
}

/// An engine config with sub-second loops so tests do not sit around.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: Duration::from_millis(100),
        sweeper_interval: Duration::from_millis(500),
        ..Default::default()
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Canned actions
// ---------------------------------------------------------------------------

/// Fails a fixed number of calls, then succeeds forever.
pub struct FlakyAction {
    action_name: String,
    failures_before_success: usize,
    calls: AtomicUsize,
}

impl FlakyAction {
    pub fn new(name: &str, failures_before_success: usize) -> Self {
        Self {
            action_name: name.to_string(),
            failures_before_success,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Action for FlakyAction {
    fn name(&self) -> &str {
        &self.action_name
    }

    async fn execute(&self, _ctx: &ExecutionContext, _config: &Value) -> EngineResult<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            Err(EngineError::Action(format!(
                "flaky failure {} of {}",
                call + 1,
                self.failures_before_success
            )))
        } else {
            Ok(json!({"success": true, "message": "finally made it", "call": call + 1}))
        }
    }
}

/// Works in small steps, reporting progress (and therefore observing pause
/// and terminate) between them.
pub struct SleepAction {
    action_name: String,
    steps: i64,
    step_delay: Duration,
}

impl SleepAction {
    pub fn new(name: &str, steps: i64, step_delay: Duration) -> Self {
        Self {
            action_name: name.to_string(),
            steps,
            step_delay,
        }
    }
}

#[async_trait]
impl Action for SleepAction {
    fn name(&self) -> &str {
        &self.action_name
    }

    async fn execute(&self, ctx: &ExecutionContext, _config: &Value) -> EngineResult<Value> {
        for step in 0..self.steps {
            ctx.report_progress(ProgressUpdate {
                processed_items: Some(step),
                total_items: Some(self.steps),
                current_item: Some(format!("step {}", step + 1)),
                ..Default::default()
            })
            .await?;
            tokio::time::sleep(self.step_delay).await;
        }
        Ok(json!({"success": true, "steps": self.steps}))
    }
}

/// Records the execution ids it runs under, then succeeds.
pub struct RecordingAction {
    action_name: String,
    runs: Arc<Mutex<Vec<i64>>>,
}

impl RecordingAction {
    pub fn new(name: &str) -> (Self, Arc<Mutex<Vec<i64>>>) {
        let runs = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                action_name: name.to_string(),
                runs: Arc::clone(&runs),
            },
            runs,
        )
    }
}

#[async_trait]
impl Action for RecordingAction {
    fn name(&self) -> &str {
        &self.action_name
    }

    async fn execute(&self, ctx: &ExecutionContext, _config: &Value) -> EngineResult<Value> {
        self.runs
            .lock()
            .expect("recording action poisoned")
            .push(ctx.execution_id());
        Ok(json!({"success": true}))
    }
}

/// Always fails with the given message.
pub struct FailingAction {
    action_name: String,
    message: String,
}

impl FailingAction {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            action_name: name.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Action for FailingAction {
    fn name(&self) -> &str {
        &self.action_name
    }

    async fn execute(&self, _ctx: &ExecutionContext, _config: &Value) -> EngineResult<Value> {
        Err(EngineError::Action(self.message.clone()))
    }
}
