//! The script runner: executes an external command under the engine's
//! timeout and cooperative-control rules.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::action::ExecutionContext;
use crate::config::SchedulerConfig;
use crate::error::{EngineError, EngineResult};

/// Environment variable carrying the execution id into the child process.
pub const EXECUTION_ID_ENV: &str = "RELAY_EXECUTION_ID";

/// How often the wait loop checks the wall clock and the control flags.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Characters of stderr carried into the failure message.
const STDERR_HEAD_CHARS: usize = 500;

/// Cap on the stderr buffer retained in memory.
const STDERR_BUFFER_CHARS: usize = 4_000;

/// Run the `command` described by the task config.
///
/// Tokenizes shell-style, infers the working directory from the first
/// token, streams both output pipes line-by-line into the log, and polls
/// every two seconds for timeout (config `timeout_seconds`, engine default
/// otherwise) and terminate requests. Stdout and stderr never enter the
/// returned result; on failure the head of stderr rides along in the error.
pub async fn run_command(
    ctx: &ExecutionContext,
    config: &Value,
    engine_config: &SchedulerConfig,
) -> EngineResult<Value> {
    let command = config
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Validation("config is missing 'command'".to_string()))?;

    let timeout = config
        .get("timeout_seconds")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .unwrap_or(engine_config.default_command_timeout);

    let argv = shell_words::split(command).map_err(|err| {
        EngineError::Validation(format!("failed to tokenize command {command:?}: {err}"))
    })?;
    if argv.is_empty() {
        return Err(EngineError::Validation("command must not be empty".to_string()));
    }

    let work_dir = infer_work_dir(&argv[0], &engine_config.project_root);
    info!(
        execution_id = ctx.execution_id(),
        command,
        work_dir = %work_dir.display(),
        timeout_secs = timeout.as_secs(),
        "running command"
    );

    let started = Instant::now();

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(&work_dir)
        .env(EXECUTION_ID_ENV, ctx.execution_id().to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| EngineError::Action(format!("failed to spawn {command:?}: {err}")))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(stream_output(stdout, ctx.execution_id(), false, None));
    }
    let stderr_buffer = Arc::new(Mutex::new(String::new()));
    let stderr_reader = child.stderr.take().map(|stderr| {
        tokio::spawn(stream_output(
            stderr,
            ctx.execution_id(),
            true,
            Some(Arc::clone(&stderr_buffer)),
        ))
    });

    let status = wait_with_polling(ctx, &mut child, started, timeout, command).await?;

    // Let the reader drain the pipe before the buffer is inspected.
    if let Some(reader) = stderr_reader {
        let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;
    }

    let duration_seconds = started.elapsed().as_secs() as i64;
    let exit_code = status.code().unwrap_or(-1);

    if status.success() {
        info!(
            execution_id = ctx.execution_id(),
            exit_code, duration_seconds, "command succeeded"
        );
        Ok(json!({
            "success": true,
            "exit_code": exit_code,
            "command": command,
            "work_dir": work_dir.display().to_string(),
            "duration_seconds": duration_seconds,
        }))
    } else {
        let head = stderr_head(&stderr_buffer);
        warn!(
            execution_id = ctx.execution_id(),
            exit_code, duration_seconds, "command failed"
        );
        Err(EngineError::Action(format!(
            "command exited with code {exit_code}: {head}"
        )))
    }
}

/// Wait for the child, checking the wall clock and the control flags on
/// every poll tick. Kills the process on timeout or terminate.
async fn wait_with_polling(
    ctx: &ExecutionContext,
    child: &mut Child,
    started: Instant,
    timeout: Duration,
    command: &str,
) -> EngineResult<std::process::ExitStatus> {
    loop {
        match tokio::time::timeout(POLL_INTERVAL, child.wait()).await {
            Ok(Ok(status)) => return Ok(status),
            Ok(Err(err)) => {
                return Err(EngineError::Action(format!(
                    "failed waiting on {command:?}: {err}"
                )));
            }
            Err(_tick) => {
                if started.elapsed() >= timeout {
                    warn!(
                        execution_id = ctx.execution_id(),
                        timeout_secs = timeout.as_secs(),
                        "command timed out, killing process"
                    );
                    kill_child(child).await;
                    return Err(EngineError::Timeout(timeout.as_secs()));
                }

                match ctx.checkpoint().await {
                    Ok(()) => {}
                    Err(EngineError::Cancelled) => {
                        info!(
                            execution_id = ctx.execution_id(),
                            "terminate requested, killing process"
                        );
                        kill_child(child).await;
                        return Err(EngineError::Cancelled);
                    }
                    Err(err) => {
                        // A transient store failure should not kill a
                        // healthy process; keep waiting.
                        warn!(
                            execution_id = ctx.execution_id(),
                            error = %err,
                            "control-flag refresh failed"
                        );
                    }
                }

                if let Err(err) = ctx.record_duration().await {
                    debug!(
                        execution_id = ctx.execution_id(),
                        error = %err,
                        "duration update failed"
                    );
                }
            }
        }
    }
}

async fn kill_child(child: &mut Child) {
    if let Err(err) = child.kill().await {
        error!(error = %err, "failed to kill child process");
    }
}

/// Stream one output pipe line-by-line into the log, re-emitting at the
/// level the line itself announces when it carries a recognizable marker.
async fn stream_output(
    pipe: impl AsyncRead + Unpin,
    execution_id: i64,
    is_stderr: bool,
    buffer: Option<Arc<Mutex<String>>>,
) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        if let Some(buffer) = &buffer {
            let mut buffer = buffer.lock().expect("stderr buffer poisoned");
            if buffer.chars().count() < STDERR_BUFFER_CHARS {
                buffer.push_str(line);
                buffer.push('\n');
            }
        }

        match inferred_level(line) {
            Some("DEBUG") => debug!(execution_id, "[script] {line}"),
            Some("INFO") => info!(execution_id, "[script] {line}"),
            Some("WARN") => warn!(execution_id, "[script] {line}"),
            Some("ERROR") => error!(execution_id, "[script] {line}"),
            None if is_stderr => warn!(execution_id, "[script] {line}"),
            None => info!(execution_id, "[script] {line}"),
            Some(_) => unreachable!("inferred_level only returns DEBUG/INFO/WARN/ERROR or None"),
        }
    }
}

/// Sniff a log level marker out of a structured log line.
fn inferred_level(line: &str) -> Option<&'static str> {
    if line.contains(" | DEBUG | ") || line.contains("DEBUG:") {
        Some("DEBUG")
    } else if line.contains(" | INFO | ") || line.contains("INFO:") {
        Some("INFO")
    } else if line.contains(" | WARNING | ") || line.contains(" | WARN | ") || line.contains("WARNING:") {
        Some("WARN")
    } else if line.contains(" | ERROR | ") || line.contains(" | CRITICAL | ") || line.contains("ERROR:") {
        Some("ERROR")
    } else {
        None
    }
}

/// Working directory: the directory of the first token when it names an
/// existing file, otherwise the configured project root. The root comes
/// from config rather than the ambient process cwd so commands resolve the
/// same way no matter where the embedding process was launched from.
fn infer_work_dir(first_token: &str, project_root: &Path) -> PathBuf {
    let candidate = Path::new(first_token);
    if candidate.is_file() {
        if let Ok(resolved) = candidate.canonicalize() {
            if let Some(parent) = resolved.parent() {
                return parent.to_path_buf();
            }
        }
    }
    project_root.to_path_buf()
}

fn stderr_head(buffer: &Arc<Mutex<String>>) -> String {
    let buffer = buffer.lock().expect("stderr buffer poisoned");
    let trimmed = buffer.trim();
    if trimmed.is_empty() {
        return "(no stderr output)".to_string();
    }
    let mut head: String = trimmed.chars().take(STDERR_HEAD_CHARS).collect();
    if trimmed.chars().count() > STDERR_HEAD_CHARS {
        head.push_str("...");
    }
    head
}
