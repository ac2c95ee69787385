//! Built-in worker that runs each task's `params.command` through a shell.
//!
//! The command sees its task through `CADRE_*` environment variables and may
//! write a flat JSON object of numbers to `$CADRE_METRICS_FILE`; those become
//! the task's metrics (including `cost`). Exit code 75 (`EX_TEMPFAIL`) marks
//! a transient failure that is retried up to `params.retries` times.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use crate::core::task::TaskOutput;
use crate::orchestration::worker::{TaskContext, Worker};
use crate::util::retry_with_backoff;
use crate::{clog_debug, Error, Result};

/// Exit status a command uses to ask for a retry.
pub const EXIT_TRANSIENT: i32 = 75;

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const MAX_NOTE_CHARS: usize = 120;

#[derive(Debug)]
enum RunError {
    Transient(String),
    Fatal(String),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Transient(msg) | RunError::Fatal(msg) => write!(f, "{}", msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShellWorker {
    shell: PathBuf,
    retry_backoff: Duration,
}

impl ShellWorker {
    /// Resolve `shell` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the shell cannot be found.
    pub fn new(shell: &str) -> Result<Self> {
        let shell = which::which(shell)
            .map_err(|_| Error::Validation(format!("shell not found: {}", shell)))?;
        Ok(Self::with_shell(shell))
    }

    pub fn with_shell(shell: PathBuf) -> Self {
        Self {
            shell,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    fn metrics_path(ctx: &TaskContext) -> PathBuf {
        ctx.workspace
            .join(".cadre")
            .join("metrics")
            .join(format!("{}.json", ctx.task.key))
    }

    fn command(&self, script: &str, ctx: &TaskContext, attempt: u32) -> Command {
        let join = |paths: Vec<PathBuf>| {
            paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(":")
        };
        let task = &ctx.task;
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .current_dir(&ctx.workspace)
            .env("CADRE_TASK_ID", task.id.0.to_string())
            .env("CADRE_TASK_KEY", &task.key)
            .env("CADRE_PHASE", task.phase.to_string())
            .env("CADRE_ATTEMPT", attempt.to_string())
            .env(
                "CADRE_INPUTS",
                join(task.inputs.iter().map(|i| i.resolve(&ctx.workspace)).collect()),
            )
            .env(
                "CADRE_OUTPUTS",
                join(task.outputs.iter().map(|o| o.resolve(&ctx.workspace)).collect()),
            )
            .env("CADRE_MISSING_INPUTS", join(ctx.missing_optional.clone()))
            .env("CADRE_MISSING_SOURCES", ctx.missing_sources().join(","))
            .env(
                "CADRE_PARAMS",
                serde_json::Value::Object(task.params.clone()).to_string(),
            )
            .env("CADRE_METRICS_FILE", Self::metrics_path(ctx))
            .kill_on_drop(true);
        if let Some(extra) = task.params.get("env").and_then(|v| v.as_object()) {
            for (name, value) in extra {
                if let Some(value) = value.as_str() {
                    cmd.env(name, value);
                }
            }
        }
        cmd
    }

    async fn run_once(&self, script: &str, ctx: &TaskContext, attempt: u32) -> std::result::Result<Output, RunError> {
        let output = self
            .command(script, ctx, attempt)
            .output()
            .await
            .map_err(|e| RunError::Fatal(format!("failed to spawn {}: {}", self.shell.display(), e)))?;
        if output.status.success() {
            return Ok(output);
        }
        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("").trim();
        let message = if detail.is_empty() {
            format!("command exited with status {}", code)
        } else {
            format!("command exited with status {}: {}", code, detail)
        };
        if code == EXIT_TRANSIENT {
            Err(RunError::Transient(message))
        } else {
            Err(RunError::Fatal(message))
        }
    }

    async fn run(&self, ctx: &TaskContext) -> std::result::Result<TaskOutput, String> {
        let task = &ctx.task;
        let script = task
            .params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("task {} has no `command` parameter", task.key))?;
        let retries = task.params.get("retries").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

        let metrics_path = Self::metrics_path(ctx);
        if let Some(dir) = metrics_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
        }
        let _ = tokio::fs::remove_file(&metrics_path).await;

        clog_debug!("ShellWorker: {} running `{}`", task.key, script);
        // Only transient failures surface as `Err` to the retry loop.
        let output = retry_with_backoff(&task.key, retries + 1, self.retry_backoff, |attempt| async move {
            match self.run_once(script, ctx, attempt).await {
                Ok(output) => Ok(Ok(output)),
                Err(RunError::Transient(msg)) => Err(msg),
                Err(RunError::Fatal(msg)) => Ok(Err(msg)),
            }
        })
        .await??;

        let mut result = TaskOutput {
            produced: task
                .outputs
                .iter()
                .map(|o| o.resolve(&ctx.workspace))
                .filter(|p| p.exists())
                .collect(),
            metrics: read_metrics(&metrics_path).await?,
            note: last_line(&String::from_utf8_lossy(&output.stdout)),
            advisories: Vec::new(),
        };

        if let Some(advisory) = task.params.get("advisory").and_then(|v| v.as_str()) {
            if let Err(e) = self.run_once(advisory, ctx, 0).await {
                result.advisories.push(format!("advisory step failed: {}", e));
            }
        }
        Ok(result)
    }
}

impl Worker for ShellWorker {
    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, std::result::Result<TaskOutput, String>> {
        self.run(ctx).boxed()
    }
}

async fn read_metrics(path: &Path) -> std::result::Result<BTreeMap<String, f64>, String> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(format!("cannot read metrics {}: {}", path.display(), e)),
    };
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| format!("metrics file {} is not JSON: {}", path.display(), e))?;
    let object = value
        .as_object()
        .ok_or_else(|| format!("metrics file {} must hold a JSON object", path.display()))?;
    Ok(object
        .iter()
        .filter_map(|(name, v)| v.as_f64().map(|n| (name.clone(), n)))
        .collect())
}

fn last_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .map(|l| l.chars().take(MAX_NOTE_CHARS).collect())
}
