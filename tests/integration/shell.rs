//! The built-in shell worker driven by a real coordinator.

use std::sync::Arc;
use std::time::Duration;

use cadre::orchestration::{AutoApprover, RunOutcome, ShellWorker};
use cadre::workflow::Profile;

use crate::fixtures::TestWorkspace;

const SHELL_PIPELINE: &str = r#"
name = "shell"

[[phases]]
number = 1
name = "build"

[[phases]]
number = 2
name = "publish"

[[tasks]]
key = "build"
subject = "Build the bundle"
phase = 1
outputs = [{ path = "out/bundle.txt" }]
params = { command = 'mkdir -p out && echo "$CADRE_TASK_KEY" > out/bundle.txt && echo "{\"cost\": 0.25}" > "$CADRE_METRICS_FILE" && echo building && echo "built bundle"' }

[[tasks]]
key = "publish"
subject = "Publish the bundle"
phase = 2
blocked_by = ["build"]
inputs = [{ path = "out/bundle.txt" }]
params = { command = 'grep -q build "$CADRE_INPUTS" && echo published' }
"#;

fn shell_worker() -> Arc<ShellWorker> {
    Arc::new(
        ShellWorker::new("sh")
            .expect("sh on PATH")
            .with_retry_backoff(Duration::from_millis(10)),
    )
}

/// Test: Commands produce outputs, metrics and notes
/// Then each task's note is its last stdout line and the metrics file feeds the cost ledger
#[tokio::test]
async fn test_shell_pipeline_succeeds() {
    let ws = TestWorkspace::new();
    let mut coord = ws.coordinator(
        SHELL_PIPELINE,
        Profile::Full,
        shell_worker(),
        Arc::new(AutoApprover::default()),
    );

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    let build = report.tasks.iter().find(|t| t.key == "build").unwrap();
    assert_eq!(build.note.as_deref(), Some("built bundle"));
    let publish = report.tasks.iter().find(|t| t.key == "publish").unwrap();
    assert_eq!(publish.note.as_deref(), Some("published"));
    assert!((report.cost.total - 0.25).abs() < 1e-9);
    assert_eq!(
        std::fs::read_to_string(ws.work_dir().join("out/bundle.txt")).unwrap(),
        "build\n"
    );
}

/// Test: A failing command fails its task and cascades
#[tokio::test]
async fn test_shell_exit_status_fails_task() {
    const FAILING: &str = r#"
name = "failing"

[[phases]]
number = 1
name = "only"

[[tasks]]
key = "broken"
subject = "Exit with an error"
phase = 1
params = { command = "echo 'disk full' >&2; exit 3" }

[[tasks]]
key = "after"
subject = "Never runs"
phase = 1
blocked_by = ["broken"]
params = { command = "true" }
"#;
    let ws = TestWorkspace::new();
    let mut coord = ws.coordinator(FAILING, Profile::Full, shell_worker(), Arc::new(AutoApprover::default()));

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::FatalFailure);
    let broken = report.tasks.iter().find(|t| t.key == "broken").unwrap();
    assert_eq!(
        broken.reason.as_deref(),
        Some("command exited with status 3: disk full")
    );
    let after = report.tasks.iter().find(|t| t.key == "after").unwrap();
    assert_eq!(after.status, "failed");
}

/// Test: Transient exits are retried
/// Given a command that exits 75 until its third attempt
/// Then the task completes once the retries allow it
#[tokio::test]
async fn test_shell_transient_exit_is_retried() {
    const FLAKY: &str = r#"
name = "flaky"

[[phases]]
number = 1
name = "only"

[[tasks]]
key = "flaky"
subject = "Succeed on the third try"
phase = 1
params = { retries = 2, command = 'n=$(cat attempts 2>/dev/null || echo 0); n=$((n + 1)); echo $n > attempts; [ $n -ge 3 ] || exit 75; echo "attempt $n"' }
"#;
    let ws = TestWorkspace::new();
    let mut coord = ws.coordinator(FLAKY, Profile::Full, shell_worker(), Arc::new(AutoApprover::default()));

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    let flaky = report.tasks.iter().find(|t| t.key == "flaky").unwrap();
    assert_eq!(flaky.note.as_deref(), Some("attempt 3"));
}

/// Test: Retries run out
#[tokio::test]
async fn test_shell_transient_exit_exhausts_retries() {
    const ALWAYS_BUSY: &str = r#"
name = "busy"

[[phases]]
number = 1
name = "only"

[[tasks]]
key = "busy"
subject = "Always busy"
phase = 1
params = { retries = 1, command = "exit 75" }
"#;
    let ws = TestWorkspace::new();
    let mut coord = ws.coordinator(ALWAYS_BUSY, Profile::Full, shell_worker(), Arc::new(AutoApprover::default()));

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::FatalFailure);
    let busy = report.tasks.iter().find(|t| t.key == "busy").unwrap();
    assert_eq!(busy.reason.as_deref(), Some("command exited with status 75"));
}
