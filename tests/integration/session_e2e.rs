//! Full coordinator runs with scripted workers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cadre::orchestration::{AutoApprover, RunOutcome};
use cadre::state::CheckpointStore;
use cadre::workflow::Profile;

use crate::fixtures::{Behavior, ScriptedApprover, ScriptedWorker, TestWorkspace, RESEARCH};

/// Test: Happy path
/// Given the research pipeline under the full profile
/// When every worker succeeds
/// Then the run succeeds, every phase is checkpointed and the report lists all tasks
#[tokio::test]
async fn test_research_pipeline_succeeds() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new());
    let approver = Arc::new(ScriptedApprover::default());
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker.clone(), approver.clone());

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert!(report.success);
    assert_eq!(report.tasks.len(), 4);
    assert!(report.tasks.iter().all(|t| t.status == "completed"));
    assert!(ws.work_dir().join("report.md").exists());

    let started = worker.started();
    let pos = |key: &str| started.iter().position(|k| k == key).unwrap();
    assert!(pos("web") < pos("analyze"));
    assert!(pos("analyze") < pos("report"));

    assert_eq!(approver.seen(), vec!["confirm-parameters", "review-analysis"]);
    assert_eq!(coord.store().list("research").unwrap(), vec![1, 2, 3]);
}

/// Test: Optional source failure degrades but does not fail
/// Given tracker fails
/// When the run finishes
/// Then analyze ran with tracker listed as a missing source and the outcome is partial
#[tokio::test]
async fn test_optional_failure_is_partial() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new().on("tracker", Behavior::Fail("tracker unavailable")));
    let mut coord = ws.coordinator(
        RESEARCH,
        Profile::Full,
        worker.clone(),
        Arc::new(AutoApprover::default()),
    );

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::PartialFailure);
    assert!(report.success);
    assert!(worker.ran("report"));
    assert_eq!(
        worker.missing.lock().unwrap()["analyze"],
        vec!["tracker".to_string()]
    );
    let tracker = report.tasks.iter().find(|t| t.key == "tracker").unwrap();
    assert_eq!(tracker.reason.as_deref(), Some("tracker unavailable"));
    let analyze = report.tasks.iter().find(|t| t.key == "analyze").unwrap();
    assert_eq!(analyze.status, "completed");
    assert_eq!(analyze.missing_sources, vec!["tracker".to_string()]);
    // Phase 1 never completed, so resume starts there.
    assert_eq!(report.resume_from, Some(1));
}

/// Test: Required source failure is fatal
/// Given web fails
/// Then analyze and report cascade without running and the outcome is fatal
#[tokio::test]
async fn test_required_failure_is_fatal() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new().on("web", Behavior::Fail("search quota exhausted")));
    let mut coord = ws.coordinator(
        RESEARCH,
        Profile::Full,
        worker.clone(),
        Arc::new(AutoApprover::default()),
    );

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::FatalFailure);
    assert!(!report.success);
    assert!(!worker.ran("analyze"));
    assert!(!worker.ran("report"));
    let report_row = report.tasks.iter().find(|t| t.key == "report").unwrap();
    assert!(report_row
        .reason
        .as_deref()
        .unwrap()
        .starts_with("upstream required dependency failed"));
    assert!(report.render().contains("resume with --resume-from 1"));
}

/// Test: Worker pool bound
/// Given four independent slow tasks and max_workers = 2
/// Then no more than two run at once and all complete
#[tokio::test]
async fn test_parallel_siblings_respect_pool_size() {
    const FAN_OUT: &str = r#"
name = "fan-out"

[[phases]]
number = 1
name = "collect"

[[tasks]]
key = "a"
subject = "A"
phase = 1

[[tasks]]
key = "b"
subject = "B"
phase = 1

[[tasks]]
key = "c"
subject = "C"
phase = 1

[[tasks]]
key = "d"
subject = "D"
phase = 1
"#;
    let mut ws = TestWorkspace::new();
    ws.config.max_workers = 2;
    let delay = Duration::from_millis(50);
    let worker = Arc::new(
        ScriptedWorker::new()
            .on("a", Behavior::Slow(delay))
            .on("b", Behavior::Slow(delay))
            .on("c", Behavior::Slow(delay))
            .on("d", Behavior::Slow(delay)),
    );
    let mut coord = ws.coordinator(FAN_OUT, Profile::Full, worker.clone(), Arc::new(AutoApprover::default()));

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(worker.started().len(), 4);
    assert_eq!(worker.max_running.load(Ordering::SeqCst), 2);
}

/// Test: Cost ledger
/// Given tasks reporting cost above the phase threshold
/// Then the report totals the spend and carries one warning for the phase
#[tokio::test]
async fn test_cost_threshold_warns_once() {
    let mut ws = TestWorkspace::new();
    ws.config.cost_warning_threshold = Some(1.0);
    let worker = Arc::new(
        ScriptedWorker::new()
            .on("web", Behavior::Succeed(vec![("cost", 0.8)]))
            .on("tracker", Behavior::Succeed(vec![("cost", 0.7)]))
            .on("analyze", Behavior::Succeed(vec![("cost", 0.2)])),
    );
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker, Arc::new(AutoApprover::default()));

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert!((report.cost.total - 1.7).abs() < 1e-9);
    assert!((report.cost.by_phase[&1] - 1.5).abs() < 1e-9);
    let cost_warnings: Vec<_> = report
        .warnings
        .iter()
        .filter(|w| w.contains("exceeded warning threshold"))
        .collect();
    assert_eq!(cost_warnings.len(), 1);
    assert!(cost_warnings[0].contains("phase 1"));
}

/// Test: Cancellation
/// Given a task that never finishes
/// When the session token is cancelled
/// Then the running task fails as aborted and the session still closes
#[tokio::test]
async fn test_cancel_aborts_running_session() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new().on("web", Behavior::Hang));
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker, Arc::new(AutoApprover::default()));
    let cancel = coord.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(10), coord.run())
        .await
        .expect("run finishes after cancel")
        .unwrap();

    assert!(report.aborted);
    assert_eq!(report.outcome, RunOutcome::FatalFailure);
    let web = report.tasks.iter().find(|t| t.key == "web").unwrap();
    assert_eq!(web.reason.as_deref(), Some("UserAborted"));
    assert!(report.tasks.iter().all(|t| t.status == "failed" || t.key == "tracker"));
}

/// Test: Audit log
/// Then progress traffic from the run is written as JSON lines next to the checkpoints
#[tokio::test]
async fn test_audit_log_written() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new());
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker, Arc::new(AutoApprover::default()));

    let report = coord.run().await.unwrap();

    let audit = coord
        .store()
        .pipeline_dir("research")
        .join(format!("audit-{}.jsonl", report.session_id.short()));
    let text = std::fs::read_to_string(&audit).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(lines.iter().any(|m| m["summary"] == "started web"));
    assert!(lines.iter().any(|m| m["summary"] == "finished report"));
}

/// Test: Explicit checkpoint store
/// Given a coordinator handed its own store
/// Then checkpoints land there and not in the configured directory
#[tokio::test]
async fn test_checkpoints_follow_explicit_store() {
    let ws = TestWorkspace::new();
    let dir = ws.temp_dir.path().join("elsewhere");
    let mut coord = ws
        .coordinator(
            RESEARCH,
            Profile::Full,
            Arc::new(ScriptedWorker::new()),
            Arc::new(AutoApprover::default()),
        )
        .with_store(CheckpointStore::new(dir.clone()));

    coord.run().await.unwrap();

    assert_eq!(CheckpointStore::new(dir).list("research").unwrap(), vec![1, 2, 3]);
    assert!(!ws.temp_dir.path().join("checkpoints").join("research").exists());
}
