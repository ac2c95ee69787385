//! Gate decisions and metric-driven graph extension.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use cadre::orchestration::{
    parse_answer, Approver, AutoApprover, Decision, GateMode, GateSpec, Presentation, RunOutcome,
    SessionConfig, WorkerSpec,
};
use cadre::workflow::Profile;

use crate::fixtures::{Behavior, ScriptedApprover, ScriptedWorker, TestWorkspace, RESEARCH};

/// Never answers.
struct SilentApprover;

impl Approver for SilentApprover {
    fn decide<'a>(&'a self, _gate: &'a GateSpec, _presentation: &'a Presentation) -> BoxFuture<'a, Decision> {
        futures::future::pending().boxed()
    }
}

fn position(started: &[String], key: &str) -> usize {
    started
        .iter()
        .position(|k| k == key)
        .unwrap_or_else(|| panic!("{} never started", key))
}

/// Test: Modify patches work that has not started
/// Given a reviewer answering `tone=brief` at the review gate
/// Then the report task runs with the patched parameter
#[tokio::test]
async fn test_modify_sets_params_on_pending_tasks() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new());
    let approver = Arc::new(ScriptedApprover::new(vec![
        Decision::Proceed,
        parse_answer("tone=brief"),
    ]));
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker.clone(), approver);

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    let params = worker.params.lock().unwrap();
    assert_eq!(params["report"]["tone"], "brief");
    assert!(params["analyze"].get("tone").is_none());
    let review = report.gates.iter().find(|g| g.gate == "review-analysis").unwrap();
    assert_eq!(review.decision, "modify");
}

/// Test: Abort at a review gate
/// Then the report never runs, fails as aborted, and earlier phases stay checkpointed
#[tokio::test]
async fn test_abort_at_review_gate() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new());
    let approver = Arc::new(ScriptedApprover::new(vec![Decision::Proceed, Decision::Abort]));
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker.clone(), approver);

    let report = coord.run().await.unwrap();

    assert!(report.aborted);
    assert_eq!(report.outcome, RunOutcome::FatalFailure);
    assert!(!worker.ran("report"));
    let row = report.tasks.iter().find(|t| t.key == "report").unwrap();
    assert_eq!(row.reason.as_deref(), Some("UserAborted"));
    assert_eq!(report.resume_from, Some(3));
    assert_eq!(coord.store().list("research").unwrap(), vec![1, 2]);
}

/// Test: A reserved task still waits for its gate
/// Given a worker spawned for the report before the run starts
/// Then the review gate opens while the report is held back, and aborting there
/// fails the report without running it
#[tokio::test]
async fn test_reserved_task_waits_for_gate() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new());
    let approver = Arc::new(ScriptedApprover::new(vec![Decision::Proceed, Decision::Abort]));
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker.clone(), approver.clone());
    coord.start_session(SessionConfig::new("research")).await.unwrap();
    let report_id = coord.graph().unwrap().id_for("report").await.unwrap();
    coord
        .spawn_worker(report_id, WorkerSpec::new("reporter"))
        .await
        .unwrap();

    let report = coord.run().await.unwrap();

    assert!(report.aborted);
    assert!(worker.ran("analyze"));
    assert!(!worker.ran("report"));
    assert_eq!(approver.seen(), vec!["confirm-parameters", "review-analysis"]);
    let row = report.tasks.iter().find(|t| t.key == "report").unwrap();
    assert_eq!(row.reason.as_deref(), Some("UserAborted"));
}

/// Test: Skip mode
/// Given the shallow profile, where the review gate is skipped
/// Then the approver is only asked to confirm parameters and the skip is recorded
#[tokio::test]
async fn test_skip_mode_never_asks() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new());
    let approver = Arc::new(ScriptedApprover::default());
    let mut coord = ws.coordinator(RESEARCH, Profile::Shallow, worker, approver.clone());

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(approver.seen(), vec!["confirm-parameters"]);
    let review = report.gates.iter().find(|g| g.gate == "review-analysis").unwrap();
    assert_eq!(review.mode, GateMode::Skip);
    assert_eq!(review.decision, "proceed");
}

/// Test: Mandatory gate timeout
/// Given an approver that never answers
/// Then the parameter gate times out to abort and no task runs
#[tokio::test]
async fn test_mandatory_gate_timeout_aborts() {
    let mut ws = TestWorkspace::new();
    ws.config.gate_timeout_secs = 1;
    let worker = Arc::new(ScriptedWorker::new());
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker.clone(), Arc::new(SilentApprover));

    let report = tokio::time::timeout(Duration::from_secs(10), coord.run())
        .await
        .expect("gate timeout resolves the run")
        .unwrap();

    assert!(report.aborted);
    assert!(worker.started().is_empty());
    assert_eq!(report.gates.len(), 1);
    assert!(report.gates[0].timed_out);
    assert_eq!(report.gates[0].decision, "abort");
}

/// Test: High metric extends without asking
/// Given analyze reports gap_score 0.9 under the auto profile
/// Then collect-more and reanalyze run after analyze and before the report
#[tokio::test]
async fn test_high_metric_extends_automatically() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new().on("analyze", Behavior::Succeed(vec![("gap_score", 0.9)])));
    let approver = Arc::new(ScriptedApprover::default());
    let mut coord = ws.coordinator(RESEARCH, Profile::Auto, worker.clone(), approver.clone());

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.tasks.len(), 6);
    let started = worker.started();
    assert!(position(&started, "analyze") < position(&started, "collect-more"));
    assert!(position(&started, "collect-more") < position(&started, "reanalyze"));
    assert!(position(&started, "reanalyze") < position(&started, "report"));
    assert!(!approver.seen().iter().any(|g| g.starts_with("extend-")));

    let reanalyze = report.tasks.iter().find(|t| t.key == "reanalyze").unwrap();
    assert_eq!(reanalyze.phase, 2);
}

/// Test: Intermediate metric asks first
/// Given gap_score 0.5 and an approver that proceeds
/// Then the extension gate is asked before the review gate and the tasks are spliced
#[tokio::test]
async fn test_intermediate_metric_asks_then_extends() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new().on("analyze", Behavior::Succeed(vec![("gap_score", 0.5)])));
    let approver = Arc::new(ScriptedApprover::default());
    let mut coord = ws.coordinator(RESEARCH, Profile::Auto, worker.clone(), approver.clone());

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(
        approver.seen(),
        vec!["confirm-parameters", "extend-analyze", "review-analysis"]
    );
    let started = worker.started();
    assert!(position(&started, "reanalyze") < position(&started, "report"));
}

/// Test: Declining an extension
/// Given gap_score 0.5 and an approver answering `skip`
/// Then the graph is left as declared
#[tokio::test]
async fn test_intermediate_metric_declined() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new().on("analyze", Behavior::Succeed(vec![("gap_score", 0.5)])));
    let approver = Arc::new(ScriptedApprover::new(vec![Decision::Proceed, parse_answer("skip")]));
    let mut coord = ws.coordinator(RESEARCH, Profile::Auto, worker.clone(), approver);

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.tasks.len(), 4);
    assert!(!worker.ran("collect-more"));
    assert!(worker.ran("report"));
}

/// Test: Low metric leaves the graph alone
#[tokio::test]
async fn test_low_metric_does_not_extend() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new().on("analyze", Behavior::Succeed(vec![("gap_score", 0.1)])));
    let approver = Arc::new(ScriptedApprover::default());
    let mut coord = ws.coordinator(RESEARCH, Profile::Auto, worker.clone(), approver.clone());

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.tasks.len(), 4);
    assert!(!worker.ran("collect-more"));
    assert_eq!(approver.seen(), vec!["confirm-parameters", "review-analysis"]);
}

/// Test: Extension is an auto-profile feature
/// Given a high metric under the full profile
/// Then nothing is spliced
#[tokio::test]
async fn test_full_profile_ignores_extension() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new().on("analyze", Behavior::Succeed(vec![("gap_score", 0.9)])));
    let mut coord = ws.coordinator(
        RESEARCH,
        Profile::Full,
        worker.clone(),
        Arc::new(AutoApprover::default()),
    );

    let report = coord.run().await.unwrap();

    assert_eq!(report.tasks.len(), 4);
    assert!(!worker.ran("collect-more"));
}
