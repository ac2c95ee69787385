//! Checkpoint resume and idempotence.

use std::collections::BTreeMap;
use std::sync::Arc;

use cadre::core::task::{TaskOutput, TaskStatus};
use cadre::orchestration::{AutoApprover, Coordinator, RunOutcome, SessionConfig};
use cadre::workflow::Profile;
use cadre::Error;

use crate::fixtures::{Behavior, ScriptedWorker, TestWorkspace, RESEARCH};

async fn complete_run(ws: &TestWorkspace) {
    let worker = Arc::new(
        ScriptedWorker::new().on("analyze", Behavior::Succeed(vec![("gap_score", 0.1)])),
    );
    let report = ws
        .coordinator(RESEARCH, Profile::Full, worker, Arc::new(AutoApprover::default()))
        .run()
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);
}

type GraphState = BTreeMap<String, (TaskStatus, Option<TaskOutput>, usize)>;

async fn initial_state(coord: &Coordinator) -> GraphState {
    let graph = coord.graph().unwrap().clone_graph().await.unwrap();
    graph
        .tasks()
        .into_iter()
        .map(|t| (t.key.clone(), (t.status.clone(), t.output.clone(), t.blocked_by.len())))
        .collect()
}

/// Test: Resume skips restored phases
/// Given checkpoints for every phase of an earlier run
/// When resuming from phase 3
/// Then only the report runs and earlier outputs come from the checkpoints
#[tokio::test]
async fn test_resume_from_last_phase() {
    let ws = TestWorkspace::new();
    complete_run(&ws).await;

    let worker = Arc::new(ScriptedWorker::new());
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker.clone(), Arc::new(AutoApprover::default()));
    coord
        .start_session(SessionConfig::new("research-retry").resume_from(3))
        .await
        .unwrap();
    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(worker.started(), vec!["report".to_string()]);
    let analyze = report.tasks.iter().find(|t| t.key == "analyze").unwrap();
    assert_eq!(analyze.status, "completed");
    // Restored from the checkpoint written by the first run.
    assert_eq!(analyze.note.as_deref(), Some("analyze"));
    let gates: Vec<&str> = report.gates.iter().map(|g| g.gate.as_str()).collect();
    assert_eq!(gates, vec!["confirm-parameters", "review-analysis"]);
}

/// Test: Checkpoint idempotence
/// Given the same checkpoints
/// When two sessions resume from phase 2
/// Then both start from an identical graph state
#[tokio::test]
async fn test_resume_is_idempotent() {
    let ws = TestWorkspace::new();
    complete_run(&ws).await;

    let mut states = Vec::new();
    for name in ["first", "second"] {
        let worker = Arc::new(ScriptedWorker::new());
        let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker, Arc::new(AutoApprover::default()));
        coord
            .start_session(SessionConfig::new(name).resume_from(2))
            .await
            .unwrap();
        states.push(initial_state(&coord).await);
    }

    assert_eq!(states[0], states[1]);
    let web = &states[0]["web"];
    assert_eq!(web.0, TaskStatus::Completed);
    assert!(web.1.is_some());
    assert_eq!(states[0]["analyze"].0, TaskStatus::Pending);
    assert_eq!(states[0]["report"].0, TaskStatus::Blocked);
}

/// Test: Missing checkpoint
/// Given no earlier run
/// When resuming from phase 3
/// Then the session does not start
#[tokio::test]
async fn test_resume_without_checkpoints_fails() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new());
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker, Arc::new(AutoApprover::default()));

    let err = coord
        .start_session(SessionConfig::new("research").resume_from(3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CheckpointMissing { phase: 1 }));
    assert!(coord.session().is_none());
}

/// Test: Unknown resume phase is rejected
#[tokio::test]
async fn test_resume_from_unknown_phase() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new());
    let mut coord = ws.coordinator(RESEARCH, Profile::Full, worker, Arc::new(AutoApprover::default()));

    let err = coord
        .start_session(SessionConfig::new("research").resume_from(9))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

/// Test: Resuming under another profile
/// Given checkpoints written under the full profile
/// When resuming under auto past the extension source
/// Then the session warns about the profile and does not extend again
#[tokio::test]
async fn test_resume_under_other_profile_warns() {
    let ws = TestWorkspace::new();
    complete_run(&ws).await;

    let worker = Arc::new(ScriptedWorker::new());
    let mut coord = ws.coordinator(RESEARCH, Profile::Auto, worker.clone(), Arc::new(AutoApprover::default()));
    coord
        .start_session(SessionConfig::new("research").resume_from(3))
        .await
        .unwrap();
    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("written under profile full")));
    assert!(!worker.ran("collect-more"));
}
