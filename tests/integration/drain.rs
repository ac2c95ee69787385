//! Session drain: cooperative worker shutdown and forced close.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use cadre::core::task::TaskOutput;
use cadre::orchestration::{AutoApprover, RunOutcome, TaskContext, Worker};
use cadre::workflow::Profile;

use crate::fixtures::{ScriptedWorker, TestWorkspace};

const SINGLE: &str = r#"
name = "single"

[[phases]]
number = 1
name = "only"

[[tasks]]
key = "upload"
subject = "Upload results"
phase = 1
"#;

/// Finishes its task but never agrees to stop.
#[derive(Default)]
struct Stubborn {
    asked: AtomicUsize,
}

impl Worker for Stubborn {
    fn execute<'a>(&'a self, _ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutput, String>> {
        async { Ok(TaskOutput::default().with_note("uploaded")) }.boxed()
    }

    fn pending_work(&self) -> Option<String> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Some("upload buffer not flushed".to_string())
    }
}

/// Test: Workers that approve shutdown close without warnings
/// Then the session closes and is removed
#[tokio::test]
async fn test_drain_with_cooperative_workers() {
    let ws = TestWorkspace::new();
    let mut coord = ws.coordinator(
        SINGLE,
        Profile::Full,
        Arc::new(ScriptedWorker::new()),
        Arc::new(AutoApprover::default()),
    );

    let report = coord.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert!(!report.warnings.iter().any(|w| w.contains("force-closed")));
    // Closing removes the session from the registry.
    assert!(coord.session().is_none());
}

/// Test: Forced close
/// Given a worker that declines every shutdown request
/// Then it is asked once per retry, force-closed, and the run still closes with a warning
#[tokio::test]
async fn test_drain_force_closes_declining_worker() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(Stubborn::default());
    let mut coord = ws.coordinator(SINGLE, Profile::Full, worker.clone(), Arc::new(AutoApprover::default()));

    let report = coord.run().await.unwrap();

    // Work itself succeeded; the forced close is advisory.
    assert_eq!(report.outcome, RunOutcome::Success);
    let warning = report
        .warnings
        .iter()
        .find(|w| w.contains("force-closed"))
        .expect("force-close warning");
    assert!(warning.contains("force-closed after 3 shutdown attempt(s)"));
    assert!(warning.ends_with(": upload buffer not flushed"));
    assert_eq!(worker.asked.load(Ordering::SeqCst), 3);
    assert!(coord.session().is_none());
}
