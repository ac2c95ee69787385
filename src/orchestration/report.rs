//! End-of-run summary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

use crate::core::dag::TaskGraph;
use crate::core::task::{Phase, TaskId, TaskStatus};
use crate::orchestration::cost::CostSummary;
use crate::orchestration::gate::GateRecord;
use crate::orchestration::WorkerId;
use crate::session::SessionId;
use crate::workflow::Profile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// Something failed or an optional source was missing, but every final
    /// deliverable was produced.
    PartialFailure,
    /// A final deliverable failed or the session was aborted.
    FatalFailure,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Success => write!(f, "success"),
            RunOutcome::PartialFailure => write!(f, "partial failure"),
            RunOutcome::FatalFailure => write!(f, "fatal failure"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub key: String,
    pub subject: String,
    pub phase: Phase,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<WorkerId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_sources: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session_id: SessionId,
    pub session_name: String,
    pub pipeline: String,
    pub profile: Profile,
    pub outcome: RunOutcome,
    pub success: bool,
    pub aborted: bool,
    pub tasks: Vec<TaskReport>,
    pub warnings: Vec<String>,
    pub gates: Vec<GateRecord>,
    pub cost: CostSummary,
    /// Earliest phase with a task that did not complete.
    pub resume_from: Option<Phase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Summarize a finished graph. Metadata fields start empty.
    pub fn from_graph(session_id: SessionId, graph: &TaskGraph, aborted: bool) -> Self {
        let mut tasks: Vec<TaskReport> = graph
            .tasks()
            .into_iter()
            .map(|task| TaskReport {
                id: task.id,
                key: task.key.clone(),
                subject: task.subject.clone(),
                phase: task.phase,
                status: task.status.name().to_string(),
                reason: task.failure_reason().map(|r| r.to_string()),
                owner: task.owner,
                missing_sources: task.missing_sources().map(|a| a.blocker_key.clone()).collect(),
                advisories: task
                    .output
                    .as_ref()
                    .map(|o| o.advisories.clone())
                    .unwrap_or_default(),
                note: task.note.clone(),
            })
            .collect();
        tasks.sort_by_key(|t| (t.phase, t.id));

        let outcome = classify(graph, aborted);
        let now = Utc::now();
        Self {
            session_id,
            session_name: String::new(),
            pipeline: String::new(),
            profile: Profile::default(),
            outcome,
            success: outcome != RunOutcome::FatalFailure,
            aborted,
            tasks,
            warnings: Vec::new(),
            gates: Vec::new(),
            cost: CostSummary::default(),
            resume_from: resume_point(graph),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.status == "failed")
    }

    /// Human-readable summary for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} [{}] profile={} outcome={}",
            self.pipeline, self.session_name, self.profile, self.outcome
        );
        for task in &self.tasks {
            let _ = write!(out, "  [{}] {:<24} {}", task.phase, task.key, task.status);
            if let Some(reason) = &task.reason {
                let _ = write!(out, " ({})", reason);
            }
            if !task.missing_sources.is_empty() {
                let _ = write!(out, " missing sources: {}", task.missing_sources.join(", "));
            }
            out.push('\n');
        }
        for warning in &self.warnings {
            let _ = writeln!(out, "  warning: {}", warning);
        }
        if self.cost.total > 0.0 {
            let _ = writeln!(out, "  cost: {:.2}", self.cost.total);
        }
        if let Some(phase) = self.resume_from.filter(|_| self.outcome != RunOutcome::Success) {
            let _ = writeln!(out, "  resume with --resume-from {}", phase);
        }
        out
    }
}

/// Fatal when a sink failed or the run was aborted; partial when anything
/// else failed or an optional source is missing.
pub fn classify(graph: &TaskGraph, aborted: bool) -> RunOutcome {
    let sink_failed = graph
        .sinks()
        .into_iter()
        .filter_map(|id| graph.get(id))
        .any(|t| t.status.is_failed());
    if aborted || sink_failed {
        return RunOutcome::FatalFailure;
    }
    let degraded = graph
        .tasks()
        .into_iter()
        .any(|t| t.status.is_failed() || t.missing_sources().next().is_some());
    if degraded {
        RunOutcome::PartialFailure
    } else {
        RunOutcome::Success
    }
}

/// Earliest phase holding a task that is not `Completed`.
pub fn resume_point(graph: &TaskGraph) -> Option<Phase> {
    graph
        .tasks()
        .into_iter()
        .filter(|t| t.status != TaskStatus::Completed)
        .map(|t| t.phase)
        .min()
}
