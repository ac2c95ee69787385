//! Task data model for the task graph.
//!
//! Tasks are the atomic units of work handed to workers. Each task tracks
//! its status, owner, unresolved blockers, declared artifacts and, once
//! finished, its output.

use crate::core::artifact::ArtifactDescriptor;
use crate::orchestration::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Phase number. Phases are ordered; gates and checkpoints sit on their boundaries.
pub type Phase = u32;

/// Stable identifier for a task within a session.
///
/// Ids are arena indices handed out by the graph in insertion order. They
/// are never reused, so ids taken before a dynamic extension stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim_start_matches('#').parse()?))
    }
}

/// Why a task ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    /// A required blocker failed; the failure cascaded here.
    UpstreamFailed { blocker: TaskId, blocker_key: String },
    /// The supervisory timeout for the task's class expired.
    WorkerTimeout { after_secs: u64 },
    /// An approval gate aborted the session.
    UserAborted,
    /// The worker reported an error.
    WorkerError { message: String },
    /// A required input artifact was absent when the task started.
    MissingInput { path: PathBuf },
    /// A required output artifact was absent after the worker finished.
    MissingOutput { path: PathBuf },
    /// The worker went away without reporting a result.
    WorkerLost,
}

impl FailureReason {
    pub fn worker_error(message: impl Into<String>) -> Self {
        Self::WorkerError {
            message: message.into(),
        }
    }

    /// True when this failure was inherited rather than caused by the task itself.
    pub fn is_cascade(&self) -> bool {
        matches!(self, FailureReason::UpstreamFailed { .. })
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::UpstreamFailed { blocker_key, .. } => {
                write!(f, "upstream required dependency failed: {}", blocker_key)
            }
            FailureReason::WorkerTimeout { after_secs } => {
                write!(f, "WorkerTimeout after {}s", after_secs)
            }
            FailureReason::UserAborted => write!(f, "UserAborted"),
            FailureReason::WorkerError { message } => write!(f, "{}", message),
            FailureReason::MissingInput { path } => {
                write!(f, "required input missing: {}", path.display())
            }
            FailureReason::MissingOutput { path } => {
                write!(f, "declared output missing: {}", path.display())
            }
            FailureReason::WorkerLost => write!(f, "worker exited without reporting"),
        }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// No unresolved blockers; eligible for scheduling.
    #[default]
    Pending,
    /// Waiting on at least one blocker.
    Blocked,
    /// Owned by a worker that announced it started.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed { reason: FailureReason },
}

impl TaskStatus {
    pub fn failed(reason: FailureReason) -> Self {
        Self::Failed { reason }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed { .. })
    }

    /// Short name without the failure reason.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
        }
    }

    /// Transition table.
    ///
    /// `Pending -> Completed` exists only for checkpoint restore, which
    /// marks upstream work done without running it.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Blocked, Pending)
                | (Pending, Blocked)
                | (Pending, InProgress)
                | (Pending, Completed)
                | (InProgress, Completed)
                | (Pending, Failed { .. })
                | (Blocked, Failed { .. })
                | (InProgress, Failed { .. })
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { reason } => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Outcome of an optional blocker, attached to the dependent for its worker to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub blocker: TaskId,
    pub blocker_key: String,
    pub outcome: TaskStatus,
}

impl Annotation {
    /// True when the optional source produced nothing usable.
    pub fn is_missing_source(&self) -> bool {
        !matches!(self.outcome, TaskStatus::Completed)
    }
}

/// What a worker hands back on success. Bulk data stays in files;
/// this only lists them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default)]
    pub produced: Vec<PathBuf>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Side-effect failures that do not invalidate the primary output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<String>,
}

impl TaskOutput {
    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    pub fn with_note(mut self, note: &str) -> Self {
        self.note = Some(note.to_string());
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Everything needed to create a task. The graph assigns the id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub key: String,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub active_form: Option<String>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub inputs: Vec<ArtifactDescriptor>,
    #[serde(default)]
    pub outputs: Vec<ArtifactDescriptor>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(key: &str, subject: &str) -> Self {
        Self {
            key: key.to_string(),
            subject: subject.to_string(),
            ..Default::default()
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    pub fn input(mut self, artifact: ArtifactDescriptor) -> Self {
        self.inputs.push(artifact);
        self
    }

    pub fn output(mut self, artifact: ArtifactDescriptor) -> Self {
        self.outputs.push(artifact);
        self
    }

    pub fn param(mut self, name: &str, value: serde_json::Value) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }
}

/// A single task in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Unique, human-chosen name used by pipelines and checkpoints.
    pub key: String,
    pub subject: String,
    pub description: String,
    /// Progress label shown while the task runs ("Collecting sources").
    pub active_form: Option<String>,
    pub phase: Phase,
    /// Selects the supervisory timeout.
    pub class: Option<String>,
    pub status: TaskStatus,
    pub owner: Option<WorkerId>,
    /// Unresolved blockers only; resolved ones are removed.
    pub blocked_by: BTreeSet<TaskId>,
    pub inputs: Vec<ArtifactDescriptor>,
    pub outputs: Vec<ArtifactDescriptor>,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub annotations: Vec<Annotation>,
    pub output: Option<TaskOutput>,
    /// Free-form note from the last status change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_spec(id: TaskId, spec: TaskSpec) -> Self {
        Self {
            id,
            key: spec.key,
            subject: spec.subject,
            description: spec.description,
            active_form: spec.active_form,
            phase: spec.phase,
            class: spec.class,
            status: TaskStatus::Pending,
            owner: None,
            blocked_by: BTreeSet::new(),
            inputs: spec.inputs,
            outputs: spec.outputs,
            params: spec.params,
            annotations: Vec::new(),
            output: None,
            note: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Ready means nothing left to wait for and nobody working on it.
    pub fn is_ready(&self) -> bool {
        self.status == TaskStatus::Pending && self.blocked_by.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.status {
            TaskStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Label for progress displays.
    pub fn display_label(&self) -> &str {
        self.active_form.as_deref().unwrap_or(&self.subject)
    }

    /// Optional sources that did not complete.
    pub fn missing_sources(&self) -> impl Iterator<Item = &Annotation> {
        self.annotations.iter().filter(|a| a.is_missing_source())
    }

    /// Apply the bookkeeping that accompanies a status change.
    /// Callers validate the transition first.
    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::InProgress => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Completed | TaskStatus::Failed { .. } => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = status;
    }
}
