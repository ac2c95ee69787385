use thiserror::Error;

use crate::core::task::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Adding {blocker} as a blocker of {task} would create a cycle")]
    CycleDetected { task: TaskId, blocker: TaskId },

    #[error("Invalid status transition for {task} from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task} is already owned by worker {owner}")]
    OwnerConflict {
        task: TaskId,
        owner: crate::orchestration::WorkerId,
    },

    #[error("Checkpoint missing for phase {phase}")]
    CheckpointMissing { phase: u32 },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session {name} is still {state}")]
    SessionBusy { name: String, state: String },

    #[error("Invalid session transition from {from} to {to}")]
    InvalidSessionTransition { from: String, to: String },

    #[error("Worker not found: {0}")]
    WorkerNotFound(crate::orchestration::WorkerId),

    #[error("Worker {worker} is busy with task {task}")]
    WorkerBusy {
        worker: crate::orchestration::WorkerId,
        task: TaskId,
    },

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },

    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
