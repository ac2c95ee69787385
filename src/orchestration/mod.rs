//! Orchestration layer: runs a task graph with a pool of workers.
//!
//! The [`Coordinator`] owns a session. The graph lives behind a single-writer
//! actor ([`GraphHandle`]), workers talk to the coordinator through worker
//! events and the [`MessageRouter`], and [`GateController`] pauses the run at
//! phase boundaries for approval.

mod actor;
mod coordinator;
mod cost;
mod extension;
mod gate;
mod report;
mod router;
mod shell;
mod worker;

pub use actor::{GraphHandle, Readiness};
pub use coordinator::{Coordinator, SessionConfig};
pub use cost::{CostLedger, CostSummary, COST_METRIC};
pub use extension::{ExtensionPlan, ExtensionPolicy, MetricBand, SpliceMode};
pub use gate::{
    ensure_parameter_gate, parse_answer, Approver, AutoApprover, Decision, GateController, GateKind, GateMode,
    GateRecord, GateSpec, Presentation, TerminalApprover, PARAMETER_GATE_ID,
};
pub use report::{classify, resume_point, RunOutcome, RunReport, TaskReport};
pub use router::{
    Endpoint, Mailbox, Message, MessageKind, MessageRouter, Recipient, MAX_CONTENT_BYTES, MAX_SUMMARY_CHARS,
};
pub use shell::{ShellWorker, EXIT_TRANSIENT};
pub use worker::{
    FnWorker, ProgressCallback, TaskContext, Worker, WorkerEnv, WorkerEvent, WorkerHandle, WorkerId, WorkerOutcome,
    WorkerSpec,
};
