//! Workers: the units that execute one task at a time.
//!
//! A [`WorkerHandle`] is the coordinator's side. It owns a background loop
//! that waits for assignments, announces `InProgress` through the graph,
//! runs the [`Worker`] implementation and reports the outcome back as a
//! [`WorkerEvent`]. The same loop answers shutdown requests arriving through
//! the [`MessageRouter`].

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::artifact::{check_inputs, first_missing_output};
use crate::core::task::{FailureReason, Task, TaskId, TaskOutput};
use crate::orchestration::actor::{GraphHandle, Readiness};
use crate::orchestration::router::{Endpoint, Mailbox, Message, MessageKind, MessageRouter, Recipient};
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How a worker is described in logs and reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    /// Task class this worker was spawned for.
    pub class: Option<String>,
}

impl WorkerSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            class: None,
        }
    }

    pub fn for_task(task: &Task) -> Self {
        Self {
            name: format!("{}-worker", task.class.as_deref().unwrap_or("task")),
            class: task.class.clone(),
        }
    }
}

/// Executes tasks. Implementations are shared across worker loops.
pub trait Worker: Send + Sync {
    /// Run the task. `Err` carries a message that becomes `WorkerError`.
    ///
    /// Long-running implementations should watch `ctx.cancel`; the future is
    /// also dropped when the task is cancelled.
    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, std::result::Result<TaskOutput, String>>;

    /// Reason to decline a shutdown request, or `None` to approve it.
    fn pending_work(&self) -> Option<String> {
        None
    }
}

pub type ProgressCallback = Arc<dyn Fn(&Message) + Send + Sync>;

struct ProgressReporter {
    worker: WorkerId,
    task: TaskId,
    router: MessageRouter,
    /// Next sequence number. Held while sending so reports leave in order.
    seq: Mutex<u64>,
    callbacks: Arc<Mutex<Vec<ProgressCallback>>>,
}

impl ProgressReporter {
    fn report(&self, summary: &str, content: &str) -> Result<()> {
        let mut seq = self.seq.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let message = Message::new(
            MessageKind::Progress {
                task: Some(self.task),
                seq: *seq,
            },
            Endpoint::Worker(self.worker),
            Recipient::To(Endpoint::Coordinator),
            summary,
            content,
        )?;
        *seq += 1;
        let callbacks: Vec<ProgressCallback> = self
            .callbacks
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        for callback in &callbacks {
            callback(&message);
        }
        if let Err(e) = self.router.send(message) {
            clog_debug!("Worker {}: progress not delivered: {}", self.worker.short(), e);
        }
        drop(seq);
        Ok(())
    }
}

/// What a worker sees while executing a task.
pub struct TaskContext {
    pub worker: WorkerId,
    /// Snapshot taken when the task moved to `InProgress`.
    pub task: Task,
    pub workspace: PathBuf,
    /// Optional inputs that are absent; treat them as "no data".
    pub missing_optional: Vec<PathBuf>,
    pub cancel: CancellationToken,
    progress: ProgressReporter,
}

impl TaskContext {
    /// Send a progress report to the coordinator.
    pub fn report_progress(&self, summary: &str, content: &str) -> Result<()> {
        self.progress.report(summary, content)
    }

    /// Keys of optional blockers that did not complete.
    pub fn missing_sources(&self) -> Vec<String> {
        self.task
            .missing_sources()
            .map(|a| a.blocker_key.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Completed(TaskOutput),
    Failed(FailureReason),
    /// Cancellation won the race against the worker.
    Cancelled,
    /// The task never reached `InProgress`.
    NotStarted(String),
}

impl WorkerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerOutcome::Completed(_) => "completed",
            WorkerOutcome::Failed(_) => "failed",
            WorkerOutcome::Cancelled => "cancelled",
            WorkerOutcome::NotStarted(_) => "not started",
        }
    }
}

/// Events emitted by worker loops to the coordinator.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Finished {
        worker: WorkerId,
        task: TaskId,
        outcome: WorkerOutcome,
    },
    /// The loop ended: approved shutdown, force close, or a panic.
    Exited { worker: WorkerId, panicked: bool },
}

/// Shared plumbing every worker loop needs.
#[derive(Clone)]
pub struct WorkerEnv {
    pub graph: GraphHandle,
    pub router: MessageRouter,
    pub workspace: PathBuf,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

struct Assignment {
    task: TaskId,
    cancel: CancellationToken,
}

/// Coordinator-side handle to one worker loop.
pub struct WorkerHandle {
    id: WorkerId,
    spec: WorkerSpec,
    current: Option<(TaskId, CancellationToken)>,
    assignments: mpsc::UnboundedSender<Assignment>,
    callbacks: Arc<Mutex<Vec<ProgressCallback>>>,
    router: MessageRouter,
    abort: AbortHandle,
    join: Option<JoinHandle<()>>,
    closed: bool,
    finished: usize,
}

impl WorkerHandle {
    /// Start a worker loop. The worker's mailbox is registered immediately.
    pub fn spawn(spec: WorkerSpec, worker: Arc<dyn Worker>, env: WorkerEnv) -> Self {
        let id = WorkerId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let callbacks: Arc<Mutex<Vec<ProgressCallback>>> = Arc::default();
        let mailbox = env.router.subscribe(Endpoint::Worker(id));
        let router = env.router.clone();
        let events = env.events.clone();

        let worker_loop = WorkerLoop {
            id,
            worker,
            env,
            assignments: rx,
            mailbox,
            callbacks: Arc::clone(&callbacks),
        };
        let inner = tokio::spawn(worker_loop.run());
        let abort = inner.abort_handle();
        let join = tokio::spawn(async move {
            let panicked = match inner.await {
                Ok(()) => false,
                Err(e) => e.is_panic(),
            };
            let _ = events.send(WorkerEvent::Exited {
                worker: id,
                panicked,
            });
        });

        clog_debug!("Worker {} ({}) spawned", id.short(), spec.name);
        Self {
            id,
            spec,
            current: None,
            assignments: tx,
            callbacks,
            router,
            abort,
            join: Some(join),
            closed: false,
            finished: 0,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current.as_ref().map(|(task, _)| *task)
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && !self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of tasks this worker has reported on.
    pub fn finished_count(&self) -> usize {
        self.finished
    }

    /// Bind a task. The loop waits for it to become ready before starting.
    ///
    /// The task's cancellation token is a child of `parent`.
    pub fn assign(&mut self, task: TaskId, parent: &CancellationToken) -> Result<()> {
        if self.closed {
            return Err(Error::WorkerNotFound(self.id));
        }
        if let Some((current, _)) = &self.current {
            return Err(Error::WorkerBusy {
                worker: self.id,
                task: *current,
            });
        }
        let cancel = parent.child_token();
        self.assignments
            .send(Assignment {
                task,
                cancel: cancel.clone(),
            })
            .map_err(|_| Error::ChannelClosed("worker assignments"))?;
        self.current = Some((task, cancel));
        Ok(())
    }

    /// Register a callback invoked for every progress report this worker sends.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Ask the worker to stop. The answer arrives as a `ShutdownResponse`.
    pub fn request_shutdown(&self, attempt: u32) -> Result<()> {
        self.router
            .send_message(
                MessageKind::ShutdownRequest { attempt },
                Endpoint::Coordinator,
                Recipient::To(Endpoint::Worker(self.id)),
                "session draining, please shut down",
                "",
            )
            .map(|_| ())
    }

    /// Cancel the running task, if any. The loop still reports an outcome.
    pub fn cancel_current(&self) {
        if let Some((task, cancel)) = &self.current {
            clog_debug!("Worker {}: cancelling {}", self.id.short(), task);
            cancel.cancel();
        }
    }

    /// Clear the binding after the loop reported on `task`.
    pub fn finish(&mut self, task: TaskId) {
        if self.current_task() == Some(task) {
            self.current = None;
            self.finished += 1;
        }
    }

    /// The loop exited on its own after approving a shutdown.
    pub fn mark_closed(&mut self) {
        self.closed = true;
        self.router.unsubscribe(Endpoint::Worker(self.id));
    }

    /// Stop a worker that was never given work and forget it.
    pub fn discard(mut self) {
        self.abort.abort();
        self.mark_closed();
        clog_debug!("Worker {} discarded", self.id.short());
    }

    /// Stop the loop without a handshake.
    pub fn force_close(&mut self) {
        self.cancel_current();
        self.abort.abort();
        self.mark_closed();
        clog_warn!("Worker {} force-closed", self.id.short());
    }

    /// Wait for the loop and its exit notification to finish.
    pub async fn join(&mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.await.map_err(|e| Error::TaskJoin(e.to_string()))?;
        }
        Ok(())
    }
}

struct WorkerLoop {
    id: WorkerId,
    worker: Arc<dyn Worker>,
    env: WorkerEnv,
    assignments: mpsc::UnboundedReceiver<Assignment>,
    mailbox: Mailbox,
    callbacks: Arc<Mutex<Vec<ProgressCallback>>>,
}

impl WorkerLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                assignment = self.assignments.recv() => {
                    let Some(assignment) = assignment else { break };
                    let task = assignment.task;
                    let outcome = self.execute(assignment).await;
                    clog_debug!("Worker {}: {} {}", self.id.short(), task, outcome.label());
                    if self.env.events.send(WorkerEvent::Finished { worker: self.id, task, outcome }).is_err() {
                        break;
                    }
                }
                message = self.mailbox.recv() => {
                    let Some(message) = message else { break };
                    if let MessageKind::ShutdownRequest { attempt } = message.kind {
                        if self.answer_shutdown(attempt) {
                            break;
                        }
                    }
                }
            }
        }
        clog_debug!("Worker {} loop stopped", self.id.short());
    }

    /// Reply to a shutdown request. Returns true when the loop should stop.
    fn answer_shutdown(&self, attempt: u32) -> bool {
        let reason = self.worker.pending_work();
        let approve = reason.is_none();
        let summary = if approve {
            "shutdown approved".to_string()
        } else {
            format!("shutdown declined (attempt {})", attempt + 1)
        };
        let sent = self.env.router.send_message(
            MessageKind::ShutdownResponse {
                approve,
                reason: reason.clone(),
            },
            Endpoint::Worker(self.id),
            Recipient::To(Endpoint::Coordinator),
            &summary,
            reason.as_deref().unwrap_or(""),
        );
        if let Err(e) = sent {
            clog_warn!("Worker {}: shutdown reply failed: {}", self.id.short(), e);
        }
        approve
    }

    async fn execute(&self, assignment: Assignment) -> WorkerOutcome {
        let Assignment { task: task_id, cancel } = assignment;
        let graph = &self.env.graph;

        let readiness = tokio::select! {
            _ = cancel.cancelled() => return WorkerOutcome::Cancelled,
            readiness = graph.wait_until_ready(task_id) => readiness,
        };
        match readiness {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::Finished(status)) => {
                return WorkerOutcome::NotStarted(format!("task ended as {} before starting", status.name()))
            }
            Err(e) => return WorkerOutcome::NotStarted(e.to_string()),
        }

        let task = match graph.start(task_id, self.id).await {
            Ok(task) => task,
            Err(e) => return WorkerOutcome::NotStarted(e.to_string()),
        };
        clog!("Worker {} started {} ({})", self.id.short(), task.key, task.display_label());

        let workspace = self.env.workspace.clone();
        let inputs = check_inputs(&task.inputs, &workspace);
        if let Some(path) = inputs.missing_required {
            return WorkerOutcome::Failed(FailureReason::MissingInput { path });
        }

        let ctx = TaskContext {
            worker: self.id,
            workspace: workspace.clone(),
            missing_optional: inputs.missing_optional,
            cancel: cancel.clone(),
            progress: ProgressReporter {
                worker: self.id,
                task: task_id,
                router: self.env.router.clone(),
                seq: Mutex::new(0),
                callbacks: Arc::clone(&self.callbacks),
            },
            task,
        };
        let _ = ctx.report_progress(&format!("started {}", ctx.task.key), "");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WorkerOutcome::Cancelled,
            result = self.worker.execute(&ctx) => result,
        };

        match result {
            Ok(output) => {
                for advisory in &output.advisories {
                    clog_warn!("{} advisory: {}", ctx.task.key, advisory);
                }
                if let Some(path) = first_missing_output(&ctx.task.outputs, &workspace) {
                    return WorkerOutcome::Failed(FailureReason::MissingOutput { path });
                }
                let _ = ctx.report_progress(&format!("finished {}", ctx.task.key), "");
                WorkerOutcome::Completed(output)
            }
            Err(message) => WorkerOutcome::Failed(FailureReason::worker_error(message)),
        }
    }
}

/// Worker built from a closure; handy for embedding and tests.
pub struct FnWorker<F> {
    f: F,
}

impl<F> FnWorker<F>
where
    F: Fn(&TaskContext) -> BoxFuture<'static, std::result::Result<TaskOutput, String>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Worker for FnWorker<F>
where
    F: Fn(&TaskContext) -> BoxFuture<'static, std::result::Result<TaskOutput, String>> + Send + Sync,
{
    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, std::result::Result<TaskOutput, String>> {
        (self.f)(ctx)
    }
}
