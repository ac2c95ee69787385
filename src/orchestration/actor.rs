//! Single-writer actor owning the [`TaskGraph`].
//!
//! Every mutation is a closure sent over one channel, so mutations are
//! serialized and each observer sees a graph that is either before or after
//! a mutation, never in between. A `watch` generation counter is bumped after
//! each write so waiters can park until the graph changes.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::core::dag::{GraphPatch, GraphSnapshot, Splice, TaskFilter, TaskGraph, TaskUpdate, Transition};
use crate::core::task::{FailureReason, Task, TaskId, TaskOutput, TaskSpec, TaskStatus};
use crate::orchestration::WorkerId;
use crate::{clog_debug, Error, Result};

type ReadJob = Box<dyn FnOnce(&TaskGraph) + Send>;
type WriteJob = Box<dyn FnOnce(&mut TaskGraph) + Send>;

enum GraphCommand {
    Read(ReadJob),
    Write(WriteJob),
}

/// Result of waiting for a task to become runnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The task reached a terminal status before it could start.
    Finished(TaskStatus),
}

/// Cloneable handle to the graph actor.
#[derive(Clone)]
pub struct GraphHandle {
    tx: mpsc::UnboundedSender<GraphCommand>,
    generation: watch::Receiver<u64>,
}

impl GraphHandle {
    /// Move `graph` into a new actor task.
    pub fn spawn(graph: TaskGraph) -> (Self, JoinHandle<TaskGraph>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<GraphCommand>();
        let (gen_tx, gen_rx) = watch::channel(0u64);

        let join = tokio::spawn(async move {
            let mut graph = graph;
            while let Some(command) = rx.recv().await {
                match command {
                    GraphCommand::Read(job) => job(&graph),
                    GraphCommand::Write(job) => {
                        job(&mut graph);
                        gen_tx.send_modify(|g| *g += 1);
                    }
                }
            }
            clog_debug!("GraphActor: all handles dropped, stopping");
            graph
        });

        (
            Self {
                tx,
                generation: gen_rx,
            },
            join,
        )
    }

    /// Run a read-only closure against the graph.
    pub async fn read<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TaskGraph) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(GraphCommand::Read(Box::new(move |g| {
                let _ = reply_tx.send(f(g));
            })))
            .map_err(|_| Error::ChannelClosed("graph actor"))?;
        reply_rx.await.map_err(|_| Error::ChannelClosed("graph actor"))
    }

    /// Run a mutating closure against the graph.
    pub async fn write<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut TaskGraph) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(GraphCommand::Write(Box::new(move |g| {
                let _ = reply_tx.send(f(g));
            })))
            .map_err(|_| Error::ChannelClosed("graph actor"))?;
        reply_rx.await.map_err(|_| Error::ChannelClosed("graph actor"))
    }

    /// Current write generation.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Park until a write happens after generation `seen`.
    pub async fn wait_for_change(&self, seen: u64) -> Result<u64> {
        let mut rx = self.generation.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current > seen {
                return Ok(current);
            }
            rx.changed()
                .await
                .map_err(|_| Error::ChannelClosed("graph actor"))?;
        }
    }

    /// Park until `task` is ready to start, or finished without starting.
    pub async fn wait_until_ready(&self, task: TaskId) -> Result<Readiness> {
        loop {
            let seen = self.generation();
            let state = self
                .read(move |g| g.get(task).map(|t| (t.is_ready(), t.status.clone())))
                .await?
                .ok_or_else(|| Error::TaskNotFound(task.to_string()))?;
            match state {
                (true, _) => return Ok(Readiness::Ready),
                (false, status) if status.is_terminal() => return Ok(Readiness::Finished(status)),
                (false, TaskStatus::InProgress) => {
                    return Err(Error::Validation(format!("task {} already started", task)))
                }
                _ => {}
            }
            self.wait_for_change(seen).await?;
        }
    }

    /// Like [`wait_until_ready`](Self::wait_until_ready) but gives up after `limit`.
    pub async fn wait_until_ready_for(&self, task: TaskId, limit: Duration) -> Result<Readiness> {
        tokio::time::timeout(limit, self.wait_until_ready(task))
            .await
            .map_err(|_| Error::Timeout(limit))?
    }

    // Control surface used by workers, the coordinator and tests.

    pub async fn create_task(&self, spec: TaskSpec) -> Result<TaskId> {
        self.write(move |g| g.add_task(spec)).await?
    }

    pub async fn update_task(&self, id: TaskId, update: TaskUpdate) -> Result<Transition> {
        self.write(move |g| g.update(id, update)).await?
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.read(move |g| g.get(id).cloned()).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        self.read(move |g| g.list(&filter).into_iter().cloned().collect())
            .await
    }

    pub async fn id_for(&self, key: &str) -> Result<TaskId> {
        let key = key.to_string();
        self.read(move |g| g.id_for(&key)).await?
    }

    pub async fn claim(&self, id: TaskId, worker: WorkerId) -> Result<()> {
        self.write(move |g| g.claim(id, worker)).await?
    }

    pub async fn release(&self, id: TaskId, worker: WorkerId) -> Result<()> {
        self.write(move |g| g.release(id, worker)).await?
    }

    /// Announce that `worker` has started `id`. The worker must own the task.
    pub async fn start(&self, id: TaskId, worker: WorkerId) -> Result<Task> {
        self.write(move |g| {
            let owner = g.get(id).ok_or_else(|| Error::TaskNotFound(id.to_string()))?.owner;
            match owner {
                Some(owner) if owner == worker => {}
                Some(owner) => return Err(Error::OwnerConflict { task: id, owner }),
                None => g.claim(id, worker)?,
            }
            g.mark_status(id, TaskStatus::InProgress, None)?;
            g.get(id)
                .cloned()
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))
        })
        .await?
    }

    pub async fn complete(&self, id: TaskId, output: TaskOutput) -> Result<Transition> {
        self.write(move |g| g.complete(id, output)).await?
    }

    pub async fn fail(&self, id: TaskId, reason: FailureReason) -> Result<Transition> {
        self.write(move |g| g.mark_status(id, TaskStatus::failed(reason), None))
            .await?
    }

    pub async fn ready_tasks(&self) -> Result<Vec<TaskId>> {
        self.read(TaskGraph::ready_tasks).await
    }

    pub async fn is_terminal(&self) -> Result<bool> {
        self.read(TaskGraph::is_terminal).await
    }

    pub async fn apply_splice(&self, splice: Splice) -> Result<Vec<TaskId>> {
        self.write(move |g| g.apply_splice(&splice)).await?
    }

    pub async fn apply_patch(&self, patch: GraphPatch) -> Result<Vec<TaskId>> {
        self.write(move |g| g.apply_patch(&patch)).await
    }

    pub async fn abort_remaining(&self, reason: FailureReason) -> Result<Vec<TaskId>> {
        self.write(move |g| g.abort_remaining(reason)).await
    }

    pub async fn snapshot(&self) -> Result<GraphSnapshot> {
        self.read(TaskGraph::snapshot).await
    }

    /// Full copy of the graph, for checkpoints and reports.
    pub async fn clone_graph(&self) -> Result<TaskGraph> {
        self.read(TaskGraph::clone).await
    }
}
